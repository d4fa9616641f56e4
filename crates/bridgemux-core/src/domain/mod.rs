//! Protocol-independent domain vocabulary.

pub mod problem;

pub use problem::{problem_message, Problem};
