//! Domain layer: configuration and error types shared by every client.

pub mod config;
pub mod errors;
