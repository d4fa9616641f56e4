//! Metrics stream decoding: the meta message layout and delta decompression.

pub mod decoder;
pub mod meta;

pub use decoder::{Decoded, MetricsDecoder, MetricsError};
pub use meta::{MetricDesc, MetricsMeta};
