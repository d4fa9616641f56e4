//! Decoder for the `metrics1` message stream.
//!
//! # Delta compression (for beginners)
//!
//! Most samples do not change from one interval to the next, so the server
//! sends `null` for any slot whose value equals the slot in the previous row:
//!
//! ```text
//! meta:  {"metrics": [A, B]}
//! data:  [[1, 2]]          -> row [1, 2]
//! data:  [[null, 5]]       -> row [1, 5]
//! ```
//!
//! The "previous row" carries across message boundaries.  Per-instance
//! metrics are arrays themselves and are filled element by element; if a row's
//! instance array is shorter than the previous one, the missing tail is copied
//! as well.
//!
//! Each data message also advances the *timestep* counter.  The first data
//! message after a meta starts at `floor(timestamp / interval)`, where
//! `timestamp` is the meta's sample time corrected by the clock offset between
//! the server's `now` and ours.

use serde_json::Value;
use thiserror::Error;

use crate::metrics::meta::MetricsMeta;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("invalid metrics meta message: {0}")]
    InvalidMeta(#[source] serde_json::Error),

    #[error("invalid metrics JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
}

/// What one message turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A new layout; `beg` is the timestep the next data message starts at.
    Meta { beg: i64 },
    /// Decompressed rows starting at timestep `beg`.
    Data { beg: i64, rows: Vec<Value> },
}

/// Stateful decoder for one metrics channel.
#[derive(Debug)]
pub struct MetricsDecoder {
    interval: u64,
    meta: Option<MetricsMeta>,
    last: Option<Value>,
    beg: i64,
}

impl MetricsDecoder {
    /// `interval` is the sampling interval in milliseconds (non-zero).
    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            meta: None,
            last: None,
            beg: 0,
        }
    }

    pub fn meta(&self) -> Option<&MetricsMeta> {
        self.meta.as_ref()
    }

    /// Timestep the next data row will be stored at.
    pub fn beg(&self) -> i64 {
        self.beg
    }

    /// Parses and feeds one text message.
    pub fn feed_text(&mut self, text: &str, now_ms: f64) -> Result<Option<Decoded>, MetricsError> {
        let value: Value = serde_json::from_str(text).map_err(MetricsError::InvalidJson)?;
        self.feed(value, now_ms)
    }

    /// Feeds one decoded JSON message.
    ///
    /// Data messages that arrive before any meta are dropped (`Ok(None)`).
    pub fn feed(&mut self, message: Value, now_ms: f64) -> Result<Option<Decoded>, MetricsError> {
        match message {
            Value::Array(mut rows) => {
                let Some(meta) = self.meta.as_mut() else {
                    return Ok(None);
                };

                decompress(&mut rows, &mut self.last);

                let beg = self.beg;
                let len = rows.len();
                self.beg += len as i64;
                if let Some(timestamp) = meta.timestamp.as_mut() {
                    *timestamp += (self.interval * len as u64) as f64;
                }
                Ok(Some(Decoded::Data { beg, rows }))
            }
            other => {
                let meta: MetricsMeta = serde_json::from_value(other).map_err(MetricsError::InvalidMeta)?;
                let timestamp = match (meta.now, meta.timestamp) {
                    (Some(now), Some(timestamp)) if now != 0.0 && timestamp != 0.0 => {
                        timestamp + (now_ms - now)
                    }
                    _ => 0.0,
                };
                self.beg = (timestamp / self.interval as f64).floor() as i64;
                self.meta = Some(meta);
                // Rows under a new meta may reorder columns, so nulls never
                // fill from a row decoded under the previous one.
                self.last = None;
                Ok(Some(Decoded::Meta { beg: self.beg }))
            }
        }
    }
}

/// Fills `null` slots of each row from the row before it.
fn decompress(rows: &mut [Value], last: &mut Option<Value>) {
    for row in rows.iter_mut() {
        if let (Some(Value::Array(prev)), Value::Array(data)) = (last.as_ref(), &mut *row) {
            for (j, prev_j) in prev.iter().enumerate() {
                match data.get_mut(j) {
                    None => data.push(prev_j.clone()),
                    Some(slot @ Value::Null) => *slot = prev_j.clone(),
                    Some(Value::Array(inner)) => {
                        let Value::Array(prev_inner) = prev_j else {
                            continue;
                        };
                        for (k, prev_k) in prev_inner.iter().enumerate() {
                            match inner.get_mut(k) {
                                None => inner.push(prev_k.clone()),
                                Some(slot @ Value::Null) => *slot = prev_k.clone(),
                                Some(_) => {}
                            }
                        }
                    }
                    Some(_) => {}
                }
            }
        }
        *last = Some(row.clone());
    }
}
