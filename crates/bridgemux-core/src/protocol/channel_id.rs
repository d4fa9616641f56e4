//! Generator for channel identifiers.
//!
//! # Why a seed? (for beginners)
//!
//! Several clients (for example two browser tabs, or a frame embedded in a
//! page) may share one bridge session.  If each started numbering channels at
//! 1 their ids would collide.  The server therefore hands every client a
//! *channel seed* in its `init` reply, such as `"4:"`.  Ids are the seed
//! followed by a counter: `4:1`, `4:2`, `4:3`…
//!
//! Before the seed arrives the generator falls back to an empty seed, but in
//! practice no channel id is handed out until the transport is ready.

use std::sync::atomic::{AtomicU64, Ordering};

/// Seeded, monotonically increasing channel id generator.
///
/// # Examples
///
/// ```rust
/// use bridgemux_core::protocol::ChannelIdGenerator;
///
/// let mut ids = ChannelIdGenerator::new();
/// ids.set_seed("x:");
/// assert_eq!(ids.next_id(), "x:1");
/// assert_eq!(ids.next_id(), "x:2");
/// ```
#[derive(Debug, Default)]
pub struct ChannelIdGenerator {
    seed: String,
    last: AtomicU64,
}

impl ChannelIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the seed; the counter keeps running.
    pub fn set_seed(&mut self, seed: impl Into<String>) {
        self.seed = seed.into();
    }

    pub fn seed(&self) -> &str {
        &self.seed
    }

    /// Returns the next id.  The first call yields `<seed>1`.
    pub fn next_id(&self) -> String {
        let n = self.last.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}{}", self.seed, n)
    }

    /// Number of ids handed out so far.
    pub fn issued(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }
}
