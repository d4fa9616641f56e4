//! Series sink: receives sample blocks, stores them, and feeds grids.
//!
//! Data enters through [`SeriesSink::input`] (live metrics) and leaves through
//! [`SeriesSink::load`] (a grid asking for a window).  `load` serves what the
//! store already holds and asks the fetch callback only for the gaps.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::series::grid::{GridId, GridShared, RowId};
use crate::series::mapping::Mapping;
use crate::series::store::{Sample, SeriesIndex, SeriesStorage, PRIVATE_LIMIT, SHARED_LIMIT};

/// Called with `(beg, end, for_walking)` for every range the store lacks.
pub type FetchCallback = Arc<dyn Fn(i64, i64, bool) + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SeriesError {
    #[error("mismatched metric interval between grid ({grid} ms) and sink ({sink} ms)")]
    IntervalMismatch { grid: u64, sink: u64 },
}

/// Where a grid row takes its value from inside each sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowPath(pub Vec<String>);

impl From<&str> for RowPath {
    /// Dot separated: `"one.sub.2"`.  The empty string is the whole sample.
    fn from(path: &str) -> Self {
        if path.is_empty() {
            RowPath(Vec::new())
        } else {
            RowPath(path.split('.').map(str::to_owned).collect())
        }
    }
}

impl From<Vec<String>> for RowPath {
    fn from(parts: Vec<String>) -> Self {
        RowPath(parts)
    }
}

impl From<&[&str]> for RowPath {
    fn from(parts: &[&str]) -> Self {
        RowPath(parts.iter().map(|p| (*p).to_owned()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for RowPath {
    fn from(parts: [&str; N]) -> Self {
        RowPath(parts.iter().map(|p| (*p).to_owned()).collect())
    }
}

impl From<Option<&str>> for RowPath {
    fn from(path: Option<&str>) -> Self {
        path.map(RowPath::from).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Link {
    pub(crate) path: RowPath,
    pub(crate) row: RowId,
}

struct Registration {
    grid: Weak<GridShared>,
    links: Vec<Link>,
}

struct SinkShared {
    interval: u64,
    index: Arc<Mutex<SeriesIndex>>,
    registered: Mutex<HashMap<GridId, Registration>>,
    fetch: Mutex<Option<FetchCallback>>,
}

/// Handle to a sink.  Clones share the same sink.
#[derive(Clone)]
pub struct SeriesSink {
    shared: Arc<SinkShared>,
}

impl std::fmt::Debug for SeriesSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesSink")
            .field("interval", &self.shared.interval)
            .field("limit", &self.limit())
            .finish()
    }
}

impl SeriesSink {
    /// A sink with its own private store (limit 1024 samples).
    pub fn new(interval: u64) -> Self {
        Self::with_index(interval, Arc::new(Mutex::new(SeriesIndex::new(PRIVATE_LIMIT))))
    }

    /// A sink whose store is shared with every other sink using the same
    /// `identifier` in `storage` (limit 64 Ki samples).
    pub fn shared(interval: u64, identifier: &str, storage: &SeriesStorage) -> Self {
        Self::with_index(interval, storage.index(identifier, SHARED_LIMIT))
    }

    fn with_index(interval: u64, index: Arc<Mutex<SeriesIndex>>) -> Self {
        Self {
            shared: Arc::new(SinkShared {
                interval,
                index,
                registered: Mutex::new(HashMap::new()),
                fetch: Mutex::new(None),
            }),
        }
    }

    /// Installs the callback asked to fetch missing ranges.
    pub fn with_fetch(self, fetch: FetchCallback) -> Self {
        self.set_fetch(Some(fetch));
        self
    }

    pub fn set_fetch(&self, fetch: Option<FetchCallback>) {
        *self.shared.fetch.lock().unwrap_or_else(PoisonError::into_inner) = fetch;
    }

    pub fn interval(&self) -> u64 {
        self.shared.interval
    }

    pub fn limit(&self) -> usize {
        self.index().limit()
    }

    pub fn set_limit(&self, limit: usize) {
        self.index().set_limit(limit);
    }

    /// Total samples currently stored.
    pub fn count(&self) -> usize {
        self.index().count()
    }

    pub fn ptr_eq(&self, other: &SeriesSink) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn index(&self) -> std::sync::MutexGuard<'_, SeriesIndex> {
        self.shared.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Data in ───────────────────────────────────────────────────────────

    /// Pushes live samples starting at timestep `beg` into every registered
    /// grid, then stores them.
    pub fn input(&self, beg: i64, items: Vec<Value>, mapping: Option<Arc<Mapping>>) {
        let items: Vec<Sample> = items.into_iter().map(Some).collect();
        self.process(beg, &items, mapping.as_deref());
        self.index().stash(beg, items, mapping);
    }

    // ── Data out ──────────────────────────────────────────────────────────

    /// Feeds `[beg, end)` to registered grids from the store and requests the
    /// missing ranges from the fetch callback.
    ///
    /// Stored data is processed before any fetch runs, so a fetch callback
    /// that feeds data back synchronously does not disturb the walk.
    pub fn load(&self, beg: i64, end: i64, for_walking: bool) {
        if end <= beg {
            return;
        }

        let coverage = self.index().coverage(beg, end);

        for hit in &coverage.hits {
            self.process(hit.beg, &hit.items, hit.mapping.as_deref());
        }

        for (gap_beg, gap_end) in coverage.gaps {
            self.fetch(gap_beg, gap_end, for_walking);
        }
    }

    fn fetch(&self, beg: i64, end: i64, for_walking: bool) {
        let callback = self
            .shared
            .fetch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(callback) = callback else {
            return;
        };

        if !for_walking {
            // Placeholder so the same range is not requested again while the
            // fetch is still in flight.
            self.index()
                .stash(beg, vec![None; (end - beg) as usize], Some(Arc::new(Mapping::new())));
        }
        debug!(target: "bridgemux::metrics", "series fetch {}..{} (walking: {})", beg, end, for_walking);
        callback(beg, end, for_walking);
    }

    fn process(&self, beg: i64, items: &[Sample], mapping: Option<&Mapping>) {
        let targets: Vec<(Arc<GridShared>, Vec<Link>)> = {
            let mut registered = self
                .shared
                .registered
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            registered.retain(|_, reg| reg.grid.strong_count() > 0);
            registered
                .values()
                .filter_map(|reg| reg.grid.upgrade().map(|grid| (grid, reg.links.clone())))
                .collect()
        };

        for (grid, links) in targets {
            grid.write_samples(beg, items, mapping, &links);
        }
    }

    // ── Grid registration ─────────────────────────────────────────────────

    /// Links `row` of `grid` to this sink.  Returns `true` when this is the
    /// grid's first row from this sink.
    pub(crate) fn link(&self, grid: &Arc<GridShared>, interval: u64, path: RowPath, row: RowId) -> Result<bool, SeriesError> {
        if interval != self.shared.interval {
            return Err(SeriesError::IntervalMismatch {
                grid: interval,
                sink: self.shared.interval,
            });
        }

        let mut registered = self
            .shared
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let reg = registered.entry(grid.id()).or_insert_with(|| Registration {
            grid: Arc::downgrade(grid),
            links: Vec::new(),
        });
        let first = reg.links.is_empty();
        reg.links.push(Link { path, row });
        Ok(first)
    }

    pub(crate) fn unlink(&self, grid: GridId, row: RowId) {
        let mut registered = self
            .shared
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(reg) = registered.get_mut(&grid) {
            reg.links.retain(|link| link.row != row);
        }
    }

    pub(crate) fn unregister(&self, grid: GridId) {
        self.shared
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&grid);
    }
}
