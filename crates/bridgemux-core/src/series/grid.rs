//! Series grid: a window `[beg, end)` of timesteps with one row per series.
//!
//! # How a grid fills up (for beginners)
//!
//! A grid owns *rows*.  A row is filled either by a [`SeriesSink`] (samples
//! picked out by a [`RowPath`]) or by a *calculation* callback that derives
//! its values from other rows.  Index 0 of every row is timestep `beg`.
//!
//! ```text
//! timestep:   beg   beg+1  beg+2  …   end-1
//! row cpu:    0.3   0.4    None   …
//! row calc:   30    40     None   …   (derived from row cpu)
//! ```
//!
//! Whenever samples land in the window the grid *notifies* for the touched
//! range `(x, n)`: calculation callbacks run in order (early ones first) and
//! then notify listeners observe the change.  During [`SeriesGrid::sync`] the
//! per-block notifications are suppressed and a single notification for the
//! whole window is sent at the end.
//!
//! # Locking
//!
//! Calculation callbacks and notify listeners run while the grid is locked.
//! They must not call back into the same grid.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use uuid::Uuid;

use crate::series::mapping::{resolve, Mapping};
use crate::series::sink::{Link, RowPath, SeriesError, SeriesSink};
use crate::series::store::Sample;

/// Walking is skipped for intervals a timer cannot sensibly express.
const MAX_WALK_INTERVAL_MS: u64 = 2_000_000_000;

/// Identity of a grid inside the sinks it reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridId(Uuid);

/// Handle to one row of a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowId(usize);

/// A window edge: absolute, or relative to the current time.
///
/// Negative integers convert to [`Timestep::FromNow`]; use
/// `Timestep::FromNow(0)` for "now" itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestep {
    At(i64),
    FromNow(i64),
}

impl From<i64> for Timestep {
    fn from(value: i64) -> Self {
        if value < 0 {
            Timestep::FromNow(value)
        } else {
            Timestep::At(value)
        }
    }
}

impl From<i32> for Timestep {
    fn from(value: i32) -> Self {
        Timestep::from(i64::from(value))
    }
}

impl Timestep {
    fn resolve(self, now_ms: i64, interval: u64) -> i64 {
        match self {
            Timestep::At(step) => step,
            Timestep::FromNow(offset) => now_ms.div_euclid(interval as i64) + offset,
        }
    }
}

/// Mutable view of the rows handed to calculation callbacks.
pub struct GridRows<'a> {
    rows: &'a mut Vec<Option<Vec<Sample>>>,
}

impl GridRows<'_> {
    /// All values of `row`; empty for removed rows.
    pub fn get(&self, row: RowId) -> &[Sample] {
        self.rows
            .get(row.0)
            .and_then(Option::as_deref)
            .unwrap_or(&[])
    }

    pub fn value(&self, row: RowId, index: usize) -> Option<&Value> {
        self.get(row).get(index).and_then(Option::as_ref)
    }

    pub fn set(&mut self, row: RowId, index: usize, value: Sample) {
        set_slot(&mut self.rows[..], row, index, value);
    }
}

fn set_slot(rows: &mut [Option<Vec<Sample>>], row: RowId, index: usize, value: Sample) {
    if let Some(Some(values)) = rows.get_mut(row.0) {
        if values.len() <= index {
            values.resize(index + 1, None);
        }
        values[index] = value;
    }
}

type Calculation = Box<dyn FnMut(&mut GridRows<'_>, RowId, usize, usize) + Send>;
type NotifyListener = Box<dyn FnMut(usize, usize) + Send>;

struct GridInner {
    beg: i64,
    end: i64,
    rows: Vec<Option<Vec<Sample>>>,
    calculations: Vec<(Calculation, RowId)>,
    listeners: Vec<NotifyListener>,
    sinks: Vec<SeriesSink>,
    suppress: u32,
    walk_generation: u64,
}

impl GridInner {
    fn width(&self) -> i64 {
        self.end - self.beg
    }

    fn live_rows(&self) -> usize {
        self.rows.iter().filter(|row| row.is_some()).count()
    }

    fn notify(&mut self, x: i64, n: i64) {
        if self.suppress > 0 {
            return;
        }
        let n = if x + n > self.width() { self.width() - x } else { n };
        if n <= 0 || x < 0 {
            return;
        }
        let (x, n) = (x as usize, n as usize);

        let mut calculations = std::mem::take(&mut self.calculations);
        {
            let mut view = GridRows { rows: &mut self.rows };
            for (calculation, row) in calculations.iter_mut() {
                calculation(&mut view, *row, x, n);
            }
        }
        // Calculations added during the callbacks land after the existing ones.
        calculations.append(&mut self.calculations);
        self.calculations = calculations;

        for listener in self.listeners.iter_mut() {
            listener(x, n);
        }
    }
}

pub(crate) struct GridShared {
    id: GridId,
    interval: u64,
    inner: Mutex<GridInner>,
}

impl GridShared {
    pub(crate) fn id(&self) -> GridId {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, GridInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes the part of a sample block that falls in the window, then
    /// notifies for the touched range.
    pub(crate) fn write_samples(&self, beg: i64, items: &[Sample], mapping: Option<&Mapping>, links: &[Link]) {
        let mut inner = self.lock();
        let end = beg + items.len() as i64;
        let b = beg.max(inner.beg);
        let e = end.min(inner.end);
        if b >= e {
            return;
        }

        let from = (b - beg) as usize;
        let to = (b - inner.beg) as usize;
        let n = (e - b) as usize;

        for i in 0..n {
            let sample = items[from + i].as_ref();
            for link in links {
                let value = resolve(sample, mapping, &link.path.0).cloned();
                set_slot(&mut inner.rows, link.row, to + i, value);
            }
        }

        inner.notify(to as i64, n as i64);
    }
}

/// Handle to a grid.  Clones share the same grid.
#[derive(Clone)]
pub struct SeriesGrid {
    shared: Arc<GridShared>,
}

impl std::fmt::Debug for SeriesGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("SeriesGrid")
            .field("interval", &self.shared.interval)
            .field("beg", &inner.beg)
            .field("end", &inner.end)
            .field("rows", &inner.live_rows())
            .finish()
    }
}

impl SeriesGrid {
    /// Creates a grid over `[beg, end)`; a missing `end` gives an empty window
    /// at `beg`.
    pub fn new(interval: u64, beg: impl Into<Timestep>, end: Option<Timestep>) -> Self {
        let grid = Self {
            shared: Arc::new(GridShared {
                id: GridId(Uuid::new_v4()),
                interval: interval.max(1),
                inner: Mutex::new(GridInner {
                    beg: 0,
                    end: 0,
                    rows: Vec::new(),
                    calculations: Vec::new(),
                    listeners: Vec::new(),
                    sinks: Vec::new(),
                    suppress: 0,
                    walk_generation: 0,
                }),
            }),
        };
        grid.move_to(beg, end);
        grid
    }

    pub fn id(&self) -> GridId {
        self.shared.id
    }

    pub fn interval(&self) -> u64 {
        self.shared.interval
    }

    pub fn beg(&self) -> i64 {
        self.shared.lock().beg
    }

    pub fn end(&self) -> i64 {
        self.shared.lock().end
    }

    // ── Rows ──────────────────────────────────────────────────────────────

    fn new_row(&self) -> RowId {
        let mut inner = self.shared.lock();
        inner.rows.push(Some(Vec::new()));
        RowId(inner.rows.len() - 1)
    }

    /// Adds a row filled by `sink`, picking values out of each sample by
    /// `path` (a dotted string, an array of components, or `None` for the
    /// whole sample).
    ///
    /// # Errors
    ///
    /// [`SeriesError::IntervalMismatch`] if the sink samples at a different
    /// interval.
    pub fn add_sink(&self, sink: &SeriesSink, path: impl Into<RowPath>) -> Result<RowId, SeriesError> {
        let row = self.new_row();
        match sink.link(&self.shared, self.shared.interval, path.into(), row) {
            Ok(first) => {
                if first {
                    let mut inner = self.shared.lock();
                    if !inner.sinks.iter().any(|s| s.ptr_eq(sink)) {
                        inner.sinks.push(sink.clone());
                    }
                }
                Ok(row)
            }
            Err(e) => {
                self.shared.lock().rows[row.0] = None;
                Err(e)
            }
        }
    }

    /// Adds a row computed by `calculation(rows, row, x, n)` whenever the range
    /// `[x, x + n)` changes.  `early` calculations run before all others.
    pub fn add_calculated<F>(&self, early: bool, calculation: F) -> RowId
    where
        F: FnMut(&mut GridRows<'_>, RowId, usize, usize) + Send + 'static,
    {
        let row = self.new_row();
        let mut inner = self.shared.lock();
        let entry: (Calculation, RowId) = (Box::new(calculation), row);
        if early {
            inner.calculations.insert(0, entry);
        } else {
            inner.calculations.push(entry);
        }
        row
    }

    /// Adds a row nothing fills automatically.
    pub fn add_row(&self) -> RowId {
        self.new_row()
    }

    /// Removes a row from the grid and from every sink feeding it.
    pub fn remove(&self, row: RowId) {
        let sinks = {
            let mut inner = self.shared.lock();
            if let Some(slot) = inner.rows.get_mut(row.0) {
                *slot = None;
            }
            inner.calculations.retain(|(_, r)| *r != row);
            inner.sinks.clone()
        };
        for sink in sinks {
            sink.unlink(self.shared.id, row);
        }
    }

    /// Snapshot of a row's values; index 0 is timestep `beg`.
    pub fn row(&self, row: RowId) -> Vec<Sample> {
        self.shared
            .lock()
            .rows
            .get(row.0)
            .cloned()
            .flatten()
            .unwrap_or_default()
    }

    /// Writes one value into a row without notifying.
    pub fn set(&self, row: RowId, index: usize, value: Sample) {
        set_slot(&mut self.shared.lock().rows, row, index, value);
    }

    /// Registers a listener called with `(x, n)` after every notification.
    pub fn on_notify<F>(&self, listener: F)
    where
        F: FnMut(usize, usize) + Send + 'static,
    {
        self.shared.lock().listeners.push(Box::new(listener));
    }

    // ── Notification and loading ──────────────────────────────────────────

    /// Runs calculations and listeners for `[x, x + n)`, clamped to the
    /// window.  Does nothing when the clamped range is empty.
    pub fn notify(&self, x: i64, n: i64) {
        self.shared.lock().notify(x, n);
    }

    /// Reloads the whole window from every sink, then notifies once.
    pub fn sync(&self) {
        self.sync_internal(false);
    }

    fn sync_internal(&self, for_walking: bool) {
        let (beg, end, sinks) = {
            let mut inner = self.shared.lock();
            inner.suppress += 1;
            (inner.beg, inner.end, inner.sinks.clone())
        };

        for sink in &sinks {
            sink.load(beg, end, for_walking);
        }

        let mut inner = self.shared.lock();
        inner.suppress -= 1;
        let width = inner.width();
        inner.notify(0, width);
    }

    fn move_internal(&self, beg: i64, end: Option<i64>, for_walking: bool) {
        {
            let mut inner = self.shared.lock();
            let end = end.unwrap_or(beg + inner.width());
            let beg = beg.min(end);
            inner.beg = beg;
            inner.end = end;

            if inner.live_rows() == 0 {
                return;
            }
            for row in inner.rows.iter_mut().flatten() {
                row.clear();
            }
        }
        self.sync_internal(for_walking);
    }

    /// Moves the window.  Stops walking.  `end = None` keeps the current width.
    pub fn move_to(&self, beg: impl Into<Timestep>, end: Option<Timestep>) {
        self.move_at(beg, end, now_ms());
    }

    /// [`SeriesGrid::move_to`] with an explicit current time in milliseconds.
    pub fn move_at(&self, beg: impl Into<Timestep>, end: Option<Timestep>, now_ms: i64) {
        self.stop_walk();
        let interval = self.shared.interval;
        let beg = beg.into().resolve(now_ms, interval);
        let end = end.map(|end| end.resolve(now_ms, interval));
        self.move_internal(beg, end, false);
    }

    // ── Walking ───────────────────────────────────────────────────────────

    /// Starts following the clock from `now_ms`.  Returns the walk state the
    /// caller drives on a timer, or `None` when the interval is too large to
    /// walk.  Any earlier walk stops.
    pub fn start_walk(&self, now_ms: i64) -> Option<Walk> {
        let interval = self.shared.interval;
        if interval > MAX_WALK_INTERVAL_MS {
            return None;
        }
        let mut inner = self.shared.lock();
        inner.walk_generation += 1;
        Some(Walk {
            grid: Arc::downgrade(&self.shared),
            offset: now_ms - inner.beg * interval as i64,
            generation: inner.walk_generation,
            interval,
        })
    }

    pub fn stop_walk(&self) {
        self.shared.lock().walk_generation += 1;
    }

    /// Stops walking and detaches from every sink.
    pub fn close(&self) {
        let sinks = {
            let mut inner = self.shared.lock();
            inner.walk_generation += 1;
            std::mem::take(&mut inner.sinks)
        };
        for sink in sinks {
            sink.unregister(self.shared.id);
        }
    }
}

/// State of a walking grid, advanced by [`Walk::step`] once per interval.
#[derive(Debug, Clone)]
pub struct Walk {
    grid: Weak<GridShared>,
    offset: i64,
    generation: u64,
    interval: u64,
}

impl Walk {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.interval)
    }

    /// Moves the window to follow `now_ms`.  Returns `false` once the walk
    /// was stopped (by a move, a new walk, or close) or the grid is gone.
    pub fn step(&self, now_ms: i64) -> bool {
        let Some(shared) = self.grid.upgrade() else {
            return false;
        };
        if shared.lock().walk_generation != self.generation {
            return false;
        }
        let grid = SeriesGrid { shared };
        let beg = (now_ms - self.offset).div_euclid(self.interval as i64);
        grid.move_internal(beg, None, true);
        true
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_window_from_constructor() {
        let grid = SeriesGrid::new(555, 3, Some(Timestep::At(8)));
        assert_eq!((grid.interval(), grid.beg(), grid.end()), (555, 3, 8));

        let grid = SeriesGrid::new(555, 3, None);
        assert_eq!((grid.beg(), grid.end()), (3, 3));
    }

    #[test]
    fn test_calculated_row_fills_notified_range() {
        // Arrange
        let grid = SeriesGrid::new(1000, 3, Some(Timestep::At(8)));
        let row = grid.add_calculated(false, |rows, me, x, n| {
            for i in 0..n {
                rows.set(me, x + i, Some(json!(i)));
            }
        });

        // Act
        grid.notify(1, 4);

        // Assert
        assert_eq!(
            grid.row(row),
            vec![None, Some(json!(0)), Some(json!(1)), Some(json!(2)), Some(json!(3))]
        );
    }

    #[test]
    fn test_early_calculation_runs_first() {
        let grid = SeriesGrid::new(1000, 3, Some(Timestep::At(8)));
        let base = Arc::new(Mutex::new(None::<RowId>));

        let base_ref = Arc::clone(&base);
        let dependant = grid.add_calculated(false, move |rows, me, x, n| {
            let base = base_ref.lock().unwrap().unwrap();
            for i in 0..n {
                let v = rows.value(base, x + i).and_then(Value::as_i64).unwrap_or(-100);
                rows.set(me, x + i, Some(json!(v + 10)));
            }
        });
        let calculated = grid.add_calculated(true, |rows, me, x, n| {
            for i in 0..n {
                rows.set(me, x + i, Some(json!(i)));
            }
        });
        *base.lock().unwrap() = Some(calculated);

        grid.notify(1, 4);

        assert_eq!(
            grid.row(dependant),
            vec![None, Some(json!(10)), Some(json!(11)), Some(json!(12)), Some(json!(13))]
        );
    }

    #[test]
    fn test_notify_is_clamped_to_window() {
        // Arrange
        let grid = SeriesGrid::new(1000, 5, Some(Timestep::At(15)));
        let called = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&called);
        grid.add_calculated(false, move |_, _, _, n| {
            *seen.lock().unwrap() = Some(n);
        });

        // Act / Assert
        grid.notify(10, 8);
        assert_eq!(*called.lock().unwrap(), None, "out of bounds");

        grid.notify(1, 0);
        assert_eq!(*called.lock().unwrap(), None, "zero length");

        grid.notify(1, 20);
        assert_eq!(*called.lock().unwrap(), Some(9), "truncated to right limit");
    }

    #[test]
    fn test_move_negative_is_relative_to_now() {
        let now = 1_000_000;
        let grid = SeriesGrid::new(1000, 0, None);

        grid.move_at(-20, Some(Timestep::FromNow(-5)), now);
        assert_eq!((grid.beg(), grid.end()), (980, 995));

        grid.move_at(-30, Some(Timestep::FromNow(0)), now);
        assert_eq!((grid.beg(), grid.end()), (970, 1000));
    }

    #[test]
    fn test_move_with_end_before_beg_collapses() {
        let grid = SeriesGrid::new(1000, 10, Some(Timestep::At(5)));
        assert_eq!((grid.beg(), grid.end()), (5, 5));
    }

    #[test]
    fn test_walk_stops_after_move() {
        // Arrange
        let grid = SeriesGrid::new(100, 20, Some(Timestep::At(25)));
        grid.add_row();
        let walk = grid.start_walk(2_000).unwrap();

        // Act
        assert!(walk.step(2_100));
        let after_step = (grid.beg(), grid.end());
        grid.move_to(0, Some(Timestep::At(5)));

        // Assert
        assert_eq!(after_step, (21, 26));
        assert!(!walk.step(2_200));
    }

    #[test]
    fn test_huge_interval_does_not_walk() {
        let grid = SeriesGrid::new(3_000_000_000, 0, None);
        assert!(grid.start_walk(0).is_none());
    }
}
