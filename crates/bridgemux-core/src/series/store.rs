//! Sorted, capacity-bounded store of sample blocks.
//!
//! # Layout (for beginners)
//!
//! Samples arrive in *blocks*: "starting at timestep 700, here are 60 rows".
//! The index keeps those blocks sorted by their first timestep (`beg`) so a
//! binary search finds the block covering any timestep quickly.
//!
//! ```text
//! index:   [beg=100 ×10] [beg=110 ×5] [beg=200 ×60]
//! expiry:  oldest inserted ──────────────▶ newest
//! ```
//!
//! Two rules keep the store sane:
//!
//! 1. **No double coverage.**  When a new block overlaps existing ones, the
//!    overlapping samples are cut out of the old blocks first.
//! 2. **Bounded size.**  Once the total sample count exceeds `limit`, whole
//!    blocks are dropped in insertion order (oldest first) via the expiry
//!    queue until the count fits again.
//!
//! Several sinks may share one index through [`SeriesStorage`], keyed by an
//! identifier string.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::series::mapping::Mapping;

/// One sample slot; `None` is "no data".
pub type Sample = Option<Value>;

/// Default sample limit for a private index.
pub const PRIVATE_LIMIT: usize = 1024;
/// Default sample limit for an index shared through [`SeriesStorage`].
pub const SHARED_LIMIT: usize = 64 * 1024;

type EntryId = u64;

#[derive(Debug, Clone)]
struct Entry {
    beg: i64,
    items: Vec<Sample>,
    mapping: Option<Arc<Mapping>>,
}

impl Entry {
    fn end(&self) -> i64 {
        self.beg + self.items.len() as i64
    }
}

/// A stored block intersecting a queried range, already sliced to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub beg: i64,
    pub items: Vec<Sample>,
    pub mapping: Option<Arc<Mapping>>,
}

/// Result of walking the index for `[beg, end)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Coverage {
    /// Stored data in ascending order.
    pub hits: Vec<Hit>,
    /// Sub-ranges with nothing stored, in ascending order.
    pub gaps: Vec<(i64, i64)>,
}

/// The sorted block index.
#[derive(Debug)]
pub struct SeriesIndex {
    /// Entry ids sorted by `beg`; no two entries overlap and none is empty.
    order: Vec<EntryId>,
    entries: HashMap<EntryId, Entry>,
    /// Insertion order for eviction.  May hold a bounded number of ids
    /// already removed.
    expiry: VecDeque<EntryId>,
    next_id: EntryId,
    count: usize,
    limit: usize,
}

impl SeriesIndex {
    pub fn new(limit: usize) -> Self {
        Self {
            order: Vec::new(),
            entries: HashMap::new(),
            expiry: VecDeque::new(),
            next_id: 0,
            count: 0,
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
        self.expire();
    }

    /// Total stored samples.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Number of stored blocks.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn entry(&self, position: usize) -> &Entry {
        &self.entries[&self.order[position]]
    }

    /// Position of the entry starting at `beg`, or where one would be inserted.
    fn search(&self, beg: i64) -> usize {
        match self.order.binary_search_by_key(&beg, |id| self.entries[id].beg) {
            Ok(found) => found,
            Err(insert_at) => insert_at,
        }
    }

    /// Collects what is stored for `[beg, end)` and what is missing.
    pub fn coverage(&self, beg: i64, end: i64) -> Coverage {
        let mut coverage = Coverage::default();
        if end <= beg {
            return coverage;
        }

        let at = self.search(beg);
        let mut last = beg;

        // Data for this range can start at the found position or one before.
        for i in at.saturating_sub(1)..self.order.len() {
            let entry = self.entry(i);
            let b = entry.beg.max(beg);
            let e = entry.end().min(end);

            if b < e {
                if b > last {
                    coverage.gaps.push((last, b));
                }
                let from = (b - entry.beg) as usize;
                let to = (e - entry.beg) as usize;
                coverage.hits.push(Hit {
                    beg: b,
                    items: entry.items[from..to].to_vec(),
                    mapping: entry.mapping.clone(),
                });
                last = e;
            } else if i >= at {
                break;
            }
        }

        if last != end {
            coverage.gaps.push((last, end));
        }
        coverage
    }

    /// Inserts a block, cutting overlapping samples out of older blocks and
    /// expiring the oldest blocks while over the limit.
    pub fn stash(&mut self, beg: i64, items: Vec<Sample>, mapping: Option<Arc<Mapping>>) {
        if items.is_empty() {
            return;
        }
        let end = beg + items.len() as i64;
        let at = self.search(beg);

        let mut split_tail = None;
        for i in at.saturating_sub(1)..self.order.len() {
            let id = self.order[i];
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            let eb = entry.beg;
            let ee = entry.end();
            let b = eb.max(beg);
            let e = ee.min(end);

            if b < e {
                let before = entry.items.len();
                let from = (b - eb) as usize;
                let to = (e - eb) as usize;
                if b > eb && e < ee {
                    // New block lands strictly inside: keep head and tail apart.
                    let tail = entry.items.split_off(to);
                    entry.items.truncate(from);
                    split_tail = Some(Entry {
                        beg: e,
                        items: tail,
                        mapping: entry.mapping.clone(),
                    });
                } else {
                    entry.items.drain(from..to);
                    if from == 0 {
                        entry.beg = e;
                    }
                }
                self.count -= before - entry.items.len();
            } else if i >= at {
                break;
            }
        }

        self.insert(Entry {
            beg,
            items,
            mapping,
        });
        if let Some(tail) = split_tail {
            self.insert(tail);
        }

        self.remove_empty();
        self.expire();
    }

    fn insert(&mut self, entry: Entry) {
        let id = self.next_id;
        self.next_id += 1;
        let at = self.search(entry.beg);
        self.count += entry.items.len();
        self.entries.insert(id, entry);
        self.order.insert(at, id);
        self.expiry.push_back(id);
    }

    fn remove_empty(&mut self) {
        let entries = &mut self.entries;
        self.order.retain(|id| {
            let keep = entries.get(id).is_some_and(|e| !e.items.is_empty());
            if !keep {
                entries.remove(id);
            }
            keep
        });

        // Stale ids of overwritten blocks stay queued until compacted.
        if self.expiry.len() > 2 * self.order.len() + 16 {
            let entries = &self.entries;
            self.expiry.retain(|id| entries.contains_key(id));
        }
    }

    fn expire(&mut self) {
        while self.count > self.limit {
            let Some(id) = self.expiry.pop_front() else {
                break;
            };
            let Some(beg) = self.entries.get(&id).map(|entry| entry.beg) else {
                continue;
            };
            let position = self.search(beg);
            if self.order.get(position) == Some(&id) {
                self.order.remove(position);
            } else {
                self.order.retain(|other| *other != id);
            }
            if let Some(entry) = self.entries.remove(&id) {
                self.count -= entry.items.len();
            }
        }
    }
}

// ── Shared storage ────────────────────────────────────────────────────────────

/// Table of indexes shared between sinks, keyed by identifier.
///
/// Clone the handle to share it; every clone sees the same table.
#[derive(Debug, Clone, Default)]
pub struct SeriesStorage {
    indexes: Arc<Mutex<HashMap<String, Arc<Mutex<SeriesIndex>>>>>,
}

impl SeriesStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The index for `identifier`, created with `limit` if it does not exist.
    pub fn index(&self, identifier: &str, limit: usize) -> Arc<Mutex<SeriesIndex>> {
        let mut indexes = self.indexes.lock().unwrap_or_else(PoisonError::into_inner);
        indexes
            .entry(identifier.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(SeriesIndex::new(limit))))
            .clone()
    }

    pub fn contains(&self, identifier: &str) -> bool {
        let indexes = self.indexes.lock().unwrap_or_else(PoisonError::into_inner);
        indexes.contains_key(identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn samples(values: &[&str]) -> Vec<Sample> {
        values.iter().map(|v| Some(json!(v))).collect()
    }

    fn flatten(coverage: &Coverage, beg: i64, end: i64) -> Vec<Sample> {
        let mut out = vec![None; (end - beg) as usize];
        for hit in &coverage.hits {
            for (i, item) in hit.items.iter().enumerate() {
                out[(hit.beg - beg) as usize + i] = item.clone();
            }
        }
        out
    }

    #[test]
    fn test_coverage_reports_gaps_around_data() {
        // Arrange
        let mut index = SeriesIndex::new(PRIVATE_LIMIT);
        index.stash(7, samples(&["a", "b", "c"]), None);

        // Act
        let coverage = index.coverage(5, 15);

        // Assert
        assert_eq!(coverage.gaps, vec![(5, 7), (10, 15)]);
        assert_eq!(coverage.hits.len(), 1);
        assert_eq!(coverage.hits[0].beg, 7);
    }

    #[test]
    fn test_stashing_twice_is_idempotent() {
        let mut once = SeriesIndex::new(PRIVATE_LIMIT);
        once.stash(3, samples(&["x", "y"]), None);

        let mut twice = SeriesIndex::new(PRIVATE_LIMIT);
        twice.stash(3, samples(&["x", "y"]), None);
        twice.stash(3, samples(&["x", "y"]), None);

        assert_eq!(once.coverage(0, 10), twice.coverage(0, 10));
        assert_eq!(twice.count(), 2);
        assert_eq!(twice.len(), 1);
    }

    #[test]
    fn test_overlap_truncates_older_blocks() {
        // Arrange
        let mut index = SeriesIndex::new(PRIVATE_LIMIT);
        index.stash(6, samples(&["a", "a"]), None);
        index.stash(8, samples(&["b", "b"]), None);
        index.stash(10, samples(&["c"]), None);

        // Act
        index.stash(7, samples(&["n", "n"]), None);

        // Assert
        let coverage = index.coverage(5, 11);
        assert_eq!(
            flatten(&coverage, 5, 11),
            vec![None, Some(json!("a")), Some(json!("n")), Some(json!("n")), Some(json!("b")), Some(json!("c"))]
        );
        assert_eq!(index.count(), 5);
    }

    #[test]
    fn test_block_inside_another_keeps_the_tail_in_place() {
        let mut index = SeriesIndex::new(PRIVATE_LIMIT);
        index.stash(0, samples(&["0", "1", "2", "3", "4"]), None);

        index.stash(2, samples(&["X"]), None);

        let coverage = index.coverage(0, 5);
        assert_eq!(
            flatten(&coverage, 0, 5),
            samples(&["0", "1", "X", "3", "4"])
        );
        assert_eq!(index.count(), 5);
    }

    #[test]
    fn test_limit_expires_oldest_inserted_first() {
        // Arrange
        let mut index = SeriesIndex::new(5);
        index.stash(8, samples(&["eight"]), None);
        index.stash(6, samples(&["six", "seven"]), None);
        index.stash(9, samples(&["nine"]), None);

        // Act
        index.stash(10, samples(&["ten", "eleven"]), None);

        // Assert: "eight" was inserted first and is gone.
        let coverage = index.coverage(4, 14);
        assert_eq!(
            flatten(&coverage, 4, 12),
            vec![
                None,
                None,
                Some(json!("six")),
                Some(json!("seven")),
                None,
                Some(json!("nine")),
                Some(json!("ten")),
                Some(json!("eleven")),
            ]
        );
        assert_eq!(index.count(), 5);
    }

    #[test]
    fn test_restashing_same_range_keeps_expiry_queue_bounded() {
        // Arrange
        let mut index = SeriesIndex::new(PRIVATE_LIMIT);

        // Act: a placeholder replaced by data, over and over
        for _ in 0..10_000 {
            index.stash(0, vec![Some(json!(1))], None);
        }

        // Assert
        assert_eq!(index.len(), 1);
        assert_eq!(index.count(), 1);
        assert!(index.expiry.len() <= 2 * index.len() + 16, "expiry grew to {}", index.expiry.len());
    }

    #[test]
    fn test_expiry_still_evicts_oldest_after_compaction() {
        let mut index = SeriesIndex::new(3);
        for _ in 0..100 {
            index.stash(0, samples(&["old"]), None);
        }
        index.stash(10, samples(&["a", "b"]), None);
        index.stash(20, samples(&["c"]), None);

        assert_eq!(index.count(), 3);
        assert_eq!(index.coverage(0, 1).gaps, vec![(0, 1)]);
        assert_eq!(index.coverage(20, 21).hits.len(), 1);
    }

    #[test]
    fn test_storage_shares_index_by_identifier() {
        let storage = SeriesStorage::new();
        let a = storage.index("cpu", SHARED_LIMIT);
        let b = storage.clone().index("cpu", SHARED_LIMIT);

        a.lock().unwrap().stash(0, samples(&["v"]), None);

        assert_eq!(b.lock().unwrap().count(), 1);
        assert!(storage.contains("cpu"));
        assert!(!storage.contains("mem"));
    }
}
