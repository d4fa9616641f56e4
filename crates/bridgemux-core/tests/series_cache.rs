//! Integration tests for the series sink and grid.
//!
//! # Purpose
//!
//! These tests drive [`SeriesSink`] and [`SeriesGrid`] together through their
//! public API, the way the metrics client does:
//!
//! - Live input lands in grid rows picked out by dotted or array paths.
//! - A positional mapping resolves names into indexes.
//! - `sync` and `move` serve cached blocks and fetch only the gaps.
//! - Overlapping input replaces older samples instead of duplicating them.
//! - The sample limit expires the oldest blocks first.
//!
//! ```text
//! sink.input(7, [s7, s8, s9])      grid window [5, 15)
//!        │                               │
//!        └──── process ──▶ rows[2..5] ◀──┘
//!        └──── stash   ──▶ index
//! ```

use std::sync::{Arc, Mutex};

use bridgemux_core::series::{Mapping, RowId, RowPath, SeriesGrid, SeriesSink, Timestep};
use serde_json::{json, Value};

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn sample(base: i64) -> Value {
    json!({
        "one": { "sub": [base, base + 1, base + 2], "another": [base / 10, base / 10 + 1, base / 10 + 2] },
        "two": { "sub": [base * 10, base * 10 + 1, base * 10 + 2], "marmalade": [0, 1, 2] }
    })
}

fn nums(values: &[Option<i64>]) -> Vec<Option<Value>> {
    values.iter().map(|v| v.map(|n| json!(n))).collect()
}

type Fetched = Arc<Mutex<Vec<(i64, i64)>>>;

fn recording_sink(interval: u64) -> (SeriesSink, Fetched) {
    let fetched: Fetched = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&fetched);
    let sink = SeriesSink::new(interval).with_fetch(Arc::new(move |beg, end, _walking| {
        record.lock().unwrap().push((beg, end));
    }));
    (sink, fetched)
}

fn sum_row(grid: &SeriesGrid, a: RowId, b: RowId) -> RowId {
    grid.add_calculated(false, move |rows, me, x, n| {
        for i in 0..n {
            let sum = match (
                rows.value(a, x + i).and_then(Value::as_i64),
                rows.value(b, x + i).and_then(Value::as_i64),
            ) {
                (Some(l), Some(r)) => Some(json!(l + r)),
                _ => None,
            };
            rows.set(me, x + i, sum);
        }
    })
}

fn window(beg: i64, end: i64) -> SeriesGrid {
    SeriesGrid::new(1000, beg, Some(Timestep::At(end)))
}

// ── Live input ────────────────────────────────────────────────────────────────

#[test]
fn test_input_fills_rows_by_string_and_array_path() {
    // Arrange
    let grid = window(5, 15);
    let sink = SeriesSink::new(1000);
    let row1 = grid.add_sink(&sink, "one.sub.2").unwrap();
    let row2 = grid.add_sink(&sink, ["one", "sub", "2"]).unwrap();
    let calc = sum_row(&grid, row1, row2);

    let notified = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&notified);
    grid.on_notify(move |x, n| *seen.lock().unwrap() = Some((x, n)));

    // Act
    sink.input(7, vec![sample(200), sample(300), sample(400)], None);

    // Assert
    assert_eq!(*notified.lock().unwrap(), Some((2, 3)));
    assert_eq!(grid.row(row1), nums(&[None, None, Some(202), Some(302), Some(402)]));
    assert_eq!(grid.row(row2), nums(&[None, None, Some(202), Some(302), Some(402)]));
    assert_eq!(grid.row(calc), nums(&[None, None, Some(404), Some(604), Some(804)]));

    grid.close();
}

#[test]
fn test_row_without_path_gets_whole_sample() {
    let grid = window(5, 15);
    let sink = SeriesSink::new(1000);
    let row = grid.add_sink(&sink, None::<&str>).unwrap();

    sink.input(8, vec![json!(567), json!(768), json!({"hello": "scruffy"})], None);

    assert_eq!(
        grid.row(row),
        vec![None, None, None, Some(json!(567)), Some(json!(768)), Some(json!({"hello": "scruffy"}))]
    );
}

#[test]
fn test_closed_grid_receives_nothing() {
    // Arrange
    let grid = window(5, 15);
    let sink = SeriesSink::new(1000);
    let row = grid.add_sink(&sink, RowPath::default()).unwrap();
    let items = vec![json!(1), json!(2), json!(3)];

    // Act
    sink.input(5, items.clone(), None);
    sink.input(8, items.clone(), None);
    let before_close = grid.row(row);
    grid.close();
    sink.input(11, items, None);

    // Assert
    let expected = nums(&[Some(1), Some(2), Some(3), Some(1), Some(2), Some(3)]);
    assert_eq!(before_close, expected);
    assert_eq!(grid.row(row), expected);
}

#[test]
fn test_mapping_resolves_positions() {
    // Arrange
    let grid = window(5, 15);
    let sink = SeriesSink::new(1000);
    let row1 = grid.add_sink(&sink, "two.sub.1").unwrap();
    let row2 = grid.add_sink(&sink, "one.sub").unwrap();
    let row3 = grid.add_sink(&sink, "invalid").unwrap();

    let mapping = Mapping::from_value(&json!({
        "one": { "": 0, "sub": { "": 0 }, "another": { "": 1 } },
        "two": { "": 1, "sub": { "": 0 }, "marmalade": { "": 1 } }
    }));
    let items = vec![
        json!([[[200, 201, 202], [20, 21, 22]], [[2000, 2001, 2002], [0, 1, 2]]]),
        json!([[[300, 301, 302], [30, 31, 32]], [[3000, 3001, 3002], [0, 1, 2]]]),
        json!([[[400, 401, 402], [40, 41, 42]], [[4000, 4001, 4002], [0, 1, 2]]]),
    ];

    // Act
    sink.input(5, items, Some(Arc::new(mapping)));

    // Assert
    assert_eq!(grid.row(row1), nums(&[Some(2001), Some(3001), Some(4001)]));
    assert_eq!(
        grid.row(row2),
        vec![
            Some(json!([200, 201, 202])),
            Some(json!([300, 301, 302])),
            Some(json!([400, 401, 402]))
        ]
    );
    assert_eq!(grid.row(row3), vec![None, None, None]);
}

#[test]
fn test_grid_rejects_sink_with_other_interval() {
    let grid = window(0, 10);
    let sink = SeriesSink::new(500);
    assert!(grid.add_sink(&sink, "x").is_err());
}

// ── Cached loads ──────────────────────────────────────────────────────────────

#[test]
fn test_sync_serves_cache_and_fetches_gaps() {
    // Arrange
    let (sink, fetched) = recording_sink(1000);
    sink.input(7, vec![sample(200), sample(300), sample(400)], None);

    let grid = window(5, 15);
    let notified = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&notified);
    grid.on_notify(move |x, n| *seen.lock().unwrap() = Some((x, n)));
    let row1 = grid.add_sink(&sink, "one.sub.2").unwrap();
    let row2 = grid.add_sink(&sink, ["one", "sub", "2"]).unwrap();
    let calc = sum_row(&grid, row1, row2);

    // Act
    grid.sync();

    // Assert
    assert_eq!(*fetched.lock().unwrap(), vec![(5, 7), (10, 15)]);
    assert_eq!(*notified.lock().unwrap(), Some((0, 10)));
    assert_eq!(grid.row(row1), nums(&[None, None, Some(202), Some(302), Some(402)]));
    assert_eq!(
        grid.row(calc),
        nums(&[None, None, Some(404), Some(604), Some(804), None, None, None, None, None])
    );

    grid.close();
}

#[test]
fn test_sync_over_multiple_blocks() {
    let (sink, fetched) = recording_sink(1000);
    sink.input(7, vec![sample(200)], None);
    sink.input(8, vec![sample(300)], None);
    sink.input(9, vec![sample(400)], None);

    let grid = window(5, 15);
    let row = grid.add_sink(&sink, "one.sub.2").unwrap();
    grid.sync();

    assert_eq!(*fetched.lock().unwrap(), vec![(5, 7), (10, 15)]);
    assert_eq!(grid.row(row), nums(&[None, None, Some(202), Some(302), Some(402)]));
}

#[test]
fn test_fetched_ranges_are_not_requested_twice() {
    // Arrange
    let (sink, fetched) = recording_sink(1000);
    let grid = window(5, 15);
    grid.add_sink(&sink, RowPath::default()).unwrap();

    // Act
    grid.sync();
    grid.sync();

    // Assert: the placeholder from the first fetch covers the second sync.
    assert_eq!(*fetched.lock().unwrap(), vec![(5, 15)]);
}

#[test]
fn test_overlapping_input_replaces_older_samples() {
    // Arrange
    let (sink, _fetched) = recording_sink(1000);
    let grid = window(5, 15);
    let row1 = grid.add_sink(&sink, "one.sub.2").unwrap();

    sink.input(6, vec![sample(200), sample(200)], None);
    sink.input(8, vec![sample(300), sample(300)], None);
    sink.input(10, vec![sample(900)], None);
    assert_eq!(
        grid.row(row1),
        nums(&[None, Some(202), Some(202), Some(302), Some(302), Some(902)])
    );

    // Act
    sink.input(7, vec![sample(400), sample(400)], None);
    let row2 = grid.add_sink(&sink, "one.sub.2").unwrap();
    grid.sync();

    // Assert
    let expected = &[None, Some(202), Some(402), Some(402), Some(302), Some(902)];
    assert_eq!(&grid.row(row1)[..6], nums(expected).as_slice());
    assert_eq!(&grid.row(row2)[..6], nums(expected).as_slice());

    grid.close();
}

#[test]
fn test_limit_expires_oldest_blocks() {
    // Arrange
    let series = SeriesSink::new(1000);
    series.set_limit(5);
    series.input(8, vec![json!("eight")], None);
    series.input(6, vec![json!("six"), json!("seven")], None);
    series.input(9, vec![json!("nine")], None);

    let grid = window(5, 15);
    let row = grid.add_sink(&series, None::<&str>).unwrap();
    grid.sync();
    assert_eq!(
        grid.row(row),
        vec![None, Some(json!("six")), Some(json!("seven")), Some(json!("eight")), Some(json!("nine"))]
    );

    // Act: push the store over its limit.
    series.input(10, vec![json!("ten"), json!("eleven")], None);
    grid.move_to(4, Some(Timestep::At(14)));

    // Assert
    assert_eq!(
        grid.row(row),
        vec![
            None,
            None,
            Some(json!("six")),
            Some(json!("seven")),
            None,
            Some(json!("nine")),
            Some(json!("ten")),
            Some(json!("eleven"))
        ]
    );

    series.input(3, vec![json!("three"), json!("four"), json!("five")], None);
    grid.move_to(3, Some(Timestep::At(13)));
    assert_eq!(
        grid.row(row),
        vec![
            Some(json!("three")),
            Some(json!("four")),
            Some(json!("five")),
            None,
            None,
            None,
            None,
            Some(json!("ten")),
            Some(json!("eleven"))
        ]
    );

    grid.close();
}

#[test]
fn test_move_loads_new_window() {
    // Arrange
    let (sink, fetched) = recording_sink(1000);
    let grid = window(20, 25);
    let row = grid.add_sink(&sink, "one.sub.2").unwrap();
    let notified = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&notified);
    grid.on_notify(move |x, n| *seen.lock().unwrap() = Some((x, n)));

    sink.input(7, vec![sample(200), sample(300), sample(400)], None);
    assert!(fetched.lock().unwrap().is_empty());
    assert_eq!(*notified.lock().unwrap(), None);
    assert!(grid.row(row).is_empty());

    // Act
    grid.move_to(5, Some(Timestep::At(15)));

    // Assert
    assert_eq!(*fetched.lock().unwrap(), vec![(5, 7), (10, 15)]);
    assert_eq!(*notified.lock().unwrap(), Some((0, 10)));
    assert_eq!(grid.row(row), nums(&[None, None, Some(202), Some(302), Some(402)]));
}

#[test]
fn test_walk_fetches_once_per_step() {
    // Arrange
    let (sink, fetched) = recording_sink(100);
    let grid = SeriesGrid::new(100, 20, Some(Timestep::At(25)));
    grid.add_sink(&sink, RowPath::default()).unwrap();
    let walk = grid.start_walk(2_000).unwrap();

    // Act
    for step in 1..=5 {
        assert!(walk.step(2_000 + step * 100));
    }

    // Assert
    let fetched = fetched.lock().unwrap();
    assert_eq!(fetched.len(), 5);
    assert_eq!(fetched[4], (25, 30));
}
