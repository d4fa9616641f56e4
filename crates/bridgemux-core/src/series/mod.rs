//! Time-series cache: block store, sinks that feed it, and grids that read it.

pub mod grid;
pub mod mapping;
pub mod sink;
pub mod store;

pub use grid::{now_ms, GridId, GridRows, RowId, SeriesGrid, Timestep, Walk};
pub use mapping::{Mapping, MappingNode};
pub use sink::{FetchCallback, RowPath, SeriesError, SeriesSink};
pub use store::{Sample, SeriesIndex, SeriesStorage, PRIVATE_LIMIT, SHARED_LIMIT};
