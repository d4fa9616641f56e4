//! Drives a walking [`SeriesGrid`] from a tokio timer.

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use bridgemux_core::series::now_ms;
use bridgemux_core::SeriesGrid;

/// A running walk.  Dropping it stops the timer.
#[derive(Debug)]
pub struct GridWalker {
    task: JoinHandle<()>,
}

impl GridWalker {
    /// Starts walking `grid` along the wall clock, one step per interval.
    ///
    /// Returns `None` when the grid's interval is too large to walk.  The
    /// timer ends by itself once the grid is moved, walked again or closed.
    pub fn start(grid: &SeriesGrid) -> Option<Self> {
        let walk = grid.start_walk(now_ms())?;
        let period = walk.period();
        let task = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if !walk.step(now_ms()) {
                    debug!(target: "bridgemux::metrics", "grid walk ended");
                    return;
                }
            }
        });
        Some(Self { task })
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for GridWalker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::settle;
    use bridgemux_core::series::Timestep;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_walker_ticks_until_grid_moves() {
        // Arrange
        let grid = SeriesGrid::new(1000, Timestep::FromNow(-5), Some(Timestep::FromNow(0)));
        let ticks = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = std::sync::Arc::clone(&ticks);
        grid.add_calculated(false, move |_, _, _, _| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        let walker = GridWalker::start(&grid).unwrap();

        // Act
        tokio::time::advance(Duration::from_millis(1000)).await;
        settle().await;
        let after_one = ticks.load(std::sync::atomic::Ordering::SeqCst);
        grid.move_to(0, Some(Timestep::At(5)));
        tokio::time::advance(Duration::from_millis(1000)).await;
        settle().await;

        // Assert
        assert!(after_one >= 1);
        assert!(walker.is_finished());
    }

    #[tokio::test]
    async fn test_huge_interval_does_not_walk() {
        let grid = SeriesGrid::new(u64::MAX / 2, 0, None);
        assert!(GridWalker::start(&grid).is_none());
    }
}
