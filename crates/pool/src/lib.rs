//! Dependency-aware async task pool.
//!
//! Tasks are submitted as futures and executed under a dynamically
//! adjustable concurrency limit. Tasks may be sequenced after one another,
//! forming a dependency DAG: a task becomes runnable only once every task it
//! depends on has completed. Results are retained until consumed by the
//! submitter, and cancelling a task also unschedules everything that
//! transitively depends on it.
//!
//! # Design
//!
//! One coarse mutex guards the pool's shared cells (dependency graph,
//! process table, slot counters); a single notifier wakes the driver loop
//! and blocked waiters after every committing mutation. The driver reserves
//! slots for ready tasks atomically, then spawns their bodies onto the tokio
//! runtime, each raced against a per-task cancellation token.
//!
//! ```no_run
//! use taskpool::Pool;
//!
//! # async fn example() -> Result<(), taskpool::TaskError> {
//! let pool: Pool<u32> = Pool::start(4);
//! let parent = pool.submit(async { Ok(1) });
//! let child = pool.submit_after(parent, async { Ok(2) });
//! assert_eq!(pool.wait(parent).await?, 1);
//! assert_eq!(pool.wait(child).await?, 2);
//! # Ok(())
//! # }
//! ```

mod graph;
mod map;
mod ops;
mod state;
mod types;


pub use map::{map_tasks, try_map_tasks};
pub use ops::Pool;
pub use state::PoolStats;
pub use types::{TaskBody, TaskError, TaskId, TaskOutcome};
