use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::graph::TaskGraph;
use crate::types::{TaskId, TaskOutcome};

/// Settled-but-unconsumed results before a backlog warning is logged.
pub(crate) const SETTLED_HIGH_WATER: usize = 256;

/// Process-table entry for a reserved or running task.
pub(crate) struct ProcEntry<T> {
	/// Filled by the epilogue once the body settles.
	pub(crate) outcome: Option<TaskOutcome<T>>,
	/// Fired to cancel the running body.
	pub(crate) cancel: CancellationToken,
}

/// The pool's mutable cells. Every mutation happens under one lock so no
/// caller observes a node started without its slot debited, or a completed
/// edge without the slot returned.
pub(crate) struct PoolState<T> {
	/// Configured concurrency limit.
	pub(crate) slots: usize,
	/// Currently unused slots. `slots - avail` bodies are in flight.
	pub(crate) avail: usize,
	/// Next task id. Strictly monotonic, never reused.
	next_id: u64,
	/// Settled process-table entries not yet consumed.
	pub(crate) settled: usize,
	/// Dependency DAG of submitted tasks.
	pub(crate) graph: TaskGraph<T>,
	/// Completion handles for reserved, running, and finished-but-unconsumed
	/// tasks.
	pub(crate) procs: FxHashMap<TaskId, ProcEntry<T>>,
	/// Tasks ever submitted.
	pub(crate) submitted_total: u64,
	/// Bodies whose epilogue has run.
	pub(crate) completed_total: u64,
	/// Tasks removed by cancellation.
	pub(crate) cancelled_total: u64,
}

impl<T> PoolState<T> {
	pub(crate) fn new(slots: usize) -> Self {
		Self {
			slots,
			avail: slots,
			next_id: 0,
			settled: 0,
			graph: TaskGraph::new(),
			procs: FxHashMap::default(),
			submitted_total: 0,
			completed_total: 0,
			cancelled_total: 0,
		}
	}

	/// Mints a fresh task id.
	pub(crate) fn mint(&mut self) -> TaskId {
		let id = TaskId(self.next_id);
		self.next_id += 1;
		id
	}

	pub(crate) fn debug_assert_slots(&self) {
		debug_assert!(
			self.avail <= self.slots,
			"avail ({}) exceeds slots ({})",
			self.avail,
			self.slots,
		);
	}
}

/// State shared between pool handles, the driver, and spawned bodies.
pub(crate) struct PoolShared<T> {
	pub(crate) state: Mutex<PoolState<T>>,
	/// Fired after every committing mutation. Blocked operations register
	/// before re-checking their predicate, so no wakeup is lost.
	pub(crate) changed: Notify,
}

impl<T> PoolShared<T> {
	pub(crate) fn new(slots: usize) -> Self {
		Self {
			state: Mutex::new(PoolState::new(slots)),
			changed: Notify::new(),
		}
	}
}

/// Point-in-time snapshot of pool accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
	/// Configured concurrency limit.
	pub slots: usize,
	/// Currently unused slots.
	pub available: usize,
	/// Bodies currently in flight.
	pub running: usize,
	/// Graph nodes not yet reserved for spawning.
	pub queued: usize,
	/// Settled results awaiting consumption.
	pub settled: usize,
	/// Tasks ever submitted.
	pub submitted_total: u64,
	/// Bodies whose epilogue has run.
	pub completed_total: u64,
	/// Tasks removed by cancellation.
	pub cancelled_total: u64,
}
