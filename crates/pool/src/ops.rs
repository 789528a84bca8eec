use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::graph::ReadyTask;
use crate::state::{PoolShared, PoolStats, ProcEntry, SETTLED_HIGH_WATER};
use crate::types::{TaskBody, TaskError, TaskId, TaskOutcome};

/// Dependency-aware task pool with a bounded, adjustable concurrency limit.
///
/// Cloning is cheap and every clone drives the same pool. Submitted bodies
/// run only while a driver ([`Pool::run`]) is executing; without one,
/// submissions queue indefinitely.
pub struct Pool<T> {
	shared: Arc<PoolShared<T>>,
}

impl<T> Clone for Pool<T> {
	fn clone(&self) -> Self {
		Self { shared: Arc::clone(&self.shared) }
	}
}

/// RAII epilogue for a spawned body. Runs on every exit path, including
/// panic unwind: restores the slot, mutates the graph, publishes the outcome
/// (or removes the entry for detached tasks), and wakes blocked operations.
struct Epilogue<T> {
	shared: Arc<PoolShared<T>>,
	id: TaskId,
	detached: bool,
	outcome: Option<TaskOutcome<T>>,
}

impl<T> Drop for Epilogue<T> {
	fn drop(&mut self) {
		let outcome = self
			.outcome
			.take()
			.unwrap_or_else(|| Err(TaskError::Panicked("<unknown panic>".to_string())));
		if self.detached && let Err(err) = &outcome {
			tracing::warn!(id = %self.id, error = %err, "pool.detached_failed");
		}

		let mut guard = self.shared.state.lock();
		let state = &mut *guard;
		// A shrink while this body ran can leave more bodies in flight than
		// slots; the min keeps avail within the new limit.
		state.avail = state.slots.min(state.avail + 1);
		state.completed_total += 1;
		state.graph.complete(self.id);
		if self.detached {
			state.procs.remove(&self.id);
		} else if let Some(entry) = state.procs.get_mut(&self.id) {
			// Entry absent means the task was cancelled while running;
			// there is nobody left to observe the outcome.
			entry.outcome = Some(outcome);
			state.settled += 1;
			if state.settled > SETTLED_HIGH_WATER {
				tracing::warn!(
					settled = state.settled,
					"pool.settle: unconsumed results exceed high-water mark"
				);
			}
		}
		state.debug_assert_slots();
		drop(guard);

		self.shared.changed.notify_waiters();
		tracing::trace!(id = %self.id, "pool.settle");
	}
}

impl<T: Send + 'static> Pool<T> {
	/// Creates a pool with `slots` concurrent task slots.
	///
	/// The pool is inert until [`Pool::run`] executes on some task.
	pub fn new(slots: usize) -> Self {
		tracing::debug!(slots, "pool.create");
		Self { shared: Arc::new(PoolShared::new(slots)) }
	}

	/// Creates a pool and spawns its driver onto the current tokio runtime.
	///
	/// The driver task runs until the runtime shuts down.
	pub fn start(slots: usize) -> Self {
		let pool = Self::new(slots);
		tokio::spawn(pool.clone().run());
		pool
	}

	/// Drives the pool: reserves slots for ready tasks and spawns their
	/// bodies. Never returns normally; run it on a dedicated task.
	pub async fn run(self) {
		tracing::debug!("pool.run");
		loop {
			let batch = self.reserve().await;
			tracing::trace!(reserved = batch.len(), "pool.reserve");
			for (task, cancel) in batch {
				self.spawn_body(task, cancel);
			}
		}
	}

	/// Blocks until at least one slot is free and at least one node is
	/// ready, then atomically debits the slots, takes the bodies, and
	/// registers each task's completion handle in the process table.
	///
	/// Registering before spawning means a cancellation interleaved between
	/// reservation and spawn finds the token and fires it; the spawned
	/// wrapper then observes the cancelled token on its first poll.
	async fn reserve(&self) -> Vec<(ReadyTask<T>, CancellationToken)> {
		let mut notified = pin!(self.shared.changed.notified());
		loop {
			notified.as_mut().enable();
			{
				let mut guard = self.shared.state.lock();
				let state = &mut *guard;
				if state.avail > 0 {
					let batch = state.graph.take_ready(state.avail);
					if !batch.is_empty() {
						state.avail -= batch.len();
						let mut reserved = Vec::with_capacity(batch.len());
						for task in batch {
							let cancel = CancellationToken::new();
							state.procs.insert(task.id, ProcEntry {
								outcome: None,
								cancel: cancel.clone(),
							});
							reserved.push((task, cancel));
						}
						state.debug_assert_slots();
						return reserved;
					}
				}
			}
			notified.as_mut().await;
			notified.set(self.shared.changed.notified());
		}
	}

	/// Spawns a reserved body onto the runtime, racing it against its
	/// cancellation token and catching panics. Spawning happens outside the
	/// state lock; it is a side effect that cannot be rolled back.
	fn spawn_body(&self, task: ReadyTask<T>, cancel: CancellationToken) {
		let ReadyTask { id, body, detached } = task;
		let shared = Arc::clone(&self.shared);
		tokio::spawn(async move {
			let mut epilogue = Epilogue { shared, id, detached, outcome: None };
			let outcome = tokio::select! {
				biased;
				_ = cancel.cancelled() => Err(TaskError::Cancelled),
				settled = AssertUnwindSafe(body).catch_unwind() => match settled {
					Ok(Ok(value)) => Ok(value),
					Ok(Err(err)) => Err(TaskError::Failed(err)),
					Err(panic) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
				},
			};
			epilogue.outcome = Some(outcome);
		});
	}

	/// Submits a task. It becomes runnable as soon as a slot is free.
	pub fn submit<F>(&self, body: F) -> TaskId
	where
		F: Future<Output = anyhow::Result<T>> + Send + 'static,
	{
		self.insert(Box::pin(body), false, None)
	}

	/// Submits a fire-and-forget task: its entry is removed from the
	/// process table when the body ends, so the result is never retained.
	/// Failures are logged instead of surfaced.
	pub fn submit_detached<F>(&self, body: F) -> TaskId
	where
		F: Future<Output = anyhow::Result<T>> + Send + 'static,
	{
		self.insert(Box::pin(body), true, None)
	}

	/// Submits a task that runs only after `parent` has completed.
	///
	/// Submission and edge insertion are one atomic step: the child is never
	/// observable without its dependency edge.
	pub fn submit_after<F>(&self, parent: TaskId, body: F) -> TaskId
	where
		F: Future<Output = anyhow::Result<T>> + Send + 'static,
	{
		self.insert(Box::pin(body), false, Some(parent))
	}

	/// Detached variant of [`Pool::submit_after`].
	pub fn submit_after_detached<F>(&self, parent: TaskId, body: F) -> TaskId
	where
		F: Future<Output = anyhow::Result<T>> + Send + 'static,
	{
		self.insert(Box::pin(body), true, Some(parent))
	}

	fn insert(&self, body: TaskBody<T>, detached: bool, after: Option<TaskId>) -> TaskId {
		let id = {
			let mut guard = self.shared.state.lock();
			let state = &mut *guard;
			let id = state.mint();
			state.graph.insert(id, body, detached);
			state.submitted_total += 1;
			if let Some(parent) = after {
				state.graph.link(parent, id);
			}
			id
		};
		self.shared.changed.notify_waiters();
		tracing::trace!(id = %id, detached, dependent = after.is_some(), "pool.submit");
		id
	}

	/// Makes `child` wait for `parent` to complete.
	///
	/// No-op when the parent has already finished and been pruned, or was
	/// cancelled: the child then runs whenever slot policy allows, rather
	/// than blocking on a vanished parent. Also a no-op once the child has
	/// been reserved for execution.
	pub fn sequence(&self, parent: TaskId, child: TaskId) {
		let linked = {
			let mut state = self.shared.state.lock();
			state.graph.link(parent, child)
		};
		tracing::trace!(parent = %parent, child = %child, linked, "pool.sequence");
	}

	/// Changes the concurrency limit.
	///
	/// Growing wakes the driver so waiting tasks start promptly. Shrinking
	/// never preempts running bodies; excess slots are absorbed as bodies
	/// finish.
	pub fn set_slots(&self, n: usize) {
		{
			let mut state = self.shared.state.lock();
			let (slots, avail) = (state.slots, state.avail);
			state.avail = if n >= slots {
				avail + (n - slots)
			} else {
				avail.saturating_sub(slots - n)
			};
			state.slots = n;
			state.debug_assert_slots();
		}
		self.shared.changed.notify_waiters();
		tracing::debug!(slots = n, "pool.resize");
	}

	/// Cancels a task and everything that transitively depends on it.
	///
	/// Not-yet-started descendants are unscheduled immediately; running ones
	/// have their cancellation token fired (honoring it is up to the body;
	/// the slot is restored by the body's epilogue either way). Results of
	/// cancelled tasks are discarded. Unknown or already-consumed ids are
	/// ignored.
	pub fn cancel(&self, id: TaskId) {
		let handles = {
			let mut guard = self.shared.state.lock();
			let state = &mut *guard;
			let removed = state.graph.remove_subtree(id);
			if removed.is_empty() {
				return;
			}
			state.cancelled_total += removed.len() as u64;
			let mut handles = Vec::with_capacity(removed.len());
			for rid in &removed {
				if let Some(entry) = state.procs.remove(rid) {
					if entry.outcome.is_some() {
						state.settled -= 1;
					}
					handles.push(entry.cancel);
				}
			}
			tracing::debug!(id = %id, removed = removed.len(), running = handles.len(), "pool.cancel");
			handles
		};
		for token in &handles {
			token.cancel();
		}
		self.shared.changed.notify_waiters();
	}

	/// Cancels every task in the pool.
	pub fn cancel_all(&self) {
		let handles: Vec<CancellationToken> = {
			let mut guard = self.shared.state.lock();
			let state = &mut *guard;
			state.cancelled_total += state.graph.len() as u64;
			state.graph.clear();
			state.settled = 0;
			state.procs.drain().map(|(_, entry)| entry.cancel).collect()
		};
		tracing::debug!(cancelled = handles.len(), "pool.cancel_all");
		for token in &handles {
			token.cancel();
		}
		self.shared.changed.notify_waiters();
	}

	/// Non-blocking result inspection.
	///
	/// `Some(outcome)` consumes the result: the task's entry is removed and
	/// later observations of the same id report it as unknown. `None` means
	/// the task is still queued or running. An id known to neither the graph
	/// nor the process table yields `Some(Err(TaskError::Unknown))`.
	pub fn try_outcome(&self, id: TaskId) -> Option<TaskOutcome<T>> {
		let (result, consumed) = {
			let mut guard = self.shared.state.lock();
			let state = &mut *guard;
			let settled = state.procs.get(&id).map(|entry| entry.outcome.is_some());
			match settled {
				Some(true) => {
					let outcome = state.procs.remove(&id).and_then(|entry| entry.outcome);
					state.settled -= 1;
					(outcome, true)
				}
				Some(false) => (None, false),
				None if state.graph.contains(id) => (None, false),
				None => (Some(Err(TaskError::Unknown(id))), false),
			}
		};
		if consumed {
			// A second waiter blocked on this id must wake and observe it
			// as unknown.
			self.shared.changed.notify_waiters();
			tracing::trace!(id = %id, "pool.consume");
		}
		result
	}

	/// Blocks until the task settles or is cancelled, then consumes and
	/// returns its outcome. Same contract as [`Pool::try_outcome`] otherwise.
	pub async fn outcome(&self, id: TaskId) -> TaskOutcome<T> {
		let mut notified = pin!(self.shared.changed.notified());
		loop {
			notified.as_mut().enable();
			if let Some(outcome) = self.try_outcome(id) {
				return outcome;
			}
			notified.as_mut().await;
			notified.set(self.shared.changed.notified());
		}
	}

	/// Non-blocking variant of [`Pool::wait`]: `Ok(None)` while the task is
	/// queued or running.
	pub fn try_wait(&self, id: TaskId) -> Result<Option<T>, TaskError> {
		self.try_outcome(id).transpose()
	}

	/// Awaits the task and returns its value, propagating its failure into
	/// the caller's context.
	pub async fn wait(&self, id: TaskId) -> Result<T, TaskError> {
		self.outcome(id).await
	}

	/// Returns a snapshot of the pool's accounting.
	pub fn stats(&self) -> PoolStats {
		let state = self.shared.state.lock();
		PoolStats {
			slots: state.slots,
			available: state.avail,
			running: state.procs.len() - state.settled,
			queued: state.graph.queued(),
			settled: state.settled,
			submitted_total: state.submitted_total,
			completed_total: state.completed_total,
			cancelled_total: state.cancelled_total,
		}
	}

	/// Returns process-table size, settled entries included (test helper).
	#[cfg(test)]
	pub(crate) fn proc_count(&self) -> usize {
		self.shared.state.lock().procs.len()
	}

	/// Returns graph node count, retained residues included (test helper).
	#[cfg(test)]
	pub(crate) fn graph_len(&self) -> usize {
		self.shared.state.lock().graph.len()
	}
}

/// Extracts a printable message from a panic payload.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
	if let Some(s) = panic.downcast_ref::<&str>() {
		(*s).to_string()
	} else if let Some(s) = panic.downcast_ref::<String>() {
		s.clone()
	} else {
		"<unknown panic>".to_string()
	}
}
