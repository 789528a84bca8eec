use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Unique identifier for a submitted task.
///
/// Minted monotonically per pool and never reused. Opaque to callers: only
/// uniqueness within a single pool is guaranteed, not contiguity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A task body: a not-yet-polled unit of async work producing the pool's
/// result type or failing.
pub type TaskBody<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'static>>;

/// Outcome of a finished task.
pub type TaskOutcome<T> = Result<T, TaskError>;

/// Ways a task can fail to produce a value.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
	/// The body ran and returned an error.
	#[error(transparent)]
	Failed(#[from] anyhow::Error),
	/// The body panicked; the panic message is preserved.
	#[error("task body panicked: {0}")]
	Panicked(String),
	/// The body observed its cancellation token before producing a value.
	#[error("task cancelled")]
	Cancelled,
	/// The id is known to neither the graph nor the process table: never
	/// submitted, already consumed, or cancelled.
	#[error("unknown task {0}")]
	Unknown(TaskId),
}
