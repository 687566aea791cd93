use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::token::CancelToken;

/// Unique identifier for one submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) u64);

/// Monotonic task id allocator shared by one execution surface.
#[derive(Debug, Default, Clone)]
pub(crate) struct TaskIdGen {
	next: Arc<AtomicU64>,
}

impl TaskIdGen {
	pub(crate) fn next(&self) -> TaskId {
		TaskId(self.next.fetch_add(1, Ordering::AcqRel).wrapping_add(1))
	}
}

/// Terminal failure classification for a background task.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
	/// The external operation failed in a recoverable way (non-zero exit,
	/// renderer error). The lane remains usable.
	#[error("{0}")]
	Transient(String),
	/// The lane's deadline elapsed. The underlying blocking call was
	/// abandoned and may still be running; it was not cancelled.
	#[error("timed out after {elapsed:?}; underlying call abandoned")]
	TimedOut {
		/// Deadline that elapsed before the call returned.
		elapsed: Duration,
	},
	/// The task was removed before or while running at the caller's request.
	/// Delivered distinctly from failure so callers don't surface an error
	/// for something the user intentionally stopped.
	#[error("cancelled")]
	Cancelled,
	/// The task body panicked or its lane was torn down mid-flight. Caught at
	/// the lane boundary; the lane restarts with an empty queue.
	#[error("fatal: {0}")]
	Fatal(String),
}

impl TaskError {
	/// Returns true when the underlying call outlived its deadline and may
	/// still be running in the background.
	pub fn timed_out(&self) -> bool {
		matches!(self, Self::TimedOut { .. })
	}
}

/// Error returned when a task cannot be enqueued at all.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SubmitError {
	/// The lane has stopped accepting work (shutdown in progress).
	#[error("lane closed")]
	Closed,
	/// The lane's bounded queue is full.
	#[error("lane queue full")]
	Full,
	/// A user-visible operation of the same kind is already in flight.
	/// Raised by the orchestration layer before any task is built; distinct
	/// from the lane's own single-flight queueing.
	#[error("operation already in flight")]
	AlreadyInFlight,
}

/// Boxed task body. Receives the task's cancel token so chunked bodies can
/// bail out between steps.
pub type TaskFn<T> = Box<dyn FnOnce(&CancelToken) -> Result<T, TaskError> + Send + 'static>;

/// Caller-side handle for one submitted task.
#[derive(Debug)]
pub struct TaskHandle<T> {
	pub(crate) id: TaskId,
	pub(crate) cancel: CancelToken,
	pub(crate) rx: oneshot::Receiver<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
	/// The task's id, usable with `cancel(task_id)` on the owning surface.
	pub fn id(&self) -> TaskId {
		self.id
	}

	/// Requests cooperative cancellation of this task.
	pub fn cancel(&self) {
		self.cancel.cancel();
	}

	/// Waits for the task to reach a terminal state.
	pub async fn wait(self) -> Result<T, TaskError> {
		match self.rx.await {
			Ok(result) => result,
			// Result sender dropped without resolving: lane abandoned at
			// forced shutdown.
			Err(_) => Err(TaskError::Cancelled),
		}
	}
}

/// Resolves a task's oneshot, ignoring an already-dropped receiver.
pub(crate) fn resolve<T>(tx: oneshot::Sender<Result<T, TaskError>>, result: Result<T, TaskError>) {
	let _ = tx.send(result);
}
