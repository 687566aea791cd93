use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, oneshot};
use tokio::task::JoinHandle;

use crate::class::ChannelKind;
use crate::spawn;
use crate::task::{SubmitError, TaskError, TaskFn, TaskHandle, TaskId, TaskIdGen, resolve};
use crate::token::CancelToken;

/// Configuration for one dedicated channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
	pub kind: ChannelKind,
	/// Hard deadline for one blocking call. On expiry the call is abandoned
	/// and the channel moves on.
	pub timeout: Duration,
	/// Bound on queued (not yet started) tasks.
	pub queue_capacity: usize,
}

impl ChannelConfig {
	/// Default timeouts per operation category.
	pub fn for_kind(kind: ChannelKind) -> Self {
		let timeout = match kind {
			ChannelKind::VersionControl => Duration::from_secs(15),
			ChannelKind::Convert => Duration::from_secs(30),
			ChannelKind::Render => Duration::from_secs(10),
			ChannelKind::Chat => Duration::from_secs(60),
		};
		Self {
			kind,
			timeout,
			queue_capacity: 64,
		}
	}

	#[must_use]
	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	#[must_use]
	pub fn queue_capacity(mut self, capacity: usize) -> Self {
		assert!(capacity > 0, "queue capacity must be > 0");
		self.queue_capacity = capacity;
		self
	}
}

/// Shutdown outcome for one channel.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownReport {
	completed: bool,
	timed_out: bool,
}

impl ShutdownReport {
	pub fn completed(&self) -> bool {
		self.completed
	}

	pub fn timed_out(&self) -> bool {
		self.timed_out
	}
}

struct Queued<T> {
	id: TaskId,
	cancel: CancelToken,
	work: TaskFn<T>,
	done: oneshot::Sender<Result<T, TaskError>>,
}

struct ChannelState<T> {
	queue: VecDeque<Queued<T>>,
	closed: bool,
	/// Id + token of the task currently executing, if any.
	current: Option<(TaskId, CancelToken)>,
}

struct ChannelInner<T> {
	kind: ChannelKind,
	timeout: Duration,
	capacity: usize,
	state: Mutex<ChannelState<T>>,
	notify: Notify,
	busy: AtomicBool,
}

/// Single-flight FIFO execution lane for one category of blocking work.
///
/// At most one task executes at a time; queued tasks run strictly in
/// submission order. Priority never applies here — ordered or exclusive
/// operations belong on a channel, interchangeable ones on the pool.
pub struct WorkerChannel<T> {
	inner: Arc<ChannelInner<T>>,
	ids: TaskIdGen,
	driver: Mutex<Option<JoinHandle<()>>>,
}

impl<T> WorkerChannel<T>
where
	T: Send + 'static,
{
	/// Creates the channel and starts its driver task.
	pub fn new(config: ChannelConfig) -> Self {
		let inner = Arc::new(ChannelInner {
			kind: config.kind,
			timeout: config.timeout,
			capacity: config.queue_capacity,
			state: Mutex::new(ChannelState {
				queue: VecDeque::new(),
				closed: false,
				current: None,
			}),
			notify: Notify::new(),
			busy: AtomicBool::new(false),
		});
		let driver = spawn::spawn(config.kind.as_str(), run_driver(Arc::clone(&inner)));
		Self {
			inner,
			ids: TaskIdGen::default(),
			driver: Mutex::new(Some(driver)),
		}
	}

	/// Operation category this channel executes.
	pub fn kind(&self) -> ChannelKind {
		self.inner.kind
	}

	/// Whether a task is executing right now. Never true for two tasks at once.
	pub fn is_busy(&self) -> bool {
		self.inner.busy.load(Ordering::Acquire)
	}

	/// Number of queued (not yet started) tasks.
	pub async fn queue_len(&self) -> usize {
		self.inner.state.lock().await.queue.len()
	}

	/// Enqueues one task. FIFO; runs immediately if the channel is idle.
	pub async fn submit(&self, work: TaskFn<T>) -> Result<TaskHandle<T>, SubmitError> {
		let id = self.ids.next();
		let cancel = CancelToken::new();
		let (tx, rx) = oneshot::channel();

		let mut state = self.inner.state.lock().await;
		if state.closed {
			return Err(SubmitError::Closed);
		}
		if state.queue.len() >= self.inner.capacity {
			return Err(SubmitError::Full);
		}
		state.queue.push_back(Queued {
			id,
			cancel: cancel.clone(),
			work,
			done: tx,
		});
		drop(state);
		self.inner.notify.notify_one();

		tracing::trace!(channel = self.inner.kind.as_str(), task = id.0, "worker.channel.submit");
		Ok(TaskHandle { id, cancel, rx })
	}

	/// Cancels a task by id.
	///
	/// A still-queued task is removed and its handle resolves `Cancelled`
	/// immediately. The currently-executing task only gets its token set; it
	/// runs to completion or to the channel timeout. Returns false when the
	/// id is unknown (already terminal).
	pub async fn cancel(&self, id: TaskId) -> bool {
		let mut state = self.inner.state.lock().await;
		if let Some(pos) = state.queue.iter().position(|q| q.id == id) {
			let queued = state.queue.remove(pos).expect("position just found");
			drop(state);
			resolve(queued.done, Err(TaskError::Cancelled));
			return true;
		}
		if let Some((current_id, token)) = state.current.as_ref()
			&& *current_id == id
		{
			token.cancel();
			return true;
		}
		false
	}

	/// Stops intake. Queued tasks resolve `Cancelled` once the in-flight
	/// task finishes; the driver then exits.
	pub async fn close(&self) {
		let mut state = self.inner.state.lock().await;
		state.closed = true;
		drop(state);
		self.inner.notify.notify_waiters();
	}

	/// Graceful stop: close intake, give the in-flight call up to `grace` to
	/// finish, then abandon the channel with a warning.
	pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
		self.close().await;
		let handle = self.driver.lock().await.take();
		let Some(handle) = handle else {
			return ShutdownReport {
				completed: true,
				timed_out: false,
			};
		};

		match tokio::time::timeout(grace, handle).await {
			Ok(_) => ShutdownReport {
				completed: true,
				timed_out: false,
			},
			Err(_) => {
				// Can't preempt a native blocking call; flag the in-flight
				// token and leave the driver detached. It terminates on its
				// own once the call returns or the channel timeout fires.
				if let Some((_, token)) = self.inner.state.lock().await.current.as_ref() {
					token.cancel();
				}
				tracing::warn!(channel = self.inner.kind.as_str(), ?grace, "worker.channel.shutdown_abandoned");
				ShutdownReport {
					completed: false,
					timed_out: true,
				}
			}
		}
	}
}

async fn run_driver<T>(inner: Arc<ChannelInner<T>>)
where
	T: Send + 'static,
{
	loop {
		// Dequeue the next task, or drain and exit once closed.
		let queued = loop {
			// Create Notified before releasing the lock so a close() between
			// unlock and await is not a lost wakeup.
			let notified = inner.notify.notified();
			let mut state = inner.state.lock().await;
			if state.closed {
				let remaining: Vec<_> = state.queue.drain(..).collect();
				drop(state);
				for q in remaining {
					resolve(q.done, Err(TaskError::Cancelled));
				}
				tracing::debug!(channel = inner.kind.as_str(), "worker.channel.stopped");
				return;
			}
			if let Some(q) = state.queue.pop_front() {
				// Cancelled via its handle while queued: never starts.
				if q.cancel.is_cancelled() {
					drop(state);
					resolve(q.done, Err(TaskError::Cancelled));
					continue;
				}
				inner.busy.store(true, Ordering::Release);
				state.current = Some((q.id, q.cancel.clone()));
				break q;
			}
			drop(state);
			notified.await;
		};

		let Queued { id, cancel, work, done } = queued;
		let token = cancel.clone();
		let call = spawn::spawn_blocking(inner.kind.as_str(), move || work(&token));

		let panicked = match tokio::time::timeout(inner.timeout, call).await {
			Ok(Ok(result)) => {
				resolve(done, result);
				false
			}
			Ok(Err(join_err)) => {
				if join_err.is_panic() {
					tracing::error!(channel = inner.kind.as_str(), task = id.0, "worker.channel.panic");
					resolve(done, Err(TaskError::Fatal("task body panicked".into())));
					true
				} else {
					resolve(done, Err(TaskError::Cancelled));
					false
				}
			}
			Err(_) => {
				// Deadline elapsed: the blocking call keeps running detached.
				// Flag its token so chunked bodies stop at the next checkpoint.
				cancel.cancel();
				tracing::warn!(
					channel = inner.kind.as_str(),
					task = id.0,
					timeout = ?inner.timeout,
					"worker.channel.abandoned"
				);
				resolve(
					done,
					Err(TaskError::TimedOut { elapsed: inner.timeout }),
				);
				false
			}
		};

		let mut state = inner.state.lock().await;
		state.current = None;
		inner.busy.store(false, Ordering::Release);
		if panicked {
			// Channel restart semantics: whatever was queued at the moment of
			// the crash is failed, then the (empty) lane keeps serving.
			let remaining: Vec<_> = state.queue.drain(..).collect();
			drop(state);
			for q in remaining {
				resolve(q.done, Err(TaskError::Fatal("channel restarted after panic".into())));
			}
		}
	}
}
