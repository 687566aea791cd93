use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, Notify, Semaphore, oneshot};
use tokio::task::JoinHandle;

use crate::class::Priority;
use crate::spawn;
use crate::task::{SubmitError, TaskError, TaskFn, TaskHandle, TaskId, TaskIdGen, resolve};
use crate::token::CancelToken;

/// Configuration for the shared pool.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
	/// Maximum concurrently executing tasks.
	pub workers: usize,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		let cores = std::thread::available_parallelism().map_or(4, |n| n.get());
		Self {
			workers: (cores * 2).max(4),
		}
	}
}

impl SchedulerConfig {
	#[must_use]
	pub fn workers(mut self, workers: usize) -> Self {
		assert!(workers > 0, "pool width must be > 0");
		self.workers = workers;
		self
	}
}

/// Dequeue key: higher priority first, FIFO within a priority.
#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
	priority: Priority,
	seq: u64,
	id: TaskId,
}

impl PartialOrd for HeapEntry {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for HeapEntry {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		// Max-heap: higher priority wins; earlier seq wins ties.
		self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
	}
}

struct Pending<T> {
	cancel: CancelToken,
	coalesce_key: Option<String>,
	work: TaskFn<T>,
	done: oneshot::Sender<Result<T, TaskError>>,
}

struct PoolState<T> {
	heap: BinaryHeap<HeapEntry>,
	/// Queued tasks by id. A heap entry whose id is absent here is a
	/// tombstone left by cancellation or coalescing and is skipped on pop.
	pending: FxHashMap<u64, Pending<T>>,
	/// Coalesce key -> queued (not yet started) task.
	keyed: FxHashMap<String, TaskId>,
	/// Executing tasks: id -> (coalesce key, token).
	running: FxHashMap<u64, (Option<String>, CancelToken)>,
	closed: bool,
}

struct PoolInner<T> {
	state: Mutex<PoolState<T>>,
	notify: Notify,
	/// Signalled whenever a running task finishes (shutdown quiescence wait).
	idle: Notify,
	permits: Arc<Semaphore>,
}

/// Bounded multiplexed pool for short, interchangeable, cancellable work.
///
/// Secondary execution surface: speculative pre-rendering and similar work
/// that needs neither strict ordering nor exclusivity. Dequeue order is
/// strict priority with FIFO ties; a new submission reusing a still-queued
/// task's coalesce key replaces that task instead of running both.
pub struct TaskScheduler<T> {
	inner: Arc<PoolInner<T>>,
	ids: TaskIdGen,
	seq: AtomicU64,
	driver: Mutex<Option<JoinHandle<()>>>,
}

impl<T> TaskScheduler<T>
where
	T: Send + 'static,
{
	/// Creates the pool and starts its dispatcher.
	pub fn new(config: SchedulerConfig) -> Self {
		let inner = Arc::new(PoolInner {
			state: Mutex::new(PoolState {
				heap: BinaryHeap::new(),
				pending: FxHashMap::default(),
				keyed: FxHashMap::default(),
				running: FxHashMap::default(),
				closed: false,
			}),
			notify: Notify::new(),
			idle: Notify::new(),
			permits: Arc::new(Semaphore::new(config.workers)),
		});
		let driver = spawn::spawn("pool", run_dispatcher(Arc::clone(&inner)));
		Self {
			inner,
			ids: TaskIdGen::default(),
			seq: AtomicU64::new(0),
			driver: Mutex::new(Some(driver)),
		}
	}

	/// Enqueues one unit of work.
	///
	/// When `coalesce_key` matches a still-queued task, that task is cancelled
	/// and replaced: exactly one execution happens, with this newer payload.
	/// A task that has already started is never coalesced away.
	pub async fn submit(&self, priority: Priority, coalesce_key: Option<String>, work: TaskFn<T>) -> Result<TaskHandle<T>, SubmitError> {
		let id = self.ids.next();
		let cancel = CancelToken::new();
		let (tx, rx) = oneshot::channel();

		let mut state = self.inner.state.lock().await;
		if state.closed {
			return Err(SubmitError::Closed);
		}

		if let Some(key) = coalesce_key.as_deref()
			&& let Some(old_id) = state.keyed.remove(key)
			&& let Some(old) = state.pending.remove(&old_id.0)
		{
			// Old heap entry stays behind as a tombstone.
			resolve(old.done, Err(TaskError::Cancelled));
			tracing::trace!(key, old = old_id.0, new = id.0, "worker.pool.coalesced");
		}

		if let Some(key) = coalesce_key.clone() {
			state.keyed.insert(key, id);
		}
		state.pending.insert(
			id.0,
			Pending {
				cancel: cancel.clone(),
				coalesce_key,
				work,
				done: tx,
			},
		);
		state.heap.push(HeapEntry {
			priority,
			seq: self.seq.fetch_add(1, AtomicOrdering::AcqRel),
			id,
		});
		drop(state);
		self.inner.notify.notify_one();

		Ok(TaskHandle { id, cancel, rx })
	}

	/// Cancels a task by id. Queued tasks resolve `Cancelled` without ever
	/// running; executing tasks only get their token flagged.
	pub async fn cancel(&self, id: TaskId) -> bool {
		let mut state = self.inner.state.lock().await;
		if let Some(pending) = state.pending.remove(&id.0) {
			if let Some(key) = pending.coalesce_key.as_deref()
				&& state.keyed.get(key) == Some(&id)
			{
				state.keyed.remove(key);
			}
			drop(state);
			resolve(pending.done, Err(TaskError::Cancelled));
			return true;
		}
		if let Some((_, token)) = state.running.get(&id.0) {
			token.cancel();
			return true;
		}
		false
	}

	/// Cancels every queued task whose coalesce key starts with `prefix` and
	/// flags the tokens of matching running tasks. Returns the number of
	/// queued tasks removed.
	pub async fn cancel_by_prefix(&self, prefix: &str) -> usize {
		let mut state = self.inner.state.lock().await;
		let ids: Vec<TaskId> = state
			.keyed
			.iter()
			.filter(|(key, _)| key.starts_with(prefix))
			.map(|(_, id)| *id)
			.collect();
		let mut removed = Vec::with_capacity(ids.len());
		for id in ids {
			if let Some(pending) = state.pending.remove(&id.0) {
				if let Some(key) = pending.coalesce_key.as_deref() {
					state.keyed.remove(key);
				}
				removed.push(pending.done);
			}
		}
		for (_, (key, token)) in state.running.iter() {
			if key.as_deref().is_some_and(|k| k.starts_with(prefix)) {
				token.cancel();
			}
		}
		drop(state);

		let count = removed.len();
		for done in removed {
			resolve(done, Err(TaskError::Cancelled));
		}
		if count > 0 {
			tracing::debug!(prefix, count, "worker.pool.cancel_by_prefix");
		}
		count
	}

	/// Number of queued (not yet started) tasks.
	pub async fn queued_len(&self) -> usize {
		self.inner.state.lock().await.pending.len()
	}

	/// Number of currently executing tasks.
	pub async fn running_len(&self) -> usize {
		self.inner.state.lock().await.running.len()
	}

	/// Graceful stop: cancel all queued work, wait up to `grace` for running
	/// tasks to quiesce, then flag their tokens and abandon them.
	pub async fn shutdown(&self, grace: Duration) -> bool {
		let removed = {
			let mut state = self.inner.state.lock().await;
			state.closed = true;
			state.keyed.clear();
			state.heap.clear();
			let pending = std::mem::take(&mut state.pending);
			pending.into_values().map(|p| p.done).collect::<Vec<_>>()
		};
		for done in removed {
			resolve(done, Err(TaskError::Cancelled));
		}
		self.inner.notify.notify_waiters();
		self.inner.permits.close();
		if let Some(driver) = self.driver.lock().await.take() {
			let _ = driver.await;
		}

		let deadline = tokio::time::Instant::now() + grace;
		loop {
			let notified = {
				let state = self.inner.state.lock().await;
				if state.running.is_empty() {
					return true;
				}
				self.inner.idle.notified()
			};
			tokio::select! {
				_ = notified => {}
				_ = tokio::time::sleep_until(deadline) => {
					let state = self.inner.state.lock().await;
					for (_, (_, token)) in state.running.iter() {
						token.cancel();
					}
					tracing::warn!(running = state.running.len(), ?grace, "worker.pool.shutdown_abandoned");
					return false;
				}
			}
		}
	}
}

async fn run_dispatcher<T>(inner: Arc<PoolInner<T>>)
where
	T: Send + 'static,
{
	loop {
		// Width bound: hold one permit per launched task; released on
		// completion. Acquire errors only once the semaphore is closed.
		let Ok(permit) = Arc::clone(&inner.permits).acquire_owned().await else {
			return;
		};

		let launched = loop {
			let notified = inner.notify.notified();
			let mut state = inner.state.lock().await;
			if state.closed {
				return;
			}

			let mut live = None;
			while let Some(entry) = state.heap.pop() {
				if let Some(pending) = state.pending.remove(&entry.id.0) {
					live = Some((entry.id, pending));
					break;
				}
				// Tombstone from cancel/coalesce: skip.
			}

			if let Some((id, pending)) = live {
				if let Some(key) = pending.coalesce_key.as_deref()
					&& state.keyed.get(key) == Some(&id)
				{
					state.keyed.remove(key);
				}
				state.running.insert(id.0, (pending.coalesce_key.clone(), pending.cancel.clone()));
				break (id, pending);
			}
			drop(state);
			notified.await;
		};

		let (id, pending) = launched;
		let Pending { cancel, work, done, .. } = pending;
		let pool = Arc::clone(&inner);
		spawn::spawn("pool", async move {
			let _permit = permit;
			let token = cancel.clone();
			let result = if token.is_cancelled() {
				Err(TaskError::Cancelled)
			} else {
				match spawn::spawn_blocking("pool", move || work(&token)).await {
					Ok(result) => result,
					Err(join_err) if join_err.is_panic() => {
						tracing::error!(task = id.0, "worker.pool.panic");
						Err(TaskError::Fatal("task body panicked".into()))
					}
					Err(_) => Err(TaskError::Cancelled),
				}
			};
			resolve(done, result);
			pool.state.lock().await.running.remove(&id.0);
			pool.idle.notify_waiters();
		});
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	fn pool(workers: usize) -> TaskScheduler<u32> {
		TaskScheduler::new(SchedulerConfig::default().workers(workers))
	}

	/// Occupies every pool worker until released, so later submissions stay
	/// queued deterministically.
	fn blocker(release: std::sync::mpsc::Receiver<()>) -> TaskFn<u32> {
		Box::new(move |_| {
			let _ = release.recv();
			Ok(0)
		})
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn priority_order_with_fifo_ties() {
		let pool = pool(1);
		let (release_tx, release_rx) = std::sync::mpsc::channel();
		let gate = pool.submit(Priority::Normal, None, blocker(release_rx)).await.expect("submit");
		while pool.running_len().await == 0 {
			tokio::task::yield_now().await;
		}

		let order = Arc::new(Mutex::new(Vec::new()));
		let mut handles = Vec::new();
		for (label, priority) in [
			(1u32, Priority::Idle),
			(2, Priority::Normal),
			(3, Priority::Critical),
			(4, Priority::Normal),
		] {
			let order = Arc::clone(&order);
			let handle = pool
				.submit(
					priority,
					None,
					Box::new(move |_| {
						order.blocking_lock().push(label);
						Ok(label)
					}),
				)
				.await
				.expect("submit");
			handles.push(handle);
		}

		release_tx.send(()).expect("release");
		assert_eq!(gate.wait().await, Ok(0));
		for handle in handles {
			let _ = handle.wait().await;
		}

		// Critical first, then Normals in submission order, Idle last.
		assert_eq!(*order.lock().await, vec![3, 2, 4, 1]);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn coalesce_runs_once_with_newer_payload() {
		let pool = pool(1);
		let (release_tx, release_rx) = std::sync::mpsc::channel();
		let gate = pool.submit(Priority::Normal, None, blocker(release_rx)).await.expect("submit");
		while pool.running_len().await == 0 {
			tokio::task::yield_now().await;
		}

		let executions = Arc::new(AtomicUsize::new(0));
		let first_exec = Arc::clone(&executions);
		let first = pool
			.submit(
				Priority::Normal,
				Some("block/42".into()),
				Box::new(move |_| {
					first_exec.fetch_add(1, Ordering::SeqCst);
					Ok(1)
				}),
			)
			.await
			.expect("submit");
		let second_exec = Arc::clone(&executions);
		let second = pool
			.submit(
				Priority::Normal,
				Some("block/42".into()),
				Box::new(move |_| {
					second_exec.fetch_add(1, Ordering::SeqCst);
					Ok(2)
				}),
			)
			.await
			.expect("submit");

		assert_eq!(first.wait().await, Err(TaskError::Cancelled));

		release_tx.send(()).expect("release");
		assert_eq!(gate.wait().await, Ok(0));
		assert_eq!(second.wait().await, Ok(2), "newer payload wins");
		assert_eq!(executions.load(Ordering::SeqCst), 1, "exactly one execution");
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn cancel_by_prefix_removes_matching_queued() {
		let pool = pool(1);
		let (release_tx, release_rx) = std::sync::mpsc::channel();
		let gate = pool.submit(Priority::Normal, None, blocker(release_rx)).await.expect("submit");
		while pool.running_len().await == 0 {
			tokio::task::yield_now().await;
		}

		let a = pool.submit(Priority::Idle, Some("render/a".into()), Box::new(|_| Ok(1))).await.expect("submit");
		let b = pool.submit(Priority::Idle, Some("render/b".into()), Box::new(|_| Ok(2))).await.expect("submit");
		let export = pool.submit(Priority::Idle, Some("export/a".into()), Box::new(|_| Ok(3))).await.expect("submit");

		assert_eq!(pool.cancel_by_prefix("render/").await, 2);
		assert_eq!(a.wait().await, Err(TaskError::Cancelled));
		assert_eq!(b.wait().await, Err(TaskError::Cancelled));

		release_tx.send(()).expect("release");
		assert_eq!(gate.wait().await, Ok(0));
		assert_eq!(export.wait().await, Ok(3), "non-matching key unaffected");
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn pool_width_bounds_concurrency() {
		let pool = pool(2);
		let active = Arc::new(AtomicUsize::new(0));
		let peak = Arc::new(AtomicUsize::new(0));

		let mut handles = Vec::new();
		for i in 0..6u32 {
			let active = Arc::clone(&active);
			let peak = Arc::clone(&peak);
			let handle = pool
				.submit(
					Priority::Normal,
					None,
					Box::new(move |_| {
						let cur = active.fetch_add(1, Ordering::SeqCst) + 1;
						peak.fetch_max(cur, Ordering::SeqCst);
						std::thread::sleep(Duration::from_millis(30));
						active.fetch_sub(1, Ordering::SeqCst);
						Ok(i)
					}),
				)
				.await
				.expect("submit");
			handles.push(handle);
		}
		for handle in handles {
			assert!(handle.wait().await.is_ok());
		}
		assert!(peak.load(Ordering::SeqCst) <= 2, "width 2 exceeded: {}", peak.load(Ordering::SeqCst));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn running_task_cancel_is_cooperative() {
		let pool = pool(1);
		let entered = Arc::new(AtomicUsize::new(0));
		let entered_clone = Arc::clone(&entered);
		let handle = pool
			.submit(
				Priority::Normal,
				None,
				Box::new(move |token| {
					entered_clone.fetch_add(1, Ordering::SeqCst);
					for _ in 0..200 {
						if token.is_cancelled() {
							return Err(TaskError::Cancelled);
						}
						std::thread::sleep(Duration::from_millis(5));
					}
					Ok(1)
				}),
			)
			.await
			.expect("submit");

		while entered.load(Ordering::SeqCst) == 0 {
			tokio::task::yield_now().await;
		}
		assert!(pool.cancel(handle.id()).await);
		assert_eq!(handle.wait().await, Err(TaskError::Cancelled));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn panic_is_contained_to_one_task() {
		let pool = pool(2);
		let boom = pool
			.submit(Priority::Normal, None, Box::new(|_| -> Result<u32, TaskError> { panic!("deliberate") }))
			.await
			.expect("submit");
		assert!(matches!(boom.wait().await, Err(TaskError::Fatal(_))));

		let ok = pool.submit(Priority::Normal, None, Box::new(|_| Ok(5))).await.expect("submit");
		assert_eq!(ok.wait().await, Ok(5));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn shutdown_cancels_queued_and_rejects_new() {
		let pool = pool(1);
		let (release_tx, release_rx) = std::sync::mpsc::channel();
		let gate = pool.submit(Priority::Normal, None, blocker(release_rx)).await.expect("submit");
		while pool.running_len().await == 0 {
			tokio::task::yield_now().await;
		}
		let queued = pool.submit(Priority::Normal, None, Box::new(|_| Ok(1))).await.expect("submit");

		// Release only after shutdown has cancelled the queue, so the queued
		// task cannot sneak onto the freed worker.
		let releaser = tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(50)).await;
			release_tx.send(()).expect("release");
		});
		let clean = pool.shutdown(Duration::from_secs(2)).await;
		assert!(clean, "blocker finishes within the grace period");
		releaser.await.expect("releaser");

		assert_eq!(queued.wait().await, Err(TaskError::Cancelled));
		assert_eq!(gate.wait().await, Ok(0));
		assert_eq!(
			pool.submit(Priority::Normal, None, Box::new(|_| Ok(2))).await.err(),
			Some(SubmitError::Closed)
		);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn shutdown_abandons_non_quiescent_worker() {
		let pool = pool(1);
		let (release_tx, release_rx) = std::sync::mpsc::channel();
		let _gate = pool.submit(Priority::Normal, None, blocker(release_rx)).await.expect("submit");
		while pool.running_len().await == 0 {
			tokio::task::yield_now().await;
		}

		// Must return within the grace period, not hang on the blocked call.
		let clean = tokio::time::timeout(Duration::from_millis(300), pool.shutdown(Duration::from_millis(20)))
			.await
			.expect("shutdown must not hang");
		assert!(!clean);
		drop(release_tx);
	}
}
