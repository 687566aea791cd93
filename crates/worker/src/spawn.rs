//! Lane-tagged task spawning.
//!
//! Every driver, waiter, and blocking call in this crate goes through these
//! wrappers so trace output carries the lane it belongs to. Callers normally
//! run inside an ambient tokio runtime; embedders without one (synchronous
//! hosts, plain `#[test]` functions) fall back to a small shared runtime
//! built on first use.

use std::future::Future;
use std::sync::OnceLock;

use tokio::task::JoinHandle;

/// Worker threads for the fallback runtime. Lanes serialize their own work,
/// so the fallback only needs enough threads to keep drivers responsive.
const FALLBACK_WORKERS: usize = 2;

fn runtime_handle() -> tokio::runtime::Handle {
	if let Ok(handle) = tokio::runtime::Handle::try_current() {
		return handle;
	}

	static FALLBACK: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
	FALLBACK
		.get_or_init(|| {
			tokio::runtime::Builder::new_multi_thread()
				.enable_all()
				.worker_threads(FALLBACK_WORKERS)
				.thread_name("quill-worker")
				.build()
				.expect("failed to build fallback tokio runtime")
		})
		.handle()
		.clone()
}

/// Spawns an async task tagged with its execution lane.
pub fn spawn<F>(lane: &'static str, fut: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	tracing::trace!(lane, "worker.spawn");
	runtime_handle().spawn(fut)
}

/// Spawns blocking work on the runtime's blocking pool, tagged with its lane.
pub fn spawn_blocking<F, R>(lane: &'static str, f: F) -> JoinHandle<R>
where
	F: FnOnce() -> R + Send + 'static,
	R: Send + 'static,
{
	tracing::trace!(lane, "worker.spawn_blocking");
	runtime_handle().spawn_blocking(f)
}
