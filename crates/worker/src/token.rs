use tokio_util::sync::CancellationToken;

/// Cooperative cancellation flag for one task.
///
/// Checked before execution starts and, for chunked task bodies, between
/// chunks. Setting it cannot abort a blocking call already in flight; it only
/// prevents future steps from running.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
	inner: CancellationToken,
}

impl CancelToken {
	/// Creates a fresh, uncancelled token.
	pub fn new() -> Self {
		Self::default()
	}

	/// Requests cancellation.
	pub fn cancel(&self) {
		self.inner.cancel();
	}

	/// Returns true once cancellation has been requested.
	pub fn is_cancelled(&self) -> bool {
		self.inner.is_cancelled()
	}

	/// Future resolving when cancellation is requested.
	pub async fn cancelled(&self) {
		self.inner.cancelled().await;
	}

	/// Creates a child token cancelled along with this one.
	pub fn child(&self) -> Self {
		Self {
			inner: self.inner.child_token(),
		}
	}
}
