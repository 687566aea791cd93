use std::time::Duration;

use tokio::time::Instant;

use crate::load::{LoadSample, SystemLoadProbe};

/// Adaptive quiescence policy for edit bursts.
#[derive(Debug, Clone)]
pub struct DebounceConfig {
	/// Delay for a small document on an unloaded host.
	pub base: Duration,
	/// Hard ceiling regardless of size and load.
	pub max_delay: Duration,
	/// Document bytes per +1 size factor step.
	pub size_step: usize,
	/// Ceiling on the size factor.
	pub max_size_factor: u32,
}

impl Default for DebounceConfig {
	fn default() -> Self {
		Self {
			base: Duration::from_millis(200),
			max_delay: Duration::from_millis(2000),
			size_step: 256 * 1024,
			max_size_factor: 5,
		}
	}
}

/// Multiplier applied for host pressure: 2.0 under heavy CPU load, 1.5 under
/// moderate CPU or high memory pressure, 1.0 otherwise.
pub fn load_factor(sample: LoadSample) -> f64 {
	if sample.cpu_percent > 85.0 {
		2.0
	} else if sample.cpu_percent > 60.0 || sample.memory_percent > 90.0 {
		1.5
	} else {
		1.0
	}
}

/// Computes the quiescence delay for one document size under one load sample.
pub fn compute_delay(config: &DebounceConfig, document_size: usize, sample: LoadSample) -> Duration {
	let size_factor = (1 + document_size / config.size_step).min(config.max_size_factor as usize) as f64;
	config.base.mul_f64(size_factor * load_factor(sample)).min(config.max_delay)
}

/// Restartable quiescence timer over a load probe.
///
/// Every edit notification restarts the timer, so only the last edit of a
/// burst fires, and the fire reflects the last notified size. The owner
/// (the orchestrator driver) sleeps on [`deadline`](Self::deadline) and calls
/// [`disarm`](Self::disarm) when it acts.
pub struct DebounceCoordinator<P> {
	config: DebounceConfig,
	probe: P,
	deadline: Option<Instant>,
	last_size: usize,
}

impl<P: SystemLoadProbe> DebounceCoordinator<P> {
	pub fn new(config: DebounceConfig, probe: P) -> Self {
		Self {
			config,
			probe,
			deadline: None,
			last_size: 0,
		}
	}

	/// Restarts the timer for a document of `document_size` bytes.
	pub fn notify(&mut self, document_size: usize) {
		self.last_size = document_size;
		let delay = compute_delay(&self.config, document_size, self.probe.sample());
		self.deadline = Some(Instant::now() + delay);
		tracing::trace!(size = document_size, ?delay, "orchestrator.debounce.armed");
	}

	/// Deadline of the armed timer, if any.
	pub fn deadline(&self) -> Option<Instant> {
		self.deadline
	}

	/// Clears the timer. Returns whether it was armed.
	pub fn disarm(&mut self) -> bool {
		self.deadline.take().is_some()
	}

	/// Size passed to the most recent [`notify`](Self::notify).
	pub fn last_size(&self) -> usize {
		self.last_size
	}
}
