use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sysinfo::System;

/// One sample of host pressure, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
	pub cpu_percent: f32,
	pub memory_percent: f32,
}

impl LoadSample {
	/// An unloaded host.
	pub const IDLE: Self = Self {
		cpu_percent: 0.0,
		memory_percent: 0.0,
	};
}

/// Source of host pressure samples. A seam so the debounce policy stays
/// deterministic under test.
pub trait SystemLoadProbe: Send + Sync {
	fn sample(&self) -> LoadSample;
}

impl<P: SystemLoadProbe + ?Sized> SystemLoadProbe for Box<P> {
	fn sample(&self) -> LoadSample {
		(**self).sample()
	}
}

struct ProbeState {
	system: System,
	refreshed_at: Option<Instant>,
	cached: LoadSample,
}

/// Live probe backed by `sysinfo`.
///
/// Refreshing CPU and memory stats is not free, and edit bursts would sample
/// on every keystroke, so refreshes are rate-limited and the last sample is
/// served in between.
pub struct SysinfoProbe {
	state: Mutex<ProbeState>,
	refresh_interval: Duration,
}

impl SysinfoProbe {
	pub fn new() -> Self {
		Self::with_refresh_interval(Duration::from_secs(1))
	}

	pub fn with_refresh_interval(refresh_interval: Duration) -> Self {
		Self {
			state: Mutex::new(ProbeState {
				system: System::new(),
				refreshed_at: None,
				cached: LoadSample::IDLE,
			}),
			refresh_interval,
		}
	}
}

impl Default for SysinfoProbe {
	fn default() -> Self {
		Self::new()
	}
}

impl SystemLoadProbe for SysinfoProbe {
	fn sample(&self) -> LoadSample {
		let mut state = self.state.lock();
		let stale = state.refreshed_at.is_none_or(|at| at.elapsed() >= self.refresh_interval);
		if stale {
			state.system.refresh_cpu_usage();
			state.system.refresh_memory();
			let total = state.system.total_memory();
			let memory_percent = if total == 0 {
				0.0
			} else {
				(state.system.used_memory() as f64 / total as f64 * 100.0) as f32
			};
			state.cached = LoadSample {
				cpu_percent: state.system.global_cpu_usage(),
				memory_percent,
			};
			state.refreshed_at = Some(Instant::now());
		}
		state.cached
	}
}

/// Probe returning a fixed sample. Used by tests and to disable adaptive
/// delay entirely.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe {
	pub sample: LoadSample,
}

impl StaticProbe {
	pub fn idle() -> Self {
		Self { sample: LoadSample::IDLE }
	}
}

impl SystemLoadProbe for StaticProbe {
	fn sample(&self) -> LoadSample {
		self.sample
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sysinfo_probe_serves_cached_sample_within_interval() {
		let probe = SysinfoProbe::with_refresh_interval(Duration::from_secs(60));
		let first = probe.sample();
		let second = probe.sample();
		assert_eq!(first, second, "second read within the interval is the cached one");
	}

	#[test]
	fn boxed_probe_samples_through_to_the_inner_probe() {
		let probe: Box<dyn SystemLoadProbe> = Box::new(StaticProbe::idle());
		assert_eq!(probe.sample(), LoadSample::IDLE);
	}

	#[test]
	fn static_probe_is_fixed() {
		let probe = StaticProbe {
			sample: LoadSample {
				cpu_percent: 99.0,
				memory_percent: 12.0,
			},
		};
		assert_eq!(probe.sample().cpu_percent, 99.0);
	}
}
