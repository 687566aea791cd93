/// Categories of blocking external work, one dedicated channel each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
	/// Version-control CLI invocations (commit, log, diff).
	VersionControl,
	/// Document format conversion (export to PDF/DOCX/...).
	Convert,
	/// Markup-to-HTML block rendering.
	Render,
	/// AI chat / local inference requests. Longest timeout class.
	Chat,
}

impl ChannelKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::VersionControl => "version_control",
			Self::Convert => "convert",
			Self::Render => "render",
			Self::Chat => "chat",
		}
	}
}

/// Dequeue priority within the shared pool.
///
/// Priority is a [`crate::TaskScheduler`] concept only; a dedicated
/// [`crate::WorkerChannel`] is strictly FIFO regardless of priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
	Critical,
	High,
	Normal,
	Low,
	Idle,
}

impl Priority {
	const fn rank(self) -> u8 {
		match self {
			Self::Critical => 4,
			Self::High => 3,
			Self::Normal => 2,
			Self::Low => 1,
			Self::Idle => 0,
		}
	}
}

impl PartialOrd for Priority {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Priority {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.rank().cmp(&other.rank())
	}
}
