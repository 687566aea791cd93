use std::fmt;
use std::hash::Hasher;

use rustc_hash::FxHasher;

/// Content hash of one block's source text.
///
/// Content-addressed and position-independent: the same text hashes to the
/// same fingerprint wherever the block sits in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
	pub fn of(text: &str) -> Self {
		let mut hasher = FxHasher::default();
		hasher.write(text.as_bytes());
		Self(hasher.finish())
	}
}

impl fmt::Display for Fingerprint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:016x}", self.0)
	}
}

/// One structural unit of the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
	pub source: String,
	pub fingerprint: Fingerprint,
}

impl Block {
	pub fn new(source: impl Into<String>) -> Self {
		let source = source.into();
		let fingerprint = Fingerprint::of(&source);
		Self { source, fingerprint }
	}
}

/// Immutable view of one document state.
#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
	/// Strictly monotonic per engine; later snapshots always win.
	pub version: u64,
	pub blocks: Vec<Block>,
}

/// Partitions a document at blank-line boundaries.
///
/// Each run of consecutive non-blank lines forms one block; blank lines
/// (empty or whitespace-only) separate blocks and belong to none. An empty
/// document produces zero blocks.
pub fn split_blocks(text: &str) -> Vec<Block> {
	let mut blocks = Vec::new();
	let mut current: Vec<&str> = Vec::new();
	for line in text.lines() {
		if line.trim().is_empty() {
			if !current.is_empty() {
				blocks.push(Block::new(current.join("\n")));
				current.clear();
			}
		} else {
			current.push(line);
		}
	}
	if !current.is_empty() {
		blocks.push(Block::new(current.join("\n")));
	}
	blocks
}
