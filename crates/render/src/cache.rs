use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::block::Fingerprint;

/// Default number of rendered blocks kept resident.
const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
struct CacheSlot {
	fingerprint: Fingerprint,
	html: String,
}

/// Manual LRU cache of rendered block fragments, keyed by content
/// fingerprint.
///
/// Entries are immutable once stored: a fingerprint fully determines its
/// fragment, so `put` for a present key only refreshes recency. Uses a
/// stable-index slot vector so eviction reuses storage instead of
/// reallocating.
#[derive(Debug)]
pub struct BlockCache {
	/// Slot storage. Indices are stable and reused after eviction.
	slots: Vec<CacheSlot>,
	/// Front is most recently used, back is least. Holds indices into `slots`.
	mru_order: VecDeque<usize>,
	/// Fingerprint -> slot index for O(1) lookup.
	index: FxHashMap<Fingerprint, usize>,
	capacity: usize,
}

impl BlockCache {
	pub fn new() -> Self {
		Self::with_capacity(DEFAULT_CAPACITY)
	}

	pub fn with_capacity(capacity: usize) -> Self {
		assert!(capacity > 0, "cache capacity must be > 0");
		Self {
			slots: Vec::with_capacity(capacity),
			mru_order: VecDeque::with_capacity(capacity),
			index: FxHashMap::default(),
			capacity,
		}
	}

	/// Looks up a fragment and refreshes its recency on a hit.
	pub fn get(&mut self, fingerprint: Fingerprint) -> Option<&str> {
		let &slot_index = self.index.get(&fingerprint)?;
		self.touch(slot_index);
		Some(self.slots[slot_index].html.as_str())
	}

	/// Stores a fragment, evicting the least-recently-used entry at capacity.
	/// A present key only refreshes recency; the stored fragment is kept.
	pub fn put(&mut self, fingerprint: Fingerprint, html: String) {
		if let Some(&existing) = self.index.get(&fingerprint) {
			self.touch(existing);
			return;
		}

		let slot_index = if self.slots.len() < self.capacity {
			let idx = self.slots.len();
			self.slots.push(CacheSlot { fingerprint, html });
			idx
		} else {
			let lru_idx = self.mru_order.pop_back().expect("MRU order not empty at capacity");
			let evicted = self.slots[lru_idx].fingerprint;
			self.index.remove(&evicted);
			tracing::trace!(evicted = %evicted, "render.cache.evict");
			self.slots[lru_idx] = CacheSlot { fingerprint, html };
			lru_idx
		};

		self.index.insert(fingerprint, slot_index);
		self.mru_order.push_front(slot_index);
	}

	pub fn contains(&self, fingerprint: Fingerprint) -> bool {
		self.index.contains_key(&fingerprint)
	}

	pub fn len(&self) -> usize {
		self.index.len()
	}

	pub fn is_empty(&self) -> bool {
		self.index.is_empty()
	}

	pub fn clear(&mut self) {
		self.slots.clear();
		self.mru_order.clear();
		self.index.clear();
	}

	fn touch(&mut self, slot_index: usize) {
		if let Some(pos) = self.mru_order.iter().position(|&idx| idx == slot_index) {
			self.mru_order.remove(pos);
		}
		self.mru_order.push_front(slot_index);
	}
}

impl Default for BlockCache {
	fn default() -> Self {
		Self::new()
	}
}
