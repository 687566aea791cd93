use thiserror::Error;

use crate::block::{DocumentSnapshot, Fingerprint, split_blocks};
use crate::cache::BlockCache;

/// Failure rendering one block. Other blocks are unaffected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
	/// The block's markup could not be rendered.
	#[error("markup error: {0}")]
	Markup(String),
	/// The renderer produced no output for this block (timed out or crashed).
	#[error("renderer unavailable: {0}")]
	Unavailable(String),
}

/// External collaborator that turns one block's source into an HTML fragment.
///
/// Blocking and stateless from the engine's point of view; invoked on a
/// worker, never on the engine's own thread.
pub trait BlockRenderer: Send + Sync {
	fn render_block(&self, source: &str) -> Result<String, RenderError>;
}

/// One cache-miss block that needs fresh rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBlock {
	/// Position in the planned document, for completion routing.
	pub index: usize,
	pub fingerprint: Fingerprint,
	pub source: String,
}

/// Outcome of planning one document state: which blocks must be rendered.
/// Blocks not listed were served from cache.
#[derive(Debug)]
pub struct RenderPlan {
	pub version: u64,
	pub block_count: usize,
	pub pending: Vec<PendingBlock>,
}

/// Fully assembled output for one document version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDocument {
	pub version: u64,
	pub html: String,
	pub block_count: usize,
	/// Blocks that failed and were replaced by an error placeholder.
	pub degraded: usize,
}

#[derive(Debug)]
enum Slot {
	Pending(Fingerprint),
	Rendered(String),
	Degraded(String),
}

#[derive(Debug)]
struct Assembly {
	version: u64,
	slots: Vec<Slot>,
	outstanding: usize,
}

/// Incremental renderer: diffs by content fingerprint, caches fragments,
/// gates completions by version, assembles in block order.
///
/// Blocks are matched by fingerprint, not position. When the block count
/// changes no positional alignment happens; every block simply hits or
/// misses the content-addressed cache, which covers moved and duplicated
/// blocks for free.
#[derive(Debug)]
pub struct RenderEngine {
	cache: BlockCache,
	version: u64,
	assembly: Option<Assembly>,
}

impl RenderEngine {
	pub fn new() -> Self {
		Self::with_cache(BlockCache::new())
	}

	pub fn with_cache(cache: BlockCache) -> Self {
		Self {
			cache,
			version: 0,
			assembly: None,
		}
	}

	/// Latest planned version. Completions for anything older are stale.
	pub fn latest_version(&self) -> u64 {
		self.version
	}

	/// Plans a render of `text`: splits, fingerprints, serves unchanged
	/// blocks from cache, and lists the cache misses for submission.
	///
	/// Replaces any in-progress assembly; its unresolved blocks become
	/// stale and their late completions only feed the cache.
	pub fn plan(&mut self, text: &str) -> RenderPlan {
		self.version += 1;
		let snapshot = DocumentSnapshot {
			version: self.version,
			blocks: split_blocks(text),
		};

		let mut slots = Vec::with_capacity(snapshot.blocks.len());
		let mut pending = Vec::new();
		for (index, block) in snapshot.blocks.iter().enumerate() {
			if let Some(html) = self.cache.get(block.fingerprint) {
				slots.push(Slot::Rendered(html.to_owned()));
			} else {
				slots.push(Slot::Pending(block.fingerprint));
				pending.push(PendingBlock {
					index,
					fingerprint: block.fingerprint,
					source: block.source.clone(),
				});
			}
		}

		tracing::debug!(
			version = snapshot.version,
			blocks = snapshot.blocks.len(),
			misses = pending.len(),
			"render.plan"
		);

		let outstanding = pending.len();
		self.assembly = Some(Assembly {
			version: snapshot.version,
			slots,
			outstanding,
		});

		RenderPlan {
			version: snapshot.version,
			block_count: snapshot.blocks.len(),
			pending,
		}
	}

	/// Records one block completion.
	///
	/// Successes always land in the cache, stale or not: content-addressed
	/// fragments stay useful across versions. The result is attached to the
	/// pending assembly only when `version` is still the latest and the slot
	/// still expects this fingerprint. An error degrades that block to a
	/// placeholder without touching the others. Returns true when attached.
	pub fn complete_block(
		&mut self,
		version: u64,
		index: usize,
		fingerprint: Fingerprint,
		result: Result<String, RenderError>,
	) -> bool {
		if let Ok(html) = &result {
			self.cache.put(fingerprint, html.clone());
		}

		let Some(assembly) = self.assembly.as_mut() else {
			return false;
		};
		if version != assembly.version || version != self.version {
			tracing::trace!(version, latest = self.version, "render.complete.stale");
			return false;
		}
		let Some(slot) = assembly.slots.get_mut(index) else {
			return false;
		};
		let Slot::Pending(expected) = *slot else {
			return false;
		};
		if expected != fingerprint {
			return false;
		}

		*slot = match result {
			Ok(html) => Slot::Rendered(html),
			Err(err) => {
				tracing::debug!(version, index, %err, "render.block.degraded");
				Slot::Degraded(error_placeholder(&err))
			}
		};
		assembly.outstanding -= 1;
		true
	}

	/// Produces the assembled document once every block of the latest
	/// version has resolved. Returns `None` while blocks are outstanding.
	pub fn try_assemble(&mut self) -> Option<RenderedDocument> {
		if self.assembly.as_ref().is_none_or(|a| a.outstanding > 0) {
			return None;
		}
		let assembly = self.assembly.take()?;

		let mut degraded = 0;
		let block_count = assembly.slots.len();
		let mut fragments = Vec::with_capacity(block_count);
		for slot in assembly.slots {
			match slot {
				Slot::Rendered(html) => fragments.push(html),
				Slot::Degraded(html) => {
					degraded += 1;
					fragments.push(html);
				}
				Slot::Pending(_) => unreachable!("outstanding == 0 with pending slot"),
			}
		}

		tracing::debug!(version = assembly.version, blocks = block_count, degraded, "render.assemble");
		Some(RenderedDocument {
			version: assembly.version,
			html: fragments.join("\n"),
			block_count,
			degraded,
		})
	}
}

impl Default for RenderEngine {
	fn default() -> Self {
		Self::new()
	}
}

fn error_placeholder(err: &RenderError) -> String {
	format!("<pre class=\"render-error\">{err}</pre>")
}

#[cfg(test)]
mod tests {
	use super::*;

	/// Renders a block and counts invocations.
	struct CountingRenderer {
		calls: std::cell::Cell<usize>,
	}

	impl CountingRenderer {
		fn new() -> Self {
			Self { calls: std::cell::Cell::new(0) }
		}

		fn render(&self, source: &str) -> String {
			self.calls.set(self.calls.get() + 1);
			format!("<p>{source}</p>")
		}
	}

	fn drive_to_completion(engine: &mut RenderEngine, renderer: &CountingRenderer, text: &str) -> RenderedDocument {
		let plan = engine.plan(text);
		for pending in plan.pending {
			let html = renderer.render(&pending.source);
			assert!(engine.complete_block(plan.version, pending.index, pending.fingerprint, Ok(html)));
		}
		engine.try_assemble().expect("all blocks resolved")
	}

	#[test]
	fn empty_document_renders_with_zero_tasks() {
		let mut engine = RenderEngine::new();
		let plan = engine.plan("");
		assert_eq!(plan.block_count, 0);
		assert!(plan.pending.is_empty());

		let doc = engine.try_assemble().expect("empty assembly completes immediately");
		assert_eq!(doc.block_count, 0);
		assert_eq!(doc.html, "");
		assert_eq!(doc.degraded, 0);
	}

	#[test]
	fn unchanged_blocks_are_served_from_cache() {
		let mut engine = RenderEngine::new();
		let renderer = CountingRenderer::new();

		let first = drive_to_completion(&mut engine, &renderer, "A\n\nB\n\nC");
		assert_eq!(first.block_count, 3);
		assert_eq!(renderer.calls.get(), 3);

		// Only the middle block changed: exactly one new task.
		let plan = engine.plan("A\n\nB2\n\nC");
		assert_eq!(plan.pending.len(), 1);
		assert_eq!(plan.pending[0].index, 1);
		assert_eq!(plan.pending[0].source, "B2");
	}

	#[test]
	fn single_block_edit_resubmits_one_task() {
		let mut engine = RenderEngine::new();
		let renderer = CountingRenderer::new();

		// No blank lines: "A\nB\nC" is one block, and so is its edit.
		drive_to_completion(&mut engine, &renderer, "A\nB\nC");
		let plan = engine.plan("A\nB2\nC");
		assert_eq!(plan.pending.len(), 1);
		assert_eq!(renderer.calls.get(), 1);
	}

	#[test]
	fn identical_replan_invokes_renderer_zero_times() {
		let mut engine = RenderEngine::new();
		let renderer = CountingRenderer::new();

		drive_to_completion(&mut engine, &renderer, "one\n\ntwo");
		assert_eq!(renderer.calls.get(), 2);

		let doc = drive_to_completion(&mut engine, &renderer, "one\n\ntwo");
		assert_eq!(renderer.calls.get(), 2, "all blocks cache-hit");
		assert_eq!(doc.html, "<p>one</p>\n<p>two</p>");
	}

	#[test]
	fn stale_completion_never_surfaces_but_feeds_cache() {
		let mut engine = RenderEngine::new();

		let old = engine.plan("slow");
		let old_block = old.pending[0].clone();

		// A newer version lands before the old render finishes.
		let new = engine.plan("fast");
		let new_block = new.pending[0].clone();

		let attached = engine.complete_block(old.version, old_block.index, old_block.fingerprint, Ok("<p>slow</p>".into()));
		assert!(!attached, "stale completion must not attach");
		assert!(engine.try_assemble().is_none(), "latest version still outstanding");

		assert!(engine.complete_block(new.version, new_block.index, new_block.fingerprint, Ok("<p>fast</p>".into())));
		let doc = engine.try_assemble().expect("latest resolved");
		assert_eq!(doc.version, new.version);
		assert_eq!(doc.html, "<p>fast</p>");

		// The stale write is kept: re-rendering the old text is a cache hit.
		let replay = engine.plan("slow");
		assert!(replay.pending.is_empty());
	}

	#[test]
	fn failed_block_degrades_alone() {
		let mut engine = RenderEngine::new();
		let plan = engine.plan("A\n\nB\n\nC");
		assert_eq!(plan.pending.len(), 3);

		for pending in &plan.pending {
			let result = if pending.source == "B" {
				Err(RenderError::Markup("unbalanced emphasis".into()))
			} else {
				Ok(format!("<p>{}</p>", pending.source))
			};
			engine.complete_block(plan.version, pending.index, pending.fingerprint, result);
		}

		let doc = engine.try_assemble().expect("resolved");
		assert_eq!(doc.degraded, 1);
		assert_eq!(doc.block_count, 3);
		assert!(doc.html.contains("<p>A</p>"));
		assert!(doc.html.contains("render-error"));
		assert!(doc.html.contains("<p>C</p>"));

		// The failure was not cached: the next plan retries that block only.
		let retry = engine.plan("A\n\nB\n\nC");
		assert_eq!(retry.pending.len(), 1);
		assert_eq!(retry.pending[0].source, "B");
	}

	#[test]
	fn mismatched_fingerprint_is_rejected() {
		let mut engine = RenderEngine::new();
		let plan = engine.plan("block");
		let pending = &plan.pending[0];
		let wrong = Fingerprint(pending.fingerprint.0 ^ 1);
		assert!(!engine.complete_block(plan.version, pending.index, wrong, Ok("<p>?</p>".into())));
		assert!(engine.try_assemble().is_none());
	}
}
