//! Incremental block rendering.
//!
//! A document is partitioned into blocks at blank-line boundaries. Each block
//! is identified by a content fingerprint, so an edit only invalidates the
//! blocks whose text actually changed. Rendered fragments live in a bounded
//! LRU cache keyed by fingerprint; the engine plans which blocks need fresh
//! rendering, collects completions with a stale-version guard, and assembles
//! the final document in block order.

mod block;
mod cache;
mod engine;

pub use block::{Block, DocumentSnapshot, Fingerprint, split_blocks};
pub use cache::BlockCache;
pub use engine::{BlockRenderer, PendingBlock, RenderEngine, RenderError, RenderPlan, RenderedDocument};
