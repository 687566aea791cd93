//! Background task orchestration for the editor core.
//!
//! Ties the execution lanes to the incremental renderer: edits arrive
//! fire-and-forget, a debounce timer adapts its delay to document size and
//! host load, and the fire plans a render whose cache misses fan out to the
//! dedicated render lane (viewport) and the shared pool (speculative).
//! User-visible operations (version control, conversion, chat) run on their
//! own lanes behind a per-kind reentrancy guard. Completions are queued as
//! foreground events and drained by the UI thread, which applies the
//! stale-version gate at drain time.

mod debounce;
mod external;
mod load;
mod orchestrator;

pub use debounce::{DebounceConfig, DebounceCoordinator, compute_delay, load_factor};
pub use external::{ChatBackend, FormatConverter, ToolError, ToolOutput, VersionControl};
pub use load::{LoadSample, StaticProbe, SysinfoProbe, SystemLoadProbe};
pub use orchestrator::{
	Collaborators, ForegroundEvent, Operation, OperationOutcome, OperationTicket, Orchestrator, OrchestratorConfig,
	ShutdownSummary,
};
