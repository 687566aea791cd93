use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use quill_render::{BlockCache, BlockRenderer, Fingerprint, RenderEngine, RenderError, RenderedDocument};
use quill_worker::{
	ChannelConfig, ChannelKind, Priority, SchedulerConfig, ShutdownReport, SubmitError, TaskError, TaskFn,
	TaskScheduler, WorkerChannel,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::debounce::{DebounceConfig, DebounceCoordinator};
use crate::external::{ChatBackend, FormatConverter, VersionControl};
use crate::load::{SysinfoProbe, SystemLoadProbe};

/// Everything the orchestrator delegates real work to.
#[derive(Clone)]
pub struct Collaborators {
	pub renderer: Arc<dyn BlockRenderer>,
	pub version_control: Arc<dyn VersionControl>,
	pub converter: Arc<dyn FormatConverter>,
	pub chat: Arc<dyn ChatBackend>,
}

/// Identifies one accepted user operation across its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationTicket(u64);

/// One explicit user action.
#[derive(Debug, Clone)]
pub enum Operation {
	VersionControl { args: Vec<String>, cwd: PathBuf },
	Convert { text: String, from: String, to: String },
	Chat { prompt: String, context: String },
}

impl Operation {
	pub fn kind(&self) -> ChannelKind {
		match self {
			Self::VersionControl { .. } => ChannelKind::VersionControl,
			Self::Convert { .. } => ChannelKind::Convert,
			Self::Chat { .. } => ChannelKind::Chat,
		}
	}
}

/// Successful result of one user operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
	VersionControl(crate::external::ToolOutput),
	Converted(Vec<u8>),
	Chat(String),
}

/// Completion queued for the foreground. Render events carry the version they
/// belong to; staleness is judged when the foreground drains, not earlier.
#[derive(Debug)]
pub enum ForegroundEvent {
	RenderComplete(RenderedDocument),
	OperationComplete {
		ticket: OperationTicket,
		kind: ChannelKind,
		outcome: Result<OperationOutcome, TaskError>,
	},
}

/// Per-lane shutdown reports.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownSummary {
	pub render: ShutdownReport,
	pub version_control: ShutdownReport,
	pub convert: ShutdownReport,
	pub chat: ShutdownReport,
	pub pool_clean: bool,
}

impl ShutdownSummary {
	pub fn clean(&self) -> bool {
		self.render.completed()
			&& self.version_control.completed()
			&& self.convert.completed()
			&& self.chat.completed()
			&& self.pool_clean
	}
}

/// Tunables for the whole background core.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
	pub render: ChannelConfig,
	pub version_control: ChannelConfig,
	pub convert: ChannelConfig,
	pub chat: ChannelConfig,
	pub scheduler: SchedulerConfig,
	pub debounce: DebounceConfig,
	pub cache_capacity: usize,
}

impl Default for OrchestratorConfig {
	fn default() -> Self {
		Self {
			render: ChannelConfig::for_kind(ChannelKind::Render),
			version_control: ChannelConfig::for_kind(ChannelKind::VersionControl),
			convert: ChannelConfig::for_kind(ChannelKind::Convert),
			chat: ChannelConfig::for_kind(ChannelKind::Chat),
			scheduler: SchedulerConfig::default(),
			debounce: DebounceConfig::default(),
			cache_capacity: 100,
		}
	}
}

enum Command {
	Edit {
		text: String,
		viewport: Option<Range<usize>>,
	},
	Operation {
		ticket: OperationTicket,
		op: Operation,
	},
	BlockDone {
		version: u64,
		index: usize,
		fingerprint: Fingerprint,
		result: Result<String, RenderError>,
	},
	Shutdown {
		grace: Duration,
		ack: oneshot::Sender<ShutdownSummary>,
	},
}

/// One reentrancy flag per user-operation lane. Set when an operation is
/// accepted, cleared when its completion event is created.
struct OperationGuards {
	version_control: AtomicBool,
	convert: AtomicBool,
	chat: AtomicBool,
}

impl OperationGuards {
	fn new() -> Self {
		Self {
			version_control: AtomicBool::new(false),
			convert: AtomicBool::new(false),
			chat: AtomicBool::new(false),
		}
	}

	fn flag(&self, kind: ChannelKind) -> &AtomicBool {
		match kind {
			ChannelKind::VersionControl => &self.version_control,
			ChannelKind::Convert => &self.convert,
			ChannelKind::Chat => &self.chat,
			// Operation::kind never yields Render.
			ChannelKind::Render => unreachable!("render is not a user operation"),
		}
	}
}

type RenderCallback = Box<dyn Fn(&RenderedDocument) + Send>;
type OperationCallback = Box<dyn Fn(OperationTicket, ChannelKind, &Result<OperationOutcome, TaskError>) + Send>;

#[derive(Default)]
struct Callbacks {
	on_render: parking_lot::Mutex<Vec<RenderCallback>>,
	on_operation: parking_lot::Mutex<Vec<OperationCallback>>,
}

/// Composition root for the background core.
///
/// Owns one dedicated lane per operation kind, the shared pool, the render
/// engine, and the debounce timer, all driven by a single task. The
/// foreground never blocks: edits and operations are handed off through a
/// command queue, and completions come back through [`drain`](Self::drain).
pub struct Orchestrator {
	commands: mpsc::UnboundedSender<Command>,
	events_rx: parking_lot::Mutex<mpsc::UnboundedReceiver<ForegroundEvent>>,
	callbacks: Arc<Callbacks>,
	latest_version: Arc<AtomicU64>,
	guards: Arc<OperationGuards>,
	tickets: AtomicU64,
	driver: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
	/// Starts the background core with a live host-load probe.
	pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Self {
		Self::with_probe(config, collaborators, Box::new(SysinfoProbe::new()))
	}

	/// Starts the background core with an explicit load probe.
	pub fn with_probe(config: OrchestratorConfig, collaborators: Collaborators, probe: Box<dyn SystemLoadProbe>) -> Self {
		let (command_tx, command_rx) = mpsc::unbounded_channel();
		let (event_tx, event_rx) = mpsc::unbounded_channel();
		let latest_version = Arc::new(AtomicU64::new(0));
		let guards = Arc::new(OperationGuards::new());

		let driver = Driver {
			engine: RenderEngine::with_cache(BlockCache::with_capacity(config.cache_capacity)),
			debounce: DebounceCoordinator::new(config.debounce, probe),
			vc_timeout: config.version_control.timeout,
			render: WorkerChannel::new(config.render),
			version_control: WorkerChannel::new(config.version_control),
			convert: WorkerChannel::new(config.convert),
			chat: WorkerChannel::new(config.chat),
			pool: TaskScheduler::new(config.scheduler),
			collaborators,
			command_tx: command_tx.clone(),
			events: event_tx,
			latest_version: Arc::clone(&latest_version),
			guards: Arc::clone(&guards),
			pending_edit: None,
		};
		let driver = quill_worker::spawn("orchestrator", driver.run(command_rx));

		Self {
			commands: command_tx,
			events_rx: parking_lot::Mutex::new(event_rx),
			callbacks: Arc::new(Callbacks::default()),
			latest_version,
			guards,
			tickets: AtomicU64::new(0),
			driver: parking_lot::Mutex::new(Some(driver)),
		}
	}

	/// Registers a callback for fresh renders, invoked during [`drain`](Self::drain).
	pub fn on_render_complete(&self, callback: impl Fn(&RenderedDocument) + Send + 'static) {
		self.callbacks.on_render.lock().push(Box::new(callback));
	}

	/// Registers a callback for operation completions, invoked during
	/// [`drain`](Self::drain).
	pub fn on_operation_complete(
		&self,
		callback: impl Fn(OperationTicket, ChannelKind, &Result<OperationOutcome, TaskError>) + Send + 'static,
	) {
		self.callbacks.on_operation.lock().push(Box::new(callback));
	}

	/// Fire-and-forget edit notification; schedules a debounced re-render of
	/// the whole document.
	pub fn submit_edit(&self, text: impl Into<String>) {
		let _ = self.commands.send(Command::Edit {
			text: text.into(),
			viewport: None,
		});
	}

	/// Like [`submit_edit`](Self::submit_edit), with a viewport hint: changed
	/// blocks inside `visible_blocks` go to the dedicated render lane, the
	/// rest are pre-rendered speculatively on the pool at idle priority.
	pub fn submit_edit_with_viewport(&self, text: impl Into<String>, visible_blocks: Range<usize>) {
		let _ = self.commands.send(Command::Edit {
			text: text.into(),
			viewport: Some(visible_blocks),
		});
	}

	/// Requests one explicit user action.
	///
	/// Rejected with `AlreadyInFlight` before any task is built when an
	/// operation of the same kind has not completed yet; this guard is
	/// separate from the lane's own queueing. It is also why operations take
	/// no coalesce key: at most one per kind is ever pending, so a key could
	/// never match anything.
	pub fn request_operation(&self, op: Operation) -> Result<OperationTicket, SubmitError> {
		let kind = op.kind();
		if self.guards.flag(kind).swap(true, Ordering::AcqRel) {
			tracing::warn!(kind = kind.as_str(), "orchestrator.operation.already_in_flight");
			return Err(SubmitError::AlreadyInFlight);
		}

		let ticket = OperationTicket(self.tickets.fetch_add(1, Ordering::AcqRel).wrapping_add(1));
		if self.commands.send(Command::Operation { ticket, op }).is_err() {
			self.guards.flag(kind).store(false, Ordering::Release);
			return Err(SubmitError::Closed);
		}
		tracing::debug!(kind = kind.as_str(), ticket = ticket.0, "orchestrator.operation.accepted");
		Ok(ticket)
	}

	/// Dispatches queued completions to the registered callbacks.
	///
	/// Called from the foreground. Render events are gated here: a render for
	/// anything but the latest version is dropped silently (its cache writes
	/// were already kept). Returns the number of events dispatched.
	pub fn drain(&self) -> usize {
		let mut batch = Vec::new();
		{
			let mut rx = self.events_rx.lock();
			while let Ok(event) = rx.try_recv() {
				batch.push(event);
			}
		}

		let mut dispatched = 0;
		for event in batch {
			match event {
				ForegroundEvent::RenderComplete(doc) => {
					if doc.version == self.latest_version.load(Ordering::Acquire) {
						for callback in self.callbacks.on_render.lock().iter() {
							callback(&doc);
						}
						dispatched += 1;
					} else {
						tracing::debug!(version = doc.version, "orchestrator.render.stale_dropped");
					}
				}
				ForegroundEvent::OperationComplete { ticket, kind, outcome } => {
					for callback in self.callbacks.on_operation.lock().iter() {
						callback(ticket, kind, &outcome);
					}
					dispatched += 1;
				}
			}
		}
		dispatched
	}

	/// Stops intake everywhere, gives each lane the grace period, abandons
	/// non-quiescent lanes, and joins the driver. Returns `None` when the
	/// core was already shut down.
	pub async fn shutdown(&self, grace: Duration) -> Option<ShutdownSummary> {
		let handle = self.driver.lock().take()?;
		let (ack_tx, ack_rx) = oneshot::channel();
		if self.commands.send(Command::Shutdown { grace, ack: ack_tx }).is_err() {
			let _ = handle.await;
			return None;
		}
		let summary = ack_rx.await.ok();
		let _ = handle.await;
		summary
	}
}

struct PendingEdit {
	text: String,
	viewport: Option<Range<usize>>,
}

struct Driver {
	engine: RenderEngine,
	debounce: DebounceCoordinator<Box<dyn SystemLoadProbe>>,
	vc_timeout: Duration,
	render: WorkerChannel<String>,
	version_control: WorkerChannel<OperationOutcome>,
	convert: WorkerChannel<OperationOutcome>,
	chat: WorkerChannel<OperationOutcome>,
	pool: TaskScheduler<String>,
	collaborators: Collaborators,
	command_tx: mpsc::UnboundedSender<Command>,
	events: mpsc::UnboundedSender<ForegroundEvent>,
	latest_version: Arc<AtomicU64>,
	guards: Arc<OperationGuards>,
	pending_edit: Option<PendingEdit>,
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}

impl Driver {
	async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
		loop {
			let deadline = self.debounce.deadline();
			tokio::select! {
				command = commands.recv() => match command {
					Some(Command::Shutdown { grace, ack }) => {
						let summary = self.shutdown_lanes(grace).await;
						let _ = ack.send(summary);
						break;
					}
					Some(command) => self.handle_command(command).await,
					None => break,
				},
				() = sleep_until_opt(deadline) => {
					self.debounce.disarm();
					self.start_render().await;
				}
			}
		}
		tracing::debug!("orchestrator.stopped");
	}

	async fn handle_command(&mut self, command: Command) {
		match command {
			Command::Edit { text, viewport } => {
				self.debounce.notify(text.len());
				self.pending_edit = Some(PendingEdit { text, viewport });
			}
			Command::Operation { ticket, op } => self.dispatch_operation(ticket, op).await,
			Command::BlockDone {
				version,
				index,
				fingerprint,
				result,
			} => {
				self.engine.complete_block(version, index, fingerprint, result);
				self.publish_if_assembled();
			}
			Command::Shutdown { .. } => unreachable!("handled in run"),
		}
	}

	async fn start_render(&mut self) {
		let Some(edit) = self.pending_edit.take() else {
			return;
		};
		let plan = self.engine.plan(&edit.text);
		self.latest_version.store(plan.version, Ordering::Release);
		// A newer version supersedes all speculative work for older ones.
		self.pool.cancel_by_prefix("render/").await;

		for block in plan.pending {
			let in_view = edit.viewport.as_ref().is_none_or(|range| range.contains(&block.index));
			let renderer = Arc::clone(&self.collaborators.renderer);
			let source = block.source;
			let body: TaskFn<String> = Box::new(move |token| {
				if token.is_cancelled() {
					return Err(TaskError::Cancelled);
				}
				renderer.render_block(&source).map_err(|err| TaskError::Transient(err.to_string()))
			});

			let submitted = if in_view {
				self.render.submit(body).await
			} else {
				// Keyed by version and slot, not fingerprint: duplicate blocks
				// share a fingerprint but each slot needs its own completion.
				let key = format!("render/{}/{}", plan.version, block.index);
				self.pool.submit(Priority::Idle, Some(key), body).await
			};

			match submitted {
				Ok(handle) => {
					let tx = self.command_tx.clone();
					let (version, index, fingerprint) = (plan.version, block.index, block.fingerprint);
					quill_worker::spawn("orchestrator", async move {
						let result = match handle.wait().await {
							Ok(html) => Ok(html),
							// Superseded by a newer plan; nothing to report.
							Err(TaskError::Cancelled) => return,
							Err(TaskError::Transient(msg)) => Err(RenderError::Markup(msg)),
							Err(err) => Err(RenderError::Unavailable(err.to_string())),
						};
						let _ = tx.send(Command::BlockDone {
							version,
							index,
							fingerprint,
							result,
						});
					});
				}
				Err(err) => {
					tracing::warn!(%err, index = block.index, "orchestrator.render.submit_failed");
					self.engine
						.complete_block(plan.version, block.index, block.fingerprint, Err(RenderError::Unavailable(err.to_string())));
				}
			}
		}

		// Zero misses (or every submit failed) completes synchronously.
		self.publish_if_assembled();
	}

	fn publish_if_assembled(&mut self) {
		if let Some(doc) = self.engine.try_assemble() {
			let _ = self.events.send(ForegroundEvent::RenderComplete(doc));
		}
	}

	async fn dispatch_operation(&mut self, ticket: OperationTicket, op: Operation) {
		let kind = op.kind();
		let body: TaskFn<OperationOutcome> = match op {
			Operation::VersionControl { args, cwd } => {
				let vc = Arc::clone(&self.collaborators.version_control);
				let timeout = self.vc_timeout;
				Box::new(move |token| {
					if token.is_cancelled() {
						return Err(TaskError::Cancelled);
					}
					let output = vc.run(&args, &cwd, timeout).map_err(|err| TaskError::Transient(err.to_string()))?;
					if !output.success() {
						return Err(TaskError::Transient(format!(
							"exit {}: {}",
							output.exit_code,
							output.stderr.trim()
						)));
					}
					Ok(OperationOutcome::VersionControl(output))
				})
			}
			Operation::Convert { text, from, to } => {
				let converter = Arc::clone(&self.collaborators.converter);
				Box::new(move |token| {
					if token.is_cancelled() {
						return Err(TaskError::Cancelled);
					}
					converter
						.convert(&text, &from, &to)
						.map(OperationOutcome::Converted)
						.map_err(|err| TaskError::Transient(err.to_string()))
				})
			}
			Operation::Chat { prompt, context } => {
				let chat = Arc::clone(&self.collaborators.chat);
				Box::new(move |token| {
					if token.is_cancelled() {
						return Err(TaskError::Cancelled);
					}
					chat.send(&prompt, &context)
						.map(OperationOutcome::Chat)
						.map_err(|err| TaskError::Transient(err.to_string()))
				})
			}
		};

		let channel = match kind {
			ChannelKind::VersionControl => &self.version_control,
			ChannelKind::Convert => &self.convert,
			ChannelKind::Chat => &self.chat,
			ChannelKind::Render => unreachable!("render is not a user operation"),
		};

		match channel.submit(body).await {
			Ok(handle) => {
				let events = self.events.clone();
				let guards = Arc::clone(&self.guards);
				quill_worker::spawn("orchestrator", async move {
					let outcome = handle.wait().await;
					guards.flag(kind).store(false, Ordering::Release);
					let _ = events.send(ForegroundEvent::OperationComplete { ticket, kind, outcome });
				});
			}
			Err(err) => {
				self.guards.flag(kind).store(false, Ordering::Release);
				let _ = self.events.send(ForegroundEvent::OperationComplete {
					ticket,
					kind,
					outcome: Err(TaskError::Transient(err.to_string())),
				});
			}
		}
	}

	async fn shutdown_lanes(&mut self, grace: Duration) -> ShutdownSummary {
		tracing::debug!(?grace, "orchestrator.shutdown");
		ShutdownSummary {
			render: self.render.shutdown(grace).await,
			version_control: self.version_control.shutdown(grace).await,
			convert: self.convert.shutdown(grace).await,
			chat: self.chat.shutdown(grace).await,
			pool_clean: self.pool.shutdown(grace).await,
		}
	}
}
