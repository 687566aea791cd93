//! Background execution lanes for blocking editor operations.
//!
//! Two execution surfaces:
//! - [`WorkerChannel`]: a single-flight FIFO lane bound to one category of
//!   blocking external call (version control, format conversion, rendering,
//!   chat). Never runs two tasks at once, never reorders.
//! - [`TaskScheduler`]: a bounded pool for short, interchangeable, cancellable
//!   work with priority ordering and keyed coalescing.
//!
//! Cancellation is cooperative everywhere: a task that has entered a blocking
//! external call runs to completion or to its lane's hard timeout, at which
//! point the call is abandoned (detached), never killed.

mod channel;
mod class;
mod scheduler;
mod spawn;
mod task;
mod token;

pub use channel::{ChannelConfig, ShutdownReport, WorkerChannel};
pub use class::{ChannelKind, Priority};
pub use scheduler::{SchedulerConfig, TaskScheduler};
pub use spawn::{spawn, spawn_blocking};
pub use task::{SubmitError, TaskError, TaskFn, TaskHandle, TaskId};
pub use token::CancelToken;
