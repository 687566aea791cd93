use std::path::Path;
use std::time::Duration;

use thiserror::Error;

/// Failure invoking an external collaborator. Non-zero exits are not errors
/// here; they come back in [`ToolOutput`] and the task layer classifies them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
	/// The tool could not be launched at all.
	#[error("failed to launch: {0}")]
	Spawn(String),
	/// The tool launched but communication with it failed.
	#[error("i/o error: {0}")]
	Io(String),
}

/// Captured result of one external tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
	pub exit_code: i32,
	pub stdout: String,
	pub stderr: String,
}

impl ToolOutput {
	pub fn success(&self) -> bool {
		self.exit_code == 0
	}
}

/// Version control backend (commit, diff, log, push).
pub trait VersionControl: Send + Sync {
	/// Runs one subcommand. `args` is passed as an argument list, never
	/// through a shell.
	fn run(&self, args: &[String], cwd: &Path, timeout: Duration) -> Result<ToolOutput, ToolError>;
}

/// Document format conversion backend (export, import).
pub trait FormatConverter: Send + Sync {
	fn convert(&self, text: &str, from: &str, to: &str) -> Result<Vec<u8>, ToolError>;
}

/// Conversational assistant backend.
pub trait ChatBackend: Send + Sync {
	fn send(&self, prompt: &str, context: &str) -> Result<String, ToolError>;
}
