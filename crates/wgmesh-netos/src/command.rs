// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! External command execution.
//!
//! Every OS implementation shells out through a [`CommandRunner`] so tests can
//! substitute a scripted runner and assert on the exact command lines.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::error::{NetOsError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
	pub success: bool,
	pub stdout: String,
	pub stderr: String,
}

impl CommandOutput {
	pub fn ok(stdout: impl Into<String>) -> Self {
		Self {
			success: true,
			stdout: stdout.into(),
			stderr: String::new(),
		}
	}

	pub fn failed(stderr: impl Into<String>) -> Self {
		Self {
			success: false,
			stdout: String::new(),
			stderr: stderr.into(),
		}
	}
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
	/// Runs `program` to completion. A non-zero exit is reported through
	/// [`CommandOutput::success`], not as an error.
	async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Runs commands with `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
	async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
		trace!(cmd = %format!("{} {}", program, args.join(" ")), "running command");

		let output = Command::new(program).args(args).output().await.map_err(|e| {
			if e.kind() == std::io::ErrorKind::NotFound {
				warn!(program, "binary not found in PATH");
				NetOsError::BinaryMissing(program.to_string())
			} else {
				NetOsError::Io(e)
			}
		})?;

		Ok(CommandOutput {
			success: output.status.success(),
			stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
			stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
		})
	}
}

pub fn argv<I, S>(items: I) -> Vec<String>
where
	I: IntoIterator<Item = S>,
	S: Into<String>,
{
	items.into_iter().map(Into::into).collect()
}

/// Thin wrapper adding the error-handling policies the OS layers need.
#[derive(Clone)]
pub struct Shell {
	runner: Arc<dyn CommandRunner>,
}

impl Shell {
	pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
		Self { runner }
	}

	pub async fn output(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
		self.runner.run(program, args).await
	}

	/// Runs the command and returns stdout, failing on non-zero exit.
	pub async fn run(&self, program: &str, args: &[String]) -> Result<String> {
		let output = self.runner.run(program, args).await?;
		if output.success {
			Ok(output.stdout)
		} else {
			Err(NetOsError::CommandFailed {
				program: program.to_string(),
				args: args.to_vec(),
				stderr: output.stderr,
			})
		}
	}

	/// Runs the command, treating failures whose stderr contains one of
	/// `benign` as success. Returns `false` when a benign failure was swallowed.
	pub async fn run_idempotent(
		&self,
		program: &str,
		args: &[String],
		benign: &[&str],
	) -> Result<bool> {
		let output = self.runner.run(program, args).await?;
		if output.success {
			return Ok(true);
		}
		if benign.iter().any(|b| output.stderr.contains(b)) {
			debug!(program, stderr = %output.stderr, "ignoring benign command failure");
			return Ok(false);
		}
		Err(NetOsError::CommandFailed {
			program: program.to_string(),
			args: args.to_vec(),
			stderr: output.stderr,
		})
	}

	/// Runs the command and ignores any failure.
	pub async fn run_allow_failure(&self, program: &str, args: &[String]) {
		match self.runner.run(program, args).await {
			Ok(output) if !output.success => {
				debug!(program, stderr = %output.stderr, "command failed (ignored)");
			}
			Err(e) => debug!(program, error = %e, "command failed (ignored)"),
			Ok(_) => {}
		}
	}

	/// Fails with [`NetOsError::BinaryMissing`] unless `program args` succeeds.
	pub async fn require(&self, program: &str, args: &[String]) -> Result<()> {
		match self.runner.run(program, args).await {
			Ok(output) if output.success => Ok(()),
			Ok(_) | Err(NetOsError::BinaryMissing(_)) => {
				Err(NetOsError::BinaryMissing(program.to_string()))
			}
			Err(e) => Err(e),
		}
	}
}

#[cfg(any(test, feature = "test-util"))]
pub use scripted::ScriptedRunner;

#[cfg(any(test, feature = "test-util"))]
mod scripted {
	use std::sync::Mutex;

	use async_trait::async_trait;

	use super::{CommandOutput, CommandRunner};
	use crate::error::Result;

	/// Records every command line and answers from a list of
	/// `(prefix, output)` pairs. Unmatched commands succeed with empty output.
	#[derive(Default)]
	pub struct ScriptedRunner {
		responses: Mutex<Vec<(String, CommandOutput)>>,
		calls: Mutex<Vec<String>>,
	}

	impl ScriptedRunner {
		pub fn new() -> Self {
			Self::default()
		}

		/// Later registrations take precedence over earlier ones.
		pub fn respond(&self, prefix: &str, output: CommandOutput) {
			if let Ok(mut responses) = self.responses.lock() {
				responses.insert(0, (prefix.to_string(), output));
			}
		}

		pub fn calls(&self) -> Vec<String> {
			self.calls.lock().map(|c| c.clone()).unwrap_or_default()
		}
	}

	#[async_trait]
	impl CommandRunner for ScriptedRunner {
		async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
			let line = if args.is_empty() {
				program.to_string()
			} else {
				format!("{} {}", program, args.join(" "))
			};
			if let Ok(mut calls) = self.calls.lock() {
				calls.push(line.clone());
			}
			let responses = match self.responses.lock() {
				Ok(r) => r,
				Err(_) => return Ok(CommandOutput::ok("")),
			};
			Ok(responses
				.iter()
				.find(|(prefix, _)| line.starts_with(prefix.as_str()))
				.map(|(_, output)| output.clone())
				.unwrap_or_else(|| CommandOutput::ok("")))
		}
	}
}
