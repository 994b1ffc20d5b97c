// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetOsError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("{program} {} failed: {stderr}", .args.join(" "))]
	CommandFailed {
		program: String,
		args: Vec<String>,
		stderr: String,
	},

	#[error("required binary not found: {0}")]
	BinaryMissing(String),

	#[error("operation not supported on {os}: {operation}")]
	Unsupported { os: String, operation: &'static str },

	#[error("failed to parse {what}: {detail}")]
	Parse { what: &'static str, detail: String },

	#[error("not found: {0}")]
	NotFound(String),
}

impl NetOsError {
	pub fn unsupported(os: impl Into<String>, operation: &'static str) -> Self {
		Self::Unsupported {
			os: os.into(),
			operation,
		}
	}

	pub fn parse(what: &'static str, detail: impl Into<String>) -> Self {
		Self::Parse {
			what,
			detail: detail.into(),
		}
	}

	pub fn is_unsupported(&self) -> bool {
		matches!(self, Self::Unsupported { .. })
	}
}

pub type Result<T> = std::result::Result<T, NetOsError>;
