// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Host networking behind one trait.
//!
//! [`NetworkOs`] covers what the reconciler needs from the host: tunnel
//! interface lifecycle, WireGuard peers, routes, IP forwarding and nftables-style
//! firewall primitives. [`platform_os`] picks the implementation for the
//! running OS.

pub mod command;
pub mod darwin;
pub mod error;
pub mod firewall;
pub mod linux;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod os;
pub mod unsupported;
pub mod windows;
mod wg;

use std::sync::Arc;

pub use command::{CommandOutput, CommandRunner, Shell, TokioCommandRunner};
pub use darwin::DarwinOs;
pub use error::{NetOsError, Result};
pub use firewall::{ChainSpec, ChainType, FirewallFamily, Hook, RuleSpec, TableSpec};
pub use linux::LinuxOs;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{OsCall, RecordingOs};
pub use os::{DefaultRoute, InterfaceSpec, NetworkOs};
pub use unsupported::UnsupportedOs;
pub use windows::WindowsOs;

#[cfg(any(test, feature = "test-util"))]
pub use command::ScriptedRunner;

/// Implementation for the running OS.
pub fn platform_os() -> Arc<dyn NetworkOs> {
	os_for(std::env::consts::OS, Arc::new(TokioCommandRunner))
}

/// Implementation for `os` (a `std::env::consts::OS` value) using `runner`.
pub fn os_for(os: &str, runner: Arc<dyn CommandRunner>) -> Arc<dyn NetworkOs> {
	match os {
		"linux" => Arc::new(LinuxOs::new(runner)),
		"macos" => Arc::new(DarwinOs::new(runner)),
		"windows" => Arc::new(WindowsOs::new(runner)),
		other => {
			tracing::warn!(os = other, "no network implementation for this platform");
			Arc::new(UnsupportedOs::new(other))
		}
	}
}
