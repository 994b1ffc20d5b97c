// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Mesh-overlay agent.
//!
//! The [`Agent`] polls the control plane for the organization's peer list and
//! security group and hands each snapshot to the [`Reconciler`], which drives
//! the host's WireGuard interface, routes and firewall towards it.

pub mod config;
pub mod control_plane;
pub mod daemon;
pub mod error;
pub mod identity;
pub mod origins;
pub mod reconciler;

pub use config::{load_config, AgentConfig, AgentConfigLayer, ConfigError, KeySource};
pub use control_plane::{ControlPlane, ControlPlaneError, HttpControlPlane};
pub use daemon::{Agent, ShutdownHandle};
pub use error::{AgentError, ReconcileError, Result};
pub use identity::{load_identity, DeviceIdentity};
pub use origins::ExitNodeOrigins;
pub use reconciler::{
	ReconcileInput, ReconcileReport, ReconcileState, ReconcileStatus, Reconciler, ReconcilerConfig,
};
