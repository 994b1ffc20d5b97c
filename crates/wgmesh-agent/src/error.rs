// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;
use wgmesh_common::keys_file::KeyFileError;
use wgmesh_common::{Route, WgPublicKey};
use wgmesh_netos::NetOsError;
use wgmesh_policy::PolicyError;

use crate::config::ConfigError;
use crate::control_plane::ControlPlaneError;

/// Failure of a single reconciliation pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
	#[error("interface setup failed: {0}")]
	Interface(#[source] NetOsError),

	#[error("peer {peer}: {source}")]
	Peer {
		peer: WgPublicKey,
		#[source]
		source: NetOsError,
	},

	#[error("route {route}: {source}")]
	Route {
		route: Route,
		#[source]
		source: NetOsError,
	},

	#[error("wireguard configuration failed: {0}")]
	Wireguard(#[source] NetOsError),

	#[error("enabling IP forwarding failed: {0}")]
	Forwarding(#[source] NetOsError),

	#[error("default route lookup failed: {0}")]
	DefaultRoute(#[source] NetOsError),

	#[error("security group apply failed: {0}")]
	SecurityGroup(#[source] PolicyError),

	#[error("exit node NAT failed: {0}")]
	ExitNode(#[source] PolicyError),
}

#[derive(Debug, Error)]
pub enum AgentError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error("device key error: {0}")]
	Identity(#[from] KeyFileError),

	#[error("missing prerequisites: {0}")]
	Prerequisites(#[source] NetOsError),

	#[error("control plane error: {0}")]
	ControlPlane(#[from] ControlPlaneError),

	#[error("reconcile error: {0}")]
	Reconcile(#[from] ReconcileError),
}

pub type Result<T> = std::result::Result<T, AgentError>;
