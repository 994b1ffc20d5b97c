// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::WgPublicKey;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// A device as listed by the control plane for the local organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
	pub public_key: WgPublicKey,
	#[serde(default)]
	pub endpoint: Option<String>,
	#[serde(default)]
	pub allowed_ips: Vec<IpNet>,
	#[serde(default)]
	pub relay: bool,
}

impl PeerRecord {
	pub fn new(public_key: WgPublicKey, endpoint: Option<&str>, allowed_ips: Vec<IpNet>) -> Self {
		Self {
			public_key,
			endpoint: endpoint.map(str::to_string),
			allowed_ips,
			relay: false,
		}
	}

	/// Endpoint with the empty string treated as absent.
	pub fn endpoint(&self) -> Option<&str> {
		self
			.endpoint
			.as_deref()
			.map(str::trim)
			.filter(|e| !e.is_empty())
	}

	/// Literal IP of the endpoint, if the endpoint is not a hostname.
	pub fn endpoint_ip(&self) -> Option<IpAddr> {
		self
			.endpoint()
			.and_then(|e| e.parse::<SocketAddr>().ok())
			.map(|addr| addr.ip())
	}

	/// Peer advertises a default route and can act as an exit node.
	pub fn advertises_default_route(&self) -> bool {
		self.allowed_ips.iter().any(crate::ip::is_default_route)
	}
}

/// A WireGuard peer as installed on the local interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
	pub public_key: WgPublicKey,
	pub endpoint: Option<String>,
	pub allowed_ips: Vec<IpNet>,
	pub relay: bool,
	pub persistent_keepalive: Option<u16>,
}

impl PeerConfig {
	pub fn new(public_key: WgPublicKey, endpoint: Option<&str>, allowed_ips: Vec<IpNet>) -> Self {
		Self {
			public_key,
			endpoint: endpoint.map(str::to_string),
			allowed_ips,
			relay: false,
			persistent_keepalive: None,
		}
	}

	pub fn allowed_ips_csv(&self) -> String {
		self
			.allowed_ips
			.iter()
			.map(ToString::to_string)
			.collect::<Vec<_>>()
			.join(",")
	}
}

/// Complete WireGuard state of the local tunnel interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireguardInterfaceConfig {
	pub interface: String,
	pub private_key_file: PathBuf,
	pub listen_port: u16,
	pub addresses: Vec<IpNet>,
	pub peers: Vec<PeerConfig>,
}

/// A peer whose traffic egresses through an exit node, tracked by key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitNodeOrigin {
	pub public_key: WgPublicKey,
	pub endpoint: Option<String>,
}

impl ExitNodeOrigin {
	pub fn endpoint_ip(&self) -> Option<IpAddr> {
		self
			.endpoint
			.as_deref()
			.and_then(|e| e.parse::<SocketAddr>().ok())
			.map(|addr| addr.ip())
	}
}
