// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;
use wgmesh_common::{PeerConfig, Route, WgPublicKey, WireguardInterfaceConfig};

use crate::error::{NetOsError, Result};
use crate::os::{DefaultRoute, InterfaceSpec, NetworkOs};

/// Fallback for platforms without an implementation. Queries report nothing,
/// every mutation fails with [`NetOsError::Unsupported`].
pub struct UnsupportedOs {
	os: String,
}

impl UnsupportedOs {
	pub fn new(os: impl Into<String>) -> Self {
		Self { os: os.into() }
	}

	fn unsupported<T>(&self, operation: &'static str) -> Result<T> {
		Err(NetOsError::unsupported(self.os.clone(), operation))
	}
}

#[async_trait]
impl NetworkOs for UnsupportedOs {
	fn name(&self) -> &'static str {
		"unsupported"
	}

	async fn check_prerequisites(&self) -> Result<()> {
		self.unsupported("check_prerequisites")
	}

	async fn query_interface_address(&self, _iface: &str) -> Result<Vec<IpAddr>> {
		Ok(Vec::new())
	}

	async fn create_or_replace_interface(&self, _spec: &InterfaceSpec) -> Result<()> {
		self.unsupported("create_or_replace_interface")
	}

	async fn destroy_interface(&self, _iface: &str) -> Result<()> {
		self.unsupported("destroy_interface")
	}

	async fn add_route(&self, _route: &Route) -> Result<()> {
		self.unsupported("add_route")
	}

	async fn delete_route(&self, _route: &Route) -> Result<()> {
		self.unsupported("delete_route")
	}

	async fn route_exists(&self, _destination: &IpNet) -> Result<bool> {
		Ok(false)
	}

	async fn configure_wireguard(&self, _config: &WireguardInterfaceConfig) -> Result<()> {
		self.unsupported("configure_wireguard")
	}

	async fn set_peer(&self, _iface: &str, _peer: &PeerConfig) -> Result<()> {
		self.unsupported("set_peer")
	}

	async fn remove_peer(&self, _iface: &str, _public_key: &WgPublicKey) -> Result<()> {
		self.unsupported("remove_peer")
	}

	async fn default_route(&self) -> Result<DefaultRoute> {
		self.unsupported("default_route")
	}

	async fn enable_ip_forwarding(&self) -> Result<()> {
		self.unsupported("enable_ip_forwarding")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn mutations_fail_and_queries_are_empty() {
		let os = UnsupportedOs::new("plan9");
		assert!(os.query_interface_address("wg0").await.unwrap().is_empty());
		assert!(!os.route_exists(&"10.0.0.0/8".parse().unwrap()).await.unwrap());

		let err = os.enable_ip_forwarding().await.unwrap_err();
		assert!(err.is_unsupported());
		assert!(err.to_string().contains("plan9"));
		assert!(!os.supports_firewall());
	}
}
