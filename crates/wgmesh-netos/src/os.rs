// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use ipnet::IpNet;
use wgmesh_common::{PeerConfig, Route, WgPublicKey, WireguardInterfaceConfig};

use crate::error::{NetOsError, Result};
use crate::firewall::{ChainSpec, RuleSpec, TableSpec};

/// Desired shape of the local tunnel interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSpec {
	pub name: String,
	pub addresses: Vec<IpNet>,
	pub listen_port: u16,
	pub private_key_file: PathBuf,
}

/// The host's default route, used for exit-node egress and endpoint exemptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
	pub device: String,
	pub gateway: Option<IpAddr>,
}

/// Network primitives the reconciler needs from the host.
///
/// Route and peer mutations are idempotent: adding an existing route or
/// deleting a missing one succeeds. Firewall primitives default to
/// [`NetOsError::Unsupported`]; implementations with a firewall backend
/// override them together with [`NetworkOs::supports_firewall`].
#[async_trait]
pub trait NetworkOs: Send + Sync {
	/// Short platform name used in logs and errors.
	fn name(&self) -> &'static str;

	/// Verifies the binaries this implementation shells out to are present.
	async fn check_prerequisites(&self) -> Result<()>;

	/// Addresses currently assigned to `iface`; empty when it does not exist.
	async fn query_interface_address(&self, iface: &str) -> Result<Vec<IpAddr>>;

	/// Tears down any existing interface of the same name and builds it afresh.
	async fn create_or_replace_interface(&self, spec: &InterfaceSpec) -> Result<()>;

	async fn destroy_interface(&self, iface: &str) -> Result<()>;

	async fn add_route(&self, route: &Route) -> Result<()>;

	async fn delete_route(&self, route: &Route) -> Result<()>;

	async fn route_exists(&self, destination: &IpNet) -> Result<bool>;

	/// Installs the full peer set in one step, removing peers not listed.
	async fn configure_wireguard(&self, config: &WireguardInterfaceConfig) -> Result<()>;

	async fn set_peer(&self, iface: &str, peer: &PeerConfig) -> Result<()>;

	async fn remove_peer(&self, iface: &str, public_key: &WgPublicKey) -> Result<()>;

	async fn default_route(&self) -> Result<DefaultRoute>;

	async fn enable_ip_forwarding(&self) -> Result<()>;

	fn supports_firewall(&self) -> bool {
		false
	}

	async fn add_table(&self, _table: &TableSpec) -> Result<()> {
		Err(NetOsError::unsupported(self.name(), "add_table"))
	}

	/// Deleting a missing table succeeds.
	async fn delete_table(&self, _table: &TableSpec) -> Result<()> {
		Err(NetOsError::unsupported(self.name(), "delete_table"))
	}

	async fn table_exists(&self, _table: &TableSpec) -> Result<bool> {
		Err(NetOsError::unsupported(self.name(), "table_exists"))
	}

	/// Lists tables whose name starts with `prefix`.
	async fn list_tables(&self, _prefix: &str) -> Result<Vec<TableSpec>> {
		Err(NetOsError::unsupported(self.name(), "list_tables"))
	}

	async fn add_chain(&self, _chain: &ChainSpec) -> Result<()> {
		Err(NetOsError::unsupported(self.name(), "add_chain"))
	}

	async fn add_rule(&self, _rule: &RuleSpec) -> Result<()> {
		Err(NetOsError::unsupported(self.name(), "add_rule"))
	}
}
