// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-memory [`NetworkOs`] that records every mutation.
//!
//! Firewall ordering is enforced the way nftables does: a chain needs its
//! table and a rule needs its chain.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use ipnet::IpNet;
use wgmesh_common::{PeerConfig, Route, WgPublicKey, WireguardInterfaceConfig};

use crate::error::{NetOsError, Result};
use crate::firewall::{ChainSpec, RuleSpec, TableSpec};
use crate::os::{DefaultRoute, InterfaceSpec, NetworkOs};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsCall {
	CreateInterface(InterfaceSpec),
	DestroyInterface(String),
	AddRoute(Route),
	DeleteRoute(Route),
	ConfigureWireguard {
		iface: String,
		peers: Vec<WgPublicKey>,
	},
	SetPeer {
		iface: String,
		peer: WgPublicKey,
	},
	RemovePeer {
		iface: String,
		peer: WgPublicKey,
	},
	EnableForwarding,
	AddTable(TableSpec),
	DeleteTable(TableSpec),
	AddChain(ChainSpec),
	AddRule(RuleSpec),
}

#[derive(Default)]
struct TableState {
	chains: Vec<String>,
	rules: Vec<RuleSpec>,
}

#[derive(Default)]
struct State {
	calls: Vec<OsCall>,
	interfaces: HashMap<String, Vec<IpAddr>>,
	routes: HashSet<Route>,
	peers: HashMap<String, BTreeMap<WgPublicKey, PeerConfig>>,
	tables: HashMap<TableSpec, TableState>,
	failures: Vec<String>,
	forwarding: bool,
}

pub struct RecordingOs {
	state: Mutex<State>,
	firewall: bool,
	default_route: Option<DefaultRoute>,
}

impl Default for RecordingOs {
	fn default() -> Self {
		Self::new()
	}
}

impl RecordingOs {
	/// A Linux-like host with a firewall and default route `eth0` via 192.168.1.1.
	pub fn new() -> Self {
		Self {
			state: Mutex::new(State::default()),
			firewall: true,
			default_route: Some(DefaultRoute {
				device: "eth0".to_string(),
				gateway: Some(IpAddr::from([192, 168, 1, 1])),
			}),
		}
	}

	pub fn without_firewall(mut self) -> Self {
		self.firewall = false;
		self
	}

	pub fn without_default_route(mut self) -> Self {
		self.default_route = None;
		self
	}

	pub fn with_interface(self, name: &str, addrs: Vec<IpAddr>) -> Self {
		self.lock().interfaces.insert(name.to_string(), addrs);
		self
	}

	fn lock(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Makes every later call whose debug rendering contains `needle` fail.
	pub fn fail_when(&self, needle: &str) {
		self.lock().failures.push(needle.to_string());
	}

	pub fn clear_failures(&self) {
		self.lock().failures.clear();
	}

	pub fn calls(&self) -> Vec<OsCall> {
		self.lock().calls.clone()
	}

	pub fn clear_calls(&self) {
		self.lock().calls.clear();
	}

	pub fn routes(&self) -> Vec<Route> {
		let mut routes: Vec<Route> = self.lock().routes.iter().cloned().collect();
		routes.sort_by_key(|r| r.to_string());
		routes
	}

	pub fn peers(&self, iface: &str) -> Vec<PeerConfig> {
		self
			.lock()
			.peers
			.get(iface)
			.map(|p| p.values().cloned().collect())
			.unwrap_or_default()
	}

	pub fn tables(&self) -> Vec<TableSpec> {
		let mut tables: Vec<TableSpec> = self.lock().tables.keys().cloned().collect();
		tables.sort_by(|a, b| a.name.cmp(&b.name));
		tables
	}

	pub fn chains(&self, table: &TableSpec) -> Vec<String> {
		self
			.lock()
			.tables
			.get(table)
			.map(|t| t.chains.clone())
			.unwrap_or_default()
	}

	pub fn rules(&self, table: &TableSpec) -> Vec<RuleSpec> {
		self
			.lock()
			.tables
			.get(table)
			.map(|t| t.rules.clone())
			.unwrap_or_default()
	}

	pub fn forwarding_enabled(&self) -> bool {
		self.lock().forwarding
	}

	/// Records `call`, failing first if an injected failure matches it.
	fn record(&self, call: OsCall) -> Result<MutexGuard<'_, State>> {
		let mut state = self.lock();
		let rendered = format!("{call:?}");
		if state.failures.iter().any(|f| rendered.contains(f.as_str())) {
			return Err(NetOsError::CommandFailed {
				program: "mock".to_string(),
				args: vec![rendered],
				stderr: "injected failure".to_string(),
			});
		}
		state.calls.push(call);
		Ok(state)
	}
}

#[async_trait]
impl NetworkOs for RecordingOs {
	fn name(&self) -> &'static str {
		"mock"
	}

	async fn check_prerequisites(&self) -> Result<()> {
		Ok(())
	}

	async fn query_interface_address(&self, iface: &str) -> Result<Vec<IpAddr>> {
		Ok(self.lock().interfaces.get(iface).cloned().unwrap_or_default())
	}

	async fn create_or_replace_interface(&self, spec: &InterfaceSpec) -> Result<()> {
		let mut state = self.record(OsCall::CreateInterface(spec.clone()))?;
		state
			.interfaces
			.insert(spec.name.clone(), spec.addresses.iter().map(IpNet::addr).collect());
		state.peers.remove(&spec.name);
		state.routes.retain(|r| r.device != spec.name);
		Ok(())
	}

	async fn destroy_interface(&self, iface: &str) -> Result<()> {
		let mut state = self.record(OsCall::DestroyInterface(iface.to_string()))?;
		state.interfaces.remove(iface);
		state.peers.remove(iface);
		state.routes.retain(|r| r.device != iface);
		Ok(())
	}

	async fn add_route(&self, route: &Route) -> Result<()> {
		let mut state = self.record(OsCall::AddRoute(route.clone()))?;
		state.routes.insert(route.clone());
		Ok(())
	}

	async fn delete_route(&self, route: &Route) -> Result<()> {
		let mut state = self.record(OsCall::DeleteRoute(route.clone()))?;
		state
			.routes
			.retain(|r| !(r.destination == route.destination && r.device == route.device));
		Ok(())
	}

	async fn route_exists(&self, destination: &IpNet) -> Result<bool> {
		Ok(self.lock().routes.iter().any(|r| r.destination == *destination))
	}

	async fn configure_wireguard(&self, config: &WireguardInterfaceConfig) -> Result<()> {
		let mut state = self.record(OsCall::ConfigureWireguard {
			iface: config.interface.clone(),
			peers: config.peers.iter().map(|p| p.public_key).collect(),
		})?;
		let peers = config
			.peers
			.iter()
			.map(|p| (p.public_key, p.clone()))
			.collect();
		state.peers.insert(config.interface.clone(), peers);
		Ok(())
	}

	async fn set_peer(&self, iface: &str, peer: &PeerConfig) -> Result<()> {
		let mut state = self.record(OsCall::SetPeer {
			iface: iface.to_string(),
			peer: peer.public_key,
		})?;
		state
			.peers
			.entry(iface.to_string())
			.or_default()
			.insert(peer.public_key, peer.clone());
		Ok(())
	}

	async fn remove_peer(&self, iface: &str, public_key: &WgPublicKey) -> Result<()> {
		let mut state = self.record(OsCall::RemovePeer {
			iface: iface.to_string(),
			peer: *public_key,
		})?;
		if let Some(peers) = state.peers.get_mut(iface) {
			peers.remove(public_key);
		}
		Ok(())
	}

	async fn default_route(&self) -> Result<DefaultRoute> {
		self
			.default_route
			.clone()
			.ok_or_else(|| NetOsError::NotFound("default route".to_string()))
	}

	async fn enable_ip_forwarding(&self) -> Result<()> {
		let mut state = self.record(OsCall::EnableForwarding)?;
		state.forwarding = true;
		Ok(())
	}

	fn supports_firewall(&self) -> bool {
		self.firewall
	}

	async fn add_table(&self, table: &TableSpec) -> Result<()> {
		if !self.firewall {
			return Err(NetOsError::unsupported(self.name(), "add_table"));
		}
		let mut state = self.record(OsCall::AddTable(table.clone()))?;
		state.tables.entry(table.clone()).or_default();
		Ok(())
	}

	async fn delete_table(&self, table: &TableSpec) -> Result<()> {
		if !self.firewall {
			return Err(NetOsError::unsupported(self.name(), "delete_table"));
		}
		let mut state = self.record(OsCall::DeleteTable(table.clone()))?;
		state.tables.remove(table);
		Ok(())
	}

	async fn table_exists(&self, table: &TableSpec) -> Result<bool> {
		Ok(self.lock().tables.contains_key(table))
	}

	async fn list_tables(&self, prefix: &str) -> Result<Vec<TableSpec>> {
		Ok(self
			.tables()
			.into_iter()
			.filter(|t| t.name.starts_with(prefix))
			.collect())
	}

	async fn add_chain(&self, chain: &ChainSpec) -> Result<()> {
		let mut state = self.record(OsCall::AddChain(chain.clone()))?;
		let table = state
			.tables
			.get_mut(&chain.table)
			.ok_or_else(|| NetOsError::NotFound(format!("table {}", chain.table)))?;
		if !table.chains.contains(&chain.name) {
			table.chains.push(chain.name.clone());
		}
		Ok(())
	}

	async fn add_rule(&self, rule: &RuleSpec) -> Result<()> {
		let mut state = self.record(OsCall::AddRule(rule.clone()))?;
		let table = state
			.tables
			.get_mut(&rule.table)
			.ok_or_else(|| NetOsError::NotFound(format!("table {}", rule.table)))?;
		if !table.chains.contains(&rule.chain) {
			return Err(NetOsError::NotFound(format!("chain {} in {}", rule.chain, rule.table)));
		}
		table.rules.push(rule.clone());
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::firewall::{ChainType, Hook};
	use wgmesh_common::RouteOrigin;

	#[tokio::test]
	async fn rule_requires_chain() {
		let os = RecordingOs::new();
		let table = TableSpec::inet("t");
		os.add_table(&table).await.unwrap();
		assert!(os.add_rule(&RuleSpec::new(&table, "forward", ["accept"])).await.is_err());

		os.add_chain(&ChainSpec::new(&table, "forward", ChainType::Filter, Hook::Forward, "filter"))
			.await
			.unwrap();
		os.add_rule(&RuleSpec::new(&table, "forward", ["accept"])).await.unwrap();
		assert_eq!(os.rules(&table).len(), 1);
	}

	#[tokio::test]
	async fn injected_failures_are_not_recorded() {
		let os = RecordingOs::new();
		os.fail_when("100.64.0.9");
		let route = Route::via_device("100.64.0.9/32".parse().unwrap(), "wg0", RouteOrigin::Peer);
		assert!(os.add_route(&route).await.is_err());
		assert!(os.calls().is_empty());
		assert!(os.routes().is_empty());
	}

	#[tokio::test]
	async fn interface_rebuild_drops_routes_and_peers() {
		let os = RecordingOs::new();
		let route = Route::via_device("100.64.0.2/32".parse().unwrap(), "wg0", RouteOrigin::Peer);
		os.add_route(&route).await.unwrap();
		os.set_peer("wg0", &PeerConfig::new(WgPublicKey::from_bytes([1; 32]), None, vec![]))
			.await
			.unwrap();

		os.create_or_replace_interface(&InterfaceSpec {
			name: "wg0".to_string(),
			addresses: vec!["100.64.0.1/32".parse().unwrap()],
			listen_port: 51820,
			private_key_file: "/tmp/key".into(),
		})
		.await
		.unwrap();

		assert!(os.routes().is_empty());
		assert!(os.peers("wg0").is_empty());
		assert_eq!(
			os.query_interface_address("wg0").await.unwrap(),
			vec!["100.64.0.1".parse::<IpAddr>().unwrap()]
		);
	}
}
