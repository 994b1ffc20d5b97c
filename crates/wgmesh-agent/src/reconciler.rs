// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Tunnel and route reconciliation.
//!
//! Each pass takes the latest peer list from the control plane and drives the
//! local interface, WireGuard peers, routes, exit-node NAT and security group
//! towards it. The first pass (and any pass after the interface had to be
//! rebuilt) installs the whole WireGuard configuration at once; later passes
//! only touch peers whose configuration changed.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use wgmesh_common::{
	is_default_route, ExitNodeOrigin, Organization, PeerConfig, PeerRecord, Route, RouteOrigin,
	SecurityGroup, WgPublicKey, WireguardInterfaceConfig,
};
use wgmesh_conn::Reachability;
use wgmesh_netos::{InterfaceSpec, NetworkOs};
use wgmesh_policy::{ExitNodeNat, NatOutcome, SecurityGroupTranslator};

use crate::error::ReconcileError;
use crate::origins::ExitNodeOrigins;

/// Keepalive towards relays when this node sits behind NAT.
pub const RELAY_KEEPALIVE_SECS: u16 = 25;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
	pub interface: String,
	pub listen_port: u16,
	pub tunnel_address: IpNet,
	pub tunnel_address_v6: Option<IpNet>,
	pub private_key_file: PathBuf,
	pub self_key: WgPublicKey,
	pub relay_node: bool,
	pub relay_only: bool,
	pub exit_node: bool,
	pub exit_node_client: bool,
	pub exit_node_egress: Option<String>,
	/// Subnets behind this node that peers reach through it.
	pub child_prefixes: Vec<IpNet>,
}

impl ReconcilerConfig {
	pub fn addresses(&self) -> Vec<IpNet> {
		std::iter::once(self.tunnel_address)
			.chain(self.tunnel_address_v6)
			.collect()
	}

	fn interface_spec(&self) -> InterfaceSpec {
		InterfaceSpec {
			name: self.interface.clone(),
			addresses: self.addresses(),
			listen_port: self.listen_port,
			private_key_file: self.private_key_file.clone(),
		}
	}
}

/// Everything one pass reconciles against.
#[derive(Debug, Clone)]
pub struct ReconcileInput {
	pub peers: Vec<PeerRecord>,
	pub security_group: Option<SecurityGroup>,
	pub organization: Organization,
	pub reachability: Reachability,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
	Idle,
	Applying,
	Converged,
	Failed,
}

impl std::fmt::Display for ReconcileState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			ReconcileState::Idle => "idle",
			ReconcileState::Applying => "applying",
			ReconcileState::Converged => "converged",
			ReconcileState::Failed => "failed",
		};
		f.write_str(s)
	}
}

/// Read-only view of the reconciler, published after every state change.
#[derive(Debug, Clone)]
pub struct ReconcileStatus {
	pub state: ReconcileState,
	pub pass: u64,
	pub peers: usize,
	pub routes: usize,
	pub exit_origins: Vec<ExitNodeOrigin>,
	pub last_error: Option<String>,
	pub last_pass_at: Option<DateTime<Utc>>,
	pub security_group_table: Option<String>,
	pub exit_nat: Option<NatOutcome>,
}

impl Default for ReconcileStatus {
	fn default() -> Self {
		Self {
			state: ReconcileState::Idle,
			pass: 0,
			peers: 0,
			routes: 0,
			exit_origins: Vec::new(),
			last_error: None,
			last_pass_at: None,
			security_group_table: None,
			exit_nat: None,
		}
	}
}

/// What a single pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
	pub first_time: bool,
	pub interface_rebuilt: bool,
	pub added: Vec<WgPublicKey>,
	pub updated: Vec<WgPublicKey>,
	pub removed: Vec<WgPublicKey>,
	pub routes_added: usize,
	pub routes_removed: usize,
	pub security_group_applied: bool,
	pub forwarding_enabled: bool,
	pub nat: Option<NatOutcome>,
}

impl ReconcileReport {
	pub fn peers_changed(&self) -> bool {
		!self.added.is_empty() || !self.updated.is_empty() || !self.removed.is_empty()
	}
}

/// A peer as it should be installed, with the routes that point at it.
#[derive(Debug, Clone)]
struct DesiredPeer {
	config: PeerConfig,
	routes: Vec<Route>,
}

/// Inputs to path selection shared by every peer of a pass.
struct PathContext<'a> {
	reachability: &'a Reachability,
	relay_available: bool,
	hub_zone: bool,
	/// The exit node origin whose default route is installed.
	exit_origin: Option<WgPublicKey>,
}

/// Keeps the first error of a pass while letting the pass continue.
#[derive(Default)]
struct FirstError(Option<ReconcileError>);

impl FirstError {
	fn record(&mut self, err: ReconcileError) {
		warn!(error = %err, "reconcile step failed");
		if self.0.is_none() {
			self.0 = Some(err);
		}
	}
}

pub struct Reconciler {
	os: Arc<dyn NetworkOs>,
	config: ReconcilerConfig,
	peers: HashMap<WgPublicKey, PeerConfig>,
	routes: HashMap<WgPublicKey, Vec<Route>>,
	exit_routes: Vec<Route>,
	origins: ExitNodeOrigins,
	translator: SecurityGroupTranslator,
	nat: ExitNodeNat,
	nat_outcome: Option<NatOutcome>,
	forwarding: bool,
	applied_group: Option<SecurityGroup>,
	security_group_dirty: bool,
	first_pass_pending: bool,
	pass: u64,
	status_tx: watch::Sender<ReconcileStatus>,
}

impl std::fmt::Debug for Reconciler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Reconciler")
			.field("os", &self.os.name())
			.field("interface", &self.config.interface)
			.field("peers", &self.peers.len())
			.field("pass", &self.pass)
			.finish_non_exhaustive()
	}
}

impl Reconciler {
	pub fn new(os: Arc<dyn NetworkOs>, config: ReconcilerConfig) -> Self {
		let translator = SecurityGroupTranslator::new(Arc::clone(&os), config.interface.clone());
		let nat = ExitNodeNat::new(Arc::clone(&os), config.interface.clone());
		let (status_tx, _) = watch::channel(ReconcileStatus::default());

		Self {
			os,
			config,
			peers: HashMap::new(),
			routes: HashMap::new(),
			exit_routes: Vec::new(),
			origins: ExitNodeOrigins::new(),
			translator,
			nat,
			nat_outcome: None,
			forwarding: false,
			applied_group: None,
			security_group_dirty: true,
			first_pass_pending: true,
			pass: 0,
			status_tx,
		}
	}

	pub fn config(&self) -> &ReconcilerConfig {
		&self.config
	}

	pub fn subscribe(&self) -> watch::Receiver<ReconcileStatus> {
		self.status_tx.subscribe()
	}

	pub fn status(&self) -> ReconcileStatus {
		self.status_tx.borrow().clone()
	}

	pub fn peer(&self, key: &WgPublicKey) -> Option<&PeerConfig> {
		self.peers.get(key)
	}

	pub fn installed_routes(&self) -> Vec<Route> {
		self
			.routes
			.values()
			.flatten()
			.chain(self.exit_routes.iter())
			.cloned()
			.collect()
	}

	pub fn exit_origins(&self) -> &ExitNodeOrigins {
		&self.origins
	}

	/// Runs one pass. Per-peer failures do not stop the pass; the first one is
	/// returned once everything else has been attempted.
	#[instrument(skip(self, input), fields(iface = %self.config.interface, pass = self.pass + 1, peers = input.peers.len()))]
	pub async fn reconcile(
		&mut self,
		input: ReconcileInput,
	) -> Result<ReconcileReport, ReconcileError> {
		self.publish(ReconcileState::Applying, None);
		let mut report = ReconcileReport::default();
		let mut errors = FirstError::default();

		match self.ensure_interface().await {
			Ok(rebuilt) => report.interface_rebuilt = rebuilt,
			Err(e) => return Err(self.finish_failed(e)),
		}

		self.track_origins(&input.peers);
		let desired = self.desired_peers(&input);

		if self.first_pass_pending {
			report.first_time = true;
			self.apply_full(&desired, &mut report, &mut errors).await;
		} else {
			self.apply_delta(&desired, &mut report, &mut errors).await;
		}

		self.reconcile_exit_routes(&mut report, &mut errors).await;

		if !self.config.child_prefixes.is_empty() && !self.forwarding {
			match self.os.enable_ip_forwarding().await {
				Ok(()) => {
					info!(prefixes = ?self.config.child_prefixes, "forwarding enabled for child prefixes");
					self.forwarding = true;
					report.forwarding_enabled = true;
				}
				Err(e) => errors.record(ReconcileError::Forwarding(e)),
			}
		}

		if self.config.exit_node && self.nat_outcome.is_none() {
			match self.nat.enable(self.config.exit_node_egress.as_deref()).await {
				Ok(outcome) => {
					report.nat = Some(outcome.clone());
					self.nat_outcome = Some(outcome);
				}
				Err(e) => errors.record(ReconcileError::ExitNode(e)),
			}
		}

		let peers_changed = report.peers_changed() || report.interface_rebuilt;
		self
			.reconcile_security_group(input.security_group, peers_changed, &mut report, &mut errors)
			.await;

		self.pass += 1;
		match errors.0 {
			Some(e) => Err(self.finish_failed(e)),
			None => {
				self.publish(ReconcileState::Converged, None);
				info!(
					added = report.added.len(),
					updated = report.updated.len(),
					removed = report.removed.len(),
					routes_added = report.routes_added,
					routes_removed = report.routes_removed,
					"reconcile pass converged"
				);
				Ok(report)
			}
		}
	}

	fn finish_failed(&mut self, err: ReconcileError) -> ReconcileError {
		self.publish(ReconcileState::Failed, Some(err.to_string()));
		err
	}

	/// Rebuilds the interface when it is missing or carries the wrong
	/// address. A rebuild drops every cached peer and route.
	async fn ensure_interface(&mut self) -> Result<bool, ReconcileError> {
		let live = self
			.os
			.query_interface_address(&self.config.interface)
			.await
			.map_err(ReconcileError::Interface)?;

		let expected: Vec<IpAddr> = self.config.addresses().iter().map(IpNet::addr).collect();
		if expected.iter().all(|addr| live.contains(addr)) {
			return Ok(false);
		}

		info!(?live, ?expected, "tunnel interface missing or misaddressed, rebuilding");
		self
			.os
			.create_or_replace_interface(&self.config.interface_spec())
			.await
			.map_err(ReconcileError::Interface)?;

		self.peers.clear();
		self.routes.clear();
		self.exit_routes.clear();
		self.nat_outcome = None;
		self.security_group_dirty = true;
		self.first_pass_pending = true;
		Ok(true)
	}

	/// Builds the peer set to install, in control-plane order. The local key
	/// and peers with no usable path are left out.
	fn desired_peers(&self, input: &ReconcileInput) -> Vec<DesiredPeer> {
		let paths = PathContext {
			reachability: &input.reachability,
			relay_available: input
				.peers
				.iter()
				.any(|p| p.relay && p.public_key != self.config.self_key),
			hub_zone: input.organization.hub_zone,
			exit_origin: self
				.config
				.exit_node_client
				.then(|| self.origins.first().map(|o| o.public_key))
				.flatten(),
		};

		let mut seen = HashSet::new();
		let mut direct = Vec::new();
		let mut deferred_to_relay = false;
		for record in &input.peers {
			if record.public_key == self.config.self_key {
				continue;
			}
			if !seen.insert(record.public_key) {
				debug!(peer = %record.public_key, "duplicate peer record ignored");
				continue;
			}
			match self.relay_reason(record, &paths) {
				Some(reason) => {
					debug!(peer = %record.public_key, reason, "peer reached through the relay");
					deferred_to_relay = true;
				}
				None => direct.push(record),
			}
		}

		// Relays carry the whole organization when traffic is meant to flow
		// through them.
		let relay_prefixes = if paths.hub_zone || self.config.relay_only || deferred_to_relay {
			input.organization.prefixes()
		} else {
			Vec::new()
		};

		direct
			.into_iter()
			.map(|record| self.build_peer(record, &relay_prefixes, &paths))
			.collect()
	}

	/// Why `record` is not tunnelled to directly, if it is not.
	fn relay_reason(&self, record: &PeerRecord, paths: &PathContext<'_>) -> Option<&'static str> {
		if record.relay || self.config.relay_node {
			return None;
		}
		if self.config.relay_only {
			return Some("relay-only node");
		}
		if paths.hub_zone && paths.relay_available {
			return Some("hub zone organization");
		}
		if record.endpoint().is_none() {
			return Some("no endpoint");
		}
		match record.endpoint_ip() {
			Some(ip) if paths.relay_available && paths.reachability.prefers_relay_to(Some(ip)) => {
				Some("endpoint family unreachable from behind NAT")
			}
			_ => None,
		}
	}

	fn build_peer(&self, record: &PeerRecord, relay_prefixes: &[IpNet], paths: &PathContext<'_>) -> DesiredPeer {
		let key = record.public_key;
		// Only one peer may own the default route in WireGuard.
		let carries_default = paths.exit_origin == Some(key);

		let mut allowed_ips = Vec::new();
		let mut routes = Vec::new();
		for net in &record.allowed_ips {
			let net = net.trunc();
			if is_default_route(&net) {
				if carries_default && !allowed_ips.contains(&net) {
					allowed_ips.push(net);
				}
				continue;
			}
			if allowed_ips.contains(&net) {
				continue;
			}
			allowed_ips.push(net);
			let origin = if net.prefix_len() == net.max_prefix_len() {
				RouteOrigin::Peer
			} else {
				RouteOrigin::ChildPrefix
			};
			routes.push(Route::via_device(net, self.config.interface.clone(), origin));
		}

		if record.relay {
			for prefix in relay_prefixes {
				if allowed_ips.contains(prefix) {
					continue;
				}
				allowed_ips.push(*prefix);
				routes.push(Route::via_device(
					*prefix,
					self.config.interface.clone(),
					RouteOrigin::Relay,
				));
			}
		}

		let keepalive = if record.relay && paths.reachability.is_nated {
			RELAY_KEEPALIVE_SECS
		} else {
			0
		};

		let mut config = PeerConfig::new(key, record.endpoint(), allowed_ips);
		config.relay = record.relay;
		config.persistent_keepalive = Some(keepalive);

		DesiredPeer { config, routes }
	}

	/// Tracks peers advertising a default route as exit-node origins and
	/// forgets origins that left the peer list.
	fn track_origins(&mut self, records: &[PeerRecord]) {
		let mut present = HashSet::new();
		for record in records {
			if record.public_key == self.config.self_key {
				continue;
			}
			present.insert(record.public_key);
			if record.advertises_default_route() {
				self.origins.upsert(ExitNodeOrigin {
					public_key: record.public_key,
					endpoint: record.endpoint().map(str::to_string),
				});
			}
		}
		self.origins.retain_keys(&present);
	}

	/// Installs the complete WireGuard configuration, then every route.
	async fn apply_full(
		&mut self,
		desired: &[DesiredPeer],
		report: &mut ReconcileReport,
		errors: &mut FirstError,
	) {
		let wg = WireguardInterfaceConfig {
			interface: self.config.interface.clone(),
			private_key_file: self.config.private_key_file.clone(),
			listen_port: self.config.listen_port,
			addresses: self.config.addresses(),
			peers: desired.iter().map(|d| d.config.clone()).collect(),
		};

		if let Err(e) = self.os.configure_wireguard(&wg).await {
			errors.record(ReconcileError::Wireguard(e));
			return;
		}
		self.first_pass_pending = false;

		// Keys cached by an earlier pass but gone now were dropped from WireGuard
		// by the full configuration; only their routes remain.
		let desired_keys: HashSet<WgPublicKey> = desired.iter().map(|d| d.config.public_key).collect();
		self.peers.retain(|key, _| desired_keys.contains(key));
		let departed: Vec<WgPublicKey> = self
			.routes
			.keys()
			.filter(|key| !desired_keys.contains(*key))
			.copied()
			.collect();
		for key in departed {
			if self.delete_peer_routes(&key, report, errors).await {
				self.routes.remove(&key);
			}
		}

		for peer in desired {
			let key = peer.config.public_key;
			let ok = self.sync_routes(&key, &peer.routes, report, errors).await;
			report.added.push(key);
			if ok {
				self.peers.insert(key, peer.config.clone());
			}
		}
		info!(peers = desired.len(), "installed full wireguard configuration");
	}

	/// Touches only peers that are new, changed or gone.
	async fn apply_delta(
		&mut self,
		desired: &[DesiredPeer],
		report: &mut ReconcileReport,
		errors: &mut FirstError,
	) {
		for peer in desired {
			let key = peer.config.public_key;
			let previous = self.peers.get(&key);
			if previous == Some(&peer.config) {
				continue;
			}
			let is_update = previous.is_some();
			let endpoint_cleared =
				previous.is_some_and(|p| p.endpoint.is_some()) && peer.config.endpoint.is_none();

			// `wg set` has no way to unset an endpoint, so the peer is recreated.
			if endpoint_cleared {
				if let Err(source) = self.os.remove_peer(&self.config.interface, &key).await {
					errors.record(ReconcileError::Peer { peer: key, source });
					continue;
				}
			}

			if let Err(source) = self.os.set_peer(&self.config.interface, &peer.config).await {
				errors.record(ReconcileError::Peer { peer: key, source });
				self.peers.remove(&key);
				continue;
			}

			let ok = self.sync_routes(&key, &peer.routes, report, errors).await;
			if is_update {
				info!(peer = %key, "peer updated");
				report.updated.push(key);
			} else {
				info!(peer = %key, "peer added");
				report.added.push(key);
			}
			if ok {
				self.peers.insert(key, peer.config.clone());
			} else {
				self.peers.remove(&key);
			}
		}

		let desired_keys: HashSet<WgPublicKey> = desired.iter().map(|d| d.config.public_key).collect();
		let departed: Vec<WgPublicKey> = self
			.peers
			.keys()
			.chain(self.routes.keys())
			.filter(|key| !desired_keys.contains(*key))
			.copied()
			.collect::<HashSet<_>>()
			.into_iter()
			.collect();

		for key in departed {
			if let Err(source) = self.os.remove_peer(&self.config.interface, &key).await {
				errors.record(ReconcileError::Peer { peer: key, source });
				continue;
			}
			self.peers.remove(&key);
			if self.delete_peer_routes(&key, report, errors).await {
				self.routes.remove(&key);
			}
			info!(peer = %key, "peer removed");
			report.removed.push(key);
		}
	}

	/// Moves the installed routes of `key` to `wanted`: stale routes are
	/// deleted first, then missing ones added. Returns true when every step
	/// succeeded.
	async fn sync_routes(
		&mut self,
		key: &WgPublicKey,
		wanted: &[Route],
		report: &mut ReconcileReport,
		errors: &mut FirstError,
	) -> bool {
		let mut installed = self.routes.remove(key).unwrap_or_default();
		let mut ok = true;

		let stale: Vec<Route> = installed
			.iter()
			.filter(|r| !wanted.contains(r))
			.cloned()
			.collect();
		for route in stale {
			if self.route_shared(key, &route) {
				installed.retain(|r| r != &route);
				continue;
			}
			match self.os.delete_route(&route).await {
				Ok(()) => {
					debug!(peer = %key, %route, "route deleted");
					installed.retain(|r| r != &route);
					report.routes_removed += 1;
				}
				Err(source) => {
					errors.record(ReconcileError::Route { route, source });
					ok = false;
				}
			}
		}

		for route in wanted {
			if installed.contains(route) {
				continue;
			}
			match self.os.add_route(route).await {
				Ok(()) => {
					debug!(peer = %key, %route, "route added");
					installed.push(route.clone());
					report.routes_added += 1;
				}
				Err(source) => {
					errors.record(ReconcileError::Route {
						route: route.clone(),
						source,
					});
					ok = false;
				}
			}
		}

		if !installed.is_empty() {
			self.routes.insert(*key, installed);
		}
		ok
	}

	/// Deletes every route installed for `key`. Returns true when none remain.
	async fn delete_peer_routes(
		&mut self,
		key: &WgPublicKey,
		report: &mut ReconcileReport,
		errors: &mut FirstError,
	) -> bool {
		let installed = self.routes.get(key).cloned().unwrap_or_default();
		let mut remaining = Vec::new();
		for route in installed {
			if self.route_shared(key, &route) {
				continue;
			}
			match self.os.delete_route(&route).await {
				Ok(()) => {
					debug!(peer = %key, %route, "route deleted");
					report.routes_removed += 1;
				}
				Err(source) => {
					errors.record(ReconcileError::Route {
						route: route.clone(),
						source,
					});
					remaining.push(route);
				}
			}
		}

		if remaining.is_empty() {
			true
		} else {
			self.routes.insert(*key, remaining);
			false
		}
	}

	/// Another peer also routes `route.destination` over the same device, so
	/// the kernel route must stay.
	fn route_shared(&self, key: &WgPublicKey, route: &Route) -> bool {
		self.routes.iter().any(|(other, routes)| {
			other != key
				&& routes
					.iter()
					.any(|r| r.destination == route.destination && r.device == route.device)
		})
	}

	/// Exit-node clients send everything through the first origin: two /1
	/// routes via the tunnel and a host route for the origin's endpoint via
	/// the physical gateway.
	async fn reconcile_exit_routes(&mut self, report: &mut ReconcileReport, errors: &mut FirstError) {
		let wanted = if self.config.exit_node_client {
			match self.desired_exit_routes().await {
				Ok(routes) => routes,
				Err(e) => {
					errors.record(e);
					return;
				}
			}
		} else {
			Vec::new()
		};

		let stale: Vec<Route> = self
			.exit_routes
			.iter()
			.filter(|r| !wanted.contains(r))
			.cloned()
			.collect();
		for route in stale {
			match self.os.delete_route(&route).await {
				Ok(()) => {
					self.exit_routes.retain(|r| r != &route);
					report.routes_removed += 1;
				}
				Err(source) => errors.record(ReconcileError::Route { route, source }),
			}
		}

		for route in wanted {
			if self.exit_routes.contains(&route) {
				continue;
			}
			match self.os.add_route(&route).await {
				Ok(()) => {
					info!(%route, "exit node route added");
					self.exit_routes.push(route);
					report.routes_added += 1;
				}
				Err(source) => errors.record(ReconcileError::Route { route, source }),
			}
		}
	}

	async fn desired_exit_routes(&self) -> Result<Vec<Route>, ReconcileError> {
		let Some(origin) = self.origins.first() else {
			return Ok(Vec::new());
		};
		if !self.peers.contains_key(&origin.public_key) {
			debug!(peer = %origin.public_key, "exit node origin not installed yet");
			return Ok(Vec::new());
		}

		let mut routes: Vec<Route> = [0u8, 128]
			.into_iter()
			.filter_map(|octet| Ipv4Net::new(Ipv4Addr::new(octet, 0, 0, 0), 1).ok())
			.map(|half| {
				Route::via_device(IpNet::V4(half), self.config.interface.clone(), RouteOrigin::ExitNode)
			})
			.collect();

		if let Some(endpoint_ip) = origin.endpoint_ip() {
			let default = self
				.os
				.default_route()
				.await
				.map_err(ReconcileError::DefaultRoute)?;
			let host = IpNet::from(endpoint_ip);
			let route = match default.gateway {
				Some(gw) => Route::via_gateway(host, gw, default.device, RouteOrigin::ExitNode),
				None => Route::via_device(host, default.device, RouteOrigin::ExitNode),
			};
			routes.push(route);
		}
		Ok(routes)
	}

	async fn reconcile_security_group(
		&mut self,
		group: Option<SecurityGroup>,
		peers_changed: bool,
		report: &mut ReconcileReport,
		errors: &mut FirstError,
	) {
		match group.filter(SecurityGroup::is_assigned) {
			Some(group) => {
				if !self.os.supports_firewall() {
					debug!(os = self.os.name(), "no firewall backend, security group not enforced");
					return;
				}
				let changed = self.applied_group.as_ref() != Some(&group);
				if !(changed || peers_changed || self.security_group_dirty) {
					return;
				}
				match self.translator.apply(&group).await {
					Ok(()) => {
						self.applied_group = Some(group);
						self.security_group_dirty = false;
						report.security_group_applied = true;
					}
					Err(e) => {
						self.security_group_dirty = true;
						errors.record(ReconcileError::SecurityGroup(e));
					}
				}
			}
			None => {
				if self.applied_group.is_none() {
					return;
				}
				match self.translator.clear().await {
					Ok(()) => self.applied_group = None,
					Err(e) => errors.record(ReconcileError::SecurityGroup(e)),
				}
			}
		}
	}

	/// Removes everything this reconciler installed: firewall tables, routes,
	/// peers and the interface itself. Every step is attempted.
	#[instrument(skip(self), fields(iface = %self.config.interface))]
	pub async fn teardown(&mut self) -> Result<(), ReconcileError> {
		let mut errors = FirstError::default();

		if let Err(e) = self.translator.clear().await {
			errors.record(ReconcileError::SecurityGroup(e));
		}
		self.applied_group = None;

		if self.nat_outcome.take().is_some() {
			if let Err(e) = self.nat.disable().await {
				errors.record(ReconcileError::ExitNode(e));
			}
		}

		let routes = self.installed_routes();
		for route in routes {
			if let Err(source) = self.os.delete_route(&route).await {
				errors.record(ReconcileError::Route { route, source });
			}
		}
		self.routes.clear();
		self.exit_routes.clear();
		self.peers.clear();
		self.origins.clear();

		if let Err(e) = self.os.destroy_interface(&self.config.interface).await {
			errors.record(ReconcileError::Interface(e));
		}
		self.first_pass_pending = true;
		self.security_group_dirty = true;
		self.forwarding = false;

		match errors.0 {
			Some(e) => Err(self.finish_failed(e)),
			None => {
				info!("reconciler state torn down");
				self.publish(ReconcileState::Idle, None);
				Ok(())
			}
		}
	}

	fn publish(&self, state: ReconcileState, last_error: Option<String>) {
		let status = ReconcileStatus {
			state,
			pass: self.pass,
			peers: self.peers.len(),
			routes: self.routes.values().map(Vec::len).sum::<usize>() + self.exit_routes.len(),
			exit_origins: self.origins.snapshot(),
			last_error,
			last_pass_at: match state {
				ReconcileState::Converged | ReconcileState::Failed => Some(Utc::now()),
				_ => self.status_tx.borrow().last_pass_at,
			},
			security_group_table: self.translator.active_table().map(|t| t.name.clone()),
			exit_nat: self.nat_outcome.clone(),
		};
		self.status_tx.send_replace(status);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use wgmesh_common::SecurityRule;
	use wgmesh_netos::{OsCall, RecordingOs};
	use wgmesh_policy::EXIT_NODE_TABLE;

	const IFACE: &str = "wg0";

	fn key(b: u8) -> WgPublicKey {
		WgPublicKey::from_bytes([b; 32])
	}

	fn net(s: &str) -> IpNet {
		s.parse().unwrap()
	}

	fn record(b: u8, endpoint: Option<&str>, ips: &[&str]) -> PeerRecord {
		PeerRecord::new(key(b), endpoint, ips.iter().map(|s| net(s)).collect())
	}

	fn relay(b: u8, endpoint: &str, ips: &[&str]) -> PeerRecord {
		let mut r = record(b, Some(endpoint), ips);
		r.relay = true;
		r
	}

	fn config() -> ReconcilerConfig {
		ReconcilerConfig {
			interface: IFACE.to_string(),
			listen_port: 51820,
			tunnel_address: net("100.64.0.1/32"),
			tunnel_address_v6: None,
			private_key_file: PathBuf::from("/var/lib/wgmesh/private.key"),
			self_key: key(0xEE),
			relay_node: false,
			relay_only: false,
			exit_node: false,
			exit_node_client: false,
			exit_node_egress: None,
			child_prefixes: Vec::new(),
		}
	}

	fn organization() -> Organization {
		Organization {
			id: "org-1".to_string(),
			cidr: Some("100.64.0.0/10".parse().unwrap()),
			..Default::default()
		}
	}

	fn input(peers: Vec<PeerRecord>) -> ReconcileInput {
		ReconcileInput {
			peers,
			security_group: None,
			organization: organization(),
			reachability: Reachability::direct("203.0.113.10".parse().unwrap()),
		}
	}

	fn setup(config: ReconcilerConfig) -> (Arc<RecordingOs>, Reconciler) {
		let os = Arc::new(RecordingOs::new());
		let reconciler = Reconciler::new(os.clone(), config);
		(os, reconciler)
	}

	#[tokio::test]
	async fn first_pass_builds_interface_and_installs_everything() {
		let (os, mut reconciler) = setup(config());

		let report = reconciler
			.reconcile(input(vec![record(1, Some("10.0.0.2:51820"), &["100.64.0.2/32", "10.20.0.0/24"])]))
			.await
			.unwrap();

		assert!(report.first_time);
		assert!(report.interface_rebuilt);
		assert_eq!(report.added, vec![key(1)]);
		assert_eq!(report.routes_added, 2);

		let calls = os.calls();
		assert!(matches!(calls[0], OsCall::CreateInterface(_)));
		assert!(matches!(&calls[1], OsCall::ConfigureWireguard { peers, .. } if peers == &vec![key(1)]));

		let routes = os.routes();
		assert_eq!(routes.len(), 2);
		let child = routes.iter().find(|r| r.destination == net("10.20.0.0/24")).unwrap();
		assert_eq!(child.origin, RouteOrigin::ChildPrefix);

		let status = reconciler.status();
		assert_eq!(status.state, ReconcileState::Converged);
		assert_eq!(status.pass, 1);
		assert_eq!(status.peers, 1);
	}

	#[tokio::test]
	async fn existing_interface_is_kept() {
		let os = Arc::new(RecordingOs::new().with_interface(IFACE, vec!["100.64.0.1".parse().unwrap()]));
		let mut reconciler = Reconciler::new(os.clone(), config());

		let report = reconciler.reconcile(input(vec![])).await.unwrap();
		assert!(report.first_time);
		assert!(!report.interface_rebuilt);
		assert!(!os.calls().iter().any(|c| matches!(c, OsCall::CreateInterface(_))));
	}

	#[tokio::test]
	async fn peers_without_endpoint_are_skipped_unless_relay_node() {
		let peers = vec![record(1, None, &["100.64.0.2/32"])];

		let (os, mut reconciler) = setup(config());
		reconciler.reconcile(input(peers.clone())).await.unwrap();
		assert!(os.peers(IFACE).is_empty());

		let mut relay_config = config();
		relay_config.relay_node = true;
		let (os, mut reconciler) = setup(relay_config);
		reconciler.reconcile(input(peers)).await.unwrap();
		assert_eq!(os.peers(IFACE).len(), 1);
	}

	#[tokio::test]
	async fn relay_only_installs_relays_with_org_prefix() {
		let mut cfg = config();
		cfg.relay_only = true;
		let (os, mut reconciler) = setup(cfg);

		reconciler
			.reconcile(input(vec![
				record(1, Some("10.0.0.2:51820"), &["100.64.0.2/32"]),
				relay(2, "198.51.100.1:51820", &["100.64.0.3/32"]),
			]))
			.await
			.unwrap();

		let peers = os.peers(IFACE);
		assert_eq!(peers.len(), 1);
		assert_eq!(peers[0].public_key, key(2));
		assert!(peers[0].allowed_ips.contains(&net("100.64.0.0/10")));

		let relay_route = os
			.routes()
			.into_iter()
			.find(|r| r.destination == net("100.64.0.0/10"))
			.unwrap();
		assert_eq!(relay_route.origin, RouteOrigin::Relay);
	}

	#[tokio::test]
	async fn natted_node_keeps_relay_alive_and_skips_other_family() {
		let (os, mut reconciler) = setup(config());
		let mut inp = input(vec![
			relay(1, "198.51.100.1:51820", &["100.64.0.3/32"]),
			record(2, Some("[2001:db8::2]:51820"), &["100.64.0.4/32"]),
			record(3, Some("192.0.2.7:51820"), &["100.64.0.5/32"]),
		]);
		inp.reachability = Reachability {
			is_nated: true,
			public_ip: Some("203.0.113.10".parse().unwrap()),
			probe_error: None,
		};

		reconciler.reconcile(inp).await.unwrap();

		let peers = os.peers(IFACE);
		let keys: Vec<_> = peers.iter().map(|p| p.public_key).collect();
		assert!(keys.contains(&key(1)));
		assert!(!keys.contains(&key(2)));
		assert!(keys.contains(&key(3)));

		let relay_peer = peers.iter().find(|p| p.public_key == key(1)).unwrap();
		assert_eq!(relay_peer.persistent_keepalive, Some(RELAY_KEEPALIVE_SECS));
		let direct_peer = peers.iter().find(|p| p.public_key == key(3)).unwrap();
		assert_eq!(direct_peer.persistent_keepalive, Some(0));
	}

	#[tokio::test]
	async fn changed_endpoint_updates_only_that_peer() {
		let (os, mut reconciler) = setup(config());
		reconciler
			.reconcile(input(vec![
				record(1, Some("10.0.0.2:51820"), &["100.64.0.2/32"]),
				record(2, Some("10.0.0.3:51820"), &["100.64.0.3/32"]),
			]))
			.await
			.unwrap();
		os.clear_calls();

		let report = reconciler
			.reconcile(input(vec![
				record(1, Some("10.0.0.9:51820"), &["100.64.0.2/32"]),
				record(2, Some("10.0.0.3:51820"), &["100.64.0.3/32"]),
			]))
			.await
			.unwrap();

		assert_eq!(report.updated, vec![key(1)]);
		assert_eq!(report.routes_added, 0);
		assert_eq!(
			os.calls(),
			vec![OsCall::SetPeer {
				iface: IFACE.to_string(),
				peer: key(1)
			}]
		);
	}

	#[tokio::test]
	async fn changed_allowed_ips_moves_routes() {
		let (os, mut reconciler) = setup(config());
		reconciler
			.reconcile(input(vec![record(1, Some("10.0.0.2:51820"), &["100.64.0.2/32", "10.1.0.0/24"])]))
			.await
			.unwrap();

		let report = reconciler
			.reconcile(input(vec![record(1, Some("10.0.0.2:51820"), &["100.64.0.2/32", "10.2.0.0/24"])]))
			.await
			.unwrap();

		assert_eq!(report.routes_removed, 1);
		assert_eq!(report.routes_added, 1);
		let destinations: Vec<_> = os.routes().into_iter().map(|r| r.destination).collect();
		assert!(destinations.contains(&net("10.2.0.0/24")));
		assert!(!destinations.contains(&net("10.1.0.0/24")));
	}

	#[tokio::test]
	async fn failed_peer_is_retried_next_pass() {
		let (os, mut reconciler) = setup(config());
		reconciler.reconcile(input(vec![])).await.unwrap();

		os.fail_when("100.64.0.3/32");
		let result = reconciler
			.reconcile(input(vec![
				record(1, Some("10.0.0.2:51820"), &["100.64.0.2/32"]),
				record(2, Some("10.0.0.3:51820"), &["100.64.0.3/32"]),
			]))
			.await;

		assert!(matches!(result, Err(ReconcileError::Route { .. })));
		assert_eq!(reconciler.status().state, ReconcileState::Failed);
		assert!(reconciler.peer(&key(1)).is_some());
		assert!(reconciler.peer(&key(2)).is_none());

		os.clear_failures();
		os.clear_calls();
		let report = reconciler
			.reconcile(input(vec![
				record(1, Some("10.0.0.2:51820"), &["100.64.0.2/32"]),
				record(2, Some("10.0.0.3:51820"), &["100.64.0.3/32"]),
			]))
			.await
			.unwrap();
		assert_eq!(report.added, vec![key(2)]);
		assert_eq!(os.routes().len(), 2);
	}

	fn hub_input(peers: Vec<PeerRecord>) -> ReconcileInput {
		let mut inp = input(peers);
		inp.organization.hub_zone = true;
		inp
	}

	#[tokio::test]
	async fn shared_relay_prefix_survives_one_relay_leaving() {
		let (os, mut reconciler) = setup(config());
		reconciler
			.reconcile(hub_input(vec![
				relay(1, "198.51.100.1:51820", &["100.64.0.3/32"]),
				relay(2, "198.51.100.2:51820", &["100.64.0.4/32"]),
			]))
			.await
			.unwrap();

		reconciler
			.reconcile(hub_input(vec![relay(2, "198.51.100.2:51820", &["100.64.0.4/32"])]))
			.await
			.unwrap();

		assert!(os.routes().iter().any(|r| r.destination == net("100.64.0.0/10")));
	}

	#[tokio::test]
	async fn exit_node_client_routes_through_first_origin() {
		let mut cfg = config();
		cfg.exit_node_client = true;
		let (os, mut reconciler) = setup(cfg);

		reconciler
			.reconcile(input(vec![record(1, Some("198.51.100.7:51820"), &["100.64.0.2/32", "0.0.0.0/0"])]))
			.await
			.unwrap();

		let peers = os.peers(IFACE);
		assert!(peers[0].allowed_ips.contains(&net("0.0.0.0/0")));

		let routes = os.routes();
		assert!(routes.iter().any(|r| r.destination == net("0.0.0.0/1") && r.device == IFACE));
		assert!(routes.iter().any(|r| r.destination == net("128.0.0.0/1") && r.device == IFACE));
		let exemption = routes
			.iter()
			.find(|r| r.destination == net("198.51.100.7/32"))
			.unwrap();
		assert_eq!(exemption.device, "eth0");
		assert_eq!(exemption.gateway, Some("192.168.1.1".parse().unwrap()));
		assert!(!routes.iter().any(|r| r.destination == net("0.0.0.0/0")));
		assert_eq!(reconciler.status().exit_origins.len(), 1);

		// Origin leaves: split routes go with it.
		reconciler.reconcile(input(vec![])).await.unwrap();
		assert!(os.routes().is_empty());
		assert!(reconciler.exit_origins().is_empty());
	}

	#[tokio::test]
	async fn hub_zone_reaches_members_through_the_relay() {
		let (os, mut reconciler) = setup(config());
		reconciler
			.reconcile(hub_input(vec![
				relay(1, "198.51.100.1:51820", &["100.64.0.3/32"]),
				record(2, Some("10.0.0.2:51820"), &["100.64.0.2/32"]),
			]))
			.await
			.unwrap();

		let peers = os.peers(IFACE);
		assert_eq!(peers.len(), 1);
		assert_eq!(peers[0].public_key, key(1));
		assert!(peers[0].allowed_ips.contains(&net("100.64.0.0/10")));
		assert!(os
			.routes()
			.iter()
			.any(|r| r.destination == net("100.64.0.0/10") && r.origin == RouteOrigin::Relay));
	}

	#[tokio::test]
	async fn hub_zone_relay_node_still_peers_directly() {
		let mut cfg = config();
		cfg.relay_node = true;
		let (os, mut reconciler) = setup(cfg);
		reconciler
			.reconcile(hub_input(vec![
				relay(1, "198.51.100.1:51820", &["100.64.0.3/32"]),
				record(2, Some("10.0.0.2:51820"), &["100.64.0.2/32"]),
			]))
			.await
			.unwrap();

		assert_eq!(os.peers(IFACE).len(), 2);
	}

	#[tokio::test]
	async fn flat_organization_peers_directly_and_relay_keeps_own_prefixes() {
		let (os, mut reconciler) = setup(config());
		reconciler
			.reconcile(input(vec![
				relay(1, "198.51.100.1:51820", &["100.64.0.3/32"]),
				record(2, Some("10.0.0.2:51820"), &["100.64.0.2/32"]),
			]))
			.await
			.unwrap();

		let peers = os.peers(IFACE);
		assert_eq!(peers.len(), 2);
		let relay_peer = peers.iter().find(|p| p.public_key == key(1)).unwrap();
		assert_eq!(relay_peer.allowed_ips, vec![net("100.64.0.3/32")]);
		assert!(!os.routes().iter().any(|r| r.origin == RouteOrigin::Relay));
	}

	#[tokio::test]
	async fn only_the_first_exit_origin_claims_the_default_route() {
		let mut cfg = config();
		cfg.exit_node_client = true;
		let (os, mut reconciler) = setup(cfg);

		reconciler
			.reconcile(input(vec![
				record(1, Some("198.51.100.7:51820"), &["100.64.0.2/32", "0.0.0.0/0"]),
				record(2, Some("198.51.100.8:51820"), &["100.64.0.3/32", "0.0.0.0/0"]),
			]))
			.await
			.unwrap();

		let claimants: Vec<_> = os
			.peers(IFACE)
			.into_iter()
			.filter(|p| p.allowed_ips.contains(&net("0.0.0.0/0")))
			.map(|p| p.public_key)
			.collect();
		assert_eq!(claimants, vec![key(1)]);

		let exempted: Vec<_> = os
			.routes()
			.into_iter()
			.filter(|r| r.gateway.is_some())
			.map(|r| r.destination)
			.collect();
		assert_eq!(exempted, vec![net("198.51.100.7/32")]);
		assert_eq!(reconciler.exit_origins().len(), 2);

		// The first origin leaves; the second takes over the default route.
		reconciler
			.reconcile(input(vec![record(2, Some("198.51.100.8:51820"), &["100.64.0.3/32", "0.0.0.0/0"])]))
			.await
			.unwrap();

		let peers = os.peers(IFACE);
		assert_eq!(peers.len(), 1);
		assert!(peers[0].allowed_ips.contains(&net("0.0.0.0/0")));
		let exempted: Vec<_> = os
			.routes()
			.into_iter()
			.filter(|r| r.gateway.is_some())
			.map(|r| r.destination)
			.collect();
		assert_eq!(exempted, vec![net("198.51.100.8/32")]);
	}

	#[tokio::test]
	async fn child_prefixes_enable_forwarding_once() {
		let mut cfg = config();
		cfg.child_prefixes = vec![net("10.10.0.0/16")];
		let (os, mut reconciler) = setup(cfg);

		let report = reconciler.reconcile(input(vec![])).await.unwrap();
		assert!(report.forwarding_enabled);
		assert!(os.forwarding_enabled());

		os.clear_calls();
		let report = reconciler.reconcile(input(vec![])).await.unwrap();
		assert!(!report.forwarding_enabled);
		assert!(!os.calls().contains(&OsCall::EnableForwarding));
	}

	#[tokio::test]
	async fn no_child_prefixes_leaves_forwarding_alone() {
		let (os, mut reconciler) = setup(config());
		reconciler.reconcile(input(vec![])).await.unwrap();
		assert!(!os.forwarding_enabled());
	}

	#[tokio::test]
	async fn failed_forwarding_is_retried() {
		let mut cfg = config();
		cfg.child_prefixes = vec![net("10.10.0.0/16")];
		let (os, mut reconciler) = setup(cfg);

		os.fail_when("EnableForwarding");
		let result = reconciler.reconcile(input(vec![])).await;
		assert!(matches!(result, Err(ReconcileError::Forwarding(_))));

		os.clear_failures();
		let report = reconciler.reconcile(input(vec![])).await.unwrap();
		assert!(report.forwarding_enabled);
	}

	#[tokio::test]
	async fn cleared_endpoint_recreates_the_peer() {
		let mut cfg = config();
		cfg.relay_node = true;
		let (os, mut reconciler) = setup(cfg);
		reconciler
			.reconcile(input(vec![record(1, Some("10.0.0.2:51820"), &["100.64.0.2/32"])]))
			.await
			.unwrap();
		os.clear_calls();

		let report = reconciler
			.reconcile(input(vec![record(1, None, &["100.64.0.2/32"])]))
			.await
			.unwrap();

		assert_eq!(report.updated, vec![key(1)]);
		assert_eq!(
			os.calls(),
			vec![
				OsCall::RemovePeer {
					iface: IFACE.to_string(),
					peer: key(1)
				},
				OsCall::SetPeer {
					iface: IFACE.to_string(),
					peer: key(1)
				},
			]
		);
		assert_eq!(os.peers(IFACE)[0].endpoint, None);
	}

	#[tokio::test]
	async fn default_route_is_not_routed_without_exit_client() {
		let (os, mut reconciler) = setup(config());
		reconciler
			.reconcile(input(vec![record(1, Some("198.51.100.7:51820"), &["100.64.0.2/32", "0.0.0.0/0"])]))
			.await
			.unwrap();

		assert_eq!(os.routes().len(), 1);
		assert!(!os.peers(IFACE)[0].allowed_ips.contains(&net("0.0.0.0/0")));
		assert_eq!(reconciler.exit_origins().len(), 1);
	}

	#[tokio::test]
	async fn exit_node_nat_is_established_once() {
		let mut cfg = config();
		cfg.exit_node = true;
		let (os, mut reconciler) = setup(cfg);

		let report = reconciler.reconcile(input(vec![])).await.unwrap();
		assert_eq!(
			report.nat,
			Some(NatOutcome::Enabled {
				egress: "eth0".to_string()
			})
		);
		assert!(os.forwarding_enabled());
		assert!(os.tables().iter().any(|t| t.name == EXIT_NODE_TABLE));

		let report = reconciler.reconcile(input(vec![])).await.unwrap();
		assert!(report.nat.is_none());
	}

	#[tokio::test]
	async fn security_group_applied_on_change_only() {
		let (os, mut reconciler) = setup(config());
		let group = SecurityGroup {
			id: "sg-1".to_string(),
			group_name: "default".to_string(),
			inbound_rules: vec![SecurityRule::new("tcp", 22, 22, &["192.168.1.0/24"])],
			outbound_rules: vec![],
		};

		let mut inp = input(vec![]);
		inp.security_group = Some(group.clone());
		let report = reconciler.reconcile(inp.clone()).await.unwrap();
		assert!(report.security_group_applied);
		assert_eq!(reconciler.status().security_group_table.as_deref(), Some("wgmesh-sg-g1"));

		let report = reconciler.reconcile(inp.clone()).await.unwrap();
		assert!(!report.security_group_applied);

		inp.security_group = None;
		reconciler.reconcile(inp).await.unwrap();
		assert!(os.tables().is_empty());
	}

	#[tokio::test]
	async fn bad_security_group_fails_pass_but_converges_peers() {
		let (os, mut reconciler) = setup(config());
		let mut inp = input(vec![record(1, Some("10.0.0.2:51820"), &["100.64.0.2/32"])]);
		inp.security_group = Some(SecurityGroup {
			id: "sg-1".to_string(),
			inbound_rules: vec![SecurityRule::new("tcp", 22, 22, &["not-an-ip"])],
			..Default::default()
		});

		let result = reconciler.reconcile(inp).await;
		assert!(matches!(result, Err(ReconcileError::SecurityGroup(_))));
		assert_eq!(os.peers(IFACE).len(), 1);
		assert!(os.tables().is_empty());
	}

	#[tokio::test]
	async fn interface_failure_aborts_pass() {
		let (os, mut reconciler) = setup(config());
		os.fail_when("CreateInterface");

		let result = reconciler.reconcile(input(vec![])).await;
		assert!(matches!(result, Err(ReconcileError::Interface(_))));
		let status = reconciler.status();
		assert_eq!(status.state, ReconcileState::Failed);
		assert!(status.last_error.is_some());
	}

	#[tokio::test]
	async fn teardown_removes_owned_state() {
		let mut cfg = config();
		cfg.exit_node = true;
		let (os, mut reconciler) = setup(cfg);
		let mut inp = input(vec![record(1, Some("10.0.0.2:51820"), &["100.64.0.2/32"])]);
		inp.security_group = Some(SecurityGroup {
			id: "sg-1".to_string(),
			inbound_rules: vec![SecurityRule::new("udp", 53, 53, &["10.0.0.0/8"])],
			..Default::default()
		});
		reconciler.reconcile(inp).await.unwrap();
		assert_eq!(os.tables().len(), 2);

		reconciler.teardown().await.unwrap();

		assert!(os.tables().is_empty());
		assert!(os.routes().is_empty());
		assert!(os.calls().contains(&OsCall::DestroyInterface(IFACE.to_string())));
		assert_eq!(reconciler.status().state, ReconcileState::Idle);
	}
}
