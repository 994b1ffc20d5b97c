// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reachability detection.
//!
//! A node is considered NAT'd when the address a STUN server reports back
//! differs from the node's own local address. Probe failures never surface
//! as errors: an unanswered probe is treated as "behind NAT" so the node
//! falls back to relayed paths.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{info, instrument, warn};

use crate::stun::{discover_endpoint, resolve_stun_servers, DEFAULT_STUN_SERVERS, DEFAULT_STUN_TIMEOUT};

#[derive(Debug, Clone)]
pub struct DetectorConfig {
	pub stun_servers: Vec<String>,
	pub probe_timeout: Duration,
}

impl Default for DetectorConfig {
	fn default() -> Self {
		Self {
			stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
			probe_timeout: DEFAULT_STUN_TIMEOUT,
		}
	}
}

/// Outcome of a reachability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reachability {
	pub is_nated: bool,
	pub public_ip: Option<IpAddr>,
	pub probe_error: Option<String>,
}

impl Reachability {
	pub fn direct(public_ip: IpAddr) -> Self {
		Self {
			is_nated: false,
			public_ip: Some(public_ip),
			probe_error: None,
		}
	}

	/// Whether traffic to a peer at `peer_endpoint` should go through a relay
	/// rather than a direct tunnel.
	///
	/// Only NAT'd nodes ever prefer the relay, and only when the peer's
	/// endpoint family cannot be reached from our public address family.
	pub fn prefers_relay_to(&self, peer_endpoint: Option<IpAddr>) -> bool {
		if !self.is_nated {
			return false;
		}
		match (self.public_ip, peer_endpoint) {
			(Some(ours), Some(theirs)) => ours.is_ipv4() != theirs.is_ipv4(),
			_ => true,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct Detector {
	config: DetectorConfig,
}

impl Detector {
	pub fn new(config: DetectorConfig) -> Self {
		Self { config }
	}

	pub fn config(&self) -> &DetectorConfig {
		&self.config
	}

	/// Compares `local_addr` against the address the STUN servers observe.
	#[instrument(skip(self), fields(%local_addr))]
	pub async fn detect_nat(&self, local_addr: IpAddr) -> Reachability {
		match self.probe(local_addr).await {
			Ok(public) => {
				let public_ip = public.ip();
				let is_nated = public_ip != local_addr;
				info!(%public_ip, is_nated, "reachability probe complete");
				Reachability {
					is_nated,
					public_ip: Some(public_ip),
					probe_error: None,
				}
			}
			Err(err) => {
				warn!(error = %err, "reachability probe failed, assuming NAT");
				Reachability {
					is_nated: true,
					public_ip: None,
					probe_error: Some(err),
				}
			}
		}
	}

	async fn probe(&self, local_addr: IpAddr) -> Result<SocketAddr, String> {
		let want_v6 = local_addr.is_ipv6();
		let servers = resolve_stun_servers(&self.config.stun_servers, want_v6).await;
		if servers.is_empty() {
			return Err("no STUN servers resolved for address family".to_string());
		}

		let bind: SocketAddr = if want_v6 {
			(std::net::Ipv6Addr::UNSPECIFIED, 0).into()
		} else {
			(std::net::Ipv4Addr::UNSPECIFIED, 0).into()
		};
		let socket = UdpSocket::bind(bind).await.map_err(|e| e.to_string())?;

		discover_endpoint(&socket, &servers, self.config.probe_timeout)
			.await
			.map_err(|e| e.to_string())
	}
}

/// Returns the local address the OS would use to reach `target`.
///
/// No packet is sent; connecting a UDP socket only selects a source address.
pub async fn discover_local_address(target: SocketAddr) -> std::io::Result<IpAddr> {
	let bind: SocketAddr = if target.is_ipv6() {
		(std::net::Ipv6Addr::UNSPECIFIED, 0).into()
	} else {
		(std::net::Ipv4Addr::UNSPECIFIED, 0).into()
	};
	let socket = UdpSocket::bind(bind).await?;
	socket.connect(target).await?;
	Ok(socket.local_addr()?.ip())
}
