// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! macOS: wireguard-go userspace tunnels configured with ifconfig and route(8).

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use tracing::{debug, info, instrument};
use wgmesh_common::{PeerConfig, Route, WgPublicKey, WireguardInterfaceConfig};

use crate::command::{argv, CommandRunner, Shell};
use crate::error::{NetOsError, Result};
use crate::os::{DefaultRoute, InterfaceSpec, NetworkOs};
use crate::wg;

const WIREGUARD_SOCKET_DIR: &str = "/var/run/wireguard";

pub struct DarwinOs {
	shell: Shell,
	socket_dir: PathBuf,
}

impl DarwinOs {
	pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
		Self {
			shell: Shell::new(runner),
			socket_dir: PathBuf::from(WIREGUARD_SOCKET_DIR),
		}
	}

	pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.socket_dir = dir.into();
		self
	}

	async fn remove_socket(&self, iface: &str) -> Result<()> {
		let path = self.socket_dir.join(format!("{iface}.sock"));
		match tokio::fs::remove_file(&path).await {
			Ok(()) => {
				debug!(path = %path.display(), "removed wireguard-go socket");
				Ok(())
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}
}

fn inet_flag(v6: bool) -> &'static str {
	if v6 {
		"-inet6"
	} else {
		"-inet"
	}
}

pub(crate) fn route_args(action: &str, route: &Route) -> Vec<String> {
	let mut args = argv([
		"-q",
		"-n",
		action,
		inet_flag(route.is_ipv6()),
	]);
	args.push(route.destination.to_string());
	match route.gateway {
		Some(gateway) => args.push(gateway.to_string()),
		None => args.extend(argv(["-interface", route.device.as_str()])),
	}
	args
}

fn address_args(iface: &str, addr: &IpNet) -> Vec<String> {
	match addr {
		IpNet::V4(net) => argv([
			iface.to_string(),
			"inet".to_string(),
			net.addr().to_string(),
			net.addr().to_string(),
			"alias".to_string(),
		]),
		IpNet::V6(net) => argv([
			iface.to_string(),
			"inet6".to_string(),
			net.to_string(),
			"alias".to_string(),
		]),
	}
}

/// Parses `ifconfig <iface>` output.
pub(crate) fn parse_ifconfig(output: &str) -> Vec<IpAddr> {
	output
		.lines()
		.filter_map(|line| {
			let mut tokens = line.split_whitespace();
			match tokens.next() {
				Some("inet") | Some("inet6") => tokens
					.next()
					.and_then(|t| t.split('%').next())
					.and_then(|t| t.parse().ok()),
				_ => None,
			}
		})
		.collect()
}

/// Parses `route -n get default` output.
pub(crate) fn parse_route_get(output: &str) -> Option<DefaultRoute> {
	let mut device = None;
	let mut gateway = None;
	for line in output.lines() {
		let Some((key, value)) = line.trim().split_once(':') else {
			continue;
		};
		match key.trim() {
			"interface" => device = Some(value.trim().to_string()),
			"gateway" => gateway = value.trim().parse().ok(),
			_ => {}
		}
	}
	Some(DefaultRoute {
		device: device?,
		gateway,
	})
}

/// Whether a `netstat -rn` listing has an entry for `destination`.
///
/// netstat prints host routes without a prefix length, so both forms match.
pub(crate) fn netstat_has_route(output: &str, destination: &IpNet) -> bool {
	let full = destination.to_string();
	let host = destination.addr().to_string();
	let is_host = destination.prefix_len() == destination.max_prefix_len();
	output.lines().any(|line| {
		line
			.split_whitespace()
			.next()
			.is_some_and(|first| first == full || (is_host && first == host))
	})
}

#[async_trait]
impl NetworkOs for DarwinOs {
	fn name(&self) -> &'static str {
		"darwin"
	}

	async fn check_prerequisites(&self) -> Result<()> {
		for binary in ["wireguard-go", "wg", "route", "ifconfig"] {
			self.shell.require("which", &argv([binary])).await.map_err(|_| {
				NetOsError::BinaryMissing(binary.to_string())
			})?;
		}
		Ok(())
	}

	async fn query_interface_address(&self, iface: &str) -> Result<Vec<IpAddr>> {
		let output = self.shell.output("ifconfig", &argv([iface])).await?;
		if !output.success {
			return Ok(Vec::new());
		}
		Ok(parse_ifconfig(&output.stdout))
	}

	#[instrument(skip(self, spec), fields(iface = %spec.name, port = spec.listen_port))]
	async fn create_or_replace_interface(&self, spec: &InterfaceSpec) -> Result<()> {
		self.destroy_interface(&spec.name).await?;
		self
			.shell
			.run("wireguard-go", &argv([spec.name.as_str()]))
			.await?;

		let key_file = spec.private_key_file.to_string_lossy();
		self
			.shell
			.run("wg", &wg::listen_args(&spec.name, spec.listen_port, &key_file))
			.await?;

		for addr in &spec.addresses {
			self.shell.run("ifconfig", &address_args(&spec.name, addr)).await?;
		}
		self
			.shell
			.run("ifconfig", &argv([spec.name.as_str(), "up"]))
			.await?;
		info!("interface ready");
		Ok(())
	}

	/// wireguard-go exits once its control socket is gone.
	async fn destroy_interface(&self, iface: &str) -> Result<()> {
		self.remove_socket(iface).await
	}

	async fn add_route(&self, route: &Route) -> Result<()> {
		self
			.shell
			.run_idempotent("route", &route_args("add", route), &["File exists"])
			.await?;
		Ok(())
	}

	async fn delete_route(&self, route: &Route) -> Result<()> {
		self
			.shell
			.run_idempotent("route", &route_args("delete", route), &["not in table"])
			.await?;
		Ok(())
	}

	async fn route_exists(&self, destination: &IpNet) -> Result<bool> {
		let family = if matches!(destination, IpNet::V6(_)) {
			"inet6"
		} else {
			"inet"
		};
		let output = self.shell.run("netstat", &argv(["-rn", "-f", family])).await?;
		Ok(netstat_has_route(&output, destination))
	}

	async fn configure_wireguard(&self, config: &WireguardInterfaceConfig) -> Result<()> {
		wg::apply_config(&self.shell, config).await
	}

	async fn set_peer(&self, iface: &str, peer: &PeerConfig) -> Result<()> {
		self.shell.run("wg", &wg::set_peer_args(iface, peer)).await?;
		Ok(())
	}

	async fn remove_peer(&self, iface: &str, public_key: &WgPublicKey) -> Result<()> {
		self
			.shell
			.run("wg", &wg::remove_peer_args(iface, public_key))
			.await?;
		Ok(())
	}

	async fn default_route(&self) -> Result<DefaultRoute> {
		let output = self.shell.run("route", &argv(["-n", "get", "default"])).await?;
		parse_route_get(&output).ok_or_else(|| NetOsError::NotFound("default route".to_string()))
	}

	async fn enable_ip_forwarding(&self) -> Result<()> {
		self
			.shell
			.run("sysctl", &argv(["-w", "net.inet.ip.forwarding=1"]))
			.await?;
		self
			.shell
			.run_allow_failure("sysctl", &argv(["-w", "net.inet6.ip6.forwarding=1"]))
			.await;
		Ok(())
	}
}
