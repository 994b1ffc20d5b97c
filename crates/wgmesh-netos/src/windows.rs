// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Windows: the WireGuard tunnel service plus netsh routes.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use tracing::{info, instrument};
use wgmesh_common::{PeerConfig, Route, WgPublicKey, WireguardInterfaceConfig};
use zeroize::Zeroizing;

use crate::command::{argv, CommandRunner, Shell};
use crate::error::{NetOsError, Result};
use crate::os::{DefaultRoute, InterfaceSpec, NetworkOs};
use crate::wg;

const DEFAULT_CONFIG_DIR: &str = r"C:\ProgramData\wgmesh";

pub struct WindowsOs {
	shell: Shell,
	config_dir: PathBuf,
}

impl WindowsOs {
	pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
		Self {
			shell: Shell::new(runner),
			config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
		}
	}

	pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.config_dir = dir.into();
		self
	}

	fn config_path(&self, iface: &str) -> PathBuf {
		self.config_dir.join(format!("{iface}.conf"))
	}
}

/// Renders the tunnel-service configuration. Peers are added afterwards with `wg set`.
pub(crate) fn render_tunnel_config(spec: &InterfaceSpec, private_key: &str) -> Zeroizing<String> {
	let addresses = spec
		.addresses
		.iter()
		.map(ToString::to_string)
		.collect::<Vec<_>>()
		.join(", ");
	Zeroizing::new(format!(
		"[Interface]\nPrivateKey = {}\nListenPort = {}\nAddress = {}\n",
		private_key.trim(),
		spec.listen_port,
		addresses
	))
}

pub(crate) fn route_args(action: &str, route: &Route) -> Vec<String> {
	let family = if route.is_ipv6() { "ipv6" } else { "ipv4" };
	let mut args = argv([
		"interface".to_string(),
		family.to_string(),
		action.to_string(),
		"route".to_string(),
		format!("prefix={}", route.destination),
		format!("interface={}", route.device),
	]);
	if let Some(gateway) = route.gateway {
		args.push(format!("nexthop={gateway}"));
	}
	args.push("store=active".to_string());
	args
}

/// Parses `netsh interface ipv4 show addresses` output.
pub(crate) fn parse_netsh_addresses(output: &str) -> Vec<IpAddr> {
	output
		.lines()
		.filter_map(|line| {
			let (key, value) = line.split_once(':')?;
			if !key.trim().eq_ignore_ascii_case("IP Address") {
				return None;
			}
			value.trim().parse().ok()
		})
		.collect()
}

async fn write_config(path: &Path, contents: &str) -> Result<()> {
	if let Some(parent) = path.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}
	tokio::fs::write(path, contents).await?;
	Ok(())
}

#[async_trait]
impl NetworkOs for WindowsOs {
	fn name(&self) -> &'static str {
		"windows"
	}

	async fn check_prerequisites(&self) -> Result<()> {
		for binary in ["wg", "wireguard", "netsh"] {
			self
				.shell
				.require("where", &argv([binary]))
				.await
				.map_err(|_| NetOsError::BinaryMissing(binary.to_string()))?;
		}
		Ok(())
	}

	async fn query_interface_address(&self, iface: &str) -> Result<Vec<IpAddr>> {
		let mut addrs = Vec::new();
		for family in ["ipv4", "ipv6"] {
			let output = self
				.shell
				.output(
					"netsh",
					&argv(["interface", family, "show", "addresses", iface]),
				)
				.await?;
			if output.success {
				addrs.extend(parse_netsh_addresses(&output.stdout));
			}
		}
		Ok(addrs)
	}

	#[instrument(skip(self, spec), fields(iface = %spec.name, port = spec.listen_port))]
	async fn create_or_replace_interface(&self, spec: &InterfaceSpec) -> Result<()> {
		self.destroy_interface(&spec.name).await?;

		let private_key = Zeroizing::new(tokio::fs::read_to_string(&spec.private_key_file).await?);
		let config = render_tunnel_config(spec, &private_key);
		let path = self.config_path(&spec.name);
		write_config(&path, &config).await?;

		let path_arg = path.to_string_lossy().to_string();
		self
			.shell
			.run("wireguard", &argv(["/installtunnelservice".to_string(), path_arg]))
			.await?;
		info!("tunnel service installed");
		Ok(())
	}

	async fn destroy_interface(&self, iface: &str) -> Result<()> {
		self
			.shell
			.run_allow_failure("wireguard", &argv(["/uninstalltunnelservice", iface]))
			.await;
		match tokio::fs::remove_file(self.config_path(iface)).await {
			Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
			_ => Ok(()),
		}
	}

	async fn add_route(&self, route: &Route) -> Result<()> {
		self
			.shell
			.run_idempotent("netsh", &route_args("add", route), &["already exists"])
			.await?;
		Ok(())
	}

	async fn delete_route(&self, route: &Route) -> Result<()> {
		self
			.shell
			.run_idempotent("netsh", &route_args("delete", route), &["Element not found"])
			.await?;
		Ok(())
	}

	async fn route_exists(&self, destination: &IpNet) -> Result<bool> {
		let family = if matches!(destination, IpNet::V6(_)) {
			"ipv6"
		} else {
			"ipv4"
		};
		let output = self
			.shell
			.run("netsh", &argv(["interface", family, "show", "route"]))
			.await?;
		let needle = destination.to_string();
		Ok(output
			.lines()
			.any(|line| line.split_whitespace().any(|t| t == needle)))
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
		Err(NetOsError::unsupported(self.name(), "default_route"))
	}

	async fn enable_ip_forwarding(&self) -> Result<()> {
		Err(NetOsError::unsupported(self.name(), "enable_ip_forwarding"))
	}
}
