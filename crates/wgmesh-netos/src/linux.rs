// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Linux: iproute2, wireguard-tools and nftables.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use tracing::{debug, info, instrument, warn};
use wgmesh_common::{PeerConfig, Route, WgPublicKey, WireguardInterfaceConfig};

use crate::command::{argv, CommandRunner, Shell};
use crate::error::{NetOsError, Result};
use crate::firewall::{ChainSpec, FirewallFamily, RuleSpec, TableSpec};
use crate::os::{DefaultRoute, InterfaceSpec, NetworkOs};
use crate::wg;

const ROUTE_EXISTS: &[&str] = &["File exists"];
const ROUTE_MISSING: &[&str] = &["No such process", "Cannot find device"];
const TABLE_MISSING: &[&str] = &["No such file or directory"];

pub struct LinuxOs {
	shell: Shell,
}

impl LinuxOs {
	pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
		Self {
			shell: Shell::new(runner),
		}
	}

	async fn add_addresses(&self, spec: &InterfaceSpec) -> Result<()> {
		for addr in &spec.addresses {
			self
				.shell
				.run("ip", &address_add_args(&spec.name, addr))
				.await?;
		}
		Ok(())
	}
}

fn family_flag(v6: bool) -> Vec<String> {
	if v6 {
		argv(["-6"])
	} else {
		Vec::new()
	}
}

pub(crate) fn route_args(action: &str, route: &Route) -> Vec<String> {
	let mut args = family_flag(route.is_ipv6());
	args.extend(argv(["route".to_string(), action.to_string(), route.destination.to_string()]));
	if let Some(gateway) = route.gateway {
		args.extend(argv(["via".to_string(), gateway.to_string()]));
	}
	args.extend(argv(["dev", route.device.as_str()]));
	args
}

fn address_add_args(iface: &str, addr: &IpNet) -> Vec<String> {
	argv([
		"address".to_string(),
		"add".to_string(),
		addr.to_string(),
		"dev".to_string(),
		iface.to_string(),
	])
}

pub(crate) fn chain_args(chain: &ChainSpec) -> Vec<String> {
	argv([
		"add",
		"chain",
		chain.table.family.as_str(),
		chain.table.name.as_str(),
		chain.name.as_str(),
		"{",
		"type",
		chain.chain_type.as_str(),
		"hook",
		chain.hook.as_str(),
		"priority",
		chain.priority.as_str(),
		";",
		"}",
	])
}

pub(crate) fn rule_args(rule: &RuleSpec) -> Vec<String> {
	let mut args = argv([
		"add",
		"rule",
		rule.table.family.as_str(),
		rule.table.name.as_str(),
		rule.chain.as_str(),
	]);
	args.extend(rule.expr.iter().cloned());
	args
}

/// Parses `ip -o addr show` output.
pub(crate) fn parse_addresses(output: &str) -> Vec<IpAddr> {
	let mut addrs = Vec::new();
	for line in output.lines() {
		let mut tokens = line.split_whitespace();
		while let Some(token) = tokens.next() {
			if token == "inet" || token == "inet6" {
				if let Some(net) = tokens.next().and_then(|t| t.parse::<IpNet>().ok()) {
					addrs.push(net.addr());
				}
			}
		}
	}
	addrs
}

/// Parses the first line of `ip route show default`.
pub(crate) fn parse_default_route(output: &str) -> Option<DefaultRoute> {
	let line = output.lines().find(|l| l.starts_with("default"))?;
	let tokens: Vec<&str> = line.split_whitespace().collect();
	let value_after = |key: &str| {
		tokens
			.iter()
			.position(|t| *t == key)
			.and_then(|i| tokens.get(i + 1))
			.copied()
	};
	Some(DefaultRoute {
		device: value_after("dev")?.to_string(),
		gateway: value_after("via").and_then(|g| g.parse().ok()),
	})
}

/// Parses `nft list tables` output.
pub(crate) fn parse_tables(output: &str) -> Vec<TableSpec> {
	output
		.lines()
		.filter_map(|line| {
			let parts: Vec<&str> = line.split_whitespace().collect();
			if parts.len() != 3 || parts[0] != "table" {
				return None;
			}
			let family = match parts[1] {
				"inet" => FirewallFamily::Inet,
				"ip" => FirewallFamily::Ip,
				"ip6" => FirewallFamily::Ip6,
				_ => return None,
			};
			Some(TableSpec {
				family,
				name: parts[2].to_string(),
			})
		})
		.collect()
}

#[async_trait]
impl NetworkOs for LinuxOs {
	fn name(&self) -> &'static str {
		"linux"
	}

	async fn check_prerequisites(&self) -> Result<()> {
		self.shell.require("ip", &argv(["-V"])).await?;
		self.shell.require("wg", &argv(["--version"])).await?;
		self.shell.require("nft", &argv(["--version"])).await?;
		Ok(())
	}

	async fn query_interface_address(&self, iface: &str) -> Result<Vec<IpAddr>> {
		let output = self
			.shell
			.output("ip", &argv(["-o", "addr", "show", "dev", iface]))
			.await?;
		if !output.success {
			if output.stderr.contains("does not exist") {
				return Ok(Vec::new());
			}
			return Err(NetOsError::CommandFailed {
				program: "ip".to_string(),
				args: argv(["-o", "addr", "show", "dev", iface]),
				stderr: output.stderr,
			});
		}
		Ok(parse_addresses(&output.stdout))
	}

	#[instrument(skip(self, spec), fields(iface = %spec.name, port = spec.listen_port))]
	async fn create_or_replace_interface(&self, spec: &InterfaceSpec) -> Result<()> {
		self
			.shell
			.run_allow_failure("ip", &argv(["link", "del", spec.name.as_str()]))
			.await;
		self
			.shell
			.run("ip", &argv(["link", "add", spec.name.as_str(), "type", "wireguard"]))
			.await?;

		let key_file = spec.private_key_file.to_string_lossy();
		self
			.shell
			.run("wg", &wg::listen_args(&spec.name, spec.listen_port, &key_file))
			.await?;

		if let Err(e) = self.add_addresses(spec).await {
			warn!(error = %e, "address assignment failed, flushing and retrying");
			self
				.shell
				.run("ip", &argv(["address", "flush", "dev", spec.name.as_str()]))
				.await?;
			self.add_addresses(spec).await?;
		}

		self
			.shell
			.run("ip", &argv(["link", "set", spec.name.as_str(), "up"]))
			.await?;
		info!("interface ready");
		Ok(())
	}

	async fn destroy_interface(&self, iface: &str) -> Result<()> {
		self
			.shell
			.run_idempotent("ip", &argv(["link", "del", iface]), &["Cannot find device"])
			.await?;
		Ok(())
	}

	async fn add_route(&self, route: &Route) -> Result<()> {
		if !self
			.shell
			.run_idempotent("ip", &route_args("add", route), ROUTE_EXISTS)
			.await?
		{
			debug!(%route, "route already present");
		}
		Ok(())
	}

	async fn delete_route(&self, route: &Route) -> Result<()> {
		self
			.shell
			.run_idempotent("ip", &route_args("del", route), ROUTE_MISSING)
			.await?;
		Ok(())
	}

	async fn route_exists(&self, destination: &IpNet) -> Result<bool> {
		let mut args = family_flag(matches!(destination, IpNet::V6(_)));
		args.extend(argv(["route".to_string(), "show".to_string(), destination.to_string()]));
		let output = self.shell.run("ip", &args).await?;
		Ok(!output.trim().is_empty())
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
		let output = self.shell.run("ip", &argv(["route", "show", "default"])).await?;
		parse_default_route(&output).ok_or_else(|| NetOsError::NotFound("default route".to_string()))
	}

	async fn enable_ip_forwarding(&self) -> Result<()> {
		self
			.shell
			.run("sysctl", &argv(["-w", "net.ipv4.ip_forward=1"]))
			.await?;
		// Hosts with IPv6 disabled have no such key.
		self
			.shell
			.run_allow_failure("sysctl", &argv(["-w", "net.ipv6.conf.all.forwarding=1"]))
			.await;
		Ok(())
	}

	fn supports_firewall(&self) -> bool {
		true
	}

	async fn add_table(&self, table: &TableSpec) -> Result<()> {
		self
			.shell
			.run("nft", &argv(["add", "table", table.family.as_str(), table.name.as_str()]))
			.await?;
		Ok(())
	}

	async fn delete_table(&self, table: &TableSpec) -> Result<()> {
		self
			.shell
			.run_idempotent(
				"nft",
				&argv(["delete", "table", table.family.as_str(), table.name.as_str()]),
				TABLE_MISSING,
			)
			.await?;
		Ok(())
	}

	async fn table_exists(&self, table: &TableSpec) -> Result<bool> {
		Ok(self.list_tables(&table.name).await?.contains(table))
	}

	async fn list_tables(&self, prefix: &str) -> Result<Vec<TableSpec>> {
		let output = self.shell.run("nft", &argv(["list", "tables"])).await?;
		Ok(parse_tables(&output)
			.into_iter()
			.filter(|t| t.name.starts_with(prefix))
			.collect())
	}

	async fn add_chain(&self, chain: &ChainSpec) -> Result<()> {
		self.shell.run("nft", &chain_args(chain)).await?;
		Ok(())
	}

	async fn add_rule(&self, rule: &RuleSpec) -> Result<()> {
		self.shell.run("nft", &rule_args(rule)).await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::command::{CommandOutput, ScriptedRunner};
	use crate::firewall::{ChainType, Hook};
	use wgmesh_common::RouteOrigin;

	fn linux() -> (Arc<ScriptedRunner>, LinuxOs) {
		let runner = Arc::new(ScriptedRunner::new());
		let os = LinuxOs::new(runner.clone());
		(runner, os)
	}

	fn route(dest: &str) -> Route {
		Route::via_device(dest.parse().unwrap(), "wg0", RouteOrigin::Peer)
	}

	#[tokio::test]
	async fn add_route_renders_ip_route() {
		let (runner, os) = linux();
		os.add_route(&route("100.64.0.2/32")).await.unwrap();
		os.add_route(&route("fd00::2/128")).await.unwrap();

		assert_eq!(
			runner.calls(),
			vec![
				"ip route add 100.64.0.2/32 dev wg0",
				"ip -6 route add fd00::2/128 dev wg0",
			]
		);
	}

	#[tokio::test]
	async fn gateway_route_includes_via() {
		let (runner, os) = linux();
		let r = Route::via_gateway(
			"203.0.113.7/32".parse().unwrap(),
			"192.168.1.1".parse().unwrap(),
			"eth0",
			RouteOrigin::ExitNode,
		);
		os.add_route(&r).await.unwrap();
		assert_eq!(runner.calls(), vec!["ip route add 203.0.113.7/32 via 192.168.1.1 dev eth0"]);
	}

	#[tokio::test]
	async fn add_existing_route_is_ok() {
		let (runner, os) = linux();
		runner.respond("ip route add", CommandOutput::failed("RTNETLINK answers: File exists"));
		assert!(os.add_route(&route("100.64.0.2/32")).await.is_ok());
	}

	#[tokio::test]
	async fn delete_missing_route_is_ok() {
		let (runner, os) = linux();
		runner.respond("ip route del", CommandOutput::failed("RTNETLINK answers: No such process"));
		assert!(os.delete_route(&route("100.64.0.2/32")).await.is_ok());
	}

	#[tokio::test]
	async fn missing_interface_has_no_addresses() {
		let (runner, os) = linux();
		runner.respond("ip -o addr show", CommandOutput::failed("Device \"wg0\" does not exist."));
		assert!(os.query_interface_address("wg0").await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn interface_address_is_parsed() {
		let (runner, os) = linux();
		runner.respond(
			"ip -o addr show",
			CommandOutput::ok(
				"7: wg0    inet 100.64.0.1/32 scope global wg0\\       valid_lft forever preferred_lft forever\n\
				 7: wg0    inet6 fd00::1/64 scope global \\       valid_lft forever preferred_lft forever",
			),
		);
		let addrs = os.query_interface_address("wg0").await.unwrap();
		assert_eq!(
			addrs,
			vec!["100.64.0.1".parse::<IpAddr>().unwrap(), "fd00::1".parse().unwrap()]
		);
	}

	#[tokio::test]
	async fn interface_creation_sequence() {
		let (runner, os) = linux();
		let spec = InterfaceSpec {
			name: "wg0".to_string(),
			addresses: vec!["100.64.0.1/32".parse().unwrap()],
			listen_port: 51820,
			private_key_file: "/var/lib/wgmesh/private.key".into(),
		};
		os.create_or_replace_interface(&spec).await.unwrap();

		assert_eq!(
			runner.calls(),
			vec![
				"ip link del wg0",
				"ip link add wg0 type wireguard",
				"wg set wg0 listen-port 51820 private-key /var/lib/wgmesh/private.key",
				"ip address add 100.64.0.1/32 dev wg0",
				"ip link set wg0 up",
			]
		);
	}

	#[tokio::test]
	async fn address_conflict_flushes_and_retries() {
		let (runner, os) = linux();
		runner.respond("ip address add", CommandOutput::failed("RTNETLINK answers: File exists"));
		let spec = InterfaceSpec {
			name: "wg0".to_string(),
			addresses: vec!["100.64.0.1/32".parse().unwrap()],
			listen_port: 51820,
			private_key_file: "/tmp/key".into(),
		};

		// The scripted failure is sticky, so the retry fails too.
		assert!(os.create_or_replace_interface(&spec).await.is_err());
		assert!(runner.calls().contains(&"ip address flush dev wg0".to_string()));
	}

	#[tokio::test]
	async fn nft_chain_and_rule_rendering() {
		let (runner, os) = linux();
		let table = TableSpec::inet("wgmesh-exit-node");
		os.add_table(&table).await.unwrap();
		os.add_chain(&ChainSpec::new(&table, "postrouting", ChainType::Nat, Hook::Postrouting, "srcnat"))
			.await
			.unwrap();
		os.add_rule(&RuleSpec::new(&table, "postrouting", ["oifname", "eth0", "masquerade"]))
			.await
			.unwrap();

		assert_eq!(
			runner.calls(),
			vec![
				"nft add table inet wgmesh-exit-node",
				"nft add chain inet wgmesh-exit-node postrouting { type nat hook postrouting priority srcnat ; }",
				"nft add rule inet wgmesh-exit-node postrouting oifname eth0 masquerade",
			]
		);
	}

	#[tokio::test]
	async fn table_listing_filters_by_prefix() {
		let (runner, os) = linux();
		runner.respond(
			"nft list tables",
			CommandOutput::ok("table inet filter\ntable inet wgmesh-sg-g3\ntable ip nat"),
		);
		let tables = os.list_tables("wgmesh-sg-").await.unwrap();
		assert_eq!(tables, vec![TableSpec::inet("wgmesh-sg-g3")]);
		assert!(os.table_exists(&TableSpec::inet("wgmesh-sg-g3")).await.unwrap());
		assert!(!os.table_exists(&TableSpec::inet("wgmesh-exit-node")).await.unwrap());
	}

	#[tokio::test]
	async fn default_route_parsing() {
		let (runner, os) = linux();
		runner.respond(
			"ip route show default",
			CommandOutput::ok("default via 192.168.1.1 dev eth0 proto dhcp metric 100"),
		);
		assert_eq!(
			os.default_route().await.unwrap(),
			DefaultRoute {
				device: "eth0".to_string(),
				gateway: Some("192.168.1.1".parse().unwrap()),
			}
		);
	}

	#[tokio::test]
	async fn default_route_missing() {
		let (_runner, os) = linux();
		assert!(matches!(os.default_route().await, Err(NetOsError::NotFound(_))));
	}

	#[tokio::test]
	async fn prerequisites_report_missing_binary() {
		let (runner, os) = linux();
		runner.respond("nft --version", CommandOutput::failed("not found"));
		assert!(matches!(
			os.check_prerequisites().await,
			Err(NetOsError::BinaryMissing(p)) if p == "nft"
		));
	}
}
