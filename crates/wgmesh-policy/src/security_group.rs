// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Security groups as nftables state.
//!
//! A group is compiled into rule expressions up front. Only a fully valid
//! group touches the firewall: it is installed into a new generation table
//! `wgmesh-sg-g<N>` and the previous generation is deleted afterwards, so a
//! failed apply leaves the old rules in force.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use wgmesh_common::{IpFamily, IpRange, Protocol, SecurityGroup, SecurityRule};
use wgmesh_netos::{ChainSpec, ChainType, Hook, NetworkOs, RuleSpec, TableSpec};

use crate::error::{PolicyError, Result};

pub const SG_TABLE_PREFIX: &str = "wgmesh-sg-g";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	Inbound,
	Outbound,
}

impl Direction {
	pub fn as_str(&self) -> &'static str {
		match self {
			Direction::Inbound => "inbound",
			Direction::Outbound => "outbound",
		}
	}

	fn hook(&self) -> Hook {
		match self {
			Direction::Inbound => Hook::Input,
			Direction::Outbound => Hook::Output,
		}
	}

	fn iface_match(&self) -> &'static str {
		match self {
			Direction::Inbound => "iifname",
			Direction::Outbound => "oifname",
		}
	}

	fn addr_match(&self) -> &'static str {
		match self {
			Direction::Inbound => "saddr",
			Direction::Outbound => "daddr",
		}
	}
}

/// Validated rule expressions for both directions, without the
/// established/drop framing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledPolicy {
	pub inbound: Vec<Vec<String>>,
	pub outbound: Vec<Vec<String>>,
}

impl CompiledPolicy {
	fn for_direction(&self, direction: Direction) -> &[Vec<String>] {
		match direction {
			Direction::Inbound => &self.inbound,
			Direction::Outbound => &self.outbound,
		}
	}
}

/// Expands every rule of `group` into nft expressions matching traffic on
/// `tunnel_iface`. Any invalid rule fails the whole group.
pub fn compile(group: &SecurityGroup, tunnel_iface: &str) -> Result<CompiledPolicy> {
	let comment = format!("\"sg:{}\"", group.id);
	let mut compiled = CompiledPolicy::default();

	for (direction, rules, out) in [
		(Direction::Inbound, &group.inbound_rules, &mut compiled.inbound),
		(Direction::Outbound, &group.outbound_rules, &mut compiled.outbound),
	] {
		for (index, rule) in rules.iter().enumerate() {
			out.extend(compile_rule(rule, direction, index, tunnel_iface, &comment)?);
		}
	}

	Ok(compiled)
}

fn compile_rule(
	rule: &SecurityRule,
	direction: Direction,
	index: usize,
	tunnel_iface: &str,
	comment: &str,
) -> Result<Vec<Vec<String>>> {
	let protocol: Protocol = rule
		.ip_protocol
		.parse()
		.map_err(|_| PolicyError::InvalidProtocol {
			direction: direction.as_str(),
			index,
			protocol: rule.ip_protocol.clone(),
		})?;

	if protocol.has_ports() && rule.from_port > rule.to_port {
		return Err(PolicyError::InvalidPortRange {
			direction: direction.as_str(),
			index,
			from: rule.from_port,
			to: rule.to_port,
		});
	}

	let ranges = rule
		.ip_ranges
		.iter()
		.map(|r| {
			r.parse::<IpRange>().map_err(|source| PolicyError::InvalidRange {
				direction: direction.as_str(),
				index,
				source,
			})
		})
		.collect::<Result<Vec<_>>>()?;

	// No ranges means any address of either family.
	let targets: Vec<Option<&IpRange>> = if ranges.is_empty() {
		vec![None]
	} else {
		ranges.iter().map(Some).collect()
	};

	Ok(targets
		.into_iter()
		.map(|range| {
			let mut expr = vec![direction.iface_match().to_string(), tunnel_iface.to_string()];
			if let Some(range) = range {
				let family = match range.family() {
					IpFamily::V4 => "ip",
					IpFamily::V6 => "ip6",
				};
				expr.push(family.to_string());
				expr.push(direction.addr_match().to_string());
				expr.push(range.to_string());
			}
			expr.extend(protocol_match(protocol, rule, range.map(IpRange::family)));
			expr.push("accept".to_string());
			expr.push("comment".to_string());
			expr.push(comment.to_string());
			expr
		})
		.collect())
}

fn port_expr(rule: &SecurityRule) -> Option<String> {
	match (rule.from_port, rule.to_port) {
		(0, 0) => None,
		(from, to) if from == to => Some(from.to_string()),
		(from, to) => Some(format!("{from}-{to}")),
	}
}

fn protocol_match(protocol: Protocol, rule: &SecurityRule, family: Option<IpFamily>) -> Vec<String> {
	match protocol {
		Protocol::Tcp | Protocol::Udp => match port_expr(rule) {
			Some(ports) => vec![protocol.as_str().to_string(), "dport".to_string(), ports],
			None => vec!["meta".into(), "l4proto".into(), protocol.as_str().to_string()],
		},
		// icmp and icmpv6 both select the ICMP flavour of the matched family.
		Protocol::Icmp | Protocol::Icmpv6 => match family {
			Some(IpFamily::V4) => vec!["meta".into(), "l4proto".into(), "icmp".into()],
			Some(IpFamily::V6) => vec!["meta".into(), "l4proto".into(), "ipv6-icmp".into()],
			None => vec![
				"meta".into(),
				"l4proto".into(),
				"{".into(),
				"icmp,".into(),
				"ipv6-icmp".into(),
				"}".into(),
			],
		},
		Protocol::All => match port_expr(rule) {
			Some(ports) => vec!["th".into(), "dport".into(), ports],
			None => Vec::new(),
		},
	}
}

/// Keeps the host firewall in line with the assigned security group.
pub struct SecurityGroupTranslator {
	os: Arc<dyn NetworkOs>,
	tunnel_iface: String,
	generation: u64,
	active: Option<TableSpec>,
	stale: Vec<TableSpec>,
	discovered: bool,
}

impl SecurityGroupTranslator {
	pub fn new(os: Arc<dyn NetworkOs>, tunnel_iface: impl Into<String>) -> Self {
		Self {
			os,
			tunnel_iface: tunnel_iface.into(),
			generation: 0,
			active: None,
			stale: Vec::new(),
			discovered: false,
		}
	}

	pub fn active_table(&self) -> Option<&TableSpec> {
		self.active.as_ref()
	}

	/// Picks up generation tables left by an earlier run so they are
	/// replaced rather than duplicated.
	async fn discover(&mut self) -> Result<()> {
		if self.discovered {
			return Ok(());
		}
		for table in self.os.list_tables(SG_TABLE_PREFIX).await? {
			if let Some(generation) = parse_generation(&table.name) {
				self.generation = self.generation.max(generation);
				debug!(table = %table, "found existing security group table");
				self.stale.push(table);
			}
		}
		self.discovered = true;
		Ok(())
	}

	#[instrument(skip(self, group), fields(group_id = %group.id, iface = %self.tunnel_iface))]
	pub async fn apply(&mut self, group: &SecurityGroup) -> Result<()> {
		let compiled = compile(group, &self.tunnel_iface)?;

		if !self.os.supports_firewall() {
			return Err(PolicyError::FirewallUnsupported(self.os.name()));
		}
		self.discover().await?;

		let generation = self.generation + 1;
		let table = TableSpec::inet(format!("{SG_TABLE_PREFIX}{generation}"));

		if let Err(e) = self.install(&table, &compiled).await {
			warn!(table = %table, error = %e, "security group install failed, keeping previous rules");
			if let Err(cleanup) = self.os.delete_table(&table).await {
				warn!(table = %table, error = %cleanup, "failed to remove partial table");
			}
			return Err(e);
		}

		self.generation = generation;
		if let Some(previous) = self.active.replace(table.clone()) {
			self.stale.push(previous);
		}
		self.prune_stale().await;

		info!(
			table = %table,
			inbound = compiled.inbound.len(),
			outbound = compiled.outbound.len(),
			"security group applied"
		);
		Ok(())
	}

	async fn install(&self, table: &TableSpec, compiled: &CompiledPolicy) -> Result<()> {
		self.os.add_table(table).await?;
		for direction in [Direction::Inbound, Direction::Outbound] {
			let chain = direction.as_str();
			self
				.os
				.add_chain(&ChainSpec::new(table, chain, ChainType::Filter, direction.hook(), "filter"))
				.await?;

			let iface_match = [direction.iface_match(), self.tunnel_iface.as_str()];
			let established = iface_match
				.iter()
				.copied()
				.chain(["ct", "state", "established,related", "accept"]);
			self.os.add_rule(&RuleSpec::new(table, chain, established)).await?;

			let rules = compiled.for_direction(direction);
			for expr in rules {
				self
					.os
					.add_rule(&RuleSpec::new(table, chain, expr.iter().cloned()))
					.await?;
			}
			if !rules.is_empty() {
				let drop = iface_match.iter().copied().chain(["drop"]);
				self.os.add_rule(&RuleSpec::new(table, chain, drop)).await?;
			}
		}
		Ok(())
	}

	/// Deletes superseded tables. Failures are retried on the next apply.
	async fn prune_stale(&mut self) {
		let mut remaining = Vec::new();
		for table in std::mem::take(&mut self.stale) {
			if Some(&table) == self.active.as_ref() {
				continue;
			}
			match self.os.delete_table(&table).await {
				Ok(()) => debug!(table = %table, "removed previous security group table"),
				Err(e) => {
					warn!(table = %table, error = %e, "failed to remove previous security group table");
					remaining.push(table);
				}
			}
		}
		self.stale = remaining;
	}

	/// Removes every security group table this translator knows about.
	pub async fn clear(&mut self) -> Result<()> {
		if !self.os.supports_firewall() {
			return Ok(());
		}
		self.discover().await?;
		if let Some(active) = self.active.take() {
			self.stale.push(active);
		}
		for table in std::mem::take(&mut self.stale) {
			self.os.delete_table(&table).await?;
		}
		info!("security group rules cleared");
		Ok(())
	}
}

fn parse_generation(name: &str) -> Option<u64> {
	name.strip_prefix(SG_TABLE_PREFIX)?.parse().ok()
}
