// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;

use tracing::{info, instrument, warn};
use wgmesh_netos::{ChainSpec, ChainType, Hook, NetworkOs, RuleSpec, TableSpec};

use crate::error::Result;

pub const EXIT_NODE_TABLE: &str = "wgmesh-exit-node";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatOutcome {
	Enabled { egress: String },
	Skipped(String),
}

/// Masquerades tunnel traffic out of the physical interface when this node
/// serves as an exit node.
pub struct ExitNodeNat {
	os: Arc<dyn NetworkOs>,
	tunnel_iface: String,
}

impl ExitNodeNat {
	pub fn new(os: Arc<dyn NetworkOs>, tunnel_iface: impl Into<String>) -> Self {
		Self {
			os,
			tunnel_iface: tunnel_iface.into(),
		}
	}

	pub fn table() -> TableSpec {
		TableSpec::inet(EXIT_NODE_TABLE)
	}

	/// Sets up forwarding and the NAT table. `egress` defaults to the device
	/// of the host's default route. Steps run in order and stop at the first
	/// failure.
	#[instrument(skip(self), fields(iface = %self.tunnel_iface))]
	pub async fn enable(&self, egress: Option<&str>) -> Result<NatOutcome> {
		if !self.os.supports_firewall() {
			let reason = format!("no firewall backend on {}", self.os.name());
			warn!(%reason, "skipping exit node NAT");
			return Ok(NatOutcome::Skipped(reason));
		}

		let egress = match egress {
			Some(e) => e.to_string(),
			None => self.os.default_route().await?.device,
		};

		self.os.enable_ip_forwarding().await?;

		let table = Self::table();
		// Start from scratch so re-runs never stack duplicate rules.
		self.os.delete_table(&table).await?;
		self.os.add_table(&table).await?;

		self
			.os
			.add_chain(&ChainSpec::new(&table, "prerouting", ChainType::Nat, Hook::Prerouting, "dstnat"))
			.await?;
		self
			.os
			.add_chain(&ChainSpec::new(&table, "postrouting", ChainType::Nat, Hook::Postrouting, "srcnat"))
			.await?;
		self
			.os
			.add_chain(&ChainSpec::new(&table, "forward", ChainType::Filter, Hook::Forward, "filter"))
			.await?;

		self
			.os
			.add_rule(&RuleSpec::new(
				&table,
				"postrouting",
				["oifname", egress.as_str(), "counter", "masquerade"],
			))
			.await?;
		self
			.os
			.add_rule(&RuleSpec::new(
				&table,
				"forward",
				["iifname", self.tunnel_iface.as_str(), "counter", "accept"],
			))
			.await?;

		info!(%egress, "exit node NAT enabled");
		Ok(NatOutcome::Enabled { egress })
	}

	pub async fn disable(&self) -> Result<()> {
		if !self.os.supports_firewall() {
			return Ok(());
		}
		self.os.delete_table(&Self::table()).await?;
		info!("exit node NAT disabled");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use wgmesh_netos::{OsCall, RecordingOs};

	#[tokio::test]
	async fn enable_runs_steps_in_order() {
		let os = Arc::new(RecordingOs::new());
		let nat = ExitNodeNat::new(os.clone(), "wg0");

		let outcome = nat.enable(None).await.unwrap();
		assert_eq!(
			outcome,
			NatOutcome::Enabled {
				egress: "eth0".to_string()
			}
		);

		let table = ExitNodeNat::table();
		let calls = os.calls();
		assert_eq!(calls[0], OsCall::EnableForwarding);
		assert_eq!(calls[1], OsCall::DeleteTable(table.clone()));
		assert_eq!(calls[2], OsCall::AddTable(table.clone()));
		let chains: Vec<&str> = calls
			.iter()
			.filter_map(|c| match c {
				OsCall::AddChain(chain) => Some(chain.name.as_str()),
				_ => None,
			})
			.collect();
		assert_eq!(chains, vec!["prerouting", "postrouting", "forward"]);
		assert!(matches!(calls[6], OsCall::AddRule(_)));
		assert!(matches!(calls[7], OsCall::AddRule(_)));

		let rules: Vec<String> = os.rules(&table).iter().map(RuleSpec::expression).collect();
		assert_eq!(
			rules,
			vec!["oifname eth0 counter masquerade", "iifname wg0 counter accept"]
		);
		assert!(os.forwarding_enabled());
	}

	#[tokio::test]
	async fn rerun_does_not_duplicate_rules() {
		let os = Arc::new(RecordingOs::new());
		let nat = ExitNodeNat::new(os.clone(), "wg0");
		nat.enable(Some("ens3")).await.unwrap();
		nat.enable(Some("ens3")).await.unwrap();

		assert_eq!(os.rules(&ExitNodeNat::table()).len(), 2);
	}

	#[tokio::test]
	async fn failing_chain_stops_before_rules() {
		let os = Arc::new(RecordingOs::new());
		os.fail_when("postrouting");
		let nat = ExitNodeNat::new(os.clone(), "wg0");

		assert!(nat.enable(Some("eth0")).await.is_err());
		assert!(!os.calls().iter().any(|c| matches!(c, OsCall::AddRule(_))));
		assert!(os.chains(&ExitNodeNat::table()).contains(&"prerouting".to_string()));
	}

	#[tokio::test]
	async fn forwarding_failure_touches_no_table() {
		let os = Arc::new(RecordingOs::new());
		os.fail_when("EnableForwarding");
		let nat = ExitNodeNat::new(os.clone(), "wg0");

		assert!(nat.enable(Some("eth0")).await.is_err());
		assert!(os.tables().is_empty());
	}

	#[tokio::test]
	async fn no_firewall_is_skipped() {
		let os = Arc::new(RecordingOs::new().without_firewall());
		let nat = ExitNodeNat::new(os.clone(), "utun8");

		assert!(matches!(nat.enable(None).await.unwrap(), NatOutcome::Skipped(_)));
		assert!(os.calls().is_empty());
	}

	#[tokio::test]
	async fn missing_default_route_fails() {
		let os = Arc::new(RecordingOs::new().without_default_route());
		let nat = ExitNodeNat::new(os.clone(), "wg0");
		assert!(nat.enable(None).await.is_err());
		assert!(os.calls().is_empty());
	}

	#[tokio::test]
	async fn disable_removes_table() {
		let os = Arc::new(RecordingOs::new());
		let nat = ExitNodeNat::new(os.clone(), "wg0");
		nat.enable(None).await.unwrap();
		nat.disable().await.unwrap();
		assert!(os.tables().is_empty());
	}
}
