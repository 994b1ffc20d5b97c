// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Layer-4 protocol selector of a security rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
	Tcp,
	Udp,
	Icmp,
	Icmpv6,
	All,
}

impl Protocol {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Tcp => "tcp",
			Self::Udp => "udp",
			Self::Icmp => "icmp",
			Self::Icmpv6 => "icmpv6",
			Self::All => "all",
		}
	}

	pub fn has_ports(&self) -> bool {
		matches!(self, Self::Tcp | Self::Udp | Self::All)
	}
}

impl FromStr for Protocol {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"tcp" => Ok(Self::Tcp),
			"udp" => Ok(Self::Udp),
			"icmp" => Ok(Self::Icmp),
			"icmpv6" => Ok(Self::Icmpv6),
			"all" => Ok(Self::All),
			other => Err(other.to_string()),
		}
	}
}

impl fmt::Display for Protocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A single inbound or outbound rule as delivered by the control plane.
///
/// The protocol and ranges stay as raw strings here; they are validated when
/// the group is translated so that a bad rule fails the whole apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
	pub ip_protocol: String,
	#[serde(default)]
	pub from_port: u16,
	#[serde(default)]
	pub to_port: u16,
	#[serde(default)]
	pub ip_ranges: Vec<String>,
}

impl SecurityRule {
	pub fn new(protocol: &str, from_port: u16, to_port: u16, ip_ranges: &[&str]) -> Self {
		Self {
			ip_protocol: protocol.to_string(),
			from_port,
			to_port,
			ip_ranges: ip_ranges.iter().map(|r| r.to_string()).collect(),
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
	pub id: String,
	#[serde(default)]
	pub group_name: String,
	#[serde(default)]
	pub inbound_rules: Vec<SecurityRule>,
	#[serde(default)]
	pub outbound_rules: Vec<SecurityRule>,
}

impl SecurityGroup {
	pub fn is_assigned(&self) -> bool {
		!self.id.trim().is_empty()
	}
}
