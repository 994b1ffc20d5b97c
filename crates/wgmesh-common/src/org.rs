// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

/// Organization settings as published by the control plane. Read-only for the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
	pub id: String,
	#[serde(default)]
	pub cidr: Option<Ipv4Net>,
	#[serde(default)]
	pub cidr_v6: Option<Ipv6Net>,
	#[serde(default)]
	pub hub_zone: bool,
	#[serde(default)]
	pub security_group_id: Option<String>,
}

impl Organization {
	/// Organization prefixes, v4 first.
	pub fn prefixes(&self) -> Vec<IpNet> {
		self
			.cidr
			.map(IpNet::V4)
			.into_iter()
			.chain(self.cidr_v6.map(IpNet::V6))
			.collect()
	}
}
