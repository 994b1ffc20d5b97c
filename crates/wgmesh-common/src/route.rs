// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use ipnet::IpNet;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

/// Why a route was installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteOrigin {
	/// The peer's own tunnel address.
	Peer,
	/// An extra subnet advertised by the peer.
	ChildPrefix,
	/// Organization prefix reached through a relay peer.
	Relay,
	/// Default route (or endpoint exemption) for exit-node clients.
	ExitNode,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Route {
	pub destination: IpNet,
	pub device: String,
	pub origin: RouteOrigin,
	pub gateway: Option<IpAddr>,
}

impl Route {
	pub fn via_device(destination: IpNet, device: impl Into<String>, origin: RouteOrigin) -> Self {
		Self {
			destination,
			device: device.into(),
			origin,
			gateway: None,
		}
	}

	pub fn via_gateway(
		destination: IpNet,
		gateway: IpAddr,
		device: impl Into<String>,
		origin: RouteOrigin,
	) -> Self {
		Self {
			destination,
			device: device.into(),
			origin,
			gateway: Some(gateway),
		}
	}

	pub fn is_ipv6(&self) -> bool {
		matches!(self.destination, IpNet::V6(_))
	}
}

impl fmt::Display for Route {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.gateway {
			Some(gw) => write!(f, "{} via {} dev {}", self.destination, gw, self.device),
			None => write!(f, "{} dev {}", self.destination, self.device),
		}
	}
}
