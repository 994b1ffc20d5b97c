// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Address notations accepted in security-group rules, plus small prefix
//! helpers shared by the route code.

use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IpRangeError {
	#[error("empty IP range")]
	Empty,

	#[error("invalid IP address or prefix: {0}")]
	Invalid(String),

	#[error("IP range {0} mixes address families")]
	MixedFamilies(String),

	#[error("IP range {0} has start after end")]
	Inverted(String),

	#[error("invalid mask size /{mask} for {addr}")]
	MaskTooLong { addr: IpAddr, mask: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
	V4,
	V6,
}

impl IpFamily {
	pub fn of(addr: &IpAddr) -> Self {
		match addr {
			IpAddr::V4(_) => Self::V4,
			IpAddr::V6(_) => Self::V6,
		}
	}
}

/// One entry of a rule's `ip_ranges` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpRange {
	Single(IpAddr),
	Cidr(IpNet),
	Range { start: IpAddr, end: IpAddr },
}

impl IpRange {
	pub fn family(&self) -> IpFamily {
		match self {
			Self::Single(addr) => IpFamily::of(addr),
			Self::Cidr(net) => IpFamily::of(&net.addr()),
			Self::Range { start, .. } => IpFamily::of(start),
		}
	}

	/// True when the range covers the whole address family.
	pub fn is_any(&self) -> bool {
		matches!(self, Self::Cidr(net) if net.prefix_len() == 0)
	}
}

impl FromStr for IpRange {
	type Err = IpRangeError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(IpRangeError::Empty);
		}

		if let Some((start, end)) = s.split_once('-') {
			let start: IpAddr = start
				.trim()
				.parse()
				.map_err(|_| IpRangeError::Invalid(s.to_string()))?;
			let end: IpAddr = end
				.trim()
				.parse()
				.map_err(|_| IpRangeError::Invalid(s.to_string()))?;
			if IpFamily::of(&start) != IpFamily::of(&end) {
				return Err(IpRangeError::MixedFamilies(s.to_string()));
			}
			if start > end {
				return Err(IpRangeError::Inverted(s.to_string()));
			}
			return Ok(Self::Range { start, end });
		}

		if s.contains('/') {
			let net: IpNet = s
				.parse()
				.map_err(|_| IpRangeError::Invalid(s.to_string()))?;
			return Ok(Self::Cidr(net.trunc()));
		}

		s.parse()
			.map(Self::Single)
			.map_err(|_| IpRangeError::Invalid(s.to_string()))
	}
}

impl fmt::Display for IpRange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Single(addr) => write!(f, "{addr}"),
			Self::Cidr(net) => write!(f, "{net}"),
			Self::Range { start, end } => write!(f, "{start}-{end}"),
		}
	}
}

pub fn is_ipv4_prefix(prefix: &str) -> bool {
	matches!(prefix.parse::<IpNet>(), Ok(IpNet::V4(_)))
}

pub fn is_ipv6_prefix(prefix: &str) -> bool {
	matches!(prefix.parse::<IpNet>(), Ok(IpNet::V6(_)))
}

pub fn is_default_route(net: &IpNet) -> bool {
	net.prefix_len() == 0
}

/// Attach a prefix length to a bare address, e.g. `100.64.0.2` + 32.
pub fn append_prefix_mask(addr: IpAddr, mask: u8) -> Result<IpNet, IpRangeError> {
	IpNet::new(addr, mask).map_err(|_| IpRangeError::MaskTooLong { addr, mask })
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;
	use std::net::Ipv4Addr;

	#[test]
	fn parses_single_address() {
		let range: IpRange = "192.168.1.201".parse().unwrap();
		assert_eq!(range, IpRange::Single("192.168.1.201".parse().unwrap()));
		assert_eq!(range.family(), IpFamily::V4);
	}

	#[test]
	fn parses_cidr_and_truncates_host_bits() {
		let range: IpRange = "192.168.200.1/24".parse().unwrap();
		assert_eq!(range.to_string(), "192.168.200.0/24");
	}

	#[test]
	fn parses_v6_range() {
		let range: IpRange = "200::1-200::5".parse().unwrap();
		assert_eq!(range.family(), IpFamily::V6);
		assert_eq!(range.to_string(), "200::1-200::5");
	}

	#[test]
	fn rejects_truncated_dotted_quad() {
		assert!(matches!(
			"100.100.0/16".parse::<IpRange>(),
			Err(IpRangeError::Invalid(_))
		));
	}

	#[test]
	fn rejects_mixed_family_range() {
		assert!(matches!(
			"10.0.0.1-200::5".parse::<IpRange>(),
			Err(IpRangeError::MixedFamilies(_))
		));
	}

	#[test]
	fn rejects_inverted_range() {
		assert!(matches!(
			"172.20.0.100-172.20.0.1".parse::<IpRange>(),
			Err(IpRangeError::Inverted(_))
		));
	}

	#[test]
	fn any_range_detection() {
		assert!("0.0.0.0/0".parse::<IpRange>().unwrap().is_any());
		assert!("::/0".parse::<IpRange>().unwrap().is_any());
		assert!(!"10.0.0.0/8".parse::<IpRange>().unwrap().is_any());
	}

	#[test]
	fn prefix_family_helpers() {
		assert!(is_ipv4_prefix("10.0.0.0/8"));
		assert!(!is_ipv4_prefix("2001:db8::/32"));
		assert!(is_ipv6_prefix("2001:db8::/32"));
		assert!(!is_ipv6_prefix("10.0.0.1"));
	}

	#[test]
	fn append_mask() {
		let net = append_prefix_mask(IpAddr::V4(Ipv4Addr::new(100, 64, 0, 2)), 32).unwrap();
		assert_eq!(net.to_string(), "100.64.0.2/32");
		assert!(append_prefix_mask(IpAddr::V4(Ipv4Addr::LOCALHOST), 33).is_err());
	}

	proptest! {
		#[test]
		fn v4_range_parses_when_ordered(a: u32, b: u32) {
			let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
			let s = format!("{}-{}", Ipv4Addr::from(lo), Ipv4Addr::from(hi));
			let range: IpRange = s.parse().unwrap();
			prop_assert_eq!(range.to_string(), s);
		}

		#[test]
		fn v4_cidr_display_is_network_address(addr: u32, len in 0u8..=32) {
			let s = format!("{}/{}", Ipv4Addr::from(addr), len);
			let range: IpRange = s.parse().unwrap();
			match range {
				IpRange::Cidr(net) => prop_assert_eq!(net, net.trunc()),
				other => prop_assert!(false, "expected cidr, got {:?}", other),
			}
		}
	}
}
