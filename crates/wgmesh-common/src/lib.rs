// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared data model for the wgmesh agent.
//!
//! Everything the reconciliation engine exchanges with the control plane and
//! with the OS layer lives here:
//!
//! - [`WgPublicKey`], [`WgPrivateKey`], [`WgKeyPair`]: x25519 device identity
//! - [`PeerRecord`] (control-plane input) and [`PeerConfig`] (applied state)
//! - [`SecurityGroup`] and [`SecurityRule`]
//! - [`IpRange`]: address / CIDR / `start-end` notations used by rules
//! - [`Route`] and [`RouteOrigin`]

pub mod ip;
pub mod keys;
pub mod keys_file;
pub mod org;
pub mod peer;
pub mod route;
pub mod security_group;

pub use ip::{
	append_prefix_mask, is_default_route, is_ipv4_prefix, is_ipv6_prefix, IpFamily, IpRange,
	IpRangeError,
};
pub use keys::{KeyError, WgKeyPair, WgPrivateKey, WgPublicKey};
pub use org::Organization;
pub use peer::{ExitNodeOrigin, PeerConfig, PeerRecord, WireguardInterfaceConfig};
pub use route::{Route, RouteOrigin};
pub use security_group::{Protocol, SecurityGroup, SecurityRule};

/// Well-known WireGuard port used by relay nodes.
pub const WG_DEFAULT_PORT: u16 = 51820;
