// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod nat;
pub mod stun;

pub use nat::{discover_local_address, Detector, DetectorConfig, Reachability};
pub use stun::{
	build_binding_request, discover_endpoint, parse_binding_response, resolve_stun_servers,
	StunError, DEFAULT_STUN_SERVERS, DEFAULT_STUN_TIMEOUT,
};
