// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;
use wgmesh_common::IpRangeError;
use wgmesh_netos::NetOsError;

#[derive(Debug, Error)]
pub enum PolicyError {
	#[error("{direction} rule {index}: unknown protocol {protocol:?}")]
	InvalidProtocol {
		direction: &'static str,
		index: usize,
		protocol: String,
	},

	#[error("{direction} rule {index}: from_port {from} is greater than to_port {to}")]
	InvalidPortRange {
		direction: &'static str,
		index: usize,
		from: u16,
		to: u16,
	},

	#[error("{direction} rule {index}: {source}")]
	InvalidRange {
		direction: &'static str,
		index: usize,
		#[source]
		source: IpRangeError,
	},

	#[error("no firewall backend on {0}")]
	FirewallUnsupported(&'static str),

	#[error("network operation failed: {0}")]
	NetOs(#[from] NetOsError),
}

pub type Result<T> = std::result::Result<T, PolicyError>;
