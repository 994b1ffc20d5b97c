// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Firewall policy for the wgmesh agent: security groups and exit-node NAT.

pub mod error;
pub mod exit_node;
pub mod security_group;

pub use error::{PolicyError, Result};
pub use exit_node::{ExitNodeNat, NatOutcome, EXIT_NODE_TABLE};
pub use security_group::{compile, CompiledPolicy, Direction, SecurityGroupTranslator, SG_TABLE_PREFIX};
