// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Peers that advertise a default route, in first-seen order.

use std::collections::HashSet;

use tracing::debug;
use wgmesh_common::{ExitNodeOrigin, WgPublicKey};

#[derive(Debug, Default, Clone)]
pub struct ExitNodeOrigins {
	origins: Vec<ExitNodeOrigin>,
}

impl ExitNodeOrigins {
	pub fn new() -> Self {
		Self::default()
	}

	/// Records `origin`, overwriting the endpoint of an existing entry with the
	/// same key in place or appending a new one. Returns true if anything changed.
	pub fn upsert(&mut self, origin: ExitNodeOrigin) -> bool {
		match self
			.origins
			.iter_mut()
			.find(|o| o.public_key == origin.public_key)
		{
			Some(existing) if existing.endpoint == origin.endpoint => false,
			Some(existing) => {
				debug!(peer = %origin.public_key, endpoint = ?origin.endpoint, "exit node origin endpoint changed");
				existing.endpoint = origin.endpoint;
				true
			}
			None => {
				debug!(peer = %origin.public_key, "tracking exit node origin");
				self.origins.push(origin);
				true
			}
		}
	}

	/// Drops origins whose key is not in `keep`. Returns true if any were removed.
	pub fn retain_keys(&mut self, keep: &HashSet<WgPublicKey>) -> bool {
		let before = self.origins.len();
		self.origins.retain(|o| keep.contains(&o.public_key));
		before != self.origins.len()
	}

	/// The origin exit-node clients route through.
	pub fn first(&self) -> Option<&ExitNodeOrigin> {
		self.origins.first()
	}

	pub fn get(&self, key: &WgPublicKey) -> Option<&ExitNodeOrigin> {
		self.origins.iter().find(|o| &o.public_key == key)
	}

	pub fn len(&self) -> usize {
		self.origins.len()
	}

	pub fn is_empty(&self) -> bool {
		self.origins.is_empty()
	}

	pub fn clear(&mut self) {
		self.origins.clear();
	}

	pub fn snapshot(&self) -> Vec<ExitNodeOrigin> {
		self.origins.clone()
	}
}
