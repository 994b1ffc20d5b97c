// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::PathBuf;

use tracing::{info, instrument};
use wgmesh_common::keys_file::{parse_wg_key, KeyFileError, KeyStore};
use wgmesh_common::WgKeyPair;

use crate::config::{AgentConfig, KeySource};

/// The device key pair and the file WireGuard reads it from.
pub struct DeviceIdentity {
	pub keypair: WgKeyPair,
	pub key_file: PathBuf,
}

impl std::fmt::Debug for DeviceIdentity {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DeviceIdentity")
			.field("public_key", self.keypair.public_key())
			.field("key_file", &self.key_file)
			.finish()
	}
}

/// Loads the device key. An inline key is written into the state directory
/// because `wg` only accepts keys from a file.
#[instrument(skip(config), fields(state_dir = %config.state_dir.display()))]
pub async fn load_identity(config: &AgentConfig) -> Result<DeviceIdentity, KeyFileError> {
	let (keypair, store) = match &config.key_source {
		KeySource::File(path) => {
			let store = KeyStore::at(path);
			(store.load().await?, store)
		}
		KeySource::Inline(value) => {
			let keypair = parse_wg_key(value)?;
			let store = KeyStore::in_state_dir(&config.state_dir);
			store.store(&keypair).await?;
			(keypair, store)
		}
		KeySource::StateDir => {
			let store = KeyStore::in_state_dir(&config.state_dir);
			(store.load_or_generate().await?, store)
		}
	};
	let key_file = store.path().to_path_buf();

	info!(public_key = %keypair.public_key(), key_file = %key_file.display(), "device identity loaded");
	Ok(DeviceIdentity { keypair, key_file })
}
