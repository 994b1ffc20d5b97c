// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! On-disk device key. `wg set ... private-key <file>` only accepts a path,
//! so the key always lives in a 0600 file even when supplied inline.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};
use zeroize::Zeroizing;

use crate::keys::{KeyError, WgKeyPair, WgPrivateKey};

pub const KEY_FILENAME: &str = "private.key";

#[derive(Error, Debug)]
pub enum KeyFileError {
	#[error("key file {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("malformed private key: {0}")]
	InvalidFormat(#[from] KeyError),

	#[error("no home directory to place the state directory in")]
	NoHomeDir,
}

pub type Result<T> = std::result::Result<T, KeyFileError>;

/// A private key file at a fixed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStore {
	path: PathBuf,
}

impl KeyStore {
	pub fn at(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	/// `<state_dir>/private.key`
	pub fn in_state_dir(state_dir: impl AsRef<Path>) -> Self {
		Self::at(state_dir.as_ref().join(KEY_FILENAME))
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn io_err(&self, source: std::io::Error) -> KeyFileError {
		KeyFileError::Io {
			path: self.path.clone(),
			source,
		}
	}

	#[instrument(skip(self), fields(path = %self.path.display()))]
	pub async fn load(&self) -> Result<WgKeyPair> {
		let raw = tokio::fs::read_to_string(&self.path)
			.await
			.map(Zeroizing::new)
			.map_err(|e| self.io_err(e))?;
		parse_wg_key(&raw)
	}

	/// Writes the key, creating parent directories. Existing contents are
	/// replaced.
	#[instrument(skip(self, keypair), fields(path = %self.path.display()))]
	pub async fn store(&self, keypair: &WgKeyPair) -> Result<()> {
		if let Some(dir) = self.path.parent() {
			tokio::fs::create_dir_all(dir)
				.await
				.map_err(|e| self.io_err(e))?;
		}

		let mut options = tokio::fs::OpenOptions::new();
		options.write(true).create(true).truncate(true);
		#[cfg(unix)]
		options.mode(0o600);

		let mut file = options.open(&self.path).await.map_err(|e| self.io_err(e))?;
		let encoded = keypair.private_key().to_base64();
		let mut line = Zeroizing::new(String::with_capacity(encoded.len() + 1));
		line.push_str(&encoded);
		line.push('\n');
		file.write_all(line.as_bytes())
			.await
			.map_err(|e| self.io_err(e))?;
		file.flush().await.map_err(|e| self.io_err(e))?;
		debug!("private key written");
		Ok(())
	}

	/// Returns the stored key, generating and storing one if the file does
	/// not exist yet.
	pub async fn load_or_generate(&self) -> Result<WgKeyPair> {
		match tokio::fs::try_exists(&self.path).await {
			Ok(true) => self.load().await,
			Ok(false) => {
				let keypair = WgKeyPair::generate();
				self.store(&keypair).await?;
				info!(public_key = %keypair.public_key(), path = %self.path.display(), "generated device key");
				Ok(keypair)
			}
			Err(e) => Err(self.io_err(e)),
		}
	}
}

/// Parses a base64 private key, ignoring surrounding whitespace.
pub fn parse_wg_key(value: &str) -> Result<WgKeyPair> {
	let private = WgPrivateKey::from_base64(value.trim())?;
	Ok(WgKeyPair::from_private_key(private))
}

/// `/var/lib/wgmesh` on Linux, `~/.wgmesh` elsewhere.
pub fn default_state_dir() -> Result<PathBuf> {
	if cfg!(target_os = "linux") {
		Ok(PathBuf::from("/var/lib/wgmesh"))
	} else {
		let home = dirs::home_dir().ok_or(KeyFileError::NoHomeDir)?;
		Ok(home.join(".wgmesh"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[tokio::test]
	async fn stored_key_loads_back() {
		let dir = TempDir::new().unwrap();
		let store = KeyStore::in_state_dir(dir.path());
		let keypair = WgKeyPair::generate();

		store.store(&keypair).await.unwrap();
		let loaded = store.load().await.unwrap();

		assert_eq!(loaded.public_key(), keypair.public_key());
		assert_eq!(store.path(), dir.path().join(KEY_FILENAME));
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn stored_key_is_owner_only() {
		use std::os::unix::fs::PermissionsExt;

		let dir = TempDir::new().unwrap();
		let store = KeyStore::at(dir.path().join("a/b/wg.key"));
		store.store(&WgKeyPair::generate()).await.unwrap();

		let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
		assert_eq!(mode & 0o777, 0o600);
	}

	#[tokio::test]
	async fn generation_happens_once() {
		let dir = TempDir::new().unwrap();
		let store = KeyStore::in_state_dir(dir.path());

		let first = store.load_or_generate().await.unwrap();
		let again = store.load_or_generate().await.unwrap();
		assert_eq!(first.public_key(), again.public_key());
	}

	#[tokio::test]
	async fn missing_file_reports_path() {
		let dir = TempDir::new().unwrap();
		let store = KeyStore::at(dir.path().join("nope.key"));
		match store.load().await {
			Err(KeyFileError::Io { path, .. }) => assert_eq!(path, store.path()),
			other => panic!("expected io error, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn garbage_file_is_invalid_format() {
		let dir = TempDir::new().unwrap();
		let store = KeyStore::in_state_dir(dir.path());
		std::fs::write(store.path(), "not base64 at all").unwrap();

		assert!(matches!(store.load().await, Err(KeyFileError::InvalidFormat(_))));
	}

	#[test]
	fn inline_key_tolerates_whitespace() {
		let keypair = WgKeyPair::generate();
		let encoded = keypair.private_key().to_base64();

		let parsed = parse_wg_key(&format!("\t{}\n", encoded.as_str())).unwrap();
		assert_eq!(parsed.public_key(), keypair.public_key());
		assert!(parse_wg_key("").is_err());
	}
}
