// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use base64::prelude::*;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum KeyError {
	#[error("invalid base64: {0}")]
	Base64(#[from] base64::DecodeError),

	#[error("invalid key length: expected 32 bytes, got {0}")]
	Length(usize),
}

fn decode_key(s: &str) -> Result<[u8; KEY_LEN], KeyError> {
	let bytes = Zeroizing::new(BASE64_STANDARD.decode(s.trim())?);
	let len = bytes.len();
	bytes
		.as_slice()
		.try_into()
		.map_err(|_| KeyError::Length(len))
}

/// WireGuard public key; the identity of a mesh device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WgPublicKey([u8; KEY_LEN]);

impl WgPublicKey {
	pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
		Self(bytes)
	}

	pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
		&self.0
	}

	pub fn from_base64(s: &str) -> Result<Self, KeyError> {
		decode_key(s).map(Self)
	}

	pub fn to_base64(&self) -> String {
		BASE64_STANDARD.encode(self.0)
	}
}

impl fmt::Display for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_base64())
	}
}

impl fmt::Debug for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "WgPublicKey({})", self.to_base64())
	}
}

impl FromStr for WgPublicKey {
	type Err = KeyError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::from_base64(s)
	}
}

impl Serialize for WgPublicKey {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_base64())
	}
}

impl<'de> Deserialize<'de> for WgPublicKey {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		Self::from_base64(&s).map_err(serde::de::Error::custom)
	}
}

/// WireGuard private key. Zeroized on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WgPrivateKey([u8; KEY_LEN]);

impl WgPrivateKey {
	pub fn generate() -> Self {
		Self(StaticSecret::random_from_rng(OsRng).to_bytes())
	}

	pub fn from_base64(s: &str) -> Result<Self, KeyError> {
		decode_key(s).map(Self)
	}

	pub fn to_base64(&self) -> Zeroizing<String> {
		Zeroizing::new(BASE64_STANDARD.encode(self.0))
	}

	pub fn public_key(&self) -> WgPublicKey {
		let secret = StaticSecret::from(self.0);
		WgPublicKey(PublicKey::from(&secret).to_bytes())
	}
}

impl fmt::Debug for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("WgPrivateKey([REDACTED])")
	}
}

#[derive(Clone)]
pub struct WgKeyPair {
	private: WgPrivateKey,
	public: WgPublicKey,
}

impl WgKeyPair {
	pub fn generate() -> Self {
		Self::from_private_key(WgPrivateKey::generate())
	}

	pub fn from_private_key(private: WgPrivateKey) -> Self {
		let public = private.public_key();
		Self { private, public }
	}

	pub fn public_key(&self) -> &WgPublicKey {
		&self.public
	}

	pub fn private_key(&self) -> &WgPrivateKey {
		&self.private
	}
}

impl fmt::Debug for WgKeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgKeyPair")
			.field("public", &self.public)
			.finish_non_exhaustive()
	}
}
