// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! `wg(8)` command rendering shared by every platform.

use std::collections::HashSet;

use tracing::{debug, info};
use wgmesh_common::{PeerConfig, WgPublicKey, WireguardInterfaceConfig};

use crate::command::{argv, Shell};
use crate::error::{NetOsError, Result};

pub(crate) fn peer_args(peer: &PeerConfig) -> Vec<String> {
	let mut args = argv(["peer".to_string(), peer.public_key.to_base64()]);
	if let Some(endpoint) = peer.endpoint.as_deref().filter(|e| !e.is_empty()) {
		args.extend(argv(["endpoint", endpoint]));
	}
	args.extend(argv(["allowed-ips".to_string(), peer.allowed_ips_csv()]));
	if let Some(keepalive) = peer.persistent_keepalive {
		args.extend(argv(["persistent-keepalive".to_string(), keepalive.to_string()]));
	}
	args
}

pub(crate) fn set_peer_args(iface: &str, peer: &PeerConfig) -> Vec<String> {
	let mut args = argv(["set", iface]);
	args.extend(peer_args(peer));
	args
}

pub(crate) fn remove_peer_args(iface: &str, public_key: &WgPublicKey) -> Vec<String> {
	argv([
		"set".to_string(),
		iface.to_string(),
		"peer".to_string(),
		public_key.to_base64(),
		"remove".to_string(),
	])
}

pub(crate) fn listen_args(iface: &str, listen_port: u16, private_key_file: &str) -> Vec<String> {
	argv([
		"set".to_string(),
		iface.to_string(),
		"listen-port".to_string(),
		listen_port.to_string(),
		"private-key".to_string(),
		private_key_file.to_string(),
	])
}

pub(crate) fn parse_peer_list(output: &str) -> Result<HashSet<WgPublicKey>> {
	output
		.lines()
		.map(str::trim)
		.filter(|l| !l.is_empty())
		.map(|l| {
			l.parse::<WgPublicKey>()
				.map_err(|e| NetOsError::parse("wg peer list", e.to_string()))
		})
		.collect()
}

/// Applies `config` with a single `wg set` and removes live peers that are
/// not part of it.
pub(crate) async fn apply_config(shell: &Shell, config: &WireguardInterfaceConfig) -> Result<()> {
	let live = shell
		.run("wg", &argv(["show", config.interface.as_str(), "peers"]))
		.await
		.and_then(|out| parse_peer_list(&out))?;

	let wanted: HashSet<WgPublicKey> = config.peers.iter().map(|p| p.public_key).collect();
	for stale in live.difference(&wanted) {
		debug!(iface = %config.interface, peer = %stale, "removing stale peer");
		shell.run("wg", &remove_peer_args(&config.interface, stale)).await?;
	}

	let key_file = config.private_key_file.to_string_lossy();
	let mut args = listen_args(&config.interface, config.listen_port, &key_file);
	for peer in &config.peers {
		args.extend(peer_args(peer));
	}
	shell.run("wg", &args).await?;

	info!(iface = %config.interface, peers = config.peers.len(), "wireguard configuration applied");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn key(b: u8) -> WgPublicKey {
		WgPublicKey::from_bytes([b; 32])
	}

	#[test]
	fn set_peer_renders_endpoint_and_keepalive() {
		let mut peer = PeerConfig::new(
			key(1),
			Some("10.0.0.2:51820"),
			vec!["100.64.0.2/32".parse().unwrap()],
		);
		peer.persistent_keepalive = Some(25);

		let args = set_peer_args("wg0", &peer);
		assert_eq!(
			args.join(" "),
			format!(
				"set wg0 peer {} endpoint 10.0.0.2:51820 allowed-ips 100.64.0.2/32 persistent-keepalive 25",
				key(1)
			)
		);
	}

	#[test]
	fn set_peer_omits_missing_endpoint() {
		let peer = PeerConfig::new(key(2), None, vec!["100.64.0.3/32".parse().unwrap()]);
		let line = set_peer_args("wg0", &peer).join(" ");
		assert!(!line.contains("endpoint"));
		assert!(!line.contains("persistent-keepalive"));
	}

	#[test]
	fn peer_list_parses_keys() {
		let output = format!("{}\n{}\n", key(1), key(2));
		let peers = parse_peer_list(&output).unwrap();
		assert_eq!(peers.len(), 2);
		assert!(peers.contains(&key(2)));
	}

	#[test]
	fn peer_list_rejects_garbage() {
		assert!(parse_peer_list("not-a-key").is_err());
	}
}
