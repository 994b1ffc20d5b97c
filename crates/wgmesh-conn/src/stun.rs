// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Minimal RFC 5389 client: one Binding request, one mapped address back.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

pub const DEFAULT_STUN_TIMEOUT: Duration = Duration::from_secs(3);

pub const DEFAULT_STUN_SERVERS: &[&str] = &[
	"stun.l.google.com:19302",
	"stun1.l.google.com:19302",
	"stun.cloudflare.com:3478",
];

const MAGIC_COOKIE: [u8; 4] = [0x21, 0x12, 0xA4, 0x42];
const HEADER_LEN: usize = 20;

const MSG_BINDING_REQUEST: u16 = 0x0001;
const MSG_BINDING_SUCCESS: u16 = 0x0101;

const MAPPED_ADDRESS: u16 = 0x0001;
const XOR_MAPPED_ADDRESS: u16 = 0x0020;

const FAMILY_V4: u8 = 0x01;
const FAMILY_V6: u8 = 0x02;

pub type TransactionId = [u8; 12];

#[derive(Debug, Error)]
pub enum StunError {
	#[error("STUN socket error: {0}")]
	Io(#[from] std::io::Error),

	#[error("no STUN server answered in time")]
	Timeout,

	#[error("malformed STUN response: {0}")]
	Malformed(&'static str),

	#[error("no STUN servers to probe")]
	NoServers,
}

pub type Result<T> = std::result::Result<T, StunError>;

pub fn build_binding_request(transaction_id: &TransactionId) -> Vec<u8> {
	let mut msg = Vec::with_capacity(HEADER_LEN);
	msg.extend(MSG_BINDING_REQUEST.to_be_bytes());
	msg.extend([0, 0]);
	msg.extend(MAGIC_COOKIE);
	msg.extend(transaction_id);
	msg
}

fn be16(bytes: &[u8], at: usize) -> u16 {
	u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

/// Extracts the reflexive address from a Binding success response.
///
/// XOR-MAPPED-ADDRESS wins over MAPPED-ADDRESS regardless of attribute order.
pub fn parse_binding_response(data: &[u8], transaction_id: &TransactionId) -> Result<SocketAddr> {
	if data.len() < HEADER_LEN {
		return Err(StunError::Malformed("shorter than a header"));
	}
	if be16(data, 0) != MSG_BINDING_SUCCESS {
		return Err(StunError::Malformed("not a binding success"));
	}
	if data[4..8] != MAGIC_COOKIE {
		return Err(StunError::Malformed("bad magic cookie"));
	}
	if data[8..HEADER_LEN] != transaction_id[..] {
		return Err(StunError::Malformed("transaction id mismatch"));
	}

	let body_len = be16(data, 2) as usize;
	let body = data
		.get(HEADER_LEN..HEADER_LEN + body_len)
		.ok_or(StunError::Malformed("body truncated"))?;

	let mut plain = None;
	let mut rest = body;
	while rest.len() >= 4 {
		let kind = be16(rest, 0);
		let len = be16(rest, 2) as usize;
		let value = rest
			.get(4..4 + len)
			.ok_or(StunError::Malformed("attribute truncated"))?;

		match kind {
			XOR_MAPPED_ADDRESS => {
				if let Some(addr) = decode_address(value, Some(transaction_id)) {
					return Ok(addr);
				}
			}
			MAPPED_ADDRESS => plain = plain.or_else(|| decode_address(value, None)),
			_ => {}
		}

		// Attribute values are padded to a 32-bit boundary.
		let padded = 4 + len.next_multiple_of(4);
		rest = rest.get(padded..).unwrap_or_default();
	}

	plain.ok_or(StunError::Malformed("no mapped address"))
}

/// Decodes a (XOR-)MAPPED-ADDRESS value. `xor_with` carries the transaction
/// id for the XOR form.
fn decode_address(value: &[u8], xor_with: Option<&TransactionId>) -> Option<SocketAddr> {
	let family = *value.get(1)?;
	let port_bytes = [*value.get(2)?, *value.get(3)?];

	let mut mask = [0u8; 16];
	if let Some(txn) = xor_with {
		mask[..4].copy_from_slice(&MAGIC_COOKIE);
		mask[4..].copy_from_slice(txn);
	}
	let unmask = |bytes: &[u8], out: &mut [u8]| {
		for ((o, b), m) in out.iter_mut().zip(bytes).zip(mask) {
			*o = b ^ m;
		}
	};

	let mut port = [0u8; 2];
	unmask(&port_bytes, &mut port);
	let port = u16::from_be_bytes(port);

	let ip = match family {
		FAMILY_V4 => {
			let mut octets = [0u8; 4];
			unmask(value.get(4..8)?, &mut octets);
			IpAddr::V4(Ipv4Addr::from(octets))
		}
		FAMILY_V6 => {
			let mut octets = [0u8; 16];
			unmask(value.get(4..20)?, &mut octets);
			IpAddr::V6(Ipv6Addr::from(octets))
		}
		_ => return None,
	};
	Some(SocketAddr::new(ip, port))
}

/// Probes `servers` in order over `socket` and returns the first reflexive
/// address reported back. Unanswered or bogus replies move on to the next
/// server.
#[instrument(skip(socket, servers), fields(servers = servers.len()))]
pub async fn discover_endpoint(
	socket: &UdpSocket,
	servers: &[SocketAddr],
	probe_timeout: Duration,
) -> Result<SocketAddr> {
	if servers.is_empty() {
		return Err(StunError::NoServers);
	}

	let mut txn: TransactionId = [0; 12];
	fastrand::fill(&mut txn);
	let request = build_binding_request(&txn);
	let mut buf = [0u8; 576];

	for server in servers {
		if let Err(e) = socket.send_to(&request, server).await {
			warn!(%server, error = %e, "STUN send failed");
			continue;
		}

		let (len, from) = match timeout(probe_timeout, socket.recv_from(&mut buf)).await {
			Ok(Ok(received)) => received,
			Ok(Err(e)) => {
				warn!(%server, error = %e, "STUN receive failed");
				continue;
			}
			Err(_) => {
				debug!(%server, "STUN probe timed out");
				continue;
			}
		};

		if from != *server {
			warn!(%from, %server, "ignoring STUN reply from another host");
			continue;
		}

		match parse_binding_response(&buf[..len], &txn) {
			Ok(reflexive) => {
				debug!(%server, %reflexive, "STUN probe answered");
				return Ok(reflexive);
			}
			Err(e) => warn!(%server, error = %e, "discarding STUN reply"),
		}
	}

	Err(StunError::Timeout)
}

/// Resolves `host:port` names, keeping the first address of the wanted family
/// per server. Names that fail to resolve are skipped.
pub async fn resolve_stun_servers(servers: &[String], want_v6: bool) -> Vec<SocketAddr> {
	let mut resolved = Vec::with_capacity(servers.len());
	for name in servers {
		match tokio::net::lookup_host(name.as_str()).await {
			Ok(mut addrs) => resolved.extend(addrs.find(|a| a.is_ipv6() == want_v6)),
			Err(e) => warn!(server = %name, error = %e, "cannot resolve STUN server"),
		}
	}
	resolved
}

/// Encodes a success response carrying `mapped` as XOR-MAPPED-ADDRESS.
#[cfg(test)]
pub(crate) fn build_binding_response(txn: &TransactionId, mapped: SocketAddr) -> Vec<u8> {
	let mut mask = [0u8; 16];
	mask[..4].copy_from_slice(&MAGIC_COOKIE);
	mask[4..].copy_from_slice(txn);

	let (family, octets): (u8, Vec<u8>) = match mapped.ip() {
		IpAddr::V4(ip) => (FAMILY_V4, ip.octets().to_vec()),
		IpAddr::V6(ip) => (FAMILY_V6, ip.octets().to_vec()),
	};
	let mut value = vec![0, family];
	value.extend(mapped.port().to_be_bytes().iter().zip(mask).map(|(b, m)| b ^ m));
	value.extend(octets.iter().zip(mask).map(|(b, m)| b ^ m));

	let mut msg = Vec::new();
	msg.extend(MSG_BINDING_SUCCESS.to_be_bytes());
	msg.extend(((4 + value.len()) as u16).to_be_bytes());
	msg.extend(MAGIC_COOKIE);
	msg.extend(txn);
	msg.extend(XOR_MAPPED_ADDRESS.to_be_bytes());
	msg.extend((value.len() as u16).to_be_bytes());
	msg.extend(value);
	msg
}
