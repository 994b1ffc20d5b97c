// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Control-plane client: the peer list, organization and security group the
//! agent reconciles against.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;
use wgmesh_common::{Organization, PeerRecord, SecurityGroup};
use zeroize::Zeroizing;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ControlPlaneError {
	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	#[error("URL parse error: {0}")]
	Url(#[from] url::ParseError),

	#[error("control plane returned {status} for {url}")]
	Status { status: u16, url: String },
}

pub type Result<T> = std::result::Result<T, ControlPlaneError>;

#[async_trait]
pub trait ControlPlane: Send + Sync {
	/// Devices in the organization, in control-plane order.
	async fn fetch_peers(&self, org_id: &str) -> Result<Vec<PeerRecord>>;

	async fn fetch_organization(&self, org_id: &str) -> Result<Organization>;

	async fn fetch_security_group(&self, org_id: &str, group_id: &str) -> Result<SecurityGroup>;
}

pub fn user_agent() -> String {
	format!(
		"wgmesh-agent/{}/{}-{}",
		env!("CARGO_PKG_VERSION"),
		std::env::consts::OS,
		std::env::consts::ARCH
	)
}

pub struct HttpControlPlane {
	base_url: Url,
	http_client: Client,
	token: Option<Zeroizing<String>>,
}

impl HttpControlPlane {
	pub fn new(base_url: Url, token: Option<Zeroizing<String>>) -> Result<Self> {
		let http_client = Client::builder()
			.user_agent(user_agent())
			.timeout(REQUEST_TIMEOUT)
			.build()?;

		Ok(Self {
			base_url,
			http_client,
			token,
		})
	}

	fn url(&self, path: &str) -> Result<Url> {
		Ok(self.base_url.join(path)?)
	}

	async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
		debug!(%url, "fetching from control plane");

		let mut request = self.http_client.get(url.clone());
		if let Some(token) = &self.token {
			request = request.bearer_auth(token.as_str());
		}

		let response = request.send().await?;
		let status = response.status();
		if !status.is_success() {
			return Err(ControlPlaneError::Status {
				status: status.as_u16(),
				url: url.to_string(),
			});
		}

		Ok(response.json::<T>().await?)
	}
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
	#[instrument(skip(self))]
	async fn fetch_peers(&self, org_id: &str) -> Result<Vec<PeerRecord>> {
		let url = self.url(&format!("/api/organizations/{org_id}/devices"))?;
		let peers: Vec<PeerRecord> = self.get_json(url).await?;
		debug!(count = peers.len(), "fetched peer list");
		Ok(peers)
	}

	#[instrument(skip(self))]
	async fn fetch_organization(&self, org_id: &str) -> Result<Organization> {
		let url = self.url(&format!("/api/organizations/{org_id}"))?;
		self.get_json(url).await
	}

	#[instrument(skip(self))]
	async fn fetch_security_group(&self, org_id: &str, group_id: &str) -> Result<SecurityGroup> {
		let url = self.url(&format!(
			"/api/organizations/{org_id}/security_groups/{group_id}"
		))?;
		self.get_json(url).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::TcpListener;

	/// Serves one canned HTTP response and hands back the request head.
	async fn serve_once(status: &str, body: &str) -> (Url, tokio::task::JoinHandle<String>) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let response = format!(
			"HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
			body.len()
		);
		let handle = tokio::spawn(async move {
			let (mut stream, _) = listener.accept().await.unwrap();
			let mut buf = vec![0u8; 8192];
			let n = stream.read(&mut buf).await.unwrap();
			stream.write_all(response.as_bytes()).await.unwrap();
			stream.shutdown().await.ok();
			String::from_utf8_lossy(&buf[..n]).to_string()
		});
		(format!("http://{addr}").parse().unwrap(), handle)
	}

	#[tokio::test]
	async fn fetch_peers_sends_bearer_token() {
		let key = wgmesh_common::WgPublicKey::from_bytes([7; 32]);
		let body = format!(
			r#"[{{"public_key":"{}","endpoint":"10.0.0.2:51820","allowed_ips":["100.64.0.2/32"]}}]"#,
			key.to_base64()
		);
		let (url, server) = serve_once("200 OK", &body).await;

		let client = HttpControlPlane::new(url, Some(Zeroizing::new("tok-123".to_string()))).unwrap();
		let peers = client.fetch_peers("org-1").await.unwrap();

		assert_eq!(peers.len(), 1);
		assert_eq!(peers[0].public_key, key);
		assert_eq!(peers[0].endpoint(), Some("10.0.0.2:51820"));

		let request = server.await.unwrap();
		assert!(request.starts_with("GET /api/organizations/org-1/devices "));
		assert!(request
			.to_ascii_lowercase()
			.contains("authorization: bearer tok-123"));
	}

	#[tokio::test]
	async fn fetch_security_group_path() {
		let body = r#"{"id":"sg-1","group_name":"default","inbound_rules":[{"ip_protocol":"tcp","from_port":22,"to_port":22,"ip_ranges":["192.168.1.0/24"]}]}"#;
		let (url, server) = serve_once("200 OK", body).await;

		let client = HttpControlPlane::new(url, None).unwrap();
		let group = client.fetch_security_group("org-1", "sg-1").await.unwrap();
		assert_eq!(group.inbound_rules.len(), 1);
		assert!(group.outbound_rules.is_empty());

		let request = server.await.unwrap();
		assert!(request.starts_with("GET /api/organizations/org-1/security_groups/sg-1 "));
		assert!(!request.to_ascii_lowercase().contains("authorization:"));
	}

	#[tokio::test]
	async fn non_success_status_is_an_error() {
		let (url, _server) = serve_once("404 Not Found", "{}").await;

		let client = HttpControlPlane::new(url, None).unwrap();
		let err = client.fetch_organization("missing").await.unwrap_err();
		assert!(matches!(err, ControlPlaneError::Status { status: 404, .. }));
	}

	#[test]
	fn user_agent_names_the_agent() {
		assert!(user_agent().starts_with("wgmesh-agent/"));
	}
}
