// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use wgmesh_common::WgPublicKey;
use wgmesh_conn::{discover_local_address, Detector, DetectorConfig, Reachability};
use wgmesh_netos::NetworkOs;

use crate::config::AgentConfig;
use crate::control_plane::ControlPlane;
use crate::error::{AgentError, ReconcileError, Result};
use crate::identity::DeviceIdentity;
use crate::reconciler::{ReconcileInput, ReconcileReport, ReconcileStatus, Reconciler, ReconcilerConfig};

/// Stops a running [`Agent`] from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
	tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
	pub fn shutdown(&self) {
		let _ = self.tx.send(true);
	}
}

/// Polls the control plane and drives the reconciler until shut down.
pub struct Agent {
	config: AgentConfig,
	os: Arc<dyn NetworkOs>,
	control_plane: Arc<dyn ControlPlane>,
	detector: Detector,
	public_key: WgPublicKey,
	reconciler: Reconciler,
	reachability: Option<Reachability>,
	shutdown_tx: Arc<watch::Sender<bool>>,
	shutdown_rx: watch::Receiver<bool>,
}

impl Agent {
	pub fn new(
		config: AgentConfig,
		os: Arc<dyn NetworkOs>,
		control_plane: Arc<dyn ControlPlane>,
		identity: DeviceIdentity,
	) -> Self {
		let public_key = *identity.keypair.public_key();
		let reconciler = Reconciler::new(
			Arc::clone(&os),
			ReconcilerConfig {
				interface: config.interface.clone(),
				listen_port: config.listen_port,
				tunnel_address: config.tunnel_address,
				tunnel_address_v6: config.tunnel_address_v6,
				private_key_file: identity.key_file,
				self_key: public_key,
				relay_node: config.relay_node,
				relay_only: config.relay_only,
				exit_node: config.exit_node,
				exit_node_client: config.exit_node_client,
				exit_node_egress: config.exit_node_egress.clone(),
				child_prefixes: config.child_prefixes.clone(),
			},
		);
		let detector = Detector::new(DetectorConfig {
			stun_servers: config.stun_servers.clone(),
			..Default::default()
		});
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		Self {
			config,
			os,
			control_plane,
			detector,
			public_key,
			reconciler,
			reachability: None,
			shutdown_tx: Arc::new(shutdown_tx),
			shutdown_rx,
		}
	}

	/// Overrides reachability detection, mainly for hosts without outbound UDP.
	pub fn with_reachability(mut self, reachability: Reachability) -> Self {
		self.reachability = Some(reachability);
		self
	}

	pub fn public_key(&self) -> &WgPublicKey {
		&self.public_key
	}

	pub fn status(&self) -> watch::Receiver<ReconcileStatus> {
		self.reconciler.subscribe()
	}

	pub fn shutdown_handle(&self) -> ShutdownHandle {
		ShutdownHandle {
			tx: Arc::clone(&self.shutdown_tx),
		}
	}

	pub fn shutdown(&self) {
		let _ = self.shutdown_tx.send(true);
	}

	pub async fn wait(&self) {
		let mut rx = self.shutdown_rx.clone();
		while !*rx.borrow() {
			if rx.changed().await.is_err() {
				break;
			}
		}
	}

	/// Runs until shutdown, then removes everything the agent installed.
	///
	/// Missing binaries, or an interface that cannot be built before the
	/// first successful pass, end the run with an error. Everything else is
	/// logged and retried on the next tick.
	#[instrument(skip(self), fields(org = %self.config.organization_id, iface = %self.config.interface))]
	pub async fn run(&mut self) -> Result<()> {
		info!(os = self.os.name(), public_key = %self.public_key, "starting wgmesh agent");

		self
			.os
			.check_prerequisites()
			.await
			.map_err(AgentError::Prerequisites)?;

		if self.reachability.is_none() {
			self.reachability = Some(self.probe_reachability().await);
		}

		let mut poll_timer = tokio::time::interval(self.config.poll_interval);
		poll_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		let mut shutdown_rx = self.shutdown_rx.clone();
		let mut converged_once = false;

		loop {
			tokio::select! {
				biased;

				_ = shutdown_rx.changed() => {
					if *shutdown_rx.borrow() {
						info!("shutdown signal received");
						break;
					}
				}

				_ = poll_timer.tick() => {
					match self.poll_once().await {
						Ok(report) => {
							converged_once = true;
							debug!(
								added = report.added.len(),
								updated = report.updated.len(),
								removed = report.removed.len(),
								"poll complete"
							);
						}
						Err(AgentError::Reconcile(ReconcileError::Interface(e))) if !converged_once => {
							error!(error = %e, "failed to create tunnel interface");
							return Err(ReconcileError::Interface(e).into());
						}
						Err(e) => warn!(error = %e, "poll failed, retrying next interval"),
					}
				}
			}
		}

		info!("tearing down wgmesh agent state");
		if let Err(e) = self.reconciler.teardown().await {
			warn!(error = %e, "teardown incomplete");
		}
		info!("wgmesh agent stopped");
		Ok(())
	}

	/// Fetches the organization, peer list and security group, then runs one
	/// reconcile pass against them.
	pub async fn poll_once(&mut self) -> Result<ReconcileReport> {
		let org_id = self.config.organization_id.as_str();
		let organization = self.control_plane.fetch_organization(org_id).await?;
		let peers = self.control_plane.fetch_peers(org_id).await?;

		let security_group = match organization
			.security_group_id
			.as_deref()
			.filter(|id| !id.trim().is_empty())
		{
			Some(group_id) => Some(
				self
					.control_plane
					.fetch_security_group(org_id, group_id)
					.await?,
			),
			None => None,
		};

		let reachability = match &self.reachability {
			Some(r) => r.clone(),
			None => self.probe_reachability().await,
		};

		let report = self
			.reconciler
			.reconcile(ReconcileInput {
				peers,
				security_group,
				organization,
				reachability,
			})
			.await?;
		Ok(report)
	}

	/// Discovery nodes are assumed publicly reachable and skip the STUN probe.
	async fn probe_reachability(&self) -> Reachability {
		let local = match self.local_address().await {
			Ok(addr) => addr,
			Err(e) => {
				warn!(error = %e, "could not determine local address, assuming NAT");
				return Reachability {
					is_nated: true,
					public_ip: None,
					probe_error: Some(e),
				};
			}
		};

		if self.config.discovery_node {
			info!(%local, "discovery node, skipping reachability probe");
			return Reachability::direct(local);
		}
		self.detector.detect_nat(local).await
	}

	/// The source address this host uses towards the control plane.
	async fn local_address(&self) -> std::result::Result<IpAddr, String> {
		let url = &self.config.controller_url;
		let host = url
			.host_str()
			.ok_or_else(|| "controller URL has no host".to_string())?;
		let port = url.port_or_known_default().unwrap_or(443);
		let host = host.trim_start_matches('[').trim_end_matches(']');

		let target: SocketAddr = tokio::net::lookup_host((host, port))
			.await
			.map_err(|e| e.to_string())?
			.next()
			.ok_or_else(|| format!("{host} did not resolve"))?;

		discover_local_address(target).await.map_err(|e| e.to_string())
	}
}

impl std::fmt::Debug for Agent {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Agent")
			.field("organization_id", &self.config.organization_id)
			.field("interface", &self.config.interface)
			.field("public_key", &self.public_key)
			.field("reconciler", &self.reconciler)
			.finish_non_exhaustive()
	}
}
