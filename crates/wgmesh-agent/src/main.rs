// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! wgmesh agent binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wgmesh_agent::{load_config, load_identity, Agent, AgentConfigLayer, HttpControlPlane};

/// Joins this node to a WireGuard mesh and keeps it converged with the control plane.
#[derive(Parser, Debug)]
#[command(name = "wgmesh-agent", version)]
struct Args {
	/// Control plane base URL
	#[arg(long)]
	controller_url: Option<String>,

	/// Organization to join
	#[arg(long)]
	organization_id: Option<String>,

	/// Bearer token for the control plane
	#[arg(long)]
	api_token: Option<String>,

	/// Allow a plain http:// control plane URL
	#[arg(long)]
	insecure_http: bool,

	/// Tunnel address assigned to this node
	#[arg(long)]
	request_ip: Option<String>,

	/// IPv6 tunnel address assigned to this node
	#[arg(long)]
	request_ip_v6: Option<String>,

	/// Extra subnet reachable through this node (repeatable)
	#[arg(long = "child-prefix")]
	child_prefix: Vec<String>,

	/// Treat this node as publicly reachable and skip the NAT probe
	#[arg(long)]
	discovery_node: bool,

	/// Act as a relay for peers that cannot reach each other directly
	#[arg(long, conflicts_with = "relay_only")]
	relay_node: bool,

	/// Only peer with relay nodes
	#[arg(long)]
	relay_only: bool,

	/// Masquerade tunnel traffic out of the default interface
	#[arg(long, conflicts_with = "exit_node_client")]
	exit_node: bool,

	/// Send all traffic through an exit node
	#[arg(long)]
	exit_node_client: bool,

	/// Egress interface for exit node NAT (defaults to the default route's)
	#[arg(long)]
	exit_node_egress: Option<String>,

	/// Tunnel interface name
	#[arg(long)]
	interface: Option<String>,

	/// WireGuard listen port
	#[arg(long)]
	listen_port: Option<u16>,

	/// Seconds between control plane polls
	#[arg(long)]
	poll_interval_secs: Option<u64>,

	/// Directory holding the device key
	#[arg(long)]
	state_dir: Option<PathBuf>,

	/// Configuration file (defaults to /etc/wgmesh/agent.toml)
	#[arg(long, short = 'c')]
	config: Option<PathBuf>,

	/// Emit logs as JSON
	#[arg(long)]
	log_json: bool,
}

fn flag(set: bool) -> Option<bool> {
	set.then_some(true)
}

impl Args {
	/// Only flags given on the command line override lower layers.
	fn to_layer(&self) -> AgentConfigLayer {
		AgentConfigLayer {
			controller_url: self.controller_url.clone(),
			organization_id: self.organization_id.clone(),
			api_token: self.api_token.clone(),
			insecure_http: flag(self.insecure_http),
			interface: self.interface.clone(),
			listen_port: self.listen_port,
			request_ip: self.request_ip.clone(),
			request_ip_v6: self.request_ip_v6.clone(),
			child_prefixes: (!self.child_prefix.is_empty()).then(|| self.child_prefix.clone()),
			discovery_node: flag(self.discovery_node),
			relay_node: flag(self.relay_node),
			relay_only: flag(self.relay_only),
			exit_node: flag(self.exit_node),
			exit_node_client: flag(self.exit_node_client),
			exit_node_egress: self.exit_node_egress.clone(),
			poll_interval_secs: self.poll_interval_secs,
			state_dir: self.state_dir.clone(),
			log_json: flag(self.log_json),
			..Default::default()
		}
	}
}

fn init_tracing(json: bool) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let registry = tracing_subscriber::registry().with(filter);
	if json {
		registry.with(tracing_subscriber::fmt::layer().json()).init();
	} else {
		registry.with(tracing_subscriber::fmt::layer()).init();
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let config = load_config(args.config.clone(), args.to_layer()).context("failed to load configuration")?;
	init_tracing(config.log_json);

	info!(
		controller = %config.controller_url,
		org = %config.organization_id,
		iface = %config.interface,
		listen_port = config.listen_port,
		"configuration loaded"
	);

	let identity = load_identity(&config)
		.await
		.context("failed to load device key")?;
	let control_plane = HttpControlPlane::new(config.controller_url.clone(), config.api_token.clone())
		.context("failed to build control plane client")?;

	let mut agent = Agent::new(
		config,
		wgmesh_netos::platform_os(),
		Arc::new(control_plane),
		identity,
	);

	let handle = agent.shutdown_handle();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!("interrupt received, shutting down");
			handle.shutdown();
		}
	});

	agent.run().await.context("agent failed")?;
	Ok(())
}
