// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Agent configuration.
//!
//! Layers are merged field-wise with precedence
//! defaults < TOML file < `WGMESH_*` environment < command line, then
//! resolved and validated into an [`AgentConfig`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;
use tracing::{debug, trace};
use url::Url;
use wgmesh_common::{append_prefix_mask, keys_file, WG_DEFAULT_PORT};
use wgmesh_conn::DEFAULT_STUN_SERVERS;
use zeroize::Zeroizing;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/wgmesh/agent.toml";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read {path}: {source}")]
	FileRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("TOML parse error in {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("Validation error: {0}")]
	Validation(String),

	#[error("Missing required field: {0}")]
	MissingField(String),

	#[error("Invalid value for {field}: {message}")]
	InvalidValue { field: String, message: String },
}

impl ConfigError {
	pub fn validation(msg: impl Into<String>) -> Self {
		Self::Validation(msg.into())
	}

	pub fn missing_field(field: impl Into<String>) -> Self {
		Self::MissingField(field.into())
	}

	pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
		Self::InvalidValue {
			field: field.into(),
			message: message.into(),
		}
	}
}

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	Environment = 50,
	CommandLine = 60,
}

/// One partially-specified configuration layer.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfigLayer {
	pub controller_url: Option<String>,
	pub organization_id: Option<String>,
	pub api_token: Option<String>,
	pub insecure_http: Option<bool>,
	pub interface: Option<String>,
	pub listen_port: Option<u16>,
	pub request_ip: Option<String>,
	pub request_ip_v6: Option<String>,
	pub child_prefixes: Option<Vec<String>>,
	pub discovery_node: Option<bool>,
	pub relay_node: Option<bool>,
	pub relay_only: Option<bool>,
	pub exit_node: Option<bool>,
	pub exit_node_client: Option<bool>,
	pub exit_node_egress: Option<String>,
	pub poll_interval_secs: Option<u64>,
	pub state_dir: Option<PathBuf>,
	pub stun_servers: Option<Vec<String>>,
	pub private_key: Option<String>,
	pub private_key_file: Option<PathBuf>,
	pub log_json: Option<bool>,
}

impl std::fmt::Debug for AgentConfigLayer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AgentConfigLayer")
			.field("controller_url", &self.controller_url)
			.field("organization_id", &self.organization_id)
			.field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
			.field("interface", &self.interface)
			.field("request_ip", &self.request_ip)
			.field("private_key", &self.private_key.as_ref().map(|_| "[REDACTED]"))
			.field("private_key_file", &self.private_key_file)
			.finish_non_exhaustive()
	}
}

macro_rules! merge_fields {
	($self:ident, $other:ident, $($field:ident),+ $(,)?) => {
		$(
			if $other.$field.is_some() {
				$self.$field = $other.$field;
			}
		)+
	};
}

impl AgentConfigLayer {
	/// Overlays every field set in `other`.
	pub fn merge(&mut self, other: AgentConfigLayer) {
		merge_fields!(
			self,
			other,
			controller_url,
			organization_id,
			api_token,
			insecure_http,
			interface,
			listen_port,
			request_ip,
			request_ip_v6,
			child_prefixes,
			discovery_node,
			relay_node,
			relay_only,
			exit_node,
			exit_node_client,
			exit_node_egress,
			poll_interval_secs,
			state_dir,
			stun_servers,
			private_key,
			private_key_file,
			log_json,
		);
	}
}

pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> Result<AgentConfigLayer, ConfigError>;
}

pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<AgentConfigLayer, ConfigError> {
		Ok(AgentConfigLayer {
			interface: Some(default_interface().to_string()),
			poll_interval_secs: Some(DEFAULT_POLL_INTERVAL_SECS),
			stun_servers: Some(DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()),
			..Default::default()
		})
	}
}

pub struct TomlSource {
	path: PathBuf,
	required: bool,
}

impl TomlSource {
	/// A file named explicitly must exist.
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			required: true,
		}
	}

	pub fn system() -> Self {
		Self {
			path: PathBuf::from(DEFAULT_CONFIG_PATH),
			required: false,
		}
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<AgentConfigLayer, ConfigError> {
		if !self.required && !self.path.exists() {
			debug!(path = %self.path.display(), "config file not found, skipping");
			return Ok(AgentConfigLayer::default());
		}

		debug!(path = %self.path.display(), "loading config file");
		let content = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::FileRead {
			path: self.path.clone(),
			source: e,
		})?;

		let layer: AgentConfigLayer =
			toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
				path: self.path.clone(),
				source: e,
			})?;

		trace!("parsed config layer from TOML");
		Ok(layer)
	}
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Environment variable source. Convention: `WGMESH_<FIELD>`.
pub struct EnvSource {
	lookup: EnvLookup,
}

impl Default for EnvSource {
	fn default() -> Self {
		Self::process()
	}
}

impl EnvSource {
	pub fn process() -> Self {
		Self {
			lookup: Box::new(|name| std::env::var(name).ok()),
		}
	}

	pub fn from_map(vars: HashMap<String, String>) -> Self {
		Self {
			lookup: Box::new(move |name| vars.get(name).cloned()),
		}
	}

	fn var(&self, name: &str) -> Option<String> {
		(self.lookup)(name).filter(|s| !s.is_empty())
	}

	fn bool(&self, name: &str) -> Option<bool> {
		self
			.var(name)
			.map(|v| v.eq_ignore_ascii_case("true") || v == "1")
	}

	fn parsed<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>, ConfigError> {
		match self.var(name) {
			Some(v) => v
				.parse()
				.map(Some)
				.map_err(|_| ConfigError::invalid_value(name, format!("invalid value '{v}'"))),
			None => Ok(None),
		}
	}

	fn list(&self, name: &str) -> Option<Vec<String>> {
		self.var(name).map(|v| {
			v.split(',')
				.map(str::trim)
				.filter(|s| !s.is_empty())
				.map(str::to_string)
				.collect()
		})
	}
}

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<AgentConfigLayer, ConfigError> {
		debug!("loading environment variables");
		Ok(AgentConfigLayer {
			controller_url: self.var("WGMESH_CONTROLLER_URL"),
			organization_id: self.var("WGMESH_ORGANIZATION_ID"),
			api_token: self.var("WGMESH_API_TOKEN"),
			insecure_http: self.bool("WGMESH_INSECURE_HTTP"),
			interface: self.var("WGMESH_INTERFACE"),
			listen_port: self.parsed("WGMESH_LISTEN_PORT")?,
			request_ip: self.var("WGMESH_REQUEST_IP"),
			request_ip_v6: self.var("WGMESH_REQUEST_IP_V6"),
			child_prefixes: self.list("WGMESH_CHILD_PREFIX"),
			discovery_node: self.bool("WGMESH_DISCOVERY_NODE"),
			relay_node: self.bool("WGMESH_RELAY_NODE"),
			relay_only: self.bool("WGMESH_RELAY_ONLY"),
			exit_node: self.bool("WGMESH_EXIT_NODE"),
			exit_node_client: self.bool("WGMESH_EXIT_NODE_CLIENT"),
			exit_node_egress: self.var("WGMESH_EXIT_NODE_EGRESS"),
			poll_interval_secs: self.parsed("WGMESH_POLL_INTERVAL_SECS")?,
			state_dir: self.var("WGMESH_STATE_DIR").map(PathBuf::from),
			stun_servers: self.list("WGMESH_STUN_SERVERS"),
			private_key: self.var("WGMESH_PRIVATE_KEY"),
			private_key_file: self.var("WGMESH_PRIVATE_KEY_FILE").map(PathBuf::from),
			log_json: self.bool("WGMESH_LOG_JSON"),
		})
	}
}

/// A layer built from command-line flags.
pub struct CliSource(pub AgentConfigLayer);

impl ConfigSource for CliSource {
	fn name(&self) -> &'static str {
		"command-line"
	}

	fn precedence(&self) -> Precedence {
		Precedence::CommandLine
	}

	fn load(&self) -> Result<AgentConfigLayer, ConfigError> {
		Ok(self.0.clone())
	}
}

pub fn default_interface() -> &'static str {
	if cfg!(target_os = "macos") {
		"utun8"
	} else {
		"wg0"
	}
}

/// Where the device private key comes from.
#[derive(Clone)]
pub enum KeySource {
	/// `<state_dir>/private.key`, generated on first run.
	StateDir,
	/// An existing key file, used as is.
	File(PathBuf),
	/// An inline key, persisted into the state directory.
	Inline(Zeroizing<String>),
}

impl std::fmt::Debug for KeySource {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			KeySource::StateDir => f.write_str("StateDir"),
			KeySource::File(path) => f.debug_tuple("File").field(path).finish(),
			KeySource::Inline(_) => f.write_str("Inline([REDACTED])"),
		}
	}
}

/// Resolved, validated agent configuration.
#[derive(Clone)]
pub struct AgentConfig {
	pub controller_url: Url,
	pub organization_id: String,
	pub api_token: Option<Zeroizing<String>>,
	pub insecure_http: bool,
	pub interface: String,
	pub listen_port: u16,
	pub tunnel_address: IpNet,
	pub tunnel_address_v6: Option<IpNet>,
	pub child_prefixes: Vec<IpNet>,
	pub discovery_node: bool,
	pub relay_node: bool,
	pub relay_only: bool,
	pub exit_node: bool,
	pub exit_node_client: bool,
	pub exit_node_egress: Option<String>,
	pub poll_interval: Duration,
	pub state_dir: PathBuf,
	pub stun_servers: Vec<String>,
	pub key_source: KeySource,
	pub log_json: bool,
}

impl std::fmt::Debug for AgentConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AgentConfig")
			.field("controller_url", &self.controller_url.as_str())
			.field("organization_id", &self.organization_id)
			.field("interface", &self.interface)
			.field("listen_port", &self.listen_port)
			.field("tunnel_address", &self.tunnel_address)
			.field("relay_node", &self.relay_node)
			.field("relay_only", &self.relay_only)
			.field("exit_node", &self.exit_node)
			.field("exit_node_client", &self.exit_node_client)
			.field("key_source", &self.key_source)
			.finish_non_exhaustive()
	}
}

/// Parses a tunnel address, attaching a host-length prefix to bare addresses.
fn parse_tunnel_address(field: &str, value: &str) -> Result<IpNet, ConfigError> {
	let value = value.trim();
	if value.contains('/') {
		return value
			.parse()
			.map_err(|_| ConfigError::invalid_value(field, format!("invalid prefix '{value}'")));
	}
	let addr: std::net::IpAddr = value
		.parse()
		.map_err(|_| ConfigError::invalid_value(field, format!("invalid address '{value}'")))?;
	let mask = if addr.is_ipv4() { 32 } else { 128 };
	append_prefix_mask(addr, mask).map_err(|e| ConfigError::invalid_value(field, e.to_string()))
}

impl AgentConfig {
	/// Resolves a merged layer, applying defaults for unset fields.
	pub fn from_layer(layer: AgentConfigLayer) -> Result<Self, ConfigError> {
		let insecure_http = layer.insecure_http.unwrap_or(false);

		let raw_url = layer
			.controller_url
			.ok_or_else(|| ConfigError::missing_field("controller_url"))?;
		let controller_url: Url = raw_url
			.parse()
			.map_err(|e| ConfigError::invalid_value("controller_url", format!("{e}")))?;
		match controller_url.scheme() {
			"https" => {}
			"http" if insecure_http => {}
			_ => {
				return Err(ConfigError::validation(
					"controller URL must use https:// (set insecure_http to allow http://)",
				))
			}
		}

		let organization_id = layer
			.organization_id
			.filter(|s| !s.trim().is_empty())
			.ok_or_else(|| ConfigError::missing_field("organization_id"))?;

		let request_ip = layer
			.request_ip
			.ok_or_else(|| ConfigError::missing_field("request_ip"))?;
		let tunnel_address = parse_tunnel_address("request_ip", &request_ip)?;
		if !matches!(tunnel_address, IpNet::V4(_)) {
			return Err(ConfigError::invalid_value("request_ip", "must be an IPv4 address"));
		}
		let tunnel_address_v6 = layer
			.request_ip_v6
			.map(|v| parse_tunnel_address("request_ip_v6", &v))
			.transpose()?;
		if matches!(tunnel_address_v6, Some(IpNet::V4(_))) {
			return Err(ConfigError::invalid_value("request_ip_v6", "must be an IPv6 address"));
		}

		let child_prefixes = layer
			.child_prefixes
			.unwrap_or_default()
			.iter()
			.map(|p| {
				p.trim()
					.parse::<IpNet>()
					.map(|net| net.trunc())
					.map_err(|_| ConfigError::invalid_value("child_prefix", format!("invalid prefix '{p}'")))
			})
			.collect::<Result<Vec<_>, _>>()?;

		let relay_node = layer.relay_node.unwrap_or(false);
		let relay_only = layer.relay_only.unwrap_or(false);
		if relay_node && relay_only {
			return Err(ConfigError::validation(
				"relay_node and relay_only cannot both be set",
			));
		}

		let exit_node = layer.exit_node.unwrap_or(false);
		let exit_node_client = layer.exit_node_client.unwrap_or(false);
		if exit_node && exit_node_client {
			return Err(ConfigError::validation(
				"exit_node and exit_node_client cannot both be set",
			));
		}

		let poll_interval_secs = layer
			.poll_interval_secs
			.unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
		if poll_interval_secs == 0 {
			return Err(ConfigError::invalid_value(
				"poll_interval_secs",
				"must be greater than zero",
			));
		}

		// Relays listen on the well-known port so peers can reach them unannounced.
		let listen_port = if relay_node {
			WG_DEFAULT_PORT
		} else {
			layer
				.listen_port
				.unwrap_or_else(|| fastrand::u16(32768..61000))
		};

		let state_dir = match layer.state_dir {
			Some(dir) => dir,
			None => keys_file::default_state_dir()
				.map_err(|e| ConfigError::invalid_value("state_dir", e.to_string()))?,
		};

		let key_source = match (layer.private_key, layer.private_key_file) {
			(Some(key), _) => KeySource::Inline(Zeroizing::new(key)),
			(None, Some(path)) => KeySource::File(path),
			(None, None) => KeySource::StateDir,
		};

		Ok(Self {
			controller_url,
			organization_id,
			api_token: layer.api_token.map(Zeroizing::new),
			insecure_http,
			interface: layer
				.interface
				.unwrap_or_else(|| default_interface().to_string()),
			listen_port,
			tunnel_address,
			tunnel_address_v6,
			child_prefixes,
			discovery_node: layer.discovery_node.unwrap_or(false),
			relay_node,
			relay_only,
			exit_node,
			exit_node_client,
			exit_node_egress: layer.exit_node_egress,
			poll_interval: Duration::from_secs(poll_interval_secs),
			state_dir,
			stun_servers: layer.stun_servers.unwrap_or_default(),
			key_source,
			log_json: layer.log_json.unwrap_or(false),
		})
	}

	/// Tunnel addresses assigned to the interface, v4 first.
	pub fn tunnel_addresses(&self) -> Vec<IpNet> {
		std::iter::once(self.tunnel_address)
			.chain(self.tunnel_address_v6)
			.collect()
	}
}

pub fn load_from_sources(mut sources: Vec<Box<dyn ConfigSource>>) -> Result<AgentConfig, ConfigError> {
	sources.sort_by_key(|s| s.precedence());

	let mut merged = AgentConfigLayer::default();
	for source in sources {
		debug!(source = source.name(), "loading configuration source");
		merged.merge(source.load()?);
	}

	AgentConfig::from_layer(merged)
}

/// Loads defaults, the TOML file (`config_path` or the system file), the
/// process environment and `cli`.
pub fn load_config(
	config_path: Option<PathBuf>,
	cli: AgentConfigLayer,
) -> Result<AgentConfig, ConfigError> {
	let toml: Box<dyn ConfigSource> = match config_path {
		Some(path) => Box::new(TomlSource::new(path)),
		None => Box::new(TomlSource::system()),
	};
	load_from_sources(vec![
		Box::new(CliSource(cli)),
		Box::new(EnvSource::process()),
		toml,
		Box::new(DefaultsSource),
	])
}
