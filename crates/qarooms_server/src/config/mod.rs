#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

/// Default listen endpoint for the public HTTP/WebSocket server.
pub const DEFAULT_HTTP_BIND: &str = "http://127.0.0.1:8080";

/// Default config path: `~/.qarooms/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".qarooms").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub hub: HubSettings,
	pub persistence: PersistenceSettings,
}

/// Listener settings.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Public HTTP/WebSocket endpoint (`http://host:port`); the CLI `--bind` wins.
	pub http_bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

/// Fan-out settings.
#[derive(Debug, Clone)]
pub struct HubSettings {
	/// Frames buffered per subscriber before it is considered too slow and dropped.
	pub subscriber_queue_capacity: usize,
	pub debug_logs: bool,
}

impl Default for HubSettings {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

/// Persistence settings.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (sqlite: or postgres:). In-memory store when unset.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	hub: FileHubSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	http_bind: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileHubSettings {
	subscriber_queue_capacity: Option<usize>,
	debug_logs: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = HubSettings::default();

		Self {
			server: ServerSettings {
				http_bind: file.server.http_bind.filter(|s| !s.trim().is_empty()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			},
			hub: HubSettings {
				subscriber_queue_capacity: file
					.hub
					.subscriber_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.subscriber_queue_capacity),
				debug_logs: file.hub.debug_logs.unwrap_or(defaults.debug_logs),
			},
			persistence: PersistenceSettings {
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => parse_toml(&s).map(Some),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn non_empty(v: String) -> Option<String> {
	let v = v.trim().to_string();
	if v.is_empty() { None } else { Some(v) }
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	if let Some(v) = env("QAROOMS_HTTP_BIND").and_then(non_empty) {
		cfg.server.http_bind = Some(v);
		info!("server config: http_bind overridden by env");
	}

	if let Some(v) = env("QAROOMS_METRICS_BIND").and_then(non_empty) {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env("QAROOMS_HEALTH_BIND").and_then(non_empty) {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = env("QAROOMS_DATABASE_URL").and_then(non_empty) {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = env("QAROOMS_SUBSCRIBER_QUEUE_CAPACITY") {
		match v.trim().parse::<usize>() {
			Ok(capacity) if capacity > 0 => {
				cfg.hub.subscriber_queue_capacity = capacity;
				info!(capacity, "hub config: subscriber_queue_capacity overridden by env");
			}
			_ => warn!(value = %v, "hub config: ignoring invalid QAROOMS_SUBSCRIBER_QUEUE_CAPACITY"),
		}
	}

	if let Some(v) = env("QAROOMS_HUB_DEBUG_LOGS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.hub.debug_logs = enabled;
		info!(enabled, "hub config: debug_logs overridden by env");
	}
}
