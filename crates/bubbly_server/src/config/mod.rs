#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use bubbly_protocol::DEFAULT_MAX_FRAME_SIZE;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::pagination::PageLimits;

/// Default config path: `~/.bubbly/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".bubbly").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// String that never shows up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Server config.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
	pub chat: ChatSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// HTTP/WebSocket bind address (host:port).
	pub bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HMAC secret for stateless access tokens. Without it every caller is anonymous.
	pub auth_hmac_secret: Option<SecretString>,
	/// Maximum number of queued frames per connection.
	pub subscriber_queue_capacity: usize,
	/// Maximum inbound and outbound frame size in bytes.
	pub max_frame_bytes: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: "127.0.0.1:8080".to_string(),
			metrics_bind: None,
			auth_hmac_secret: None,
			subscriber_queue_capacity: 256,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// `sqlite:` URL; `None` keeps everything in memory.
	pub database_url: Option<String>,
}

/// Listing sizes and chat policy.
#[derive(Debug, Clone)]
pub struct ChatSettings {
	pub history_page_default: usize,
	pub history_page_cap: usize,
	pub members_page_default: usize,
	pub rooms_page_default: usize,
	pub explore_page_default: usize,
	/// Cap shared by member and room listings.
	pub page_cap: usize,
	/// Record a visitant community row on first public-room access checks.
	pub auto_provision_visitants: bool,
}

impl Default for ChatSettings {
	fn default() -> Self {
		Self {
			history_page_default: 20,
			history_page_cap: 100,
			members_page_default: 20,
			rooms_page_default: 15,
			explore_page_default: 5,
			page_cap: 100,
			auto_provision_visitants: false,
		}
	}
}

impl ChatSettings {
	pub fn history_limits(&self) -> PageLimits {
		PageLimits::new(self.history_page_default, self.history_page_cap)
	}

	pub fn members_limits(&self) -> PageLimits {
		PageLimits::new(self.members_page_default, self.page_cap)
	}

	pub fn rooms_limits(&self) -> PageLimits {
		PageLimits::new(self.rooms_page_default, self.page_cap)
	}

	pub fn explore_limits(&self) -> PageLimits {
		PageLimits::new(self.explore_page_default, self.page_cap)
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	chat: FileChatSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	subscriber_queue_capacity: Option<usize>,
	max_frame_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileChatSettings {
	history_page_default: Option<usize>,
	history_page_cap: Option<usize>,
	members_page_default: Option<usize>,
	rooms_page_default: Option<usize>,
	explore_page_default: Option<usize>,
	page_cap: Option<usize>,
	auto_provision_visitants: Option<bool>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let server_defaults = ServerSettings::default();
		let chat_defaults = ChatSettings::default();

		Self {
			server: ServerSettings {
				bind: file
					.server
					.bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(server_defaults.bind),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				subscriber_queue_capacity: file
					.server
					.subscriber_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(server_defaults.subscriber_queue_capacity),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(server_defaults.max_frame_bytes),
			},
			persistence: PersistenceSettings {
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
			chat: ChatSettings {
				history_page_default: file
					.chat
					.history_page_default
					.filter(|v| *v > 0)
					.unwrap_or(chat_defaults.history_page_default),
				history_page_cap: file
					.chat
					.history_page_cap
					.filter(|v| *v > 0)
					.unwrap_or(chat_defaults.history_page_cap),
				members_page_default: file
					.chat
					.members_page_default
					.filter(|v| *v > 0)
					.unwrap_or(chat_defaults.members_page_default),
				rooms_page_default: file
					.chat
					.rooms_page_default
					.filter(|v| *v > 0)
					.unwrap_or(chat_defaults.rooms_page_default),
				explore_page_default: file
					.chat
					.explore_page_default
					.filter(|v| *v > 0)
					.unwrap_or(chat_defaults.explore_page_default),
				page_cap: file.chat.page_cap.filter(|v| *v > 0).unwrap_or(chat_defaults.page_cap),
				auto_provision_visitants: file
					.chat
					.auto_provision_visitants
					.unwrap_or(chat_defaults.auto_provision_visitants),
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
		Ok(s) => Ok(Some(parse_config(&s)?)),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_config(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("BUBBLY_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.bind = v;
			info!("server config: bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("BUBBLY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("BUBBLY_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretString::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("BUBBLY_SUBSCRIBER_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.server.subscriber_queue_capacity = capacity;
		info!(capacity, "server config: subscriber_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("BUBBLY_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("BUBBLY_AUTO_PROVISION_VISITANTS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.chat.auto_provision_visitants = enabled;
		info!(enabled, "chat config: auto_provision_visitants overridden by env");
	}

	if let Ok(v) = std::env::var("BUBBLY_HISTORY_PAGE_CAP")
		&& let Ok(cap) = v.trim().parse::<usize>()
		&& cap > 0
	{
		cfg.chat.history_page_cap = cap;
		info!(cap, "chat config: history_page_cap overridden by env");
	}

	if cfg.server.auth_hmac_secret.is_none() {
		warn!("server auth: no auth_hmac_secret configured; every caller is anonymous");
	}

	if cfg.chat.history_page_default > cfg.chat.history_page_cap {
		warn!(
			default = cfg.chat.history_page_default,
			cap = cfg.chat.history_page_cap,
			"chat config: history_page_default exceeds history_page_cap; clamping"
		);
		cfg.chat.history_page_default = cfg.chat.history_page_cap;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_file_gives_defaults() {
		let cfg = ServerConfig::from_file(parse_config("").unwrap());
		assert_eq!(cfg.server.bind, "127.0.0.1:8080");
		assert_eq!(cfg.server.max_frame_bytes, DEFAULT_MAX_FRAME_SIZE);
		assert!(cfg.persistence.database_url.is_none());
		assert_eq!(cfg.chat.history_limits(), PageLimits::new(20, 100));
		assert_eq!(cfg.chat.rooms_limits().default, 15);
		assert_eq!(cfg.chat.explore_limits().default, 5);
		assert!(!cfg.chat.auto_provision_visitants);
	}

	#[test]
	fn file_values_are_read_and_blank_strings_ignored() {
		let cfg = ServerConfig::from_file(
			parse_config(
				r#"
				[server]
				bind = "0.0.0.0:9000"
				metrics_bind = " "
				auth_hmac_secret = "s3cret"
				subscriber_queue_capacity = 8

				[persistence]
				database_url = "sqlite://bubbly.db"

				[chat]
				history_page_cap = 50
				auto_provision_visitants = true
				"#,
			)
			.unwrap(),
		);

		assert_eq!(cfg.server.bind, "0.0.0.0:9000");
		assert!(cfg.server.metrics_bind.is_none());
		assert_eq!(cfg.server.auth_hmac_secret.as_ref().map(|s| s.expose()), Some("s3cret"));
		assert_eq!(cfg.server.subscriber_queue_capacity, 8);
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("sqlite://bubbly.db"));
		assert_eq!(cfg.chat.history_page_cap, 50);
		assert!(cfg.chat.auto_provision_visitants);
	}

	#[test]
	fn secrets_are_redacted() {
		let secret = SecretString::new("hunter2");
		assert_eq!(format!("{secret}"), "<redacted>");
		assert!(!format!("{secret:?}").contains("hunter2"));
	}

	#[test]
	fn env_bool_parsing() {
		assert_eq!(parse_env_bool(" YES "), Some(true));
		assert_eq!(parse_env_bool("off"), Some(false));
		assert_eq!(parse_env_bool("maybe"), None);
	}
}
