#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use liveboard_twitch::SecretString;
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.liveboard/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".liveboard").join("config.toml"))
}

/// Default data dir: `~/.liveboard` (groups.json and cache/ live here).
pub fn default_data_dir() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".liveboard"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	/// Public hostname this deployment is reachable under; the webhook
	/// callback is derived from it.
	pub hostname: Option<String>,
	/// Password for membership mutation routes; unset disables them.
	pub modify_password: Option<SecretString>,
	pub server: ServerSettings,
	pub twitch: TwitchSettings,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// HTTP bind address override (host:port).
	pub bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Directory holding groups.json and the cache documents.
	pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct TwitchSettings {
	/// Twitch App Client ID.
	pub client_id: Option<String>,
	/// Twitch app access token (bearer) for all Helix calls.
	pub bearer_token: Option<SecretString>,
	/// Shared secret for the EventSub webhook transport.
	pub subscription_secret: Option<SecretString>,
	/// Helix base URL (optional override).
	pub helix_base_url: Option<String>,
	/// Verify inbound webhook signatures (default true).
	pub verify_signatures: bool,
}

impl ServerConfig {
	/// Webhook callback this deployment registers with the platform.
	pub fn callback_url(&self) -> Option<String> {
		self.hostname.as_deref().map(|h| format!("https://{h}/api/webhook"))
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	hostname: Option<String>,
	modify_password: Option<String>,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	twitch: FileTwitchSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	data_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	bearer_token: Option<String>,
	subscription_secret: Option<String>,
	helix_base_url: Option<String>,
	verify_signatures: Option<bool>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		Self {
			hostname: file.hostname.filter(|s| !s.trim().is_empty()),
			modify_password: file.modify_password.filter(|s| !s.trim().is_empty()).map(SecretString::new),
			server: ServerSettings {
				bind: file.server.bind.filter(|s| !s.trim().is_empty()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				data_dir: file.server.data_dir.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
			},
			twitch: TwitchSettings {
				client_id: file.twitch.client_id.filter(|s| !s.trim().is_empty()),
				bearer_token: file
					.twitch
					.bearer_token
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				subscription_secret: file
					.twitch
					.subscription_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				helix_base_url: file.twitch.helix_base_url.filter(|s| !s.trim().is_empty()),
				verify_signatures: file.twitch.verify_signatures.unwrap_or(true),
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
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("LIVEBOARD_HOSTNAME") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.hostname = Some(v);
			info!("server config: hostname overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LIVEBOARD_MODIFY_PASSWORD") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.modify_password = Some(SecretString::new(v));
			info!("server config: modify_password overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LIVEBOARD_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.bind = Some(v);
			info!("server config: bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LIVEBOARD_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LIVEBOARD_DATA_DIR") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.data_dir = Some(PathBuf::from(v));
			info!("server config: data_dir overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LIVEBOARD_TWITCH_CLIENT_ID") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.twitch.client_id = Some(v);
			info!("twitch config: client_id overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LIVEBOARD_TWITCH_BEARER_TOKEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.twitch.bearer_token = Some(SecretString::new(v));
			info!("twitch config: bearer_token overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LIVEBOARD_SUBSCRIPTION_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.twitch.subscription_secret = Some(SecretString::new(v));
			info!("twitch config: subscription_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LIVEBOARD_TWITCH_HELIX_BASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.twitch.helix_base_url = Some(v);
			info!("twitch config: helix_base_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LIVEBOARD_VERIFY_SIGNATURES")
		&& let Some(verify) = parse_env_bool(&v)
	{
		cfg.twitch.verify_signatures = verify;
		info!(verify, "twitch config: verify_signatures overridden by env");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_file_yields_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let cfg = load_server_config_from_path(&dir.path().join("config.toml")).unwrap();
		assert!(cfg.hostname.is_none());
		assert!(cfg.modify_password.is_none());
		assert!(cfg.twitch.verify_signatures);
	}

	#[test]
	fn parses_full_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.toml");
		fs::write(
			&path,
			r#"
hostname = "live.example.com"
modify_password = "hunter2"

[server]
bind = "0.0.0.0:3001"
metrics_bind = "127.0.0.1:9100"
data_dir = "/var/lib/liveboard"

[twitch]
client_id = "abc"
bearer_token = "tok"
subscription_secret = "sekrit"
verify_signatures = false
"#,
		)
		.unwrap();

		let cfg = load_server_config_from_path(&path).unwrap();
		assert_eq!(cfg.callback_url().as_deref(), Some("https://live.example.com/api/webhook"));
		assert_eq!(cfg.server.bind.as_deref(), Some("0.0.0.0:3001"));
		assert_eq!(cfg.server.data_dir.as_deref(), Some(Path::new("/var/lib/liveboard")));
		assert_eq!(cfg.twitch.client_id.as_deref(), Some("abc"));
		assert_eq!(cfg.twitch.bearer_token.as_ref().map(|s| s.expose()), Some("tok"));
		assert!(!cfg.twitch.verify_signatures);
	}

	#[test]
	fn blank_strings_count_as_unset() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.toml");
		fs::write(&path, "hostname = \"  \"\nmodify_password = \"\"\n").unwrap();

		let cfg = load_server_config_from_path(&path).unwrap();
		assert!(cfg.hostname.is_none());
		assert!(cfg.modify_password.is_none());
	}
}
