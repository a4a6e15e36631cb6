#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};


pub const DEFAULT_CLIENT_ID: &str = "7cpdxe88x0bjscf77hvglg9ebp0k3h";
pub const DEFAULT_REFRESH_URL: &str = "https://www.nullinside.com/api/v1/twitch/cathy-desktop/oauth/refresh";

/// Default config path: `<config dir>/streamtools/config.toml`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
	let base = dirs::config_dir()
		.or_else(|| dirs::home_dir().map(|h| h.join(".config")))
		.ok_or(ConfigError::NoConfigDir)?;
	Ok(base.join("streamtools").join("config.toml"))
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("could not determine config directory")]
	NoConfigDir,
	#[error("read config {path}: {source}")]
	Read { path: PathBuf, source: std::io::Error },
	#[error("parse config {path}: {source}")]
	Parse { path: PathBuf, source: toml::de::Error },
	#[error("serialize config: {0}")]
	Serialize(#[from] toml::ser::Error),
	#[error("write config {path}: {source}")]
	Write { path: PathBuf, source: std::io::Error },
}

/// A Twitch login with its stored OAuth tokens.
///
/// Tokens are kept base64-encoded on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Account {
	pub username: String,
	pub api_oauth: Option<String>,
	pub api_oauth_refresh: Option<String>,
	pub api_oauth_expires: Option<DateTime<Utc>>,
	pub is_users_streaming_account: bool,
}

/// One monitored channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
	pub account_username: String,
	pub channel: String,
	pub tts_on: bool,
	pub tts_voice: Option<String>,
	/// 0..=100
	pub tts_volume: u32,
	pub output_device: Option<String>,
	/// Pause speech while the microphone picks up the streamer.
	pub pause_during_speech: bool,
	pub admin_on: bool,
}

impl Default for ChatConfig {
	fn default() -> Self {
		Self {
			account_username: String::new(),
			channel: String::new(),
			tts_on: false,
			tts_voice: None,
			tts_volume: 50,
			output_device: None,
			pause_during_speech: false,
			admin_on: false,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoneticEntry {
	pub key: String,
	pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelPointSound {
	/// Reward title, matched case-insensitively.
	pub name: String,
	pub filename: String,
	pub volume: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeystrokeCommand {
	pub key_code: Option<i32>,
	pub command: String,
	pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwitchSettings {
	pub client_id: String,
	pub refresh_url: String,
	pub chat_ws_url: String,
	pub pubsub_ws_url: String,
	pub helix_base_url: String,
}

impl Default for TwitchSettings {
	fn default() -> Self {
		Self {
			client_id: DEFAULT_CLIENT_ID.to_string(),
			refresh_url: DEFAULT_REFRESH_URL.to_string(),
			chat_ws_url: "wss://irc-ws.chat.twitch.tv:443".to_string(),
			pubsub_ws_url: "wss://pubsub-edge.twitch.tv".to_string(),
			helix_base_url: "https://api.twitch.tv".to_string(),
		}
	}
}

/// Persisted application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
	pub accounts: Vec<Account>,
	pub chats: Vec<ChatConfig>,
	pub tts_phonetic_usernames: Vec<PhoneticEntry>,
	pub tts_usernames_to_skip: Vec<String>,
	pub channel_point_sounds: Vec<ChannelPointSound>,
	pub channel_point_sounds_master_volume: u32,
	pub channel_point_output_device: Option<String>,
	pub keystroke_commands: Vec<KeystrokeCommand>,
	/// Input device name.
	pub microphone: Option<String>,
	pub pause_threshold: i32,
	pub twitch: TwitchSettings,
	pub emoji_allowlist_path: Option<PathBuf>,
}

impl Default for Configuration {
	fn default() -> Self {
		Self {
			accounts: Vec::new(),
			chats: Vec::new(),
			tts_phonetic_usernames: Vec::new(),
			tts_usernames_to_skip: Vec::new(),
			channel_point_sounds: Vec::new(),
			channel_point_sounds_master_volume: 100,
			channel_point_output_device: None,
			keystroke_commands: Vec::new(),
			microphone: None,
			pause_threshold: 30,
			twitch: TwitchSettings::default(),
			emoji_allowlist_path: None,
		}
	}
}

impl Configuration {
	/// Case-insensitive account lookup.
	pub fn get_account(&self, username: &str) -> Option<&Account> {
		let username = username.trim();
		self.accounts.iter().find(|a| a.username.eq_ignore_ascii_case(username))
	}

	pub fn get_account_mut(&mut self, username: &str) -> Option<&mut Account> {
		let username = username.trim();
		self.accounts.iter_mut().find(|a| a.username.eq_ignore_ascii_case(username))
	}

	pub fn streaming_account(&self) -> Option<&Account> {
		self.accounts.iter().find(|a| a.is_users_streaming_account)
	}

	pub fn pause_threshold_clamped(&self) -> i32 {
		self.pause_threshold.clamp(0, 100)
	}
}

/// Values taken from the environment at load time. Applied on read, never persisted.
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
	client_id: Option<String>,
	refresh_url: Option<String>,
	chat_ws_url: Option<String>,
	pubsub_ws_url: Option<String>,
	helix_base_url: Option<String>,
	emoji_allowlist_path: Option<PathBuf>,
}

fn env_nonempty(key: &str) -> Option<String> {
	std::env::var(key)
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
}

fn read_env_overrides() -> EnvOverrides {
	let mut o = EnvOverrides::default();

	if let Some(v) = env_nonempty("STREAMTOOLS_TWITCH_CLIENT_ID") {
		o.client_id = Some(v);
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = env_nonempty("STREAMTOOLS_TWITCH_REFRESH_URL") {
		o.refresh_url = Some(v);
		info!("twitch config: refresh_url overridden by env");
	}

	if let Some(v) = env_nonempty("STREAMTOOLS_TWITCH_CHAT_WS_URL") {
		o.chat_ws_url = Some(v);
		info!("twitch config: chat_ws_url overridden by env");
	}

	if let Some(v) = env_nonempty("STREAMTOOLS_TWITCH_PUBSUB_WS_URL") {
		o.pubsub_ws_url = Some(v);
		info!("twitch config: pubsub_ws_url overridden by env");
	}

	if let Some(v) = env_nonempty("STREAMTOOLS_TWITCH_HELIX_URL") {
		o.helix_base_url = Some(v);
		info!("twitch config: helix_base_url overridden by env");
	}

	if let Some(v) = env_nonempty("STREAMTOOLS_EMOJI_ALLOWLIST") {
		o.emoji_allowlist_path = Some(PathBuf::from(v));
		info!("emoji config: allowlist path overridden by env");
	}

	o
}

fn read_toml_if_exists(path: &Path) -> Result<Option<Configuration>, ConfigError> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: Configuration = toml::from_str(&s).map_err(|source| ConfigError::Parse {
				path: path.to_path_buf(),
				source,
			})?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(source) => Err(ConfigError::Read {
			path: path.to_path_buf(),
			source,
		}),
	}
}

/// Shared, mutable configuration snapshot backed by a TOML file.
///
/// Every mutation rewrites the whole file synchronously on the calling thread.
#[derive(Debug)]
pub struct ConfigStore {
	path: Option<PathBuf>,
	inner: RwLock<Configuration>,
	env: EnvOverrides,
}

impl ConfigStore {
	/// Read-or-default: a missing file yields the defaults.
	pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
		let path = path.into();
		let cfg = match read_toml_if_exists(&path)? {
			Some(cfg) => {
				info!(path = %path.display(), accounts = cfg.accounts.len(), chats = cfg.chats.len(), "config loaded");
				cfg
			}
			None => {
				info!(path = %path.display(), "no config file; using defaults");
				Configuration::default()
			}
		};

		let mut cfg = cfg;
		if cfg.pause_threshold != cfg.pause_threshold_clamped() {
			warn!(threshold = cfg.pause_threshold, "config: pause_threshold out of range; clamping");
			cfg.pause_threshold = cfg.pause_threshold_clamped();
		}

		Ok(Self {
			path: Some(path),
			inner: RwLock::new(cfg),
			env: read_env_overrides(),
		})
	}

	/// Store without a backing file; writes are no-ops.
	pub fn in_memory(cfg: Configuration) -> Self {
		Self {
			path: None,
			inner: RwLock::new(cfg),
			env: EnvOverrides::default(),
		}
	}

	pub fn path(&self) -> Option<&Path> {
		self.path.as_deref()
	}

	pub fn snapshot(&self) -> Configuration {
		self.inner.read().clone()
	}

	pub fn read<R>(&self, f: impl FnOnce(&Configuration) -> R) -> R {
		f(&self.inner.read())
	}

	/// Mutate under the write lock, then persist the whole object.
	pub fn update<R>(&self, f: impl FnOnce(&mut Configuration) -> R) -> Result<R, ConfigError> {
		let (out, serialized) = {
			let mut guard = self.inner.write();
			let out = f(&mut guard);
			(out, toml::to_string_pretty(&*guard)?)
		};
		self.write_serialized(&serialized)?;
		Ok(out)
	}

	/// Persist the current snapshot.
	pub fn write(&self) -> Result<(), ConfigError> {
		let serialized = toml::to_string_pretty(&*self.inner.read())?;
		self.write_serialized(&serialized)
	}

	fn write_serialized(&self, serialized: &str) -> Result<(), ConfigError> {
		let Some(path) = self.path.as_deref() else {
			return Ok(());
		};

		if let Some(dir) = path.parent()
			&& !dir.as_os_str().is_empty()
		{
			fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
				path: dir.to_path_buf(),
				source,
			})?;
		}

		fs::write(path, serialized).map_err(|source| ConfigError::Write {
			path: path.to_path_buf(),
			source,
		})?;
		debug!(path = %path.display(), "config written");
		Ok(())
	}

	/// Case-insensitive account lookup (cloned).
	pub fn get_account(&self, username: &str) -> Option<Account> {
		self.inner.read().get_account(username).cloned()
	}

	/// Twitch endpoints with env overrides applied.
	pub fn twitch(&self) -> TwitchSettings {
		let mut t = self.inner.read().twitch.clone();
		if let Some(v) = &self.env.client_id {
			t.client_id = v.clone();
		}
		if let Some(v) = &self.env.refresh_url {
			t.refresh_url = v.clone();
		}
		if let Some(v) = &self.env.chat_ws_url {
			t.chat_ws_url = v.clone();
		}
		if let Some(v) = &self.env.pubsub_ws_url {
			t.pubsub_ws_url = v.clone();
		}
		if let Some(v) = &self.env.helix_base_url {
			t.helix_base_url = v.clone();
		}
		t
	}

	pub fn emoji_allowlist_path(&self) -> Option<PathBuf> {
		self.env
			.emoji_allowlist_path
			.clone()
			.or_else(|| self.inner.read().emoji_allowlist_path.clone())
	}
}
