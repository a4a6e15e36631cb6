#![forbid(unsafe_code)]

//! Per-chat bindings of pool callbacks to speech and moderation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use streamtools_domain::{AccountName, ChannelName};
use streamtools_platform::ChatTransport;
use tracing::{info, warn};

use crate::audio::{PlaybackEngine, SettingsSource, VoiceSettings};
use crate::config::{ChatConfig, ConfigStore};
use crate::filters::AdminFilterChain;
use crate::pool::{Callback, CallbackId, CallbackSlot, ChatConnectionPool};

fn chat_identity(chat: &ChatConfig) -> Option<(AccountName, ChannelName)> {
	match (AccountName::new(&chat.account_username), ChannelName::new(&chat.channel)) {
		(Ok(account), Ok(channel)) => Some((account, channel)),
		_ => {
			warn!(account = %chat.account_username, channel = %chat.channel, "session: chat is missing account or channel");
			None
		}
	}
}

fn voice_settings(chat: &ChatConfig) -> VoiceSettings {
	VoiceSettings {
		voice: chat.tts_voice.clone(),
		volume: chat.tts_volume.min(100),
		device: chat.output_device.clone(),
	}
}

/// Voice settings for one chat, re-read from the store on every call.
pub fn chat_voice_settings(config: Arc<ConfigStore>, chat: &ChatConfig) -> SettingsSource {
	let fallback = voice_settings(chat);
	let account = chat.account_username.clone();
	let channel = chat.channel.clone();
	Arc::new(move || {
		config.read(|cfg| {
			cfg.chats
				.iter()
				.find(|c| c.account_username.eq_ignore_ascii_case(&account) && c.channel.eq_ignore_ascii_case(&channel))
				.map(voice_settings)
				.unwrap_or_else(|| fallback.clone())
		})
	})
}

/// Reads one chat aloud through a [`PlaybackEngine`].
pub struct TtsSession {
	pool: ChatConnectionPool,
	account: AccountName,
	channel: ChannelName,
	callback: CallbackId,
	engine: Arc<PlaybackEngine>,
}

impl TtsSession {
	/// `None` when the chat cannot be connected; the engine is shut down in that case.
	pub async fn start(pool: ChatConnectionPool, chat: &ChatConfig, engine: Arc<PlaybackEngine>) -> Option<Self> {
		let Some((account, channel)) = chat_identity(chat) else {
			shutdown_engine(engine).await;
			return None;
		};

		let sink = Arc::clone(&engine);
		let callback = Callback::message(move |msg| {
			sink.enqueue(msg.clone());
			Ok(())
		});

		let Some(callback) = pool.add_callback(&account, &channel, callback).await else {
			shutdown_engine(engine).await;
			return None;
		};

		info!(account = %account, channel = %channel, "tts: session started");
		Some(Self {
			pool,
			account,
			channel,
			callback,
			engine,
		})
	}

	pub fn engine(&self) -> &Arc<PlaybackEngine> {
		&self.engine
	}

	pub fn channel(&self) -> &ChannelName {
		&self.channel
	}

	fn client(&self) -> anyhow::Result<Arc<dyn ChatTransport>> {
		self.pool
			.get_connection_client(&self.channel)
			.with_context(|| format!("no connection for {}", self.channel))
	}

	/// Ban whoever is being read out right now. `false` when nobody is.
	pub async fn ban_current_speaker(&self, reason: Option<&str>) -> anyhow::Result<bool> {
		let Some(user) = self.engine.current_username() else {
			return Ok(false);
		};
		self.client()?.ban(&self.channel, &user, reason).await?;
		self.engine.skip_current();
		info!(channel = %self.channel, %user, "tts: current speaker banned");
		Ok(true)
	}

	pub async fn timeout_current_speaker(&self, duration: Duration, reason: Option<&str>) -> anyhow::Result<bool> {
		let Some(user) = self.engine.current_username() else {
			return Ok(false);
		};
		self.client()?.timeout(&self.channel, &user, duration, reason).await?;
		self.engine.skip_current();
		info!(channel = %self.channel, %user, secs = duration.as_secs(), "tts: current speaker timed out");
		Ok(true)
	}

	/// Detach from the pool and stop the engine.
	pub async fn stop(self) {
		self.pool
			.remove_callback(&self.account, &self.channel, CallbackSlot::Message, self.callback);
		shutdown_engine(self.engine).await;
		info!(account = %self.account, channel = %self.channel, "tts: session stopped");
	}
}

async fn shutdown_engine(engine: Arc<PlaybackEngine>) {
	if tokio::task::spawn_blocking(move || engine.shutdown()).await.is_err() {
		warn!("tts: engine shutdown task failed");
	}
}

/// Runs the admin filters in front of every message callback of one chat.
pub struct AdminSession {
	pool: ChatConnectionPool,
	account: AccountName,
	channel: ChannelName,
	callback: CallbackId,
}

impl AdminSession {
	/// `None` when `admin_on` is off or the chat cannot be connected.
	pub async fn start(pool: ChatConnectionPool, chat: &ChatConfig, chain: Arc<AdminFilterChain>) -> Option<Self> {
		if !chat.admin_on {
			return None;
		}
		let (account, channel) = chat_identity(chat)?;

		let judged = chat.clone();
		let callback = Callback::admin(move |transport, msg| match chain.rejected_by(&judged, transport, msg) {
			None => true,
			Some(filter) => {
				metrics::counter!("streamtools_admin_rejections_total", "filter" => filter).increment(1);
				info!(channel = %msg.channel, user = %msg.username, filter, "admin: message rejected");
				false
			}
		});

		let callback = pool.add_callback(&account, &channel, callback).await?;
		info!(account = %account, channel = %channel, "admin: session started");
		Some(Self {
			pool,
			account,
			channel,
			callback,
		})
	}

	pub fn stop(self) {
		self.pool
			.remove_callback(&self.account, &self.channel, CallbackSlot::Admin, self.callback);
		info!(account = %self.account, channel = %self.channel, "admin: session stopped");
	}
}
