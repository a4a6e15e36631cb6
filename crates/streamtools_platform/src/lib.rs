#![forbid(unsafe_code)]

pub mod assets;
pub mod twitch;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use streamtools_domain::{AccountName, ChannelName};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Wrapper that redacts in logs.
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

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
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

/// Emote reference attached to a chat message by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmoteRef {
	pub id: String,
	pub name: String,
}

/// Normalized chat message.
#[derive(Debug, Clone)]
pub struct ChatMessage {
	/// Platform message id, if provided.
	pub id: Option<String>,

	pub channel: ChannelName,

	/// Numeric channel id (`room-id` tag).
	pub room_id: String,

	pub user_id: String,

	/// Lowercase login of the sender.
	pub username: String,

	pub display_name: String,

	pub text: String,

	/// Platform emotes present in the message.
	pub emotes: Vec<EmoteRef>,

	pub received_at: SystemTime,
}

impl ChatMessage {
	pub fn new(channel: ChannelName, username: impl Into<String>, text: impl Into<String>) -> Self {
		let username = username.into();
		Self {
			id: None,
			channel,
			room_id: String::new(),
			user_id: String::new(),
			display_name: username.clone(),
			username: username.to_lowercase(),
			text: text.into(),
			emotes: Vec::new(),
			received_at: SystemTime::now(),
		}
	}

	pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
		self.display_name = display_name.into();
		self
	}
}

/// Another channel started hosting the watched channel.
#[derive(Debug, Clone)]
pub struct HostEvent {
	pub channel: ChannelName,
	pub hosted_by: String,
	pub viewers: u64,
}

/// Incoming raid on the watched channel.
#[derive(Debug, Clone)]
pub struct RaidEvent {
	pub channel: ChannelName,
	pub from_login: String,
	pub from_display: String,
	pub viewers: u64,
}

/// New follower, delivered over Pub/Sub.
#[derive(Debug, Clone)]
pub struct FollowEvent {
	/// Channel that was followed.
	pub channel_id: String,
	pub user_id: String,
	pub username: String,
	pub display_name: String,
}

/// Channel-point reward redemption, delivered over Pub/Sub.
#[derive(Debug, Clone)]
pub struct RedemptionEvent {
	pub channel_id: String,
	pub redemption_id: String,
	pub reward_id: String,
	pub reward_title: String,
	pub user_login: String,
	pub user_display: String,
	pub user_input: Option<String>,
}

/// Events raised by a chat transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
	Message(ChatMessage),
	Host(HostEvent),
	Raid(RaidEvent),
}

/// Snapshot of a transport's connection state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportState {
	pub connected: bool,
	pub joined: BTreeSet<ChannelName>,
}

/// Transport failures surfaced to callers.
#[derive(Debug, Error)]
pub enum TransportError {
	#[error("transport not initialized")]
	NotInitialized,
	#[error("transport not connected")]
	NotConnected,
	#[error("transport session closed")]
	Closed,
}

/// Login credentials for a chat transport.
#[derive(Debug, Clone)]
pub struct ChatCredentials {
	pub username: AccountName,
	pub token: SecretString,
}

/// Hands out bearer tokens for configured accounts.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync + 'static {
	/// `None` means no API access for this account right now.
	async fn access_token(&self, username: &AccountName) -> Option<SecretString>;
}

/// Narrow command surface of a chat protocol client.
#[async_trait::async_trait]
pub trait ChatTransport: Send + Sync + 'static {
	fn username(&self) -> &AccountName;

	/// Credentials and initial channel have been supplied.
	fn is_initialized(&self) -> bool;

	fn is_connected(&self) -> bool;

	fn joined_channels(&self) -> Vec<ChannelName>;

	/// Watch connection state changes.
	fn state(&self) -> watch::Receiver<TransportState>;

	/// Open the session and join the initial channel.
	async fn connect(&self) -> anyhow::Result<()>;

	/// Drop any current session and open a fresh one.
	async fn reconnect(&self) -> anyhow::Result<()>;

	async fn join(&self, channel: &ChannelName) -> anyhow::Result<()>;

	async fn send_message(&self, channel: &ChannelName, text: &str) -> anyhow::Result<()>;

	async fn ban(&self, channel: &ChannelName, user: &str, reason: Option<&str>) -> anyhow::Result<()>;

	async fn timeout(
		&self,
		channel: &ChannelName,
		user: &str,
		duration: Duration,
		reason: Option<&str>,
	) -> anyhow::Result<()>;

	async fn disconnect(&self);
}

/// A freshly built transport plus its event stream.
pub struct TransportHandle {
	pub transport: Arc<dyn ChatTransport>,
	pub events_rx: mpsc::Receiver<TransportEvent>,
}

impl fmt::Debug for TransportHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TransportHandle")
			.field("username", self.transport.username())
			.finish_non_exhaustive()
	}
}

/// Builds transports. Must not perform network I/O.
pub trait TransportFactory: Send + Sync + 'static {
	fn create(&self, credentials: ChatCredentials, channel: ChannelName) -> TransportHandle;
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}

/// Exponential backoff clamped to `[min, max]`.
pub fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
	d.min(max).max(min)
}
