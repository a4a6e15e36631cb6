#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use streamtools_domain::{AccountName, ChannelName};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::helix::HelixClient;
use super::irc::{IrcMessage, to_transport_event};
use crate::{
	ChatCredentials, ChatTransport, SecretString, TokenProvider, TransportError, TransportEvent, TransportFactory,
	TransportHandle, TransportState, new_session_id,
};

/// Chat transport configuration.
#[derive(Debug, Clone)]
pub struct TwitchChatConfig {
	pub client_id: String,
	pub chat_ws_url: String,
	pub helix_base_url: String,
	pub connect_timeout: Duration,
	pub event_buffer: usize,
}

impl TwitchChatConfig {
	pub fn new(client_id: impl Into<String>) -> Self {
		Self {
			client_id: client_id.into(),
			chat_ws_url: "wss://irc-ws.chat.twitch.tv:443".to_string(),
			helix_base_url: "https://api.twitch.tv".to_string(),
			connect_timeout: Duration::from_secs(10),
			event_buffer: 1024,
		}
	}
}

/// Builds [`TwitchIrcTransport`]s.
#[derive(Clone)]
pub struct TwitchTransportFactory {
	cfg: TwitchChatConfig,
	tokens: Option<Arc<dyn TokenProvider>>,
}

impl std::fmt::Debug for TwitchTransportFactory {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TwitchTransportFactory")
			.field("cfg", &self.cfg)
			.finish_non_exhaustive()
	}
}

impl TwitchTransportFactory {
	pub fn new(cfg: TwitchChatConfig) -> Self {
		Self { cfg, tokens: None }
	}

	/// Transports ask `tokens` for the account's token on every (re)connect and
	/// Helix call, falling back to the token they were created with.
	pub fn with_token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
		self.tokens = Some(tokens);
		self
	}
}

impl TransportFactory for TwitchTransportFactory {
	fn create(&self, credentials: ChatCredentials, channel: ChannelName) -> TransportHandle {
		let (events_tx, events_rx) = mpsc::channel(self.cfg.event_buffer.max(1));
		let mut transport = TwitchIrcTransport::new(self.cfg.clone(), credentials, channel, events_tx);
		transport.tokens = self.tokens.clone();
		TransportHandle {
			transport: Arc::new(transport),
			events_rx,
		}
	}
}

struct Session {
	outgoing: mpsc::UnboundedSender<String>,
	task: JoinHandle<()>,
}

impl Session {
	fn alive(&self) -> bool {
		!self.task.is_finished() && !self.outgoing.is_closed()
	}
}

/// Twitch chat over the IRC websocket gateway.
pub struct TwitchIrcTransport {
	cfg: TwitchChatConfig,
	credentials: ChatCredentials,
	tokens: Option<Arc<dyn TokenProvider>>,
	wanted: Arc<Mutex<BTreeSet<ChannelName>>>,
	state_tx: Arc<watch::Sender<TransportState>>,
	events_tx: mpsc::Sender<TransportEvent>,
	session: Mutex<Option<Session>>,
	generation: Arc<AtomicU64>,
	connect_lock: tokio::sync::Mutex<()>,
}

impl TwitchIrcTransport {
	pub fn new(
		cfg: TwitchChatConfig,
		credentials: ChatCredentials,
		channel: ChannelName,
		events_tx: mpsc::Sender<TransportEvent>,
	) -> Self {
		let (state_tx, _rx) = watch::channel(TransportState::default());
		let mut wanted = BTreeSet::new();
		wanted.insert(channel);

		Self {
			cfg,
			credentials,
			tokens: None,
			wanted: Arc::new(Mutex::new(wanted)),
			state_tx: Arc::new(state_tx),
			events_tx,
			session: Mutex::new(None),
			generation: Arc::new(AtomicU64::new(0)),
			connect_lock: tokio::sync::Mutex::new(()),
		}
	}

	fn send_line(&self, line: String) -> anyhow::Result<()> {
		let guard = self.session.lock();
		let session = guard.as_ref().filter(|s| s.alive()).ok_or(TransportError::NotConnected)?;
		session.outgoing.send(line).map_err(|_| TransportError::Closed)?;
		Ok(())
	}

	async fn current_token(&self) -> SecretString {
		if let Some(tokens) = &self.tokens
			&& let Some(fresh) = tokens.access_token(&self.credentials.username).await
		{
			return fresh;
		}
		self.credentials.token.clone()
	}

	async fn helix(&self) -> anyhow::Result<HelixClient> {
		HelixClient::new(&self.cfg.helix_base_url, &self.cfg.client_id, self.current_token().await)
	}

	async fn moderate_via_helix(
		&self,
		channel: &ChannelName,
		user: &str,
		duration_seconds: Option<u32>,
		reason: Option<&str>,
	) -> anyhow::Result<()> {
		let helix = self.helix().await?;
		let broadcaster = helix
			.get_user_by_login(channel.as_str())
			.await?
			.with_context(|| format!("unknown channel {channel}"))?;
		let moderator = helix
			.get_user_by_login(&self.credentials.username.login())
			.await?
			.with_context(|| format!("unknown account {}", self.credentials.username))?;
		let target = helix
			.get_user_by_login(&user.to_lowercase())
			.await?
			.with_context(|| format!("unknown user {user}"))?;

		helix
			.ban_user(&broadcaster.id, &moderator.id, &target.id, duration_seconds, reason)
			.await
	}

	async fn moderate(
		&self,
		channel: &ChannelName,
		user: &str,
		duration_seconds: Option<u32>,
		reason: Option<&str>,
	) -> anyhow::Result<()> {
		match self.moderate_via_helix(channel, user, duration_seconds, reason).await {
			Ok(()) => Ok(()),
			Err(e) => {
				warn!(%channel, user, error = %e, "helix moderation failed; falling back to chat command");
				let command = match duration_seconds {
					Some(secs) => format!("/timeout {user} {secs} {}", reason.unwrap_or_default()),
					None => format!("/ban {user} {}", reason.unwrap_or_default()),
				};
				self.send_line(format!("PRIVMSG {} :{}", channel.irc(), command.trim_end()))
			}
		}
	}
}

fn handshake_lines(token: &SecretString, login: &str) -> [String; 3] {
	let token = token.expose().trim_start_matches("oauth:");
	[
		"CAP REQ :twitch.tv/tags twitch.tv/commands".to_string(),
		format!("PASS oauth:{token}"),
		format!("NICK {login}"),
	]
}

struct SessionCtx {
	login: String,
	generation: u64,
	current_generation: Arc<AtomicU64>,
	wanted: Arc<Mutex<BTreeSet<ChannelName>>>,
	state_tx: Arc<watch::Sender<TransportState>>,
	events_tx: mpsc::Sender<TransportEvent>,
}

impl SessionCtx {
	fn is_current(&self) -> bool {
		self.current_generation.load(Ordering::SeqCst) == self.generation
	}
}

type TwitchWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn run_session(ctx: SessionCtx, ws: TwitchWs, mut outgoing_rx: mpsc::UnboundedReceiver<String>) {
	let session_id = new_session_id();
	let (mut sink, mut stream) = ws.split();
	info!(login = %ctx.login, %session_id, "chat session started");

	'session: loop {
		tokio::select! {
			line = outgoing_rx.recv() => {
				let Some(line) = line else {
					let _ = sink.close().await;
					break;
				};
				if let Err(e) = sink.send(Message::text(line)).await {
					warn!(login = %ctx.login, error = %e, "chat ws write error");
					break;
				}
			}

			msg = stream.next() => {
				let Some(msg) = msg else {
					info!(login = %ctx.login, "chat ws ended");
					break;
				};

				let msg = match msg {
					Ok(m) => m,
					Err(e) => {
						warn!(login = %ctx.login, error = %e, "chat ws read error");
						break;
					}
				};

				match msg {
					Message::Text(t) => {
						for line in t.split("\r\n").filter(|l| !l.is_empty()) {
							let parsed = IrcMessage::parse(line);
							match handle_line(&ctx, &parsed) {
								LineAction::Continue => {}
								LineAction::Forward(ev) => {
									// Backpressure onto the socket read; chat lines are never dropped.
									if ctx.events_tx.send(ev).await.is_err() {
										debug!(login = %ctx.login, "chat event receiver gone");
										let _ = sink.close().await;
										break 'session;
									}
								}
								LineAction::Reply(reply) => {
									if sink.send(Message::text(reply)).await.is_err() {
										break 'session;
									}
								}
								LineAction::JoinWanted => {
									let wanted: Vec<ChannelName> = ctx.wanted.lock().iter().cloned().collect();
									for channel in wanted {
										if sink.send(Message::text(format!("JOIN {}", channel.irc()))).await.is_err() {
											break 'session;
										}
									}
								}
								LineAction::Close => {
									let _ = sink.close().await;
									break 'session;
								}
							}
						}
					}
					Message::Ping(p) => {
						let _ = sink.send(Message::Pong(p)).await;
					}
					Message::Close(frame) => {
						info!(login = %ctx.login, ?frame, "chat ws closed");
						break;
					}
					_ => {}
				}
			}
		}
	}

	if ctx.is_current() {
		ctx.state_tx.send_replace(TransportState::default());
	}
	debug!(login = %ctx.login, %session_id, "chat session finished");
}

enum LineAction {
	Continue,
	Forward(TransportEvent),
	Reply(String),
	JoinWanted,
	Close,
}

fn handle_line(ctx: &SessionCtx, msg: &IrcMessage<'_>) -> LineAction {
	match msg.command {
		Some("PING") => {
			let target = msg.params.first().copied().unwrap_or("tmi.twitch.tv");
			LineAction::Reply(format!("PONG :{target}"))
		}
		Some("001") => {
			info!(login = %ctx.login, "chat authenticated");
			if ctx.is_current() {
				ctx.state_tx.send_modify(|s| s.connected = true);
			}
			LineAction::JoinWanted
		}
		Some("JOIN") if msg.prefix_nick().is_some_and(|n| n.eq_ignore_ascii_case(&ctx.login)) => {
			if let Some(channel) = msg.channel() {
				info!(login = %ctx.login, %channel, "joined channel");
				ctx.state_tx.send_modify(|s| {
					s.joined.insert(channel);
				});
			}
			LineAction::Continue
		}
		Some("PART") if msg.prefix_nick().is_some_and(|n| n.eq_ignore_ascii_case(&ctx.login)) => {
			if let Some(channel) = msg.channel() {
				info!(login = %ctx.login, %channel, "left channel");
				ctx.state_tx.send_modify(|s| {
					s.joined.remove(&channel);
				});
			}
			LineAction::Continue
		}
		Some("RECONNECT") => {
			info!(login = %ctx.login, "server requested reconnect");
			LineAction::Close
		}
		Some("NOTICE") if msg.trailing().is_some_and(|t| t.contains("authentication failed")) => {
			warn!(login = %ctx.login, "chat login rejected");
			LineAction::Close
		}
		_ => match to_transport_event(msg) {
			Some(ev) => {
				metrics::counter!("streamtools_chat_events_total").increment(1);
				LineAction::Forward(ev)
			}
			None => LineAction::Continue,
		},
	}
}

#[async_trait::async_trait]
impl ChatTransport for TwitchIrcTransport {
	fn username(&self) -> &AccountName {
		&self.credentials.username
	}

	fn is_initialized(&self) -> bool {
		!self.credentials.token.is_empty()
	}

	fn is_connected(&self) -> bool {
		self.state_tx.borrow().connected
	}

	fn joined_channels(&self) -> Vec<ChannelName> {
		self.state_tx.borrow().joined.iter().cloned().collect()
	}

	fn state(&self) -> watch::Receiver<TransportState> {
		self.state_tx.subscribe()
	}

	async fn connect(&self) -> anyhow::Result<()> {
		if !self.is_initialized() {
			return Err(TransportError::NotInitialized.into());
		}

		let _guard = self.connect_lock.lock().await;
		if self.session.lock().as_ref().is_some_and(Session::alive) {
			return Ok(());
		}

		let url = Url::parse(&self.cfg.chat_ws_url).with_context(|| format!("parse chat ws url: {}", self.cfg.chat_ws_url))?;
		let (mut ws, _resp) = tokio::time::timeout(self.cfg.connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
			.await
			.context("chat ws connect timed out")?
			.context("connect_async to chat ws")?;

		let login = self.credentials.username.login();
		let token = self.current_token().await;
		for line in handshake_lines(&token, &login) {
			ws.send(Message::text(line)).await.context("send chat handshake")?;
		}

		let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
		let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
		let ctx = SessionCtx {
			login,
			generation,
			current_generation: self.generation.clone(),
			wanted: self.wanted.clone(),
			state_tx: self.state_tx.clone(),
			events_tx: self.events_tx.clone(),
		};
		let task = tokio::spawn(run_session(ctx, ws, outgoing_rx));

		if let Some(old) = self.session.lock().replace(Session { outgoing, task }) {
			old.task.abort();
		}
		Ok(())
	}

	async fn reconnect(&self) -> anyhow::Result<()> {
		metrics::counter!("streamtools_chat_reconnects_total").increment(1);
		self.disconnect().await;
		self.connect().await
	}

	async fn join(&self, channel: &ChannelName) -> anyhow::Result<()> {
		self.wanted.lock().insert(channel.clone());
		self.send_line(format!("JOIN {}", channel.irc()))
	}

	async fn send_message(&self, channel: &ChannelName, text: &str) -> anyhow::Result<()> {
		let text = text.replace(['\r', '\n'], " ");
		self.send_line(format!("PRIVMSG {} :{}", channel.irc(), text))
	}

	async fn ban(&self, channel: &ChannelName, user: &str, reason: Option<&str>) -> anyhow::Result<()> {
		self.moderate(channel, user, None, reason).await
	}

	async fn timeout(
		&self,
		channel: &ChannelName,
		user: &str,
		duration: Duration,
		reason: Option<&str>,
	) -> anyhow::Result<()> {
		let secs = u32::try_from(duration.as_secs()).unwrap_or(u32::MAX).max(1);
		self.moderate(channel, user, Some(secs), reason).await
	}

	async fn disconnect(&self) {
		let _guard = self.connect_lock.lock().await;
		self.generation.fetch_add(1, Ordering::SeqCst);
		if let Some(session) = self.session.lock().take() {
			session.task.abort();
		}
		self.state_tx.send_replace(TransportState::default());
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use super::*;

	/// Local chat gateway: records every line it receives and, once a client
	/// has sent NICK, welcomes it and pushes `burst` chat lines.
	async fn chat_server(burst: usize) -> (String, Arc<Mutex<Vec<String>>>) {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let url = format!("ws://{}", listener.local_addr().unwrap());
		let received = Arc::new(Mutex::new(Vec::new()));
		let log = Arc::clone(&received);
		tokio::spawn(async move {
			while let Ok((sock, _)) = listener.accept().await {
				let log = Arc::clone(&log);
				tokio::spawn(async move {
					let Ok(mut ws) = tokio_tungstenite::accept_async(sock).await else {
						return;
					};
					while let Some(Ok(msg)) = ws.next().await {
						let Message::Text(text) = msg else { continue };
						let line = text.as_str().to_string();
						log.lock().push(line.clone());
						if !line.starts_with("NICK ") {
							continue;
						}
						let _ = ws.send(Message::text(":tmi.twitch.tv 001 cathybot :Welcome, GLHF!")).await;
						for i in 0..burst {
							let privmsg = format!("@display-name=Viewer :viewer!viewer@viewer.tmi.twitch.tv PRIVMSG #shroud :line {i}");
							let _ = ws.send(Message::text(privmsg)).await;
						}
					}
				});
			}
		});
		(url, received)
	}

	fn credentials() -> ChatCredentials {
		ChatCredentials {
			username: AccountName::new("CathyBot").unwrap(),
			token: SecretString::new("initial"),
		}
	}

	struct RotatingTokens(AtomicUsize);

	#[async_trait::async_trait]
	impl TokenProvider for RotatingTokens {
		async fn access_token(&self, _username: &AccountName) -> Option<SecretString> {
			let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
			Some(SecretString::new(format!("fresh{n}")))
		}
	}

	fn ctx() -> (SessionCtx, mpsc::Receiver<TransportEvent>, watch::Receiver<TransportState>) {
		let (events_tx, events_rx) = mpsc::channel(8);
		let (state_tx, state_rx) = watch::channel(TransportState::default());
		let mut wanted = BTreeSet::new();
		wanted.insert(ChannelName::new("shroud").unwrap());
		let ctx = SessionCtx {
			login: "cathybot".to_string(),
			generation: 1,
			current_generation: Arc::new(AtomicU64::new(1)),
			wanted: Arc::new(Mutex::new(wanted)),
			state_tx: Arc::new(state_tx),
			events_tx,
		};
		(ctx, events_rx, state_rx)
	}

	#[test]
	fn handshake_strips_oauth_prefix() {
		let lines = handshake_lines(&SecretString::new("oauth:abc"), "cathybot");
		assert_eq!(lines[1], "PASS oauth:abc");
		assert_eq!(lines[2], "NICK cathybot");
	}

	#[test]
	fn ping_gets_pong() {
		let (ctx, _rx, _state) = ctx();
		let action = handle_line(&ctx, &IrcMessage::parse("PING :tmi.twitch.tv"));
		assert!(matches!(action, LineAction::Reply(r) if r == "PONG :tmi.twitch.tv"));
	}

	#[test]
	fn welcome_and_join_update_state() {
		let (ctx, _rx, state) = ctx();
		assert!(matches!(
			handle_line(&ctx, &IrcMessage::parse(":tmi.twitch.tv 001 cathybot :Welcome, GLHF!")),
			LineAction::JoinWanted
		));
		assert!(state.borrow().connected);

		handle_line(
			&ctx,
			&IrcMessage::parse(":cathybot!cathybot@cathybot.tmi.twitch.tv JOIN #shroud"),
		);
		assert!(state.borrow().joined.contains(&ChannelName::new("shroud").unwrap()));

		handle_line(&ctx, &IrcMessage::parse(":someone!someone@someone.tmi.twitch.tv JOIN #other"));
		assert_eq!(state.borrow().joined.len(), 1);

		handle_line(&ctx, &IrcMessage::parse(":cathybot!cathybot@cathybot.tmi.twitch.tv PART #shroud"));
		assert!(state.borrow().joined.is_empty());
	}

	#[test]
	fn privmsg_is_forwarded() {
		let (ctx, _rx, _state) = ctx();
		let action = handle_line(
			&ctx,
			&IrcMessage::parse("@display-name=Foo :foo!foo@foo.tmi.twitch.tv PRIVMSG #shroud :hello"),
		);
		let LineAction::Forward(TransportEvent::Message(m)) = action else {
			panic!("expected message");
		};
		assert_eq!(m.display_name, "Foo");
		assert_eq!(m.text, "hello");
	}

	#[test]
	fn reconnect_closes_session() {
		let (ctx, _rx, _state) = ctx();
		assert!(matches!(
			handle_line(&ctx, &IrcMessage::parse(":tmi.twitch.tv RECONNECT")),
			LineAction::Close
		));
	}

	#[tokio::test]
	async fn slow_consumer_loses_no_chat_lines() {
		let (url, _received) = chat_server(50).await;
		let mut cfg = TwitchChatConfig::new("cid");
		cfg.chat_ws_url = url;
		cfg.event_buffer = 4;
		let mut handle = TwitchTransportFactory::new(cfg).create(credentials(), ChannelName::new("shroud").unwrap());
		handle.transport.connect().await.unwrap();

		// Let the burst overrun the buffer before anything is read.
		tokio::time::sleep(Duration::from_millis(300)).await;

		for i in 0..50 {
			let ev = tokio::time::timeout(Duration::from_secs(2), handle.events_rx.recv())
				.await
				.expect("event in time")
				.expect("stream open");
			let TransportEvent::Message(m) = ev else {
				panic!("expected message");
			};
			assert_eq!(m.text, format!("line {i}"));
		}
		handle.transport.disconnect().await;
	}

	#[tokio::test]
	async fn every_connect_uses_the_current_token() {
		let (url, received) = chat_server(0).await;
		let mut cfg = TwitchChatConfig::new("cid");
		cfg.chat_ws_url = url;
		let handle = TwitchTransportFactory::new(cfg)
			.with_token_provider(Arc::new(RotatingTokens(AtomicUsize::new(0))))
			.create(credentials(), ChannelName::new("shroud").unwrap());

		handle.transport.connect().await.unwrap();
		handle.transport.reconnect().await.unwrap();

		let passes = || -> Vec<String> {
			let mut p: Vec<String> = received.lock().iter().filter(|l| l.starts_with("PASS ")).cloned().collect();
			p.sort();
			p
		};
		for _ in 0..100 {
			if passes().len() == 2 {
				break;
			}
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
		assert_eq!(passes(), vec!["PASS oauth:fresh1", "PASS oauth:fresh2"]);
		handle.transport.disconnect().await;
	}

	#[tokio::test]
	async fn send_without_session_fails() {
		let factory = TwitchTransportFactory::new(TwitchChatConfig::new("cid"));
		let handle = factory.create(
			ChatCredentials {
				username: AccountName::new("CathyBot").unwrap(),
				token: SecretString::new("tok"),
			},
			ChannelName::new("shroud").unwrap(),
		);
		assert!(handle.transport.is_initialized());
		assert!(!handle.transport.is_connected());
		assert!(
			handle
				.transport
				.send_message(&ChannelName::new("shroud").unwrap(), "hi")
				.await
				.is_err()
		);
	}
}
