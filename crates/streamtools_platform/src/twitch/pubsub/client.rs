#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use streamtools_domain::AccountName;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use super::{ListenData, ListenFrame, PubSubEvent, PubSubFrame, PubSubTopic, parse_topic_message};
use crate::{SecretString, TokenProvider, backoff_delay, new_session_id};

/// Pub/Sub client configuration.
#[derive(Debug, Clone)]
pub struct PubSubConfig {
	pub ws_url: String,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	pub ping_interval: Duration,
	pub pong_timeout: Duration,
}

impl Default for PubSubConfig {
	fn default() -> Self {
		Self {
			ws_url: "wss://pubsub-edge.twitch.tv".to_string(),
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
			ping_interval: Duration::from_secs(240),
			pong_timeout: Duration::from_secs(10),
		}
	}
}

enum Control {
	Listen(PubSubTopic, AccountName),
	Shutdown,
}

/// Handle to the background Pub/Sub socket.
pub struct PubSubClient {
	control_tx: mpsc::UnboundedSender<Control>,
	connected_rx: watch::Receiver<bool>,
	task: JoinHandle<()>,
}

impl PubSubClient {
	/// Tokens come from `tokens` on every (re)connect, so refreshed tokens are picked up.
	pub fn spawn(cfg: PubSubConfig, tokens: Arc<dyn TokenProvider>, events_tx: mpsc::Sender<PubSubEvent>) -> Self {
		let (control_tx, control_rx) = mpsc::unbounded_channel();
		let (connected_tx, connected_rx) = watch::channel(false);
		let task = tokio::spawn(run_loop(cfg, tokens, control_rx, events_tx, connected_tx));
		Self {
			control_tx,
			connected_rx,
			task,
		}
	}

	/// Register a topic authorized by `account`. Re-registering the same topic for
	/// the same account is a no-op.
	pub fn listen(&self, topic: PubSubTopic, account: AccountName) {
		if self.control_tx.send(Control::Listen(topic, account)).is_err() {
			warn!("pubsub control channel closed; listen dropped");
		}
	}

	pub fn is_connected(&self) -> bool {
		*self.connected_rx.borrow()
	}

	pub fn connected(&self) -> watch::Receiver<bool> {
		self.connected_rx.clone()
	}

	pub fn shutdown(&self) {
		let _ = self.control_tx.send(Control::Shutdown);
	}
}

impl Drop for PubSubClient {
	fn drop(&mut self) {
		self.task.abort();
	}
}

fn listen_frames(topics: &BTreeMap<PubSubTopic, SecretString>) -> Vec<String> {
	let mut by_token: BTreeMap<&str, Vec<String>> = BTreeMap::new();
	for (topic, token) in topics {
		by_token.entry(token.expose()).or_default().push(topic.wire_name());
	}

	by_token
		.into_iter()
		.filter_map(|(auth_token, topics)| {
			let nonce = new_session_id();
			let frame = ListenFrame {
				r#type: "LISTEN",
				nonce: &nonce,
				data: ListenData { topics, auth_token },
			};
			serde_json::to_string(&frame).ok()
		})
		.collect()
}

/// Current token for each topic's account. Topics whose account has no token are left out.
async fn authorize(
	tokens: &dyn TokenProvider,
	topics: &BTreeMap<PubSubTopic, AccountName>,
) -> BTreeMap<PubSubTopic, SecretString> {
	let mut fetched: HashMap<&AccountName, Option<SecretString>> = HashMap::new();
	let mut out = BTreeMap::new();
	for (topic, account) in topics {
		if !fetched.contains_key(account) {
			fetched.insert(account, tokens.access_token(account).await);
		}
		match fetched.get(account).cloned().flatten() {
			Some(token) => {
				out.insert(topic.clone(), token);
			}
			None => warn!(account = %account, topic = %topic.wire_name(), "pubsub: no token; topic skipped"),
		}
	}
	out
}

type PubSubWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(url: &str) -> anyhow::Result<PubSubWs> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url)
		.await
		.context("connect_async to pubsub ws")?;
	Ok(ws)
}

async fn run_loop(
	cfg: PubSubConfig,
	tokens: Arc<dyn TokenProvider>,
	mut control_rx: mpsc::UnboundedReceiver<Control>,
	events_tx: mpsc::Sender<PubSubEvent>,
	connected_tx: watch::Sender<bool>,
) {
	let mut topics: BTreeMap<PubSubTopic, AccountName> = BTreeMap::new();
	let mut reconnect_attempt: u32 = 0;

	'outer: loop {
		// Nothing to listen to yet: wait for the first topic.
		while topics.is_empty() {
			match control_rx.recv().await {
				Some(Control::Listen(topic, account)) => {
					topics.insert(topic, account);
				}
				Some(Control::Shutdown) | None => break 'outer,
			}
		}

		if reconnect_attempt > 0 {
			let delay = backoff_delay(reconnect_attempt, cfg.reconnect_min_delay, cfg.reconnect_max_delay);
			debug!(?delay, attempt = reconnect_attempt, "pubsub reconnecting");
			sleep(delay).await;
		}

		let mut ws = match connect(&cfg.ws_url).await {
			Ok(ws) => ws,
			Err(e) => {
				reconnect_attempt = reconnect_attempt.saturating_add(1);
				warn!(error = %e, "failed to connect pubsub ws");
				continue;
			}
		};

		let mut send_failed = false;
		for frame in listen_frames(&authorize(tokens.as_ref(), &topics).await) {
			if let Err(e) = ws.send(Message::text(frame)).await {
				warn!(error = %e, "pubsub LISTEN send failed");
				send_failed = true;
				break;
			}
		}
		if send_failed {
			reconnect_attempt = reconnect_attempt.saturating_add(1);
			continue;
		}

		reconnect_attempt = 0;
		connected_tx.send_replace(true);
		info!(topics = topics.len(), "pubsub connected");
		let _ = events_tx.try_send(PubSubEvent::Connected);

		let mut next_ping = Instant::now() + cfg.ping_interval;
		let mut pong_deadline: Option<Instant> = None;

		loop {
			tokio::select! {
				cmd = control_rx.recv() => {
					match cmd {
						Some(Control::Listen(topic, account)) => {
							if topics.get(&topic) == Some(&account) {
								continue;
							}
							let mut single = BTreeMap::new();
							single.insert(topic.clone(), account.clone());
							topics.insert(topic, account);
							for frame in listen_frames(&authorize(tokens.as_ref(), &single).await) {
								if ws.send(Message::text(frame)).await.is_err() {
									break;
								}
							}
						}
						Some(Control::Shutdown) | None => {
							let _ = ws.close(None).await;
							break 'outer;
						}
					}
				}

				_ = sleep_until(next_ping) => {
					if ws.send(Message::text(r#"{"type":"PING"}"#)).await.is_err() {
						break;
					}
					pong_deadline = Some(Instant::now() + cfg.pong_timeout);
					next_ping = Instant::now() + cfg.ping_interval;
				}

				_ = sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
					warn!("pubsub PONG not received in time");
					break;
				}

				msg = ws.next() => {
					let Some(msg) = msg else {
						info!("pubsub ws ended");
						break;
					};
					let msg = match msg {
						Ok(m) => m,
						Err(e) => {
							warn!(error = %e, "pubsub ws read error");
							break;
						}
					};

					match msg {
						Message::Text(t) => {
							let frame: PubSubFrame = match serde_json::from_str(&t) {
								Ok(f) => f,
								Err(e) => {
									debug!(error = %e, "pubsub frame parse failed");
									continue;
								}
							};

							match frame.r#type.as_str() {
								"PONG" => pong_deadline = None,
								"RECONNECT" => {
									info!("pubsub server requested reconnect");
									break;
								}
								"RESPONSE" => {
									if let Some(error) = frame.error.filter(|e| !e.is_empty()) {
										warn!(%error, "pubsub LISTEN rejected");
										let _ = events_tx.try_send(PubSubEvent::ListenError {
											nonce: frame.nonce.unwrap_or_default(),
											error,
										});
									}
								}
								"MESSAGE" => {
									let Some(data) = frame.data else { continue };
									match parse_topic_message(&data.topic, &data.message) {
										Ok(Some(ev)) => {
											if events_tx.send(ev).await.is_err() {
												break 'outer;
											}
										}
										Ok(None) => {}
										Err(e) => warn!(topic = %data.topic, error = %e, "pubsub message parse failed"),
									}
								}
								_ => {}
							}
						}
						Message::Ping(p) => {
							let _ = ws.send(Message::Pong(p)).await;
						}
						Message::Close(frame) => {
							info!(?frame, "pubsub ws closed");
							break;
						}
						_ => {}
					}
				}
			}
		}

		connected_tx.send_replace(false);
		reconnect_attempt = reconnect_attempt.saturating_add(1);
	}

	connected_tx.send_replace(false);
	debug!("pubsub loop finished");
}
