#![forbid(unsafe_code)]

use std::sync::Arc;

use streamtools_domain::AccountName;
use streamtools_platform::twitch::{PubSubClient, PubSubConfig, PubSubEvent, PubSubTopic};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::TokenProvider;
use crate::pool::ChatConnectionPool;

const EVENT_BUFFER: usize = 256;

/// Feeds follow and redemption events from Pub/Sub into the pool's callbacks.
pub struct PubSubRouter {
	client: PubSubClient,
	tokens: Arc<dyn TokenProvider>,
	task: JoinHandle<()>,
}

impl PubSubRouter {
	pub fn start(pool: ChatConnectionPool, tokens: Arc<dyn TokenProvider>, cfg: PubSubConfig) -> Self {
		let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
		let client = PubSubClient::spawn(cfg, Arc::clone(&tokens), events_tx);
		let task = tokio::spawn(run(pool, events_rx));
		Self { client, tokens, task }
	}

	/// Subscribe to follows on `user_id`'s channel. Idempotent.
	pub async fn listen_follows(&self, account: &AccountName, user_id: &str) -> bool {
		self.listen(account, PubSubTopic::Follows {
			channel_id: user_id.to_string(),
		})
		.await
	}

	/// Subscribe to channel-point redemptions on `user_id`'s channel. Idempotent.
	pub async fn listen_redemptions(&self, account: &AccountName, user_id: &str) -> bool {
		self.listen(account, PubSubTopic::ChannelPoints {
			channel_id: user_id.to_string(),
		})
		.await
	}

	/// The client re-reads the account's token on every connect.
	async fn listen(&self, account: &AccountName, topic: PubSubTopic) -> bool {
		if self.tokens.access_token(account).await.is_none() {
			warn!(account = %account, topic = %topic.wire_name(), "pubsub: no api access; not listening");
			return false;
		}
		debug!(account = %account, topic = %topic.wire_name(), "pubsub: listen");
		self.client.listen(topic, account.clone());
		true
	}

	pub fn is_connected(&self) -> bool {
		self.client.is_connected()
	}

	pub fn shutdown(self) {
		self.client.shutdown();
		self.task.abort();
	}
}

async fn run(pool: ChatConnectionPool, mut events_rx: mpsc::Receiver<PubSubEvent>) {
	while let Some(event) = events_rx.recv().await {
		route_event(&pool, event);
	}
	debug!("pubsub router exiting");
}

pub(crate) fn route_event(pool: &ChatConnectionPool, event: PubSubEvent) {
	match event {
		PubSubEvent::Connected => info!("pubsub: connected; topics sent"),
		PubSubEvent::ListenError { nonce, error } => {
			warn!(%nonce, %error, "pubsub: listen rejected");
		}
		PubSubEvent::Follow(follow) => {
			metrics::counter!("streamtools_pubsub_follows_total").increment(1);
			if !pool.dispatch_follow(&follow) {
				debug!(channel_id = %follow.channel_id, "pubsub: follow for channel not in pool");
			}
		}
		PubSubEvent::Redemption(redemption) => {
			metrics::counter!("streamtools_pubsub_redemptions_total").increment(1);
			let delivered = pool.dispatch_redemption(&redemption);
			debug!(
				channel_id = %redemption.channel_id,
				reward = %redemption.reward_title,
				delivered,
				"pubsub: redemption routed"
			);
		}
	}
}
