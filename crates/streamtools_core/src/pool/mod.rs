#![forbid(unsafe_code)]

//! Shared chat connections keyed by `(account, channel)`.
//!
//! Subscribers attach callbacks to one of six slots on a connection. The first
//! callback for a key opens the connection; removing the last callback from
//! every slot tears it down.

mod callbacks;
mod supervisor;

#[cfg(test)]
mod pool_tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use streamtools_domain::{AccountName, ChannelName, ConnectionKey};
use streamtools_platform::{
	ChatCredentials, ChatMessage, ChatTransport, FollowEvent, RedemptionEvent, TransportEvent, TransportFactory,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{ChannelResolver, TokenProvider};

pub use callbacks::{AdminHandler, Callback, CallbackId, CallbackSlot, Handler};
pub use supervisor::{Supervisor, SupervisorConfig};

use callbacks::{CallbackSets, invoke_admin_chain, invoke_guarded};

/// A viewer present in one of the pooled channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chatter {
	pub channel: ChannelName,
	pub username: String,
}

/// Read-only view of one pooled connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
	pub key: ConnectionKey,
	pub channel_id: String,
}

struct Connection {
	id: u64,
	key: ConnectionKey,
	channel_id: String,
	transport: Arc<dyn ChatTransport>,
	callbacks: CallbackSets,
	dispatcher: Option<JoinHandle<()>>,
}

impl Connection {
	fn teardown(self) -> Arc<dyn ChatTransport> {
		if let Some(task) = self.dispatcher {
			task.abort();
		}
		self.transport
	}
}

struct PoolInner {
	factory: Arc<dyn TransportFactory>,
	resolver: Arc<dyn ChannelResolver>,
	tokens: Arc<dyn TokenProvider>,
	rt: Handle,
	/// Insertion order decides "first match" lookups.
	connections: Mutex<Vec<Connection>>,
	next_connection_id: AtomicU64,
	next_callback_id: AtomicU64,
}

/// Pool of chat connections. Cheap to clone.
#[derive(Clone)]
pub struct ChatConnectionPool {
	inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ChatConnectionPool {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChatConnectionPool")
			.field("connections", &self.inner.connections.lock().len())
			.finish_non_exhaustive()
	}
}

impl ChatConnectionPool {
	/// Must be called from within a tokio runtime.
	pub fn new(
		factory: Arc<dyn TransportFactory>,
		resolver: Arc<dyn ChannelResolver>,
		tokens: Arc<dyn TokenProvider>,
	) -> Self {
		Self {
			inner: Arc::new(PoolInner {
				factory,
				resolver,
				tokens,
				rt: Handle::current(),
				connections: Mutex::new(Vec::new()),
				next_connection_id: AtomicU64::new(1),
				next_callback_id: AtomicU64::new(1),
			}),
		}
	}

	/// Attach `callback` to the connection for `(account, channel)`, opening it if needed.
	///
	/// Returns `None` when the account has no API access or the channel cannot be resolved.
	pub async fn add_callback(
		&self,
		account: &AccountName,
		channel: &ChannelName,
		callback: Callback,
	) -> Option<CallbackId> {
		let key = ConnectionKey::new(account.clone(), channel.clone());
		let id = CallbackId(self.inner.next_callback_id.fetch_add(1, Ordering::Relaxed));

		{
			let mut conns = self.inner.connections.lock();
			if let Some(conn) = conns.iter_mut().find(|c| c.key == key) {
				conn.callbacks.insert(id, callback);
				return Some(id);
			}
		}

		let Some(token) = self.inner.tokens.access_token(account).await else {
			warn!(account = %account, channel = %channel, "pool: no api access for account; not connecting");
			return None;
		};
		let Some(channel_id) = self.inner.resolver.resolve_channel_id(account, channel).await else {
			warn!(account = %account, channel = %channel, "pool: channel could not be resolved; not connecting");
			return None;
		};

		let created = {
			let mut conns = self.inner.connections.lock();
			if let Some(conn) = conns.iter_mut().find(|c| c.key == key) {
				conn.callbacks.insert(id, callback);
				return Some(id);
			}

			let handle = self.inner.factory.create(
				ChatCredentials {
					username: account.clone(),
					token,
				},
				channel.clone(),
			);

			let conn_id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
			let dispatcher = self.inner.rt.spawn(run_dispatcher(
				Arc::downgrade(&self.inner),
				conn_id,
				handle.events_rx,
			));

			let mut callbacks = CallbackSets::default();
			callbacks.insert(id, callback);
			conns.push(Connection {
				id: conn_id,
				key: key.clone(),
				channel_id: channel_id.clone(),
				transport: Arc::clone(&handle.transport),
				callbacks,
				dispatcher: Some(dispatcher),
			});
			handle.transport
		};

		metrics::counter!("streamtools_pool_connections_created_total").increment(1);
		info!(key = %key, channel_id = %channel_id, "pool: connection created");

		self.inner.rt.spawn(async move {
			if let Err(e) = created.connect().await {
				warn!(key = %key, error = %e, "pool: initial connect failed; supervisor will retry");
			}
		});

		Some(id)
	}

	/// Detach a callback. A connection left with no callbacks is disconnected and dropped.
	pub fn remove_callback(
		&self,
		account: &AccountName,
		channel: &ChannelName,
		slot: CallbackSlot,
		id: CallbackId,
	) -> bool {
		let key = ConnectionKey::new(account.clone(), channel.clone());
		let mut removed = false;
		let mut dead = Vec::new();

		{
			let mut conns = self.inner.connections.lock();
			for conn in conns.iter_mut().filter(|c| c.key == key) {
				removed |= conn.callbacks.remove(slot, id);
			}

			let mut i = 0;
			while i < conns.len() {
				if conns[i].key == key && conns[i].callbacks.is_empty() {
					dead.push(conns.remove(i));
				} else {
					i += 1;
				}
			}
		}

		for conn in dead {
			let key = conn.key.clone();
			let transport = conn.teardown();
			metrics::counter!("streamtools_pool_connections_removed_total").increment(1);
			info!(key = %key, "pool: last callback removed; disconnecting");
			self.inner.rt.spawn(async move {
				transport.disconnect().await;
			});
		}

		removed
	}

	/// First connection watching `channel`, regardless of account.
	pub fn get_connection_client(&self, channel: &ChannelName) -> Option<Arc<dyn ChatTransport>> {
		self.inner
			.connections
			.lock()
			.iter()
			.find(|c| &c.key.channel == channel)
			.map(|c| Arc::clone(&c.transport))
	}

	/// Connected at the transport level and holding at least one joined channel.
	pub fn is_connected(&self, account: &AccountName, channel: &ChannelName) -> bool {
		let transport = {
			let conns = self.inner.connections.lock();
			conns
				.iter()
				.find(|c| &c.key.account == account && &c.key.channel == channel)
				.map(|c| Arc::clone(&c.transport))
		};
		transport.is_some_and(|t| t.is_connected() && !t.joined_channels().is_empty())
	}

	pub fn connections(&self) -> Vec<ConnectionInfo> {
		self.inner
			.connections
			.lock()
			.iter()
			.map(|c| ConnectionInfo {
				key: c.key.clone(),
				channel_id: c.channel_id.clone(),
			})
			.collect()
	}

	pub fn len(&self) -> usize {
		self.inner.connections.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub(crate) fn transports(&self) -> Vec<(ConnectionKey, Arc<dyn ChatTransport>)> {
		self.inner
			.connections
			.lock()
			.iter()
			.map(|c| (c.key.clone(), Arc::clone(&c.transport)))
			.collect()
	}

	/// Deliver a follow to the first connection on the followed channel id.
	pub fn dispatch_follow(&self, event: &FollowEvent) -> bool {
		let handlers = {
			let conns = self.inner.connections.lock();
			conns
				.iter()
				.find(|c| c.channel_id == event.channel_id)
				.map(|c| (c.key.clone(), c.callbacks.follow.clone()))
		};

		let Some((key, handlers)) = handlers else {
			debug!(channel_id = %event.channel_id, "pool: follow for unknown channel");
			return false;
		};
		invoke_guarded(&key, CallbackSlot::Follow, &handlers, event);
		true
	}

	/// Deliver a redemption to every connection on the channel id.
	pub fn dispatch_redemption(&self, event: &RedemptionEvent) -> usize {
		let targets: Vec<_> = {
			let conns = self.inner.connections.lock();
			conns
				.iter()
				.filter(|c| c.channel_id == event.channel_id)
				.map(|c| (c.key.clone(), c.callbacks.channel_point.clone()))
				.collect()
		};

		for (key, handlers) in &targets {
			invoke_guarded(key, CallbackSlot::ChannelPoint, handlers, event);
		}
		targets.len()
	}

	/// Chat logins across every pooled channel. Failed lookups contribute nothing.
	pub async fn users_from_all_chats(&self) -> Vec<Chatter> {
		let targets: Vec<(AccountName, ChannelName, String)> = {
			let conns = self.inner.connections.lock();
			conns
				.iter()
				.map(|c| (c.key.account.clone(), c.key.channel.clone(), c.channel_id.clone()))
				.collect()
		};

		let resolver = Arc::clone(&self.inner.resolver);
		let lookups = targets.into_iter().map(|(account, channel, channel_id)| {
			let resolver = Arc::clone(&resolver);
			async move {
				match resolver.chatters(&account, &channel_id).await {
					Ok(users) => users
						.into_iter()
						.map(|username| Chatter {
							channel: channel.clone(),
							username,
						})
						.collect(),
					Err(e) => {
						warn!(account = %account, channel = %channel, error = %e, "pool: chatter lookup failed");
						Vec::new()
					}
				}
			}
		});

		futures::future::join_all(lookups).await.into_iter().flatten().collect()
	}

	/// Drop every connection and disconnect its transport.
	pub async fn shutdown(&self) {
		let dead: Vec<Connection> = std::mem::take(&mut *self.inner.connections.lock());
		let transports: Vec<_> = dead.into_iter().map(Connection::teardown).collect();
		futures::future::join_all(transports.iter().map(|t| t.disconnect())).await;
		info!(count = transports.len(), "pool: shut down");
	}

	fn downgrade(&self) -> Weak<PoolInner> {
		Arc::downgrade(&self.inner)
	}

	fn upgrade(weak: &Weak<PoolInner>) -> Option<Self> {
		weak.upgrade().map(|inner| Self { inner })
	}
}

async fn run_dispatcher(pool: Weak<PoolInner>, conn_id: u64, mut events_rx: mpsc::Receiver<TransportEvent>) {
	while let Some(event) = events_rx.recv().await {
		let Some(inner) = pool.upgrade() else {
			break;
		};
		match event {
			TransportEvent::Message(msg) => inner.dispatch_message(conn_id, &msg),
			TransportEvent::Host(ev) => inner.dispatch_channel_event(conn_id, &ev.channel, CallbackSlot::Host, |key, sets| {
				invoke_guarded(key, CallbackSlot::Host, &sets.host, &ev);
			}),
			TransportEvent::Raid(ev) => inner.dispatch_channel_event(conn_id, &ev.channel, CallbackSlot::Raid, |key, sets| {
				invoke_guarded(key, CallbackSlot::Raid, &sets.raid, &ev);
			}),
		}
	}
	debug!(conn_id, "pool: dispatcher exiting");
}

impl PoolInner {
	/// Admin chain first; a rejection stops delivery to every message callback.
	fn dispatch_message(&self, conn_id: u64, msg: &ChatMessage) {
		let snapshot = {
			let conns = self.connections.lock();
			conns.iter().find(|c| c.id == conn_id).map(|c| {
				(
					c.key.clone(),
					Arc::clone(&c.transport),
					c.callbacks.admin.clone(),
					c.callbacks.message.clone(),
				)
			})
		};
		let Some((key, transport, admin, message)) = snapshot else {
			return;
		};

		if !invoke_admin_chain(&key, &admin, &transport, msg) {
			metrics::counter!("streamtools_pool_messages_rejected_total").increment(1);
			debug!(key = %key, user = %msg.username, "pool: message rejected by admin filter");
			return;
		}

		metrics::counter!("streamtools_pool_messages_dispatched_total").increment(1);
		invoke_guarded(&key, CallbackSlot::Message, &message, msg);
	}

	/// Route a channel-scoped event to the first connection on `channel`.
	///
	/// Every connection joined to the channel receives the same event; only the
	/// oldest of them forwards it.
	fn dispatch_channel_event(
		&self,
		conn_id: u64,
		channel: &ChannelName,
		slot: CallbackSlot,
		deliver: impl FnOnce(&ConnectionKey, &CallbackSets),
	) {
		let target = {
			let conns = self.connections.lock();
			let Some(receiver) = conns.iter().find(|c| c.id == conn_id) else {
				return;
			};
			let forwarder = conns.iter().find(|c| c.key.channel == receiver.key.channel).map(|c| c.id);
			if forwarder != Some(conn_id) {
				return;
			}
			conns
				.iter()
				.find(|c| &c.key.channel == channel)
				.map(|c| (c.key.clone(), c.callbacks.clone()))
		};

		match target {
			Some((key, sets)) => deliver(&key, &sets),
			None => debug!(channel = %channel, slot = %slot, "pool: no connection for channel event"),
		}
	}
}
