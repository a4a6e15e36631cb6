#![forbid(unsafe_code)]

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use streamtools_domain::ConnectionKey;
use streamtools_platform::{ChatMessage, ChatTransport, FollowEvent, HostEvent, RaidEvent, RedemptionEvent};
use tracing::warn;

/// Event callback. An `Err` is logged and ignored.
pub type Handler<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

/// Admin judge: `false` rejects the message for every message callback.
pub type AdminHandler = Arc<dyn Fn(&Arc<dyn ChatTransport>, &ChatMessage) -> bool + Send + Sync>;

/// Token returned by `add_callback`, used to detach it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub(crate) u64);

impl fmt::Display for CallbackId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "cb-{}", self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackSlot {
	Message,
	Admin,
	Follow,
	Host,
	Raid,
	ChannelPoint,
}

impl fmt::Display for CallbackSlot {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Message => "message",
			Self::Admin => "admin",
			Self::Follow => "follow",
			Self::Host => "host",
			Self::Raid => "raid",
			Self::ChannelPoint => "channel_point",
		})
	}
}

#[derive(Clone)]
pub enum Callback {
	Message(Handler<ChatMessage>),
	Admin(AdminHandler),
	Follow(Handler<FollowEvent>),
	Host(Handler<HostEvent>),
	Raid(Handler<RaidEvent>),
	ChannelPoint(Handler<RedemptionEvent>),
}

impl fmt::Debug for Callback {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Callback({})", self.slot())
	}
}

impl Callback {
	pub fn slot(&self) -> CallbackSlot {
		match self {
			Self::Message(_) => CallbackSlot::Message,
			Self::Admin(_) => CallbackSlot::Admin,
			Self::Follow(_) => CallbackSlot::Follow,
			Self::Host(_) => CallbackSlot::Host,
			Self::Raid(_) => CallbackSlot::Raid,
			Self::ChannelPoint(_) => CallbackSlot::ChannelPoint,
		}
	}

	pub fn message(f: impl Fn(&ChatMessage) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
		Self::Message(Arc::new(f))
	}

	pub fn admin(f: impl Fn(&Arc<dyn ChatTransport>, &ChatMessage) -> bool + Send + Sync + 'static) -> Self {
		Self::Admin(Arc::new(f))
	}

	pub fn follow(f: impl Fn(&FollowEvent) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
		Self::Follow(Arc::new(f))
	}

	pub fn host(f: impl Fn(&HostEvent) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
		Self::Host(Arc::new(f))
	}

	pub fn raid(f: impl Fn(&RaidEvent) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
		Self::Raid(Arc::new(f))
	}

	pub fn channel_point(f: impl Fn(&RedemptionEvent) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
		Self::ChannelPoint(Arc::new(f))
	}
}

/// The six callback slots of one connection, each in registration order.
#[derive(Clone, Default)]
pub(crate) struct CallbackSets {
	pub(crate) message: Vec<(CallbackId, Handler<ChatMessage>)>,
	pub(crate) admin: Vec<(CallbackId, AdminHandler)>,
	pub(crate) follow: Vec<(CallbackId, Handler<FollowEvent>)>,
	pub(crate) host: Vec<(CallbackId, Handler<HostEvent>)>,
	pub(crate) raid: Vec<(CallbackId, Handler<RaidEvent>)>,
	pub(crate) channel_point: Vec<(CallbackId, Handler<RedemptionEvent>)>,
}

fn remove_id<T>(slot: &mut Vec<(CallbackId, T)>, id: CallbackId) -> bool {
	let before = slot.len();
	slot.retain(|(cid, _)| *cid != id);
	slot.len() != before
}

impl CallbackSets {
	pub(crate) fn insert(&mut self, id: CallbackId, callback: Callback) {
		match callback {
			Callback::Message(h) => self.message.push((id, h)),
			Callback::Admin(h) => self.admin.push((id, h)),
			Callback::Follow(h) => self.follow.push((id, h)),
			Callback::Host(h) => self.host.push((id, h)),
			Callback::Raid(h) => self.raid.push((id, h)),
			Callback::ChannelPoint(h) => self.channel_point.push((id, h)),
		}
	}

	pub(crate) fn remove(&mut self, slot: CallbackSlot, id: CallbackId) -> bool {
		match slot {
			CallbackSlot::Message => remove_id(&mut self.message, id),
			CallbackSlot::Admin => remove_id(&mut self.admin, id),
			CallbackSlot::Follow => remove_id(&mut self.follow, id),
			CallbackSlot::Host => remove_id(&mut self.host, id),
			CallbackSlot::Raid => remove_id(&mut self.raid, id),
			CallbackSlot::ChannelPoint => remove_id(&mut self.channel_point, id),
		}
	}

	pub(crate) fn is_empty(&self) -> bool {
		self.message.is_empty()
			&& self.admin.is_empty()
			&& self.follow.is_empty()
			&& self.host.is_empty()
			&& self.raid.is_empty()
			&& self.channel_point.is_empty()
	}
}

/// Call every handler in order. A failing or panicking handler does not stop the rest.
pub(crate) fn invoke_guarded<E>(key: &ConnectionKey, slot: CallbackSlot, handlers: &[(CallbackId, Handler<E>)], event: &E) {
	for (id, handler) in handlers {
		match catch_unwind(AssertUnwindSafe(|| handler(event))) {
			Ok(Ok(())) => {}
			Ok(Err(e)) => {
				metrics::counter!("streamtools_pool_callback_errors_total").increment(1);
				warn!(key = %key, slot = %slot, callback = %id, error = %e, "callback failed");
			}
			Err(_) => {
				metrics::counter!("streamtools_pool_callback_panics_total").increment(1);
				warn!(key = %key, slot = %slot, callback = %id, "callback panicked");
			}
		}
	}
}

/// Short-circuits on the first rejection. A panicking judge counts as accept.
pub(crate) fn invoke_admin_chain(
	key: &ConnectionKey,
	handlers: &[(CallbackId, AdminHandler)],
	transport: &Arc<dyn ChatTransport>,
	msg: &ChatMessage,
) -> bool {
	for (id, handler) in handlers {
		match catch_unwind(AssertUnwindSafe(|| handler(transport, msg))) {
			Ok(true) => {}
			Ok(false) => return false,
			Err(_) => {
				metrics::counter!("streamtools_pool_callback_panics_total").increment(1);
				warn!(key = %key, slot = %CallbackSlot::Admin, callback = %id, "admin callback panicked; accepting");
			}
		}
	}
	true
}
