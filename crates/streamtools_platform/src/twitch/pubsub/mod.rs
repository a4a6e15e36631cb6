#![forbid(unsafe_code)]

mod client;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{FollowEvent, RedemptionEvent};

pub use client::{PubSubClient, PubSubConfig};

/// Topic a client can listen to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PubSubTopic {
	Follows { channel_id: String },
	ChannelPoints { channel_id: String },
}

impl PubSubTopic {
	pub fn wire_name(&self) -> String {
		match self {
			Self::Follows { channel_id } => format!("following.{channel_id}"),
			Self::ChannelPoints { channel_id } => format!("channel-points-channel-v1.{channel_id}"),
		}
	}
}

/// Events surfaced by the Pub/Sub client.
#[derive(Debug, Clone)]
pub enum PubSubEvent {
	/// Socket (re)opened and topics were sent.
	Connected,
	/// Server answered a LISTEN with an error.
	ListenError { nonce: String, error: String },
	Follow(FollowEvent),
	Redemption(RedemptionEvent),
}

#[derive(Debug, Serialize)]
pub(crate) struct ListenFrame<'a> {
	#[serde(rename = "type")]
	pub(crate) r#type: &'static str,
	pub(crate) nonce: &'a str,
	pub(crate) data: ListenData<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ListenData<'a> {
	pub(crate) topics: Vec<String>,
	pub(crate) auth_token: &'a str,
}

/// Envelope of every server frame.
#[derive(Debug, Deserialize)]
pub(crate) struct PubSubFrame {
	#[serde(rename = "type")]
	pub(crate) r#type: String,
	#[serde(default)]
	pub(crate) nonce: Option<String>,
	#[serde(default)]
	pub(crate) error: Option<String>,
	#[serde(default)]
	pub(crate) data: Option<PubSubFrameData>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PubSubFrameData {
	pub(crate) topic: String,
	/// JSON-encoded inner payload.
	pub(crate) message: String,
}

#[derive(Debug, Deserialize)]
struct FollowPayload {
	#[serde(default)]
	display_name: String,
	#[serde(default)]
	username: String,
	#[serde(default)]
	user_id: String,
}

#[derive(Debug, Deserialize)]
struct RedemptionEnvelope {
	#[serde(rename = "type")]
	r#type: String,
	data: RedemptionData,
}

#[derive(Debug, Deserialize)]
struct RedemptionData {
	redemption: Redemption,
}

#[derive(Debug, Deserialize)]
struct Redemption {
	id: String,
	user: RedemptionUser,
	channel_id: String,
	reward: RedemptionReward,
	#[serde(default)]
	user_input: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RedemptionUser {
	#[serde(default)]
	login: String,
	#[serde(default)]
	display_name: String,
}

#[derive(Debug, Deserialize)]
struct RedemptionReward {
	id: String,
	title: String,
}

/// Decode a MESSAGE frame into an event. Unknown topics yield `None`.
pub(crate) fn parse_topic_message(topic: &str, message: &str) -> anyhow::Result<Option<PubSubEvent>> {
	if let Some(channel_id) = topic.strip_prefix("following.") {
		let p: FollowPayload = serde_json::from_str(message).context("pubsub follow parse json")?;
		return Ok(Some(PubSubEvent::Follow(FollowEvent {
			channel_id: channel_id.to_string(),
			user_id: p.user_id,
			display_name: if p.display_name.is_empty() {
				p.username.clone()
			} else {
				p.display_name
			},
			username: p.username,
		})));
	}

	if topic.starts_with("channel-points-channel-v1.") {
		let env: RedemptionEnvelope = serde_json::from_str(message).context("pubsub redemption parse json")?;
		if env.r#type != "reward-redeemed" {
			return Ok(None);
		}
		let r = env.data.redemption;
		return Ok(Some(PubSubEvent::Redemption(RedemptionEvent {
			channel_id: r.channel_id,
			redemption_id: r.id,
			reward_id: r.reward.id,
			reward_title: r.reward.title,
			user_display: if r.user.display_name.is_empty() {
				r.user.login.clone()
			} else {
				r.user.display_name
			},
			user_login: r.user.login,
			user_input: r.user_input.filter(|s| !s.is_empty()),
		})));
	}

	Ok(None)
}
