#![forbid(unsafe_code)]

//! Admin (veto) and TTS (rewrite) filter chains.

pub mod admin;
pub mod emoji;
pub mod tts;


use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use streamtools_platform::assets::EmoteCache;
use streamtools_platform::{ChatMessage, ChatTransport};
use tokio::runtime::Handle;
use tracing::trace;

use crate::config::{ChatConfig, ConfigStore};

pub use admin::{BotWannaBecomeFamousFilter, NonAsciiFilter};
pub use emoji::EmojiAllowlist;
pub use tts::{
	CommandFilter, EmojiDeduplicationFilter, LinkFilter, PhoneticFilter, SPAM_REPLACEMENT, UsernameCharactersFilter,
	UsernameSkipFilter, WordSpamFilter,
};

const URL_PATTERN: &str =
	r"(https?://(www\.)?)?[-a-zA-Z0-9@:%._+~#=]{1,256}\.[a-zA-Z0-9()]{1,6}\b([-a-zA-Z0-9()@:%_+.~#?&/=,]*)";

pub(crate) fn url_regex() -> anyhow::Result<Regex> {
	Ok(Regex::new(URL_PATTERN)?)
}

/// Third-party emote names for the channel a message was sent in.
pub trait EmoteSource: Send + Sync {
	fn emote_names(&self, msg: &ChatMessage) -> HashSet<String>;
}

/// No third-party emotes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEmotes;

impl EmoteSource for NoEmotes {
	fn emote_names(&self, _msg: &ChatMessage) -> HashSet<String> {
		HashSet::new()
	}
}

/// Blocks on the async [`EmoteCache`] from a non-runtime thread.
pub struct BlockingEmoteSource {
	cache: Arc<EmoteCache>,
	rt: Handle,
}

impl BlockingEmoteSource {
	pub fn new(cache: Arc<EmoteCache>, rt: Handle) -> Self {
		Self { cache, rt }
	}
}

impl EmoteSource for BlockingEmoteSource {
	fn emote_names(&self, msg: &ChatMessage) -> HashSet<String> {
		let (bttv, ffz) = self.rt.block_on(async {
			tokio::join!(
				self.cache.bttv_emotes(&msg.room_id),
				self.cache.ffz_emotes(msg.channel.as_str())
			)
		});
		bttv.iter().chain(ffz.iter()).cloned().collect()
	}
}

/// Rewrites `(username, text)`. Returning an empty text drops the message.
pub trait TtsFilter: Send + Sync {
	fn name(&self) -> &'static str;

	fn filter(&self, msg: &ChatMessage, username: String, text: String) -> (String, String);
}

/// Fixed-order TTS rewrite pipeline.
pub struct TtsFilterChain {
	filters: Vec<Box<dyn TtsFilter>>,
}

impl TtsFilterChain {
	pub fn new(filters: Vec<Box<dyn TtsFilter>>) -> Self {
		Self { filters }
	}

	/// Link, username skip, username characters, phonetic, command, emoji dedup, word spam.
	pub fn standard(config: Arc<ConfigStore>, emotes: Arc<dyn EmoteSource>) -> anyhow::Result<Self> {
		Ok(Self::new(vec![
			Box::new(LinkFilter::new()?),
			Box::new(UsernameSkipFilter::new(Arc::clone(&config))),
			Box::new(UsernameCharactersFilter::new()?),
			Box::new(PhoneticFilter::new(config)),
			Box::new(CommandFilter::new()?),
			Box::new(EmojiDeduplicationFilter::new(emotes)),
			Box::new(WordSpamFilter),
		]))
	}

	pub fn apply(&self, msg: &ChatMessage) -> (String, String) {
		let mut username = msg.display_name.clone();
		let mut text = msg.text.clone();
		for f in &self.filters {
			(username, text) = f.filter(msg, username, text);
			trace!(filter = f.name(), %text, "tts filter applied");
		}
		(username, text)
	}

	/// Final utterance, or `None` when the chain blanked the message.
	pub fn render(&self, msg: &ChatMessage) -> Option<String> {
		let (username, text) = self.apply(msg);
		render_utterance(&username, &text)
	}
}

/// `!tts <text>` speaks the text as-is; anything else is attributed to the sender.
pub fn render_utterance(username: &str, text: &str) -> Option<String> {
	if text.trim().is_empty() {
		return None;
	}

	let trimmed = text.trim();
	match trimmed.get(..4) {
		Some(head) if head.eq_ignore_ascii_case("!tts") => {
			let rest = trimmed[4..].trim();
			(!rest.is_empty()).then(|| rest.to_string())
		}
		_ => Some(format!("{username} says {text}")),
	}
}

/// Veto filter. `false` rejects the message.
pub trait AdminFilter: Send + Sync {
	fn name(&self) -> &'static str;

	fn judge(&self, chat: &ChatConfig, transport: &Arc<dyn ChatTransport>, msg: &ChatMessage) -> bool;
}

/// Short-circuiting admin pipeline.
pub struct AdminFilterChain {
	filters: Vec<Box<dyn AdminFilter>>,
}

impl AdminFilterChain {
	pub fn new(filters: Vec<Box<dyn AdminFilter>>) -> Self {
		Self { filters }
	}

	/// Spam-bot detector, then the non-ASCII policy.
	pub fn standard(allowlist: Arc<EmojiAllowlist>) -> anyhow::Result<Self> {
		Ok(Self::new(vec![
			Box::new(BotWannaBecomeFamousFilter::new()?),
			Box::new(NonAsciiFilter::new(allowlist)),
		]))
	}

	/// Name of the first rejecting filter.
	pub fn rejected_by(&self, chat: &ChatConfig, transport: &Arc<dyn ChatTransport>, msg: &ChatMessage) -> Option<&'static str> {
		self.filters
			.iter()
			.find(|f| !f.judge(chat, transport, msg))
			.map(|f| f.name())
	}

	pub fn judge(&self, chat: &ChatConfig, transport: &Arc<dyn ChatTransport>, msg: &ChatMessage) -> bool {
		self.rejected_by(chat, transport, msg).is_none()
	}
}
