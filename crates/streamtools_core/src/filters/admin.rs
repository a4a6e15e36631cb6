#![forbid(unsafe_code)]

use std::sync::Arc;

use regex::Regex;
use streamtools_platform::{ChatMessage, ChatTransport};
use tracing::debug;

use super::emoji::{EmojiAllowlist, hex_sequence};
use super::{AdminFilter, url_regex};
use crate::config::ChatConfig;

const FAMOUS_PHRASE: &str = "wanna become famous?";
const MARKETING_WORDS: &[&str] = &["buy", "followers", "primes", "viewers"];

/// Rejects the "Wanna become famous?" follower-selling spam.
pub struct BotWannaBecomeFamousFilter {
	url: Regex,
}

impl BotWannaBecomeFamousFilter {
	pub fn new() -> anyhow::Result<Self> {
		Ok(Self { url: url_regex()? })
	}
}

impl AdminFilter for BotWannaBecomeFamousFilter {
	fn name(&self) -> &'static str {
		"bot_wanna_become_famous"
	}

	fn judge(&self, chat: &ChatConfig, _transport: &Arc<dyn ChatTransport>, msg: &ChatMessage) -> bool {
		if chat.account_username.trim().is_empty() || chat.channel.trim().is_empty() {
			return true;
		}

		let lower = msg.text.to_lowercase();
		if !lower.contains(FAMOUS_PHRASE) {
			return true;
		}

		let marketing = MARKETING_WORDS.iter().all(|w| lower.contains(w));
		!(self.url.is_match(&msg.text) || marketing)
	}
}

/// Only ASCII and recognised emoji are allowed.
pub struct NonAsciiFilter {
	allowlist: Arc<EmojiAllowlist>,
}

impl NonAsciiFilter {
	pub fn new(allowlist: Arc<EmojiAllowlist>) -> Self {
		Self { allowlist }
	}
}

impl AdminFilter for NonAsciiFilter {
	fn name(&self) -> &'static str {
		"non_ascii"
	}

	fn judge(&self, _chat: &ChatConfig, _transport: &Arc<dyn ChatTransport>, msg: &ChatMessage) -> bool {
		match self.allowlist.first_rejected(&msg.text) {
			None => true,
			Some(grapheme) => {
				debug!(user = %msg.username, codepoints = %hex_sequence(grapheme), "non-ascii grapheme rejected");
				false
			}
		}
	}
}
