#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use regex::{NoExpand, Regex, RegexBuilder};
use streamtools_platform::ChatMessage;

use super::{EmoteSource, TtsFilter, url_regex};
use crate::config::ConfigStore;

const ALLOWED_COMMANDS: &[&str] = &["!lurk", "!tts", "!unlurk"];
const MAX_EMOTES: usize = 2;
const MAX_REPEATED_LETTERS: u32 = 2;
const MAX_REPEATED_WORDS: u32 = 2;

pub const SPAM_REPLACEMENT: &str = "this message was removed for spam";

/// Removes URLs. Matches containing `..` are kept so ellipses survive.
pub struct LinkFilter {
	url: Regex,
}

impl LinkFilter {
	pub fn new() -> anyhow::Result<Self> {
		Ok(Self { url: url_regex()? })
	}
}

impl TtsFilter for LinkFilter {
	fn name(&self) -> &'static str {
		"link"
	}

	fn filter(&self, _msg: &ChatMessage, username: String, text: String) -> (String, String) {
		let links: Vec<String> = self
			.url
			.find_iter(&text)
			.map(|m| m.as_str().to_string())
			.filter(|m| !m.contains(".."))
			.collect();

		let mut text = text;
		for link in links {
			text = text.replace(&link, "");
		}
		(username, text)
	}
}

/// Silences configured users entirely.
pub struct UsernameSkipFilter {
	config: Arc<ConfigStore>,
}

impl UsernameSkipFilter {
	pub fn new(config: Arc<ConfigStore>) -> Self {
		Self { config }
	}
}

impl TtsFilter for UsernameSkipFilter {
	fn name(&self) -> &'static str {
		"username_skip"
	}

	fn filter(&self, msg: &ChatMessage, username: String, text: String) -> (String, String) {
		let skip = self.config.read(|cfg| {
			cfg.tts_usernames_to_skip
				.iter()
				.any(|u| u.trim().eq_ignore_ascii_case(msg.display_name.trim()))
		});
		if skip { (String::new(), String::new()) } else { (username, text) }
	}
}

/// Replaces digit and underscore runs with a space in mentions and in the speaker's name.
pub struct UsernameCharactersFilter {
	mention: Regex,
	noise: Regex,
}

impl UsernameCharactersFilter {
	pub fn new() -> anyhow::Result<Self> {
		Ok(Self {
			mention: Regex::new(r"@[a-zA-Z]+\S+")?,
			noise: Regex::new(r"[0-9_]+")?,
		})
	}
}

impl TtsFilter for UsernameCharactersFilter {
	fn name(&self) -> &'static str {
		"username_characters"
	}

	fn filter(&self, _msg: &ChatMessage, username: String, text: String) -> (String, String) {
		let mentions: Vec<String> = self.mention.find_iter(&text).map(|m| m.as_str().to_string()).collect();

		let mut text = text;
		for mention in mentions {
			let cleaned = self.noise.replace_all(&mention, " ");
			text = text.replace(&mention, &cleaned);
		}

		let username = self.noise.replace_all(&username, " ").into_owned();
		(username, text)
	}
}

/// Configured case-insensitive replacements, plus a spoken alias for the speaker.
pub struct PhoneticFilter {
	config: Arc<ConfigStore>,
}

impl PhoneticFilter {
	pub fn new(config: Arc<ConfigStore>) -> Self {
		Self { config }
	}
}

impl TtsFilter for PhoneticFilter {
	fn name(&self) -> &'static str {
		"phonetic"
	}

	fn filter(&self, msg: &ChatMessage, username: String, text: String) -> (String, String) {
		let entries = self.config.read(|cfg| cfg.tts_phonetic_usernames.clone());

		let mut text = text;
		for entry in entries.iter().filter(|e| !e.key.is_empty()) {
			let Ok(re) = RegexBuilder::new(&regex::escape(&entry.key)).case_insensitive(true).build() else {
				continue;
			};
			text = re.replace_all(&text, NoExpand(&entry.value)).into_owned();
		}

		let username = entries
			.iter()
			.find(|e| e.key.eq_ignore_ascii_case(&msg.display_name))
			.map(|e| e.value.clone())
			.unwrap_or(username);
		(username, text)
	}
}

/// Blanks `!commands` other than the allowed few.
pub struct CommandFilter {
	command: Regex,
}

impl CommandFilter {
	pub fn new() -> anyhow::Result<Self> {
		Ok(Self {
			command: Regex::new(r"!\S+")?,
		})
	}
}

impl TtsFilter for CommandFilter {
	fn name(&self) -> &'static str {
		"command"
	}

	fn filter(&self, _msg: &ChatMessage, username: String, text: String) -> (String, String) {
		if !text.starts_with('!') {
			return (username, text);
		}

		let allowed = self
			.command
			.find(&text)
			.map(|m| m.as_str().to_lowercase())
			.is_some_and(|cmd| ALLOWED_COMMANDS.contains(&cmd.as_str()));
		if allowed { (username, text) } else { (username, String::new()) }
	}
}

/// Speaks each emote once and at most two distinct emotes per message.
///
/// Emote tokens keep their case; other tokens are lowercased. Any character above 127 counts as an emote of its own.
/// Once two distinct emotes were seen, the first occurrence of a third is dropped too.
pub struct EmojiDeduplicationFilter {
	emotes: Arc<dyn EmoteSource>,
}

impl EmojiDeduplicationFilter {
	pub fn new(emotes: Arc<dyn EmoteSource>) -> Self {
		Self { emotes }
	}
}

/// Repeats of a kept emote stay; a distinct emote past the limit goes.
fn keep_emote(seen: &mut HashSet<String>, emote: String) -> bool {
	if seen.contains(&emote) {
		return true;
	}
	if seen.len() >= MAX_EMOTES {
		return false;
	}
	seen.insert(emote);
	true
}

pub(crate) fn dedup_emotes(text: &str, known: &HashSet<String>) -> String {
	let mut seen: HashSet<String> = HashSet::new();
	let mut parts: Vec<String> = Vec::new();

	for token in text.split_whitespace() {
		let part = token.to_lowercase();

		if known.contains(&part) || (part.starts_with(':') && part.ends_with(':')) {
			if keep_emote(&mut seen, part) {
				parts.push(token.to_string());
			}
			continue;
		}

		let rebuilt: String = part
			.chars()
			.filter(|&c| (c as u32) <= 127 || keep_emote(&mut seen, c.to_string()))
			.collect();
		parts.push(rebuilt);
	}

	parts.retain(|p| !p.trim().is_empty());
	parts.join(" ")
}

impl TtsFilter for EmojiDeduplicationFilter {
	fn name(&self) -> &'static str {
		"emoji_dedup"
	}

	fn filter(&self, msg: &ChatMessage, username: String, text: String) -> (String, String) {
		let mut known: HashSet<String> = msg.emotes.iter().map(|e| e.name.to_lowercase()).collect();
		known.extend(self.emotes.emote_names(msg).into_iter().map(|e| e.to_lowercase()));
		(username, dedup_emotes(&text, &known))
	}
}

/// Caps letter runs at two and replaces whole-word spam with a canned line.
pub struct WordSpamFilter;

pub(crate) fn collapse_letters(token: &str) -> String {
	let mut chars: Vec<char> = token.chars().collect();
	let mut previous = ' ';
	let mut run = 1u32;

	for x in (0..chars.len()).rev() {
		let letter = chars[x];
		run = if letter == previous { run + 1 } else { 1 };
		previous = letter;
		if run > MAX_REPEATED_LETTERS {
			chars.remove(x);
		}
	}
	chars.into_iter().collect()
}

pub(crate) fn word_spam(text: &str) -> String {
	let parts: Vec<String> = text.split_whitespace().map(collapse_letters).collect();

	let mut run = 0u32;
	let mut previous = "";
	for part in &parts {
		if part.as_str() == previous {
			run += 1;
			if run > MAX_REPEATED_WORDS {
				return SPAM_REPLACEMENT.to_string();
			}
		} else {
			run = 0;
		}
		previous = part.as_str();
	}

	parts.join(" ")
}

impl TtsFilter for WordSpamFilter {
	fn name(&self) -> &'static str {
		"word_spam"
	}

	fn filter(&self, _msg: &ChatMessage, username: String, text: String) -> (String, String) {
		(username, word_spam(&text))
	}
}
