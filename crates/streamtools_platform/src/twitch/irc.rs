#![forbid(unsafe_code)]

use std::time::SystemTime;

use streamtools_domain::ChannelName;

use crate::{ChatMessage, EmoteRef, HostEvent, RaidEvent, TransportEvent};

/// One parsed IRC line.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IrcMessage<'a> {
	pub tags: Option<&'a str>,
	pub prefix: Option<&'a str>,
	pub command: Option<&'a str>,
	pub params: Vec<&'a str>,
}

impl<'a> IrcMessage<'a> {
	pub fn parse(line: &'a str) -> Self {
		let mut message = IrcMessage::default();
		let mut rest = line.trim_end_matches(['\r', '\n']);

		if let Some(stripped) = rest.strip_prefix('@') {
			match stripped.split_once(' ') {
				Some((tags, tail)) => {
					message.tags = Some(tags);
					rest = tail;
				}
				None => {
					message.tags = Some(stripped);
					return message;
				}
			}
		}

		if let Some(stripped) = rest.strip_prefix(':') {
			match stripped.split_once(' ') {
				Some((prefix, tail)) => {
					message.prefix = Some(prefix);
					rest = tail;
				}
				None => {
					message.prefix = Some(stripped);
					return message;
				}
			}
		}

		let (head, trailing) = match rest.find(" :") {
			Some(idx) => (&rest[..idx], Some(&rest[idx + 2..])),
			None => (rest, None),
		};

		let mut parts = head.split(' ').filter(|s| !s.is_empty());
		message.command = parts.next();
		message.params.extend(parts);
		if let Some(t) = trailing {
			message.params.push(t);
		}

		message
	}

	/// Raw tag value, unescaped.
	pub fn tag(&self, key: &str) -> Option<String> {
		self.tags?.split(';').find_map(|component| {
			let (k, v) = component.split_once('=').unwrap_or((component, ""));
			(k == key).then(|| unescape_tag_value(v))
		})
	}

	/// Nick part of `nick!user@host`.
	pub fn prefix_nick(&self) -> Option<&'a str> {
		self.prefix.and_then(|p| p.split('!').next()).filter(|s| !s.is_empty())
	}

	pub fn channel(&self) -> Option<ChannelName> {
		self.params.first().and_then(|c| ChannelName::new(c).ok())
	}

	pub fn trailing(&self) -> Option<&'a str> {
		if self.params.len() > 1 { self.params.last().copied() } else { None }
	}
}

fn unescape_tag_value(v: &str) -> String {
	let mut out = String::with_capacity(v.len());
	let mut chars = v.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some(':') => out.push(';'),
			Some('s') => out.push(' '),
			Some('\\') => out.push('\\'),
			Some('r') => out.push('\r'),
			Some('n') => out.push('\n'),
			Some(other) => out.push(other),
			None => {}
		}
	}
	out
}

/// Parse the `emotes` tag (`id:0-4,6-10/id2:12-15`) against the message text.
/// Offsets are code point indices.
pub fn parse_emotes_tag(tag: &str, text: &str) -> Vec<EmoteRef> {
	let chars: Vec<char> = text.chars().collect();
	let mut out: Vec<EmoteRef> = Vec::new();

	for group in tag.split('/').filter(|g| !g.is_empty()) {
		let Some((id, ranges)) = group.split_once(':') else {
			continue;
		};

		let Some(first) = ranges.split(',').next() else {
			continue;
		};
		let Some((start, end)) = first.split_once('-') else {
			continue;
		};
		let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) else {
			continue;
		};
		if start > end || end >= chars.len() {
			continue;
		}

		let name: String = chars[start..=end].iter().collect();
		if !out.iter().any(|e| e.id == id) {
			out.push(EmoteRef { id: id.to_string(), name });
		}
	}

	out
}

/// Map a parsed line to a transport event, if it is one we surface.
pub fn to_transport_event(msg: &IrcMessage<'_>) -> Option<TransportEvent> {
	match msg.command? {
		"PRIVMSG" => {
			let channel = msg.channel()?;
			let text = msg.trailing()?.to_string();
			let login = msg.prefix_nick()?.to_lowercase();
			let display_name = msg.tag("display-name").filter(|d| !d.is_empty()).unwrap_or_else(|| login.clone());
			let emotes = msg
				.tag("emotes")
				.map(|tag| parse_emotes_tag(&tag, &text))
				.unwrap_or_default();

			Some(TransportEvent::Message(ChatMessage {
				id: msg.tag("id"),
				channel,
				room_id: msg.tag("room-id").unwrap_or_default(),
				user_id: msg.tag("user-id").unwrap_or_default(),
				username: login,
				display_name,
				text,
				emotes,
				received_at: SystemTime::now(),
			}))
		}
		"USERNOTICE" => {
			if msg.tag("msg-id").as_deref() != Some("raid") {
				return None;
			}
			let channel = msg.channel()?;
			let from_login = msg.tag("msg-param-login").or_else(|| msg.tag("login"))?;
			let from_display = msg
				.tag("msg-param-displayName")
				.filter(|d| !d.is_empty())
				.unwrap_or_else(|| from_login.clone());
			let viewers = msg
				.tag("msg-param-viewerCount")
				.and_then(|v| v.parse().ok())
				.unwrap_or(0);

			Some(TransportEvent::Raid(RaidEvent {
				channel,
				from_login,
				from_display,
				viewers,
			}))
		}
		"HOSTTARGET" => {
			// `:tmi.twitch.tv HOSTTARGET #hoster :<target> <viewers>`
			let hoster = msg.channel()?;
			let trailing = msg.trailing()?;
			let mut parts = trailing.split_whitespace();
			let target = parts.next().filter(|t| *t != "-")?;
			let viewers = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);

			Some(TransportEvent::Host(HostEvent {
				channel: ChannelName::new(target).ok()?,
				hosted_by: hoster.as_str().to_string(),
				viewers,
			}))
		}
		_ => None,
	}
}
