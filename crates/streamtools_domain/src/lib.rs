#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Twitch channel name, normalized to lowercase without a leading `#`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelName(String);

impl ChannelName {
	pub fn new(name: impl AsRef<str>) -> Result<Self, ParseIdError> {
		let name = name.as_ref().trim().trim_start_matches('#').trim();
		if name.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if name.chars().any(char::is_whitespace) {
			return Err(ParseIdError::InvalidFormat(format!("channel contains whitespace: {name}")));
		}
		Ok(Self(name.to_lowercase()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// IRC form (`#channel`).
	pub fn irc(&self) -> String {
		format!("#{}", self.0)
	}

	/// Case-insensitive comparison against a raw name.
	pub fn matches(&self, other: &str) -> bool {
		self.0.eq_ignore_ascii_case(other.trim().trim_start_matches('#'))
	}
}

impl fmt::Display for ChannelName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelName::new(s)
	}
}

impl TryFrom<String> for ChannelName {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		ChannelName::new(value)
	}
}

impl From<ChannelName> for String {
	fn from(v: ChannelName) -> Self {
		v.0
	}
}

/// Account username. Stored as typed; compared case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountName(String);

impl AccountName {
	pub fn new(name: impl AsRef<str>) -> Result<Self, ParseIdError> {
		let name = name.as_ref().trim();
		if name.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(name.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Lowercase login as used on the wire.
	pub fn login(&self) -> String {
		self.0.to_lowercase()
	}

	pub fn matches(&self, other: &str) -> bool {
		self.0.eq_ignore_ascii_case(other.trim())
	}
}

impl PartialEq for AccountName {
	fn eq(&self, other: &Self) -> bool {
		self.0.eq_ignore_ascii_case(&other.0)
	}
}

impl Eq for AccountName {}

impl core::hash::Hash for AccountName {
	fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
		self.0.to_ascii_lowercase().hash(state);
	}
}

impl fmt::Display for AccountName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for AccountName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		AccountName::new(s)
	}
}

impl TryFrom<String> for AccountName {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		AccountName::new(value)
	}
}

impl From<AccountName> for String {
	fn from(v: AccountName) -> Self {
		v.0
	}
}

/// Pool key: `(account, channel)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
	pub account: AccountName,
	pub channel: ChannelName,
}

impl ConnectionKey {
	pub fn new(account: AccountName, channel: ChannelName) -> Self {
		Self { account, channel }
	}

	/// Parse an `account/channel` string.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let (account_s, channel_s) = s
			.split_once('/')
			.ok_or_else(|| ParseIdError::InvalidFormat("expected account/channel".into()))?;

		Ok(Self::new(AccountName::new(account_s)?, ChannelName::new(channel_s)?))
	}
}

impl fmt::Display for ConnectionKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.account, self.channel)
	}
}

impl FromStr for ConnectionKey {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ConnectionKey::parse(s)
	}
}
