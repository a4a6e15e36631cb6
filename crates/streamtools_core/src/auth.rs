#![forbid(unsafe_code)]

//! OAuth token lookup with lazy refresh, and channel-id resolution over Helix.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, TimeDelta, Utc};
use streamtools_domain::{AccountName, ChannelName};
use streamtools_platform::SecretString;
pub use streamtools_platform::TokenProvider;
use streamtools_platform::twitch::{HelixClient, RefreshOutcome, TokenRefreshResponse, refresh_partner_token};
use tracing::{debug, info, warn};

use crate::config::ConfigStore;

/// Refreshed tokens are treated as expired this long before the server says so.
const EXPIRY_MARGIN_SECS: i64 = 300;

/// Longer server-reported lifetimes are clamped to this.
const MAX_LIFETIME_SECS: u64 = 365 * 24 * 60 * 60;

/// Maps a channel login to its numeric id and lists its chatters.
#[async_trait::async_trait]
pub trait ChannelResolver: Send + Sync + 'static {
	async fn resolve_channel_id(&self, account: &AccountName, channel: &ChannelName) -> Option<String>;

	/// Logins currently in chat. Requires the account to moderate the channel.
	async fn chatters(&self, account: &AccountName, channel_id: &str) -> anyhow::Result<Vec<String>>;
}

pub(crate) fn decode_token(encoded: &str) -> Option<String> {
	let bytes = BASE64.decode(encoded.trim()).ok()?;
	String::from_utf8(bytes).ok().filter(|s| !s.trim().is_empty())
}

pub(crate) fn encode_token(raw: &str) -> String {
	BASE64.encode(raw.as_bytes())
}

/// Reads tokens from the configuration and refreshes them through the partner endpoint.
#[derive(Debug, Clone)]
pub struct ConfigTokenProvider {
	config: Arc<ConfigStore>,
}

impl ConfigTokenProvider {
	pub fn new(config: Arc<ConfigStore>) -> Self {
		Self { config }
	}

	fn store_refreshed(&self, username: &AccountName, tokens: &TokenRefreshResponse, now: DateTime<Utc>) -> bool {
		let expires_in = i64::try_from(tokens.expires_in.min(MAX_LIFETIME_SECS)).unwrap_or_default();
		let lifetime = TimeDelta::try_seconds(expires_in.saturating_sub(EXPIRY_MARGIN_SECS)).unwrap_or_default();
		let expires = now + lifetime;

		let res = self.config.update(|cfg| {
			let Some(account) = cfg.get_account_mut(username.as_str()) else {
				return false;
			};
			account.api_oauth = Some(encode_token(&tokens.access_token));
			account.api_oauth_refresh = Some(encode_token(&tokens.refresh_token));
			account.api_oauth_expires = Some(expires);
			true
		});

		match res {
			Ok(stored) => stored,
			Err(e) => {
				warn!(account = %username, error = %e, "oauth: failed to persist refreshed tokens");
				false
			}
		}
	}
}

#[async_trait::async_trait]
impl TokenProvider for ConfigTokenProvider {
	async fn access_token(&self, username: &AccountName) -> Option<SecretString> {
		let account = self.config.get_account(username.as_str())?;
		let current = account.api_oauth.as_deref().and_then(decode_token)?;

		let now = Utc::now();
		let expired = account.api_oauth_expires.is_some_and(|exp| exp <= now);
		let refresh = account.api_oauth_refresh.as_deref().and_then(decode_token);

		let (true, Some(refresh)) = (expired, refresh) else {
			return Some(SecretString::new(current));
		};

		let refresh_url = self.config.twitch().refresh_url;
		debug!(account = %username, "oauth: token expired; refreshing");

		match refresh_partner_token(&refresh_url, &refresh).await {
			Ok(RefreshOutcome::Refreshed(tokens)) => {
				if self.store_refreshed(username, &tokens, now) {
					metrics::counter!("streamtools_oauth_refresh_total", "result" => "ok").increment(1);
					info!(account = %username, "oauth: token refreshed");
					Some(SecretString::new(tokens.access_token))
				} else {
					Some(SecretString::new(current))
				}
			}
			Ok(RefreshOutcome::Rejected(status)) => {
				metrics::counter!("streamtools_oauth_refresh_total", "result" => "rejected").increment(1);
				warn!(account = %username, %status, "oauth: refresh rejected");
				None
			}
			Ok(RefreshOutcome::Unparsable) => {
				warn!(account = %username, "oauth: refresh response unparsable; keeping old token");
				Some(SecretString::new(current))
			}
			Err(e) => {
				warn!(account = %username, error = %e, "oauth: refresh request failed; keeping old token");
				Some(SecretString::new(current))
			}
		}
	}
}

/// [`ChannelResolver`] over Helix, authenticated per account.
pub struct HelixChannelResolver {
	tokens: Arc<dyn TokenProvider>,
	config: Arc<ConfigStore>,
}

impl HelixChannelResolver {
	pub fn new(tokens: Arc<dyn TokenProvider>, config: Arc<ConfigStore>) -> Self {
		Self { tokens, config }
	}

	async fn helix(&self, account: &AccountName) -> anyhow::Result<HelixClient> {
		let token = self
			.tokens
			.access_token(account)
			.await
			.ok_or_else(|| anyhow::anyhow!("no api access for {account}"))?;
		let twitch = self.config.twitch();
		HelixClient::new(&twitch.helix_base_url, twitch.client_id, token)
	}
}

#[async_trait::async_trait]
impl ChannelResolver for HelixChannelResolver {
	async fn resolve_channel_id(&self, account: &AccountName, channel: &ChannelName) -> Option<String> {
		let helix = match self.helix(account).await {
			Ok(h) => h,
			Err(e) => {
				debug!(account = %account, error = %e, "channel resolve: no helix client");
				return None;
			}
		};

		match helix.get_user_by_login(channel.as_str()).await {
			Ok(Some(user)) => Some(user.id),
			Ok(None) => {
				warn!(account = %account, channel = %channel, "channel resolve: no such user");
				None
			}
			Err(e) => {
				warn!(account = %account, channel = %channel, error = %e, "channel resolve failed");
				None
			}
		}
	}

	async fn chatters(&self, account: &AccountName, channel_id: &str) -> anyhow::Result<Vec<String>> {
		let helix = self.helix(account).await?;
		let moderator = helix
			.get_user_by_login(&account.login())
			.await?
			.ok_or_else(|| anyhow::anyhow!("account user not found: {account}"))?;
		let chatters = helix.get_chatters(channel_id, &moderator.id).await?;
		Ok(chatters.into_iter().map(|c| c.user_login).collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{Account, Configuration};

	fn store_with(account: Account) -> Arc<ConfigStore> {
		let mut cfg = Configuration::default();
		cfg.accounts.push(account);
		Arc::new(ConfigStore::in_memory(cfg))
	}

	#[test]
	fn token_codec_round_trips() {
		assert_eq!(decode_token(&encode_token("abc123")).as_deref(), Some("abc123"));
		assert_eq!(decode_token("not base64!"), None);
		assert_eq!(decode_token(&encode_token("   ")), None);
	}

	#[tokio::test]
	async fn unexpired_token_is_returned_without_refresh() {
		let store = store_with(Account {
			username: "CathyBot".into(),
			api_oauth: Some(encode_token("live-token")),
			api_oauth_refresh: Some(encode_token("refresh")),
			api_oauth_expires: Some(Utc::now() + TimeDelta::hours(1)),
			is_users_streaming_account: false,
		});
		let provider = ConfigTokenProvider::new(store);
		let token = provider.access_token(&AccountName::new("cathybot").unwrap()).await;
		assert_eq!(token.map(|t| t.expose().to_string()).as_deref(), Some("live-token"));
	}

	#[tokio::test]
	async fn missing_account_or_token_is_none() {
		let store = store_with(Account {
			username: "CathyBot".into(),
			..Default::default()
		});
		let provider = ConfigTokenProvider::new(store);
		assert!(provider.access_token(&AccountName::new("cathybot").unwrap()).await.is_none());
		assert!(provider.access_token(&AccountName::new("other").unwrap()).await.is_none());
	}

	#[tokio::test]
	async fn expired_token_without_refresh_token_is_kept() {
		let store = store_with(Account {
			username: "CathyBot".into(),
			api_oauth: Some(encode_token("stale")),
			api_oauth_expires: Some(Utc::now() - TimeDelta::hours(1)),
			..Default::default()
		});
		let provider = ConfigTokenProvider::new(store);
		let token = provider.access_token(&AccountName::new("CathyBot").unwrap()).await;
		assert_eq!(token.map(|t| t.expose().to_string()).as_deref(), Some("stale"));
	}

	#[test]
	fn refreshed_tokens_are_stored_encoded_with_margin() {
		let store = store_with(Account {
			username: "CathyBot".into(),
			..Default::default()
		});
		let provider = ConfigTokenProvider::new(store.clone());
		let now = Utc::now();
		let tokens = TokenRefreshResponse {
			access_token: "new-access".into(),
			refresh_token: "new-refresh".into(),
			expires_in: 3600,
		};
		assert!(provider.store_refreshed(&AccountName::new("cathybot").unwrap(), &tokens, now));

		let account = store.get_account("cathybot").unwrap();
		assert_eq!(account.api_oauth.as_deref().and_then(decode_token).as_deref(), Some("new-access"));
		assert_eq!(
			account.api_oauth_refresh.as_deref().and_then(decode_token).as_deref(),
			Some("new-refresh")
		);
		assert_eq!(account.api_oauth_expires, Some(now + TimeDelta::seconds(3300)));
	}

	#[test]
	fn absurd_expiry_is_clamped_not_fatal() {
		let store = store_with(Account {
			username: "CathyBot".into(),
			..Default::default()
		});
		let provider = ConfigTokenProvider::new(store.clone());
		let now = Utc::now();
		let tokens = TokenRefreshResponse {
			access_token: "new-access".into(),
			refresh_token: "new-refresh".into(),
			expires_in: u64::MAX,
		};
		assert!(provider.store_refreshed(&AccountName::new("cathybot").unwrap(), &tokens, now));

		let expires = store.get_account("cathybot").unwrap().api_oauth_expires.unwrap();
		assert_eq!(expires, now + TimeDelta::seconds(365 * 24 * 60 * 60 - 300));
	}
}
