#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::SecretString;

const USERS_PATH: &str = "/helix/users";
const CHATTERS_PATH: &str = "/helix/chat/chatters";
const MODERATION_BANS_PATH: &str = "/helix/moderation/bans";

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> anyhow::Result<reqwest::Response> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.with_context(|| format!("helix {label} send"))?;
	let status = resp.status();

	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("helix auth failed (status={status}) body={body}");
	}

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(delay).await;
		return retry.send().await.with_context(|| format!("helix {label} retry send"));
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		return retry.send().await.with_context(|| format!("helix {label} retry send"));
	}

	Ok(resp)
}

/// Minimal Helix REST client bound to one user token.
#[derive(Clone, Debug)]
pub struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	bearer_token: SecretString,
}

#[derive(Debug, Serialize)]
struct HelixBanRequest<'a> {
	data: HelixBanData<'a>,
}

#[derive(Debug, Serialize)]
struct HelixBanData<'a> {
	user_id: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	duration: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	reason: Option<&'a str>,
}

impl HelixClient {
	pub fn new(base_url: &str, client_id: impl Into<String>, bearer_token: SecretString) -> anyhow::Result<Self> {
		let base_url = Url::parse(base_url).with_context(|| format!("parse helix base url: {base_url}"))?;
		let http = reqwest::Client::builder()
			.user_agent("streamtools/0.x (helix)")
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			base_url,
			client_id: client_id.into(),
			bearer_token,
		})
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		req.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {}", self.bearer_token.expose()))
	}

	fn url(&self, path_and_query: &str) -> anyhow::Result<Url> {
		self.base_url.join(path_and_query).context("join helix url")
	}

	pub async fn get_user_by_login(&self, login: &str) -> anyhow::Result<Option<HelixUser>> {
		let url = self.url(&format!("{USERS_PATH}?login={}", urlencoding::encode(login)))?;

		let resp = send_with_retry(self.authed(self.http.get(url)), "GET /helix/users")
			.await
			.context("helix GET /helix/users send")?;

		let status = resp.status();
		let body = resp.text().await.context("helix GET /helix/users read body")?;

		if !status.is_success() {
			anyhow::bail!("helix GET /helix/users failed: status={status} body={body}");
		}

		let parsed: HelixUsersResponse = serde_json::from_str(&body).context("helix users parse json")?;
		Ok(parsed.data.into_iter().next())
	}

	async fn get_chatters_page(
		&self,
		broadcaster_id: &str,
		moderator_id: &str,
		after: Option<&str>,
	) -> anyhow::Result<HelixChattersResponse> {
		let mut path = format!(
			"{CHATTERS_PATH}?broadcaster_id={b}&moderator_id={m}&first=1000",
			b = urlencoding::encode(broadcaster_id),
			m = urlencoding::encode(moderator_id),
		);
		if let Some(after) = after {
			path.push_str("&after=");
			path.push_str(&urlencoding::encode(after));
		}

		let url = self.url(&path)?;
		let resp = send_with_retry(self.authed(self.http.get(url)), "GET /helix/chat/chatters")
			.await
			.context("helix GET /helix/chat/chatters send")?;

		let status = resp.status();
		let body = resp.text().await.context("helix GET /helix/chat/chatters read body")?;

		if !status.is_success() {
			anyhow::bail!("helix GET /helix/chat/chatters failed: status={status} body={body}");
		}

		serde_json::from_str(&body).context("helix chatters parse json")
	}

	/// All users currently in a chat. Requires moderator rights.
	pub async fn get_chatters(&self, broadcaster_id: &str, moderator_id: &str) -> anyhow::Result<Vec<HelixChatter>> {
		let mut out: Vec<HelixChatter> = Vec::new();
		let mut after: Option<String> = None;

		loop {
			let page = self.get_chatters_page(broadcaster_id, moderator_id, after.as_deref()).await?;
			out.extend(page.data);

			let next = page.pagination.and_then(|p| p.cursor).filter(|c| !c.is_empty());
			if next.is_none() {
				break;
			}
			after = next;
		}

		Ok(out)
	}

	/// Ban (`duration_seconds = None`) or time out a user.
	pub async fn ban_user(
		&self,
		broadcaster_id: &str,
		moderator_id: &str,
		user_id: &str,
		duration_seconds: Option<u32>,
		reason: Option<&str>,
	) -> anyhow::Result<()> {
		let url = self.url(&format!(
			"{base}?broadcaster_id={b}&moderator_id={m}",
			base = MODERATION_BANS_PATH,
			b = urlencoding::encode(broadcaster_id),
			m = urlencoding::encode(moderator_id),
		))?;
		let req = HelixBanRequest {
			data: HelixBanData {
				user_id,
				duration: duration_seconds,
				reason,
			},
		};
		let resp = send_with_retry(self.authed(self.http.post(url)).json(&req), "POST /helix/moderation/bans")
			.await
			.context("helix POST /helix/moderation/bans send")?;
		let status = resp.status();
		let body = resp.text().await.unwrap_or_default();
		if !status.is_success() {
			anyhow::bail!("helix ban user failed: status={status} body={body}");
		}
		Ok(())
	}
}

/// Response of the partner token-refresh endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenRefreshResponse {
	pub access_token: String,
	pub refresh_token: String,
	pub expires_in: u64,
}

/// Outcome of a refresh attempt.
#[derive(Debug)]
pub enum RefreshOutcome {
	Refreshed(TokenRefreshResponse),
	/// Endpoint answered with a non-success status.
	Rejected(StatusCode),
	/// Success status but a body we could not read.
	Unparsable,
}

/// POST `{refresh_url}?refresh_token=...` with an empty body.
pub async fn refresh_partner_token(refresh_url: &str, refresh_token: &str) -> anyhow::Result<RefreshOutcome> {
	let http = reqwest::Client::builder()
		.user_agent("streamtools/0.x (oauth-refresh)")
		.build()
		.context("build reqwest client")?;

	let url = format!("{refresh_url}?refresh_token={}", urlencoding::encode(refresh_token));
	let resp = http
		.post(url)
		.body("")
		.send()
		.await
		.context("partner refresh token request")?;

	let status = resp.status();
	if !status.is_success() {
		return Ok(RefreshOutcome::Rejected(status));
	}

	let body = resp.text().await.context("partner refresh token read body")?;
	Ok(parse_refresh_body(&body))
}

fn parse_refresh_body(body: &str) -> RefreshOutcome {
	match serde_json::from_str::<TokenRefreshResponse>(body) {
		Ok(parsed) => RefreshOutcome::Refreshed(parsed),
		Err(_) => RefreshOutcome::Unparsable,
	}
}

#[derive(Debug, Deserialize)]
struct HelixUsersResponse {
	data: Vec<HelixUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixUser {
	pub id: String,
	pub login: String,
	#[serde(default)]
	pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelixChattersResponse {
	data: Vec<HelixChatter>,
	#[serde(default)]
	pagination: Option<HelixPagination>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixChatter {
	pub user_id: String,
	pub user_login: String,
	pub user_name: String,
}

#[derive(Debug, Deserialize)]
struct HelixPagination {
	#[serde(default)]
	cursor: Option<String>,
}
