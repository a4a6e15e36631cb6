#![forbid(unsafe_code)]

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

pub(crate) const BTTV_BASE_URL: &str = "https://api.betterttv.net/3";

/// Channel and shared BTTV emote codes for a Twitch room id. Unknown users have none.
pub(crate) async fn fetch_bttv_emote_codes(
	http: &reqwest::Client,
	base_url: &str,
	room_id: &str,
) -> anyhow::Result<Vec<String>> {
	let url = format!("{base_url}/cached/users/twitch/{}", urlencoding::encode(room_id));
	let resp = http.get(url).send().await.context("bttv user request")?;
	if resp.status() == reqwest::StatusCode::NOT_FOUND {
		info!(room_id, "bttv user not found");
		return Ok(Vec::new());
	}
	let body = resp
		.error_for_status()
		.context("bttv user status")?
		.text()
		.await
		.context("bttv user read body")?;

	let codes = parse_bttv_user(&body)?;
	info!(room_id, emote_count = codes.len(), "bttv channel emotes fetched");
	Ok(codes)
}

pub(crate) fn parse_bttv_user(body: &str) -> anyhow::Result<Vec<String>> {
	let parsed: BttvUserResponse = serde_json::from_str(body).context("bttv user json")?;
	Ok(parsed
		.channel_emotes
		.into_iter()
		.chain(parsed.shared_emotes)
		.filter_map(|e| e.code)
		.filter(|c| !c.is_empty())
		.collect())
}

#[derive(Debug, Deserialize)]
struct BttvUserResponse {
	#[serde(default, rename = "channelEmotes")]
	channel_emotes: Vec<BttvEmote>,
	#[serde(default, rename = "sharedEmotes")]
	shared_emotes: Vec<BttvEmote>,
}

#[derive(Debug, Deserialize)]
struct BttvEmote {
	#[serde(default)]
	code: Option<String>,
}
