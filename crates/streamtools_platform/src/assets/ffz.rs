#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

pub(crate) const FFZ_BASE_URL: &str = "https://api.frankerfacez.com";

/// Emote names in a channel's FFZ room set. A channel without a room has none.
pub(crate) async fn fetch_ffz_emote_names(
	http: &reqwest::Client,
	base_url: &str,
	room_login: &str,
) -> anyhow::Result<Vec<String>> {
	let url = format!("{base_url}/v1/room/{}", urlencoding::encode(room_login));
	let resp = http.get(url).send().await.context("ffz room request")?;
	if resp.status() == reqwest::StatusCode::NOT_FOUND {
		info!(room_login, "ffz room not found");
		return Ok(Vec::new());
	}
	let body = resp
		.error_for_status()
		.context("ffz room status")?
		.text()
		.await
		.context("ffz room read body")?;

	let names = parse_ffz_room(&body)?;
	info!(room_login, emote_count = names.len(), "ffz room emotes fetched");
	Ok(names)
}

pub(crate) fn parse_ffz_room(body: &str) -> anyhow::Result<Vec<String>> {
	let parsed: FfzRoomResponse = serde_json::from_str(body).context("ffz room json")?;

	let Some(set) = parsed
		.room
		.and_then(|r| parsed.sets.get(&r.set.to_string()))
		.or_else(|| parsed.sets.values().next())
	else {
		return Ok(Vec::new());
	};

	Ok(set
		.emoticons
		.iter()
		.filter_map(|e| e.name.clone())
		.filter(|n| !n.is_empty())
		.collect())
}

#[derive(Debug, Deserialize)]
struct FfzRoomResponse {
	#[serde(default)]
	room: Option<FfzRoom>,
	#[serde(default)]
	sets: HashMap<String, FfzEmoteSet>,
}

#[derive(Debug, Deserialize)]
struct FfzRoom {
	set: u64,
}

#[derive(Debug, Deserialize)]
struct FfzEmoteSet {
	#[serde(default)]
	emoticons: Vec<FfzEmote>,
}

#[derive(Debug, Deserialize)]
struct FfzEmote {
	#[serde(default)]
	name: Option<String>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reads_room_set_emoticons() {
		let body = r#"{"room":{"set":99},"sets":{"99":{"emoticons":[{"id":1,"name":"OMEGALUL"},{"id":2}]}}}"#;
		assert_eq!(parse_ffz_room(body).unwrap(), vec!["OMEGALUL"]);
	}

	#[test]
	fn not_found_body_has_no_emotes() {
		assert!(parse_ffz_room(r#"{"error":"Not Found","status":404}"#).unwrap().is_empty());
	}

	#[test]
	fn malformed_body_is_error() {
		assert!(parse_ffz_room("<html>bad gateway</html>").is_err());
	}
}
