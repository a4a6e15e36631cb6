#![forbid(unsafe_code)]

mod bttv;
mod ffz;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tracing::warn;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Third-party emote names per channel, cached for the lifetime of the instance.
///
/// A channel the provider does not know is cached as an empty set. Transport
/// errors and server failures yield an empty set without caching, so the next
/// call retries.
#[derive(Debug)]
pub struct EmoteCache {
	http: reqwest::Client,
	bttv_base_url: String,
	ffz_base_url: String,
	bttv: Mutex<HashMap<String, Arc<HashSet<String>>>>,
	ffz: Mutex<HashMap<String, Arc<HashSet<String>>>>,
}

impl EmoteCache {
	pub fn new() -> anyhow::Result<Self> {
		Self::with_base_urls(bttv::BTTV_BASE_URL, ffz::FFZ_BASE_URL)
	}

	pub fn with_base_urls(bttv_base_url: impl Into<String>, ffz_base_url: impl Into<String>) -> anyhow::Result<Self> {
		Self::with_request_timeout(bttv_base_url, ffz_base_url, REQUEST_TIMEOUT)
	}

	/// Lookups run on the playback thread, so every request is bounded by `timeout`.
	pub fn with_request_timeout(
		bttv_base_url: impl Into<String>,
		ffz_base_url: impl Into<String>,
		timeout: Duration,
	) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("streamtools/0.x (emotes)")
			.timeout(timeout)
			.connect_timeout(CONNECT_TIMEOUT.min(timeout))
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			bttv_base_url: bttv_base_url.into(),
			ffz_base_url: ffz_base_url.into(),
			bttv: Mutex::new(HashMap::new()),
			ffz: Mutex::new(HashMap::new()),
		})
	}

	/// BTTV emote codes for a numeric room id.
	pub async fn bttv_emotes(&self, room_id: &str) -> Arc<HashSet<String>> {
		if room_id.is_empty() {
			return Arc::default();
		}
		let cached = self.bttv.lock().get(room_id).cloned();
		if let Some(hit) = cached {
			return hit;
		}

		match bttv::fetch_bttv_emote_codes(&self.http, &self.bttv_base_url, room_id).await {
			Ok(codes) => {
				let set: Arc<HashSet<String>> = Arc::new(codes.into_iter().collect());
				self.bttv.lock().insert(room_id.to_string(), set.clone());
				set
			}
			Err(e) => {
				warn!(room_id, error = %e, "bttv emote lookup failed");
				Arc::default()
			}
		}
	}

	/// FFZ emote names for a channel login.
	pub async fn ffz_emotes(&self, channel: &str) -> Arc<HashSet<String>> {
		if channel.is_empty() {
			return Arc::default();
		}
		let cached = self.ffz.lock().get(channel).cloned();
		if let Some(hit) = cached {
			return hit;
		}

		match ffz::fetch_ffz_emote_names(&self.http, &self.ffz_base_url, channel).await {
			Ok(names) => {
				let set: Arc<HashSet<String>> = Arc::new(names.into_iter().collect());
				self.ffz.lock().insert(channel.to_string(), set.clone());
				set
			}
			Err(e) => {
				warn!(channel, error = %e, "ffz emote lookup failed");
				Arc::default()
			}
		}
	}

	#[cfg(test)]
	fn seed_bttv(&self, room_id: &str, codes: &[&str]) {
		self.bttv
			.lock()
			.insert(room_id.to_string(), Arc::new(codes.iter().map(|c| c.to_string()).collect()));
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::TcpListener;

	use super::*;

	/// Serves one canned response per connection and counts requests.
	async fn serve(status: &'static str, body: &'static str) -> (String, Arc<AtomicUsize>) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let url = format!("http://{}", listener.local_addr().unwrap());
		let hits = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&hits);
		tokio::spawn(async move {
			while let Ok((mut sock, _)) = listener.accept().await {
				counter.fetch_add(1, Ordering::SeqCst);
				let mut buf = [0u8; 4096];
				let _ = sock.read(&mut buf).await;
				let reply = format!(
					"HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
					body.len()
				);
				let _ = sock.write_all(reply.as_bytes()).await;
				let _ = sock.shutdown().await;
			}
		});
		(url, hits)
	}

	#[tokio::test]
	async fn cached_entries_are_served_without_network() {
		let cache = EmoteCache::with_base_urls("http://127.0.0.1:9", "http://127.0.0.1:9").unwrap();
		cache.seed_bttv("42", &["catJAM"]);
		assert!(cache.bttv_emotes("42").await.contains("catJAM"));
		assert!(cache.bttv_emotes("").await.is_empty());
	}

	#[tokio::test]
	async fn unknown_ffz_room_is_fetched_once() {
		let (url, hits) = serve("404 Not Found", r#"{"error":"Not Found","status":404,"message":"No such room"}"#).await;
		let cache = EmoteCache::with_base_urls(url.clone(), url).unwrap();

		for _ in 0..5 {
			assert!(cache.ffz_emotes("nofzzroom").await.is_empty());
		}
		assert_eq!(hits.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn unknown_bttv_user_is_fetched_once() {
		let (url, hits) = serve("404 Not Found", r#"{"message":"user not found"}"#).await;
		let cache = EmoteCache::with_base_urls(url.clone(), url).unwrap();

		for _ in 0..3 {
			assert!(cache.bttv_emotes("1234").await.is_empty());
		}
		assert_eq!(hits.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn server_errors_are_retried() {
		let (url, hits) = serve("503 Service Unavailable", "{}").await;
		let cache = EmoteCache::with_base_urls(url.clone(), url).unwrap();

		assert!(cache.ffz_emotes("somechannel").await.is_empty());
		assert!(cache.ffz_emotes("somechannel").await.is_empty());
		assert_eq!(hits.load(Ordering::SeqCst), 2);
		assert!(cache.ffz.lock().is_empty());
	}

	#[tokio::test]
	async fn silent_server_times_out_with_no_emotes() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let url = format!("http://{}", listener.local_addr().unwrap());
		tokio::spawn(async move {
			let mut held = Vec::new();
			while let Ok((sock, _)) = listener.accept().await {
				held.push(sock);
			}
		});
		let cache = EmoteCache::with_request_timeout(url.clone(), url, Duration::from_millis(300)).unwrap();

		let lookup = tokio::time::timeout(Duration::from_secs(5), cache.ffz_emotes("x")).await;
		assert!(lookup.expect("lookup must give up on a silent server").is_empty());
		assert!(cache.ffz.lock().is_empty());
	}
}
