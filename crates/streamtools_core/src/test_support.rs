#![forbid(unsafe_code)]

//! Hand-written fakes shared by unit tests.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use streamtools_domain::{AccountName, ChannelName};
use streamtools_platform::{
	ChatCredentials, ChatTransport, SecretString, TransportEvent, TransportFactory, TransportHandle, TransportState,
};
use tokio::sync::{mpsc, watch};

use crate::audio::{AudioOutput, PlaybackControl, PlaybackRequest, SpeechSynthesizer};
use crate::auth::{ChannelResolver, TokenProvider};

pub(crate) struct FakeTransport {
	pub(crate) username: AccountName,
	pub(crate) channel: ChannelName,
	pub(crate) state_tx: watch::Sender<TransportState>,
	pub(crate) events_tx: mpsc::Sender<TransportEvent>,
	pub(crate) hang_reconnect: AtomicBool,
	pub(crate) join_works: AtomicBool,
	pub(crate) connects: AtomicUsize,
	pub(crate) reconnects: AtomicUsize,
	pub(crate) joins: AtomicUsize,
	pub(crate) disconnects: AtomicUsize,
	pub(crate) sent: Mutex<Vec<(ChannelName, String)>>,
}

impl FakeTransport {
	pub(crate) fn set_state(&self, connected: bool, joined: bool) {
		let mut set = BTreeSet::new();
		if joined {
			set.insert(self.channel.clone());
		}
		self.state_tx.send_replace(TransportState { connected, joined: set });
	}

	pub(crate) async fn emit(&self, event: TransportEvent) {
		self.events_tx.send(event).await.expect("dispatcher alive");
	}
}

#[async_trait::async_trait]
impl ChatTransport for FakeTransport {
	fn username(&self) -> &AccountName {
		&self.username
	}

	fn is_initialized(&self) -> bool {
		true
	}

	fn is_connected(&self) -> bool {
		self.state_tx.borrow().connected
	}

	fn joined_channels(&self) -> Vec<ChannelName> {
		self.state_tx.borrow().joined.iter().cloned().collect()
	}

	fn state(&self) -> watch::Receiver<TransportState> {
		self.state_tx.subscribe()
	}

	async fn connect(&self) -> anyhow::Result<()> {
		self.connects.fetch_add(1, Ordering::SeqCst);
		self.set_state(true, true);
		Ok(())
	}

	async fn reconnect(&self) -> anyhow::Result<()> {
		self.reconnects.fetch_add(1, Ordering::SeqCst);
		if self.hang_reconnect.load(Ordering::SeqCst) {
			futures::future::pending::<()>().await;
		}
		self.set_state(true, true);
		Ok(())
	}

	async fn join(&self, _channel: &ChannelName) -> anyhow::Result<()> {
		self.joins.fetch_add(1, Ordering::SeqCst);
		if self.join_works.load(Ordering::SeqCst) {
			self.set_state(true, true);
		}
		Ok(())
	}

	async fn send_message(&self, channel: &ChannelName, text: &str) -> anyhow::Result<()> {
		self.sent.lock().push((channel.clone(), text.to_string()));
		Ok(())
	}

	async fn ban(&self, channel: &ChannelName, user: &str, _reason: Option<&str>) -> anyhow::Result<()> {
		self.sent.lock().push((channel.clone(), format!("/ban {user}")));
		Ok(())
	}

	async fn timeout(
		&self,
		channel: &ChannelName,
		user: &str,
		duration: Duration,
		_reason: Option<&str>,
	) -> anyhow::Result<()> {
		self.sent
			.lock()
			.push((channel.clone(), format!("/timeout {user} {}", duration.as_secs())));
		Ok(())
	}

	async fn disconnect(&self) {
		self.disconnects.fetch_add(1, Ordering::SeqCst);
		self.set_state(false, false);
	}
}

/// Records every transport it builds. Connecting succeeds unless the
/// channel is listed in `hang_reconnect_on`.
#[derive(Default)]
pub(crate) struct FakeFactory {
	pub(crate) created: Mutex<Vec<Arc<FakeTransport>>>,
	pub(crate) hang_reconnect_on: Mutex<HashSet<String>>,
}

impl FakeFactory {
	pub(crate) fn transport(&self, idx: usize) -> Arc<FakeTransport> {
		Arc::clone(&self.created.lock()[idx])
	}

	pub(crate) fn count(&self) -> usize {
		self.created.lock().len()
	}
}

impl TransportFactory for FakeFactory {
	fn create(&self, credentials: ChatCredentials, channel: ChannelName) -> TransportHandle {
		let (events_tx, events_rx) = mpsc::channel(64);
		let (state_tx, _) = watch::channel(TransportState::default());
		let hang = self.hang_reconnect_on.lock().contains(channel.as_str());
		let transport = Arc::new(FakeTransport {
			username: credentials.username,
			channel,
			state_tx,
			events_tx,
			hang_reconnect: AtomicBool::new(hang),
			join_works: AtomicBool::new(true),
			connects: AtomicUsize::new(0),
			reconnects: AtomicUsize::new(0),
			joins: AtomicUsize::new(0),
			disconnects: AtomicUsize::new(0),
			sent: Mutex::new(Vec::new()),
		});
		self.created.lock().push(Arc::clone(&transport));
		TransportHandle { transport, events_rx }
	}
}

/// Channel ids are `id-<channel>` unless the channel is listed as unknown.
#[derive(Default)]
pub(crate) struct FakeResolver {
	pub(crate) unknown: Mutex<HashSet<String>>,
	pub(crate) chatters: Mutex<HashMap<String, Vec<String>>>,
}

#[async_trait::async_trait]
impl ChannelResolver for FakeResolver {
	async fn resolve_channel_id(&self, _account: &AccountName, channel: &ChannelName) -> Option<String> {
		if self.unknown.lock().contains(channel.as_str()) {
			return None;
		}
		Some(format!("id-{channel}"))
	}

	async fn chatters(&self, _account: &AccountName, channel_id: &str) -> anyhow::Result<Vec<String>> {
		self.chatters
			.lock()
			.get(channel_id)
			.cloned()
			.ok_or_else(|| anyhow::anyhow!("no chatters for {channel_id}"))
	}
}

pub(crate) struct FakeTokens;

#[async_trait::async_trait]
impl TokenProvider for FakeTokens {
	async fn access_token(&self, username: &AccountName) -> Option<SecretString> {
		(!username.matches("nobody")).then(|| SecretString::new("token"))
	}
}

pub(crate) fn account(name: &str) -> AccountName {
	AccountName::new(name).unwrap()
}

pub(crate) fn channel(name: &str) -> ChannelName {
	ChannelName::new(name).unwrap()
}

/// Poll `cond` every 5 ms for up to one second.
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
	while tokio::time::Instant::now() < deadline {
		if cond() {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	cond()
}

pub(crate) struct FakeControl {
	stopped: AtomicBool,
	pauses: Arc<AtomicUsize>,
	resumes: Arc<AtomicUsize>,
}

impl PlaybackControl for FakeControl {
	fn pause(&self) {
		self.pauses.fetch_add(1, Ordering::SeqCst);
	}

	fn resume(&self) {
		self.resumes.fetch_add(1, Ordering::SeqCst);
	}

	fn stop(&self) {
		self.stopped.store(true, Ordering::SeqCst);
	}
}

/// Records what it plays once the control handle is out. While `hold` is set,
/// playback lasts until stopped. While `delay_start` is set, the control is not handed out yet.
#[derive(Default)]
pub(crate) struct FakeOutput {
	pub(crate) hold: AtomicBool,
	pub(crate) delay_start: AtomicBool,
	pub(crate) played: Mutex<Vec<PlaybackRequest>>,
	pub(crate) pauses: Arc<AtomicUsize>,
	pub(crate) resumes: Arc<AtomicUsize>,
}

impl FakeOutput {
	pub(crate) fn texts(&self) -> Vec<String> {
		self.played
			.lock()
			.iter()
			.map(|r| String::from_utf8_lossy(&r.bytes).into_owned())
			.collect()
	}
}

impl AudioOutput for FakeOutput {
	fn play(&self, request: PlaybackRequest, on_start: &mut dyn FnMut(Arc<dyn PlaybackControl>)) -> anyhow::Result<()> {
		let control = Arc::new(FakeControl {
			stopped: AtomicBool::new(false),
			pauses: Arc::clone(&self.pauses),
			resumes: Arc::clone(&self.resumes),
		});
		while self.delay_start.load(Ordering::SeqCst) {
			std::thread::sleep(Duration::from_millis(2));
		}
		on_start(Arc::clone(&control) as Arc<dyn PlaybackControl>);
		self.played.lock().push(request);
		while self.hold.load(Ordering::SeqCst) && !control.stopped.load(Ordering::SeqCst) {
			std::thread::sleep(Duration::from_millis(2));
		}
		Ok(())
	}
}

/// "Synthesizes" the text as its UTF-8 bytes. Panics on text containing `boom`.
#[derive(Default)]
pub(crate) struct FakeSynth {
	pub(crate) calls: Mutex<Vec<(String, Option<String>, u32)>>,
}

impl SpeechSynthesizer for FakeSynth {
	fn synthesize(&self, text: &str, voice: Option<&str>, volume: u32) -> anyhow::Result<Vec<u8>> {
		assert!(!text.contains("boom"), "synthesizer exploded");
		self.calls.lock().push((text.to_string(), voice.map(str::to_string), volume));
		Ok(text.as_bytes().to_vec())
	}
}

/// Blocking poll for plain threads: every 5 ms for up to two seconds.
pub(crate) fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
	let deadline = std::time::Instant::now() + Duration::from_secs(2);
	while std::time::Instant::now() < deadline {
		if cond() {
			return true;
		}
		std::thread::sleep(Duration::from_millis(5));
	}
	cond()
}
