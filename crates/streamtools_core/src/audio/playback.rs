#![forbid(unsafe_code)]

//! One consumer thread per TTS session, speaking queued chat messages in order.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use parking_lot::{Condvar, Mutex};
use streamtools_platform::ChatMessage;
use tracing::{debug, error, info, trace, warn};

use super::mic::PauseTarget;
use super::{AudioGate, AudioOutput, PlaybackControl, PlaybackRequest, SpeechSynthesizer};
use crate::filters::TtsFilterChain;

const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Voice parameters, read fresh for every utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceSettings {
	pub voice: Option<String>,
	/// 0..=100
	pub volume: u32,
	pub device: Option<String>,
}

pub type SettingsSource = Arc<dyn Fn() -> VoiceSettings + Send + Sync>;

/// Collaborators of a [`PlaybackEngine`].
pub struct EngineParts {
	pub chain: TtsFilterChain,
	pub synth: Arc<dyn SpeechSynthesizer>,
	pub output: Arc<dyn AudioOutput>,
	pub gate: Arc<AudioGate>,
	pub settings: SettingsSource,
}

enum Entry {
	Message(Box<ChatMessage>),
	Poison,
}

#[derive(Default)]
struct Queue {
	entries: VecDeque<Entry>,
	/// Entries still to be discarded unplayed.
	skip: usize,
}

/// The utterance being spoken. Its speaker is known before the output hands over a control.
#[derive(Default)]
struct Current {
	username: Option<String>,
	control: Option<Arc<dyn PlaybackControl>>,
	/// A stop arrived before `control` did.
	stop_pending: bool,
}

struct Shared {
	queue: Mutex<Queue>,
	ready: Condvar,
	/// Also serialises pause/resume/stop against playback start and teardown.
	current: Mutex<Current>,
	stopping: AtomicBool,
}

impl Shared {
	fn push(&self, entry: Entry) {
		self.queue.lock().entries.push_back(entry);
		self.ready.notify_one();
	}

	fn next(&self, name: &str) -> Option<ChatMessage> {
		let mut q = self.queue.lock();
		loop {
			if self.stopping.load(Ordering::SeqCst) {
				return None;
			}
			match q.entries.pop_front() {
				None => self.ready.wait(&mut q),
				Some(Entry::Poison) => return None,
				Some(Entry::Message(msg)) if q.skip > 0 => {
					q.skip -= 1;
					metrics::counter!("streamtools_tts_skipped_total").increment(1);
					debug!(session = name, user = %msg.username, remaining = q.skip, "tts: skipping queued message");
				}
				Some(Entry::Message(msg)) => return Some(*msg),
			}
		}
	}

	fn with_current(&self, f: impl FnOnce(&dyn PlaybackControl)) {
		if let Some(ctl) = self.current.lock().control.as_deref() {
			f(ctl);
		}
	}

	fn stop_current(&self) {
		let mut current = self.current.lock();
		match current.control.as_deref() {
			Some(ctl) => ctl.stop(),
			None if current.username.is_some() => current.stop_pending = true,
			None => {}
		}
	}

	fn begin(&self, username: &str) {
		*self.current.lock() = Current {
			username: Some(username.to_string()),
			..Current::default()
		};
	}

	fn started(&self, ctl: Arc<dyn PlaybackControl>) {
		let mut current = self.current.lock();
		if std::mem::take(&mut current.stop_pending) {
			ctl.stop();
		}
		current.control = Some(ctl);
	}

	fn clear_current(&self) {
		*self.current.lock() = Current::default();
	}
}

/// Serialised text-to-speech playback for one chat.
pub struct PlaybackEngine {
	name: String,
	shared: Arc<Shared>,
	worker: Mutex<Option<(JoinHandle<()>, std_mpsc::Receiver<()>)>>,
}

impl std::fmt::Debug for PlaybackEngine {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PlaybackEngine")
			.field("name", &self.name)
			.field("pending", &self.pending())
			.finish_non_exhaustive()
	}
}

impl PlaybackEngine {
	pub fn start(name: impl Into<String>, parts: EngineParts) -> anyhow::Result<Self> {
		let name = name.into();
		let shared = Arc::new(Shared {
			queue: Mutex::new(Queue::default()),
			ready: Condvar::new(),
			current: Mutex::new(Current::default()),
			stopping: AtomicBool::new(false),
		});

		let (done_tx, done_rx) = std_mpsc::channel();
		let handle = {
			let shared = Arc::clone(&shared);
			let name = name.clone();
			thread::Builder::new()
				.name(format!("tts-{name}"))
				.spawn(move || {
					run(&shared, &parts, &name);
					let _ = done_tx.send(());
				})
				.context("spawn tts playback thread")?
		};

		info!(session = %name, "tts: playback engine started");
		Ok(Self {
			name,
			shared,
			worker: Mutex::new(Some((handle, done_rx))),
		})
	}

	/// Queue a message. Never blocks on playback.
	pub fn enqueue(&self, msg: ChatMessage) {
		if self.shared.stopping.load(Ordering::SeqCst) {
			return;
		}
		trace!(session = %self.name, user = %msg.username, "tts: queued");
		self.shared.push(Entry::Message(Box::new(msg)));
	}

	pub fn pending(&self) -> usize {
		self.shared.queue.lock().entries.len()
	}

	/// Sender of the utterance being played right now.
	pub fn current_username(&self) -> Option<String> {
		self.shared.current.lock().username.clone()
	}

	pub fn pause(&self) {
		self.shared.with_current(|c| c.pause());
	}

	pub fn unpause(&self) {
		self.shared.with_current(|c| c.resume());
	}

	/// Stop the current utterance, even one whose audio has not started yet.
	pub fn skip_current(&self) {
		self.shared.stop_current();
	}

	/// Discard everything queued right now and stop the current utterance.
	/// Messages queued afterwards still play.
	pub fn skip_all(&self) {
		{
			let mut q = self.shared.queue.lock();
			q.skip = q.entries.len();
			debug!(session = %self.name, skip = q.skip, "tts: skipping all queued messages");
		}
		self.skip_current();
	}

	/// Stop the consumer and wait a bounded time for it to exit.
	pub fn shutdown(&self) {
		self.shared.stopping.store(true, Ordering::SeqCst);
		self.shared.push(Entry::Poison);
		self.skip_current();

		let Some((handle, done_rx)) = self.worker.lock().take() else {
			return;
		};
		match done_rx.recv_timeout(SHUTDOWN_WAIT) {
			Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
				if handle.join().is_err() {
					warn!(session = %self.name, "tts: playback thread panicked");
				}
				info!(session = %self.name, "tts: playback engine stopped");
			}
			Err(std_mpsc::RecvTimeoutError::Timeout) => {
				warn!(session = %self.name, "tts: playback thread did not stop in time; detaching");
			}
		}
	}
}

impl PauseTarget for PlaybackEngine {
	fn pause(&self) {
		PlaybackEngine::pause(self);
	}

	fn unpause(&self) {
		PlaybackEngine::unpause(self);
	}
}

impl Drop for PlaybackEngine {
	fn drop(&mut self) {
		if !self.shared.stopping.swap(true, Ordering::SeqCst) {
			self.shared.push(Entry::Poison);
			self.skip_current();
		}
	}
}

fn run(shared: &Shared, parts: &EngineParts, name: &str) {
	while let Some(msg) = shared.next(name) {
		match catch_unwind(AssertUnwindSafe(|| speak(shared, parts, &msg))) {
			Ok(Ok(())) => {}
			Ok(Err(e)) => {
				metrics::counter!("streamtools_tts_failures_total").increment(1);
				error!(session = name, user = %msg.username, error = format!("{e:#}"), "tts: playback failed");
			}
			Err(_) => {
				metrics::counter!("streamtools_tts_failures_total").increment(1);
				error!(session = name, user = %msg.username, "tts: playback panicked");
			}
		}
		shared.clear_current();
	}
	debug!(session = name, "tts: playback thread exiting");
}

fn speak(shared: &Shared, parts: &EngineParts, msg: &ChatMessage) -> anyhow::Result<()> {
	let Some(text) = parts.chain.render(msg) else {
		trace!(user = %msg.username, "tts: message filtered out");
		return Ok(());
	};

	let settings = (parts.settings)();
	let bytes = parts
		.synth
		.synthesize(&text, settings.voice.as_deref(), settings.volume)
		.context("synthesize")?;

	parts.gate.wait_idle();
	if shared.stopping.load(Ordering::SeqCst) {
		return Ok(());
	}

	shared.begin(&msg.username);
	metrics::counter!("streamtools_tts_utterances_total").increment(1);
	parts.output.play(
		PlaybackRequest {
			bytes,
			device: settings.device,
			volume: settings.volume,
		},
		&mut |ctl| shared.started(ctl),
	)
}
