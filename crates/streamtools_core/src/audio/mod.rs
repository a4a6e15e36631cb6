#![forbid(unsafe_code)]

//! Speech synthesis, audio output and the serialised playback paths built on them.

pub mod mic;
pub mod playback;
pub mod rodio_output;
pub mod sound_effects;
pub mod synth;


use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

pub use mic::{MicPauser, MicPauserConfig, PauseTarget};
pub use playback::{EngineParts, PlaybackEngine, SettingsSource, VoiceSettings};
pub use rodio_output::{RodioOutput, output_device_names};
pub use sound_effects::SoundEffectPlayer;
pub use synth::{CommandSynthesizer, SpeechSynthesizer};

/// Handle to a sound that is currently playing.
pub trait PlaybackControl: Send + Sync {
	fn pause(&self);

	fn resume(&self);

	/// Ends playback; the blocked `play` call returns shortly after.
	fn stop(&self);
}

/// Encoded audio (WAV, MP3, ...) to play on one device.
#[derive(Clone)]
pub struct PlaybackRequest {
	pub bytes: Vec<u8>,
	/// Exact output device name. `None` plays on the default device.
	pub device: Option<String>,
	/// 0..=100
	pub volume: u32,
}

impl fmt::Debug for PlaybackRequest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PlaybackRequest")
			.field("bytes", &self.bytes.len())
			.field("device", &self.device)
			.field("volume", &self.volume)
			.finish()
	}
}

/// Blocking audio sink.
pub trait AudioOutput: Send + Sync {
	/// Play `request` to completion or until stopped.
	///
	/// `on_start` receives the control handle once playback has begun, before this call blocks.
	fn play(&self, request: PlaybackRequest, on_start: &mut dyn FnMut(Arc<dyn PlaybackControl>)) -> anyhow::Result<()>;
}

/// Keeps speech from overlapping sound effects.
#[derive(Debug, Default)]
pub struct AudioGate {
	busy: Mutex<bool>,
	idle: Condvar,
}

impl AudioGate {
	pub fn new() -> Self {
		Self::default()
	}

	/// Mark the gate busy until the guard drops.
	pub fn hold(&self) -> GateGuard<'_> {
		*self.busy.lock() = true;
		GateGuard { gate: self }
	}

	pub fn is_busy(&self) -> bool {
		*self.busy.lock()
	}

	/// Block until no sound effect is playing.
	pub fn wait_idle(&self) {
		let mut busy = self.busy.lock();
		while *busy {
			self.idle.wait(&mut busy);
		}
	}

	fn release(&self) {
		*self.busy.lock() = false;
		self.idle.notify_all();
	}
}

pub struct GateGuard<'a> {
	gate: &'a AudioGate,
}

impl Drop for GateGuard<'_> {
	fn drop(&mut self) {
		self.gate.release();
	}
}
