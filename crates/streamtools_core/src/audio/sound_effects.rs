#![forbid(unsafe_code)]

use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{AudioGate, AudioOutput, PlaybackControl, PlaybackRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedSound {
	filename: PathBuf,
	device: String,
	volume: u32,
}

enum SoundEntry {
	Play(QueuedSound),
	Exit,
}

/// Plays sound files one after another on a dedicated thread.
///
/// The shared [`AudioGate`] is held for the duration of every sound so speech waits.
pub struct SoundEffectPlayer {
	tx: std_mpsc::Sender<SoundEntry>,
	current: Arc<Mutex<Option<Arc<dyn PlaybackControl>>>>,
	worker: Mutex<Option<JoinHandle<()>>>,
}

impl SoundEffectPlayer {
	pub fn start(output: Arc<dyn AudioOutput>, gate: Arc<AudioGate>) -> anyhow::Result<Self> {
		let (tx, rx) = std_mpsc::channel();
		let current: Arc<Mutex<Option<Arc<dyn PlaybackControl>>>> = Arc::new(Mutex::new(None));

		let worker = {
			let current = Arc::clone(&current);
			thread::Builder::new()
				.name("sound-effects".into())
				.spawn(move || run(&rx, output.as_ref(), &gate, &current))
				.context("spawn sound effect thread")?
		};

		Ok(Self {
			tx,
			current,
			worker: Mutex::new(Some(worker)),
		})
	}

	/// Queue a file. Blank names, a blank device or a volume outside `0..=100` are ignored.
	pub fn queue_sound(&self, filename: &str, output_device: &str, volume: i32) -> bool {
		if filename.trim().is_empty() || output_device.trim().is_empty() || !(0..=100).contains(&volume) {
			debug!(filename, output_device, volume, "sound: rejected");
			return false;
		}

		let sound = QueuedSound {
			filename: PathBuf::from(filename),
			device: output_device.to_string(),
			volume: volume.unsigned_abs(),
		};
		self.tx.send(SoundEntry::Play(sound)).is_ok()
	}

	/// Stop the current sound and end the thread. Queued sounds are dropped.
	pub fn shutdown(&self) {
		let _ = self.tx.send(SoundEntry::Exit);
		if let Some(ctl) = self.current.lock().as_ref() {
			ctl.stop();
		}
		if let Some(worker) = self.worker.lock().take()
			&& worker.join().is_err()
		{
			warn!("sound: effect thread panicked");
		}
	}
}

impl Drop for SoundEffectPlayer {
	fn drop(&mut self) {
		let _ = self.tx.send(SoundEntry::Exit);
	}
}

fn run(
	rx: &std_mpsc::Receiver<SoundEntry>,
	output: &dyn AudioOutput,
	gate: &AudioGate,
	current: &Mutex<Option<Arc<dyn PlaybackControl>>>,
) {
	while let Ok(SoundEntry::Play(sound)) = rx.recv() {
		if !sound.filename.is_file() {
			debug!(file = %sound.filename.display(), "sound: file missing; skipped");
			continue;
		}

		let played = catch_unwind(AssertUnwindSafe(|| play_one(&sound, output, gate, current)));
		*current.lock() = None;
		match played {
			Ok(Ok(())) => metrics::counter!("streamtools_sound_effects_played_total").increment(1),
			Ok(Err(e)) => warn!(file = %sound.filename.display(), error = format!("{e:#}"), "sound: playback failed"),
			Err(_) => warn!(file = %sound.filename.display(), "sound: playback panicked"),
		}
	}
	info!("sound: effect thread exiting");
}

fn play_one(
	sound: &QueuedSound,
	output: &dyn AudioOutput,
	gate: &AudioGate,
	current: &Mutex<Option<Arc<dyn PlaybackControl>>>,
) -> anyhow::Result<()> {
	let bytes = fs::read(&sound.filename).with_context(|| format!("read {}", sound.filename.display()))?;
	let _busy = gate.hold();
	debug!(file = %sound.filename.display(), device = %sound.device, volume = sound.volume, "sound: playing");
	output.play(
		PlaybackRequest {
			bytes,
			device: Some(sound.device.clone()),
			volume: sound.volume,
		},
		&mut |ctl| *current.lock() = Some(ctl),
	)
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::Ordering;

	use super::*;
	use crate::test_support::{FakeOutput, wait_until};

	fn temp_sound(contents: &[u8]) -> PathBuf {
		let path = std::env::temp_dir().join(format!("streamtools-sound-{}.wav", uuid::Uuid::new_v4()));
		fs::write(&path, contents).unwrap();
		path
	}

	#[test]
	fn invalid_requests_are_rejected() {
		let player = SoundEffectPlayer::start(Arc::new(FakeOutput::default()), Arc::new(AudioGate::new())).unwrap();
		assert!(!player.queue_sound("", "Speakers", 50));
		assert!(!player.queue_sound("a.wav", "  ", 50));
		assert!(!player.queue_sound("a.wav", "Speakers", -1));
		assert!(!player.queue_sound("a.wav", "Speakers", 101));
		assert!(player.queue_sound("a.wav", "Speakers", 100));
		player.shutdown();
	}

	#[test]
	fn sounds_play_in_order_and_missing_files_are_skipped() {
		let output = Arc::new(FakeOutput::default());
		let player = SoundEffectPlayer::start(Arc::clone(&output) as Arc<dyn AudioOutput>, Arc::new(AudioGate::new())).unwrap();
		let first = temp_sound(b"first");
		let second = temp_sound(b"second");

		assert!(player.queue_sound(first.to_str().unwrap(), "Speakers", 40));
		assert!(player.queue_sound("/definitely/not/here.wav", "Speakers", 40));
		assert!(player.queue_sound(second.to_str().unwrap(), "Headset", 90));

		assert!(wait_until(|| output.played.lock().len() == 2));
		assert_eq!(output.texts(), vec!["first", "second"]);
		let played = output.played.lock();
		assert_eq!(played[0].device.as_deref(), Some("Speakers"));
		assert_eq!(played[1].volume, 90);
		drop(played);

		player.shutdown();
		let _ = fs::remove_file(first);
		let _ = fs::remove_file(second);
	}

	#[test]
	fn gate_is_busy_while_a_sound_plays() {
		let output = Arc::new(FakeOutput::default());
		output.hold.store(true, Ordering::SeqCst);
		let gate = Arc::new(AudioGate::new());
		let player = SoundEffectPlayer::start(Arc::clone(&output) as Arc<dyn AudioOutput>, Arc::clone(&gate)).unwrap();
		let file = temp_sound(b"ding");

		assert!(player.queue_sound(file.to_str().unwrap(), "Speakers", 50));
		assert!(wait_until(|| output.played.lock().len() == 1));
		assert!(gate.is_busy());

		player.shutdown();
		assert!(!gate.is_busy());
		let _ = fs::remove_file(file);
	}
}
