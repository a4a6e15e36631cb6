#![forbid(unsafe_code)]

//! Pauses speech while the microphone hears the streamer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow, bail};
use cpal::SampleFormat;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

pub const DEFAULT_RESUME_AFTER: Duration = Duration::from_millis(1000);

/// Something that can be paused while the streamer talks.
pub trait PauseTarget: Send + Sync {
	fn pause(&self);

	fn unpause(&self);
}

#[derive(Debug, Clone)]
pub struct MicPauserConfig {
	/// Input device name. `None` uses the default input.
	pub device: Option<String>,
	/// 0..=100; a block whose peak × 100 exceeds this pauses the target.
	pub threshold: i32,
	pub resume_after: Duration,
}

impl MicPauserConfig {
	pub fn new(device: Option<String>, threshold: i32) -> Self {
		Self {
			device,
			threshold: threshold.clamp(0, 100),
			resume_after: DEFAULT_RESUME_AFTER,
		}
	}
}

/// Pause on loud input; resume once the input stayed quiet for `resume_after`.
struct Debounce {
	target: Arc<dyn PauseTarget>,
	threshold: f32,
	resume_after: Duration,
	deadline: Mutex<Option<Instant>>,
	wake: Condvar,
	stop: AtomicBool,
}

impl Debounce {
	fn new(target: Arc<dyn PauseTarget>, threshold: i32, resume_after: Duration) -> Self {
		Self {
			target,
			threshold: threshold.clamp(0, 100) as f32,
			resume_after,
			deadline: Mutex::new(None),
			wake: Condvar::new(),
			stop: AtomicBool::new(false),
		}
	}

	fn observe(&self, samples: impl IntoIterator<Item = f32>) {
		let peak = samples.into_iter().fold(0.0f32, |m, s| m.max(s.abs()));
		if peak * 100.0 <= self.threshold {
			return;
		}

		self.target.pause();
		let mut deadline = self.deadline.lock();
		if deadline.is_none() {
			debug!(peak, "mic: speech detected; pausing");
		}
		*deadline = Some(Instant::now() + self.resume_after);
		self.wake.notify_one();
	}

	fn run_timer(&self) {
		let mut deadline = self.deadline.lock();
		while !self.stop.load(Ordering::SeqCst) {
			match *deadline {
				None => self.wake.wait(&mut deadline),
				Some(at) if Instant::now() >= at => {
					*deadline = None;
					MutexGuard::unlocked(&mut deadline, || self.target.unpause());
					debug!("mic: quiet again; resuming");
				}
				Some(at) => {
					self.wake.wait_until(&mut deadline, at);
				}
			}
		}
	}

	fn shutdown(&self) {
		{
			let _guard = self.deadline.lock();
			self.stop.store(true, Ordering::SeqCst);
		}
		self.wake.notify_all();
	}
}

fn find_input(name: Option<&str>) -> anyhow::Result<cpal::Device> {
	let host = cpal::default_host();
	match name.filter(|n| !n.trim().is_empty()) {
		Some(name) => host
			.input_devices()
			.context("enumerate input devices")?
			.find(|d| d.name().is_ok_and(|n| n == name))
			.ok_or_else(|| anyhow!("input device {name} not found")),
		None => host.default_input_device().ok_or_else(|| anyhow!("no default input device")),
	}
}

fn build_stream(device: &cpal::Device, debounce: Arc<Debounce>) -> anyhow::Result<cpal::Stream> {
	let supported = device.default_input_config().context("default input config")?;
	let config = supported.config();
	let on_error = |err: cpal::StreamError| error!(error = %err, "mic: input stream error");

	let stream = match supported.sample_format() {
		SampleFormat::F32 => device.build_input_stream(
			&config,
			move |data: &[f32], _: &cpal::InputCallbackInfo| debounce.observe(data.iter().copied()),
			on_error,
			None,
		),
		SampleFormat::I16 => device.build_input_stream(
			&config,
			move |data: &[i16], _: &cpal::InputCallbackInfo| {
				debounce.observe(data.iter().map(|s| *s as f32 / i16::MAX as f32))
			},
			on_error,
			None,
		),
		SampleFormat::U16 => device.build_input_stream(
			&config,
			move |data: &[u16], _: &cpal::InputCallbackInfo| {
				debounce.observe(data.iter().map(|s| (*s as f32 - 32768.0) / 32768.0))
			},
			on_error,
			None,
		),
		other => bail!("unsupported input sample format {other:?}"),
	};
	stream.context("build input stream")
}

/// Microphone listener bound to one pause target.
pub struct MicPauser {
	debounce: Arc<Debounce>,
	stop_tx: std_mpsc::Sender<()>,
	input: Option<JoinHandle<()>>,
	timer: Option<JoinHandle<()>>,
}

impl MicPauser {
	pub fn start(cfg: MicPauserConfig, target: Arc<dyn PauseTarget>) -> anyhow::Result<Self> {
		let debounce = Arc::new(Debounce::new(target, cfg.threshold, cfg.resume_after));

		let timer = {
			let debounce = Arc::clone(&debounce);
			thread::Builder::new()
				.name("mic-resume".into())
				.spawn(move || debounce.run_timer())
				.context("spawn mic resume thread")?
		};

		// cpal streams are not Send everywhere; the stream lives on its own thread.
		let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
		let (ready_tx, ready_rx) = std_mpsc::channel::<anyhow::Result<String>>();
		let input = {
			let debounce = Arc::clone(&debounce);
			let device = cfg.device.clone();
			thread::Builder::new()
				.name("mic-input".into())
				.spawn(move || {
					let opened = find_input(device.as_deref()).and_then(|dev| {
						let name = dev.name().unwrap_or_else(|_| "unknown".into());
						let stream = build_stream(&dev, debounce)?;
						stream.play().context("start input stream")?;
						Ok((name, stream))
					});
					match opened {
						Ok((name, stream)) => {
							let _ = ready_tx.send(Ok(name));
							let _ = stop_rx.recv();
							drop(stream);
						}
						Err(e) => {
							let _ = ready_tx.send(Err(e));
						}
					}
				})
				.context("spawn mic input thread")?
		};

		let pauser = Self {
			debounce,
			stop_tx,
			input: Some(input),
			timer: Some(timer),
		};

		match ready_rx.recv() {
			Ok(Ok(name)) => {
				info!(device = %name, threshold = cfg.threshold, "mic: listening");
				Ok(pauser)
			}
			Ok(Err(e)) => {
				pauser.stop();
				Err(e)
			}
			Err(_) => {
				pauser.stop();
				bail!("mic input thread exited before opening the device")
			}
		}
	}

	pub fn stop(mut self) {
		self.halt();
	}

	fn halt(&mut self) {
		let _ = self.stop_tx.send(());
		self.debounce.shutdown();
		for handle in [self.input.take(), self.timer.take()].into_iter().flatten() {
			if handle.join().is_err() {
				warn!("mic: worker thread panicked");
			}
		}
	}
}

impl Drop for MicPauser {
	fn drop(&mut self) {
		self.halt();
	}
}
