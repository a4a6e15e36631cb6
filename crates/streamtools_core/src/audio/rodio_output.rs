#![forbid(unsafe_code)]

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use rodio::cpal::traits::{DeviceTrait, HostTrait};
use rodio::{Decoder, OutputStream, OutputStreamBuilder, Sink};
use tracing::{debug, warn};

use super::{AudioOutput, PlaybackControl, PlaybackRequest};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Names of every output device on the default host, in enumeration order.
pub fn output_device_names() -> Vec<String> {
	let host = rodio::cpal::default_host();
	match host.output_devices() {
		Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
		Err(e) => {
			warn!(error = %e, "audio: output devices could not be enumerated");
			Vec::new()
		}
	}
}

fn open_stream(device: Option<&str>) -> anyhow::Result<OutputStream> {
	if let Some(name) = device.filter(|n| !n.trim().is_empty()) {
		let host = rodio::cpal::default_host();
		let found = host
			.output_devices()
			.context("enumerate output devices")?
			.find(|d| d.name().is_ok_and(|n| n == name));
		match found {
			Some(dev) => {
				return OutputStreamBuilder::from_device(dev)
					.and_then(|b| b.open_stream())
					.with_context(|| format!("open output device {name}"));
			}
			None => debug!(device = name, "audio: output device not found; using default"),
		}
	}
	OutputStreamBuilder::open_default_stream().context("open default output device")
}

struct SinkControl {
	sink: Sink,
	stopped: AtomicBool,
}

impl PlaybackControl for SinkControl {
	fn pause(&self) {
		self.sink.pause();
	}

	fn resume(&self) {
		self.sink.play();
	}

	fn stop(&self) {
		self.stopped.store(true, Ordering::SeqCst);
		self.sink.stop();
	}
}

/// Plays through rodio on a named or default device.
#[derive(Debug, Default, Clone, Copy)]
pub struct RodioOutput;

impl AudioOutput for RodioOutput {
	fn play(&self, request: PlaybackRequest, on_start: &mut dyn FnMut(Arc<dyn PlaybackControl>)) -> anyhow::Result<()> {
		let mut stream = open_stream(request.device.as_deref())?;
		stream.log_on_drop(false);

		let source = Decoder::new(Cursor::new(request.bytes)).context("decode audio")?;
		let control = Arc::new(SinkControl {
			sink: Sink::connect_new(stream.mixer()),
			stopped: AtomicBool::new(false),
		});
		control.sink.set_volume(request.volume.min(100) as f32 / 100.0);
		control.sink.append(source);

		on_start(Arc::clone(&control) as Arc<dyn PlaybackControl>);

		while !control.sink.empty() && !control.stopped.load(Ordering::SeqCst) {
			thread::sleep(POLL_INTERVAL);
		}
		Ok(())
	}
}
