#![forbid(unsafe_code)]

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{Context, bail};
use tracing::trace;

/// Renders text to an in-memory WAV file.
pub trait SpeechSynthesizer: Send + Sync {
	/// `volume` is 0..=100.
	fn synthesize(&self, text: &str, voice: Option<&str>, volume: u32) -> anyhow::Result<Vec<u8>>;
}

/// Runs an espeak-compatible program that writes WAV to stdout.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
	program: String,
}

impl Default for CommandSynthesizer {
	fn default() -> Self {
		Self::new("espeak-ng")
	}
}

impl CommandSynthesizer {
	pub fn new(program: impl Into<String>) -> Self {
		Self { program: program.into() }
	}
}

impl SpeechSynthesizer for CommandSynthesizer {
	fn synthesize(&self, text: &str, voice: Option<&str>, volume: u32) -> anyhow::Result<Vec<u8>> {
		let mut cmd = Command::new(&self.program);
		cmd.arg("--stdout").arg("-a").arg(volume.min(100).to_string());
		if let Some(voice) = voice.filter(|v| !v.trim().is_empty()) {
			cmd.arg("-v").arg(voice);
		}

		let mut child = cmd
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.spawn()
			.with_context(|| format!("spawn {}", self.program))?;

		if let Some(mut stdin) = child.stdin.take() {
			stdin.write_all(text.as_bytes()).context("write text to synthesizer")?;
		}

		let output = child.wait_with_output().context("wait for synthesizer")?;
		if !output.status.success() {
			bail!(
				"{} exited with {}: {}",
				self.program,
				output.status,
				String::from_utf8_lossy(&output.stderr).trim()
			);
		}

		trace!(bytes = output.stdout.len(), "speech synthesized");
		Ok(output.stdout)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_program_is_an_error() {
		let synth = CommandSynthesizer::new("streamtools-no-such-synthesizer");
		assert!(synth.synthesize("hello", None, 50).is_err());
	}
}
