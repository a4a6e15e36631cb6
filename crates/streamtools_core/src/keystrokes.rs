#![forbid(unsafe_code)]

//! Sends configured chat commands when a key code arrives.

use std::sync::Arc;

use streamtools_domain::ChannelName;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use crate::config::ConfigStore;
use crate::pool::ChatConnectionPool;

pub struct KeystrokeCommands {
	pool: ChatConnectionPool,
	config: Arc<ConfigStore>,
}

impl KeystrokeCommands {
	pub fn new(pool: ChatConnectionPool, config: Arc<ConfigStore>) -> Self {
		Self { pool, config }
	}

	/// Handle one key code line. Returns how many commands were sent.
	pub async fn handle_line(&self, line: &str) -> usize {
		let Ok(code) = line.trim().parse::<i32>() else {
			debug!(line, "keystrokes: not a key code");
			return 0;
		};

		let bound: Vec<(String, String)> = self.config.read(|cfg| {
			cfg.keystroke_commands
				.iter()
				.filter(|k| k.key_code == Some(code) && !k.command.trim().is_empty() && !k.channel.trim().is_empty())
				.map(|k| (k.channel.clone(), k.command.clone()))
				.collect()
		});

		let mut sent = 0;
		for (channel, command) in bound {
			let Ok(channel) = ChannelName::new(&channel) else {
				continue;
			};
			let Some(client) = self.pool.get_connection_client(&channel) else {
				debug!(channel = %channel, "keystrokes: no connection for channel");
				continue;
			};

			if !client.is_connected()
				&& let Err(e) = client.reconnect().await
			{
				warn!(channel = %channel, error = %e, "keystrokes: reconnect failed");
			}
			match client.send_message(&channel, &command).await {
				Ok(()) => {
					info!(channel = %channel, code, %command, "keystrokes: command sent");
					sent += 1;
				}
				Err(e) => warn!(channel = %channel, error = %e, "keystrokes: send failed"),
			}
		}
		sent
	}

	/// Consume key codes, one per line, until the reader ends.
	pub async fn run<R: AsyncBufRead + Unpin>(self, reader: R) {
		let mut lines = reader.lines();
		loop {
			match lines.next_line().await {
				Ok(Some(line)) => {
					self.handle_line(&line).await;
				}
				Ok(None) => break,
				Err(e) => {
					warn!(error = %e, "keystrokes: input failed");
					break;
				}
			}
		}
		debug!("keystrokes: input closed");
	}
}
