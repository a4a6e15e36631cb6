#![forbid(unsafe_code)]

use std::sync::Arc;

use streamtools_domain::{AccountName, ChannelName};
use streamtools_platform::RedemptionEvent;
use tracing::{debug, info, warn};

use crate::audio::SoundEffectPlayer;
use crate::config::{ConfigStore, Configuration};
use crate::pool::{Callback, CallbackId, CallbackSlot, ChatConnectionPool};

/// A sound queued for a redemption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionSound {
	pub filename: String,
	pub device: String,
	/// 0..=100 after master scaling.
	pub volume: i32,
}

/// Sound for `reward_title`, with the reward volume scaled by a non-zero master volume.
pub fn sound_for(cfg: &Configuration, reward_title: &str) -> Option<RedemptionSound> {
	let device = cfg.channel_point_output_device.as_deref().filter(|d| !d.trim().is_empty())?;
	let sound = cfg
		.channel_point_sounds
		.iter()
		.find(|s| s.name.eq_ignore_ascii_case(reward_title))?;
	if sound.filename.trim().is_empty() {
		return None;
	}

	let mut volume = f64::from(sound.volume.unwrap_or(100));
	let master = cfg.channel_point_sounds_master_volume;
	if master != 0 {
		volume *= f64::from(master) / 100.0;
	}

	Some(RedemptionSound {
		filename: sound.filename.clone(),
		device: device.to_string(),
		volume: volume.max(0.0) as i32,
	})
}

/// Plays configured sounds when rewards are redeemed on the streaming account's channel.
pub struct ChannelPointSounds {
	pool: ChatConnectionPool,
	account: AccountName,
	channel: ChannelName,
	callback: CallbackId,
}

impl ChannelPointSounds {
	/// `None` without a streaming account or when its channel cannot be connected.
	pub async fn start(pool: ChatConnectionPool, config: Arc<ConfigStore>, player: Arc<SoundEffectPlayer>) -> Option<Self> {
		let Some(username) = config.read(|cfg| cfg.streaming_account().map(|a| a.username.clone())) else {
			debug!("channel points: no streaming account configured");
			return None;
		};
		let (Ok(account), Ok(channel)) = (AccountName::new(&username), ChannelName::new(&username)) else {
			warn!(%username, "channel points: streaming account name is invalid");
			return None;
		};

		let store = Arc::clone(&config);
		let callback = Callback::channel_point(move |ev: &RedemptionEvent| {
			let Some(sound) = store.read(|cfg| sound_for(cfg, &ev.reward_title)) else {
				debug!(reward = %ev.reward_title, "channel points: no sound for reward");
				return Ok(());
			};
			if player.queue_sound(&sound.filename, &sound.device, sound.volume) {
				info!(reward = %ev.reward_title, user = %ev.user_login, file = %sound.filename, "channel points: sound queued");
			}
			Ok(())
		});

		let callback = pool.add_callback(&account, &channel, callback).await?;
		Some(Self {
			pool,
			account,
			channel,
			callback,
		})
	}

	pub fn channel(&self) -> &ChannelName {
		&self.channel
	}

	pub fn stop(self) {
		self.pool
			.remove_callback(&self.account, &self.channel, CallbackSlot::ChannelPoint, self.callback);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ChannelPointSound;

	fn cfg(master: u32) -> Configuration {
		Configuration {
			channel_point_sounds: vec![
				ChannelPointSound {
					name: "Airhorn".into(),
					filename: "/sounds/airhorn.wav".into(),
					volume: Some(80),
				},
				ChannelPointSound {
					name: "Quiet".into(),
					filename: "/sounds/quiet.wav".into(),
					volume: Some(-20),
				},
				ChannelPointSound {
					name: "Unset".into(),
					filename: "/sounds/unset.wav".into(),
					volume: None,
				},
				ChannelPointSound {
					name: "Nothing".into(),
					filename: " ".into(),
					volume: Some(50),
				},
			],
			channel_point_sounds_master_volume: master,
			channel_point_output_device: Some("Speakers".into()),
			..Default::default()
		}
	}

	#[test]
	fn reward_title_matches_case_insensitively() {
		let sound = sound_for(&cfg(100), "AIRHORN").unwrap();
		assert_eq!(sound.filename, "/sounds/airhorn.wav");
		assert_eq!(sound.device, "Speakers");
		assert_eq!(sound.volume, 80);
		assert!(sound_for(&cfg(100), "Unknown").is_none());
		assert!(sound_for(&cfg(100), "nothing").is_none());
	}

	#[test]
	fn master_volume_scales_unless_zero() {
		assert_eq!(sound_for(&cfg(50), "airhorn").unwrap().volume, 40);
		assert_eq!(sound_for(&cfg(0), "airhorn").unwrap().volume, 80);
		assert_eq!(sound_for(&cfg(50), "unset").unwrap().volume, 50);
	}

	#[test]
	fn negative_volume_clamps_to_zero() {
		assert_eq!(sound_for(&cfg(100), "quiet").unwrap().volume, 0);
	}

	#[test]
	fn no_output_device_means_no_sound() {
		let mut c = cfg(100);
		c.channel_point_output_device = None;
		assert!(sound_for(&c, "airhorn").is_none());
	}
}
