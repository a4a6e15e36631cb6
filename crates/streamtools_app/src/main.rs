#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use streamtools_core::audio::{
	AudioGate, AudioOutput, CommandSynthesizer, EngineParts, MicPauser, MicPauserConfig, PauseTarget, PlaybackEngine,
	RodioOutput, SoundEffectPlayer, SpeechSynthesizer,
};
use streamtools_core::auth::{ChannelResolver, ConfigTokenProvider, HelixChannelResolver, TokenProvider};
use streamtools_core::config::{ConfigStore, default_config_path};
use streamtools_core::filters::{AdminFilterChain, BlockingEmoteSource, EmojiAllowlist, EmoteSource, TtsFilterChain};
use streamtools_core::pool::{Callback, CallbackId, CallbackSlot, ChatConnectionPool, Supervisor, SupervisorConfig};
use streamtools_core::pubsub_router::PubSubRouter;
use streamtools_core::sessions::chat_voice_settings;
use streamtools_core::{AdminSession, ChannelPointSounds, KeystrokeCommands, TtsSession};
use streamtools_domain::{AccountName, ChannelName};
use streamtools_platform::assets::EmoteCache;
use streamtools_platform::twitch::{PubSubConfig, TwitchChatConfig, TwitchTransportFactory};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: streamtools_app [--config PATH]\n\
\n\
Options:\n\
\t--config  Configuration file (default: <config dir>/streamtools/config.toml)\n\
\t--help    Show this help\n\
\n\
Key codes read from stdin, one per line, trigger configured keystroke commands.\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,streamtools_core=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

/// Pauses every engine whose chat asked to be paused while the streamer talks.
struct PauseAll(Vec<Arc<PlaybackEngine>>);

impl PauseTarget for PauseAll {
	fn pause(&self) {
		self.0.iter().for_each(|e| e.pause());
	}

	fn unpause(&self) {
		self.0.iter().for_each(|e| e.unpause());
	}
}

/// Logs follows, hosts and raids on the streaming account's channel.
struct EventLog {
	account: AccountName,
	channel: ChannelName,
	callbacks: Vec<(CallbackSlot, CallbackId)>,
}

impl EventLog {
	async fn start(pool: &ChatConnectionPool, account: AccountName, channel: ChannelName) -> Self {
		let callbacks = [
			Callback::follow(|ev| {
				info!(user = %ev.username, "follow");
				Ok(())
			}),
			Callback::host(|ev| {
				info!(channel = %ev.channel, from = %ev.hosted_by, viewers = ev.viewers, "host");
				Ok(())
			}),
			Callback::raid(|ev| {
				info!(channel = %ev.channel, from = %ev.from_login, viewers = ev.viewers, "raid");
				Ok(())
			}),
		];

		let mut ids = Vec::new();
		for callback in callbacks {
			let slot = callback.slot();
			if let Some(id) = pool.add_callback(&account, &channel, callback).await {
				ids.push((slot, id));
			}
		}
		Self {
			account,
			channel,
			callbacks: ids,
		}
	}

	fn stop(self, pool: &ChatConnectionPool) {
		for (slot, id) in self.callbacks {
			pool.remove_callback(&self.account, &self.channel, slot, id);
		}
	}
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
	let config = Arc::new(ConfigStore::load(&config_path)?);
	info!(path = %config_path.display(), "loaded config (toml + env overrides)");
	let twitch = config.twitch();

	let tokens: Arc<dyn TokenProvider> = Arc::new(ConfigTokenProvider::new(Arc::clone(&config)));
	let resolver = Arc::new(HelixChannelResolver::new(Arc::clone(&tokens), Arc::clone(&config)));

	let mut chat_cfg = TwitchChatConfig::new(twitch.client_id.clone());
	chat_cfg.chat_ws_url = twitch.chat_ws_url.clone();
	chat_cfg.helix_base_url = twitch.helix_base_url.clone();
	let factory = Arc::new(TwitchTransportFactory::new(chat_cfg).with_token_provider(Arc::clone(&tokens)));

	let pool = ChatConnectionPool::new(factory, Arc::clone(&resolver) as Arc<dyn ChannelResolver>, Arc::clone(&tokens));
	let supervisor = Supervisor::start(&pool, SupervisorConfig::default());

	let router = PubSubRouter::start(
		pool.clone(),
		Arc::clone(&tokens),
		PubSubConfig {
			ws_url: twitch.pubsub_ws_url.clone(),
			..PubSubConfig::default()
		},
	);
	let streaming: Vec<String> = config.read(|cfg| {
		cfg.accounts
			.iter()
			.filter(|a| a.is_users_streaming_account)
			.map(|a| a.username.clone())
			.collect()
	});
	for username in &streaming {
		let (Ok(account), Ok(channel)) = (AccountName::new(username), ChannelName::new(username)) else {
			warn!(%username, "streaming account name is invalid");
			continue;
		};
		match resolver.resolve_channel_id(&account, &channel).await {
			Some(user_id) => {
				router.listen_follows(&account, &user_id).await;
				router.listen_redemptions(&account, &user_id).await;
			}
			None => warn!(account = %account, "could not resolve streaming account id; pubsub disabled for it"),
		}
	}

	let allowlist = Arc::new(EmojiAllowlist::load(config.emoji_allowlist_path().as_deref())?);
	let admin_chain = Arc::new(AdminFilterChain::standard(allowlist)?);
	let emotes: Arc<dyn EmoteSource> = Arc::new(BlockingEmoteSource::new(
		Arc::new(EmoteCache::new()?),
		tokio::runtime::Handle::current(),
	));

	let gate = Arc::new(AudioGate::new());
	let output: Arc<dyn AudioOutput> = Arc::new(RodioOutput);
	let synth: Arc<dyn SpeechSynthesizer> = Arc::new(CommandSynthesizer::default());
	let sounds = Arc::new(SoundEffectPlayer::start(Arc::clone(&output), Arc::clone(&gate))?);

	let chats = config.read(|cfg| cfg.chats.clone());
	let mut tts_sessions = Vec::new();
	let mut paused_by_mic = Vec::new();
	for chat in chats.iter().filter(|c| c.tts_on) {
		let engine = PlaybackEngine::start(
			chat.channel.trim().to_lowercase(),
			EngineParts {
				chain: TtsFilterChain::standard(Arc::clone(&config), Arc::clone(&emotes))?,
				synth: Arc::clone(&synth),
				output: Arc::clone(&output),
				gate: Arc::clone(&gate),
				settings: chat_voice_settings(Arc::clone(&config), chat),
			},
		)?;
		let Some(session) = TtsSession::start(pool.clone(), chat, Arc::new(engine)).await else {
			warn!(account = %chat.account_username, channel = %chat.channel, "tts session could not start");
			continue;
		};
		if chat.pause_during_speech {
			paused_by_mic.push(Arc::clone(session.engine()));
		}
		tts_sessions.push(session);
	}

	let mut admin_sessions = Vec::new();
	for chat in &chats {
		if let Some(session) = AdminSession::start(pool.clone(), chat, Arc::clone(&admin_chain)).await {
			admin_sessions.push(session);
		}
	}

	let channel_points = ChannelPointSounds::start(pool.clone(), Arc::clone(&config), Arc::clone(&sounds)).await;

	let event_log = match streaming.first().map(|u| (AccountName::new(u), ChannelName::new(u))) {
		Some((Ok(account), Ok(channel))) => Some(EventLog::start(&pool, account, channel).await),
		_ => None,
	};

	let keys = tokio::spawn(
		KeystrokeCommands::new(pool.clone(), Arc::clone(&config))
			.run(tokio::io::BufReader::new(tokio::io::stdin())),
	);

	let (microphone, threshold) = config.read(|cfg| (cfg.microphone.clone(), cfg.pause_threshold_clamped()));
	let mic = match microphone.filter(|m| !m.trim().is_empty()) {
		Some(device) if !paused_by_mic.is_empty() => {
			let target: Arc<dyn PauseTarget> = Arc::new(PauseAll(paused_by_mic));
			tokio::task::spawn_blocking(move || MicPauser::start(MicPauserConfig::new(Some(device), threshold), target))
				.await
				.context("mic start task")?
				.map_err(|e| warn!(error = format!("{e:#}"), "microphone pause disabled"))
				.ok()
		}
		_ => None,
	};

	info!(
		connections = pool.len(),
		tts = tts_sessions.len(),
		admin = admin_sessions.len(),
		"streamtools running; press Ctrl-C to exit"
	);
	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	info!("shutting down");

	keys.abort();
	if let Some(mic) = mic {
		let _ = tokio::task::spawn_blocking(move || mic.stop()).await;
	}
	if let Some(log) = event_log {
		log.stop(&pool);
	}
	if let Some(cp) = channel_points {
		cp.stop();
	}
	for session in admin_sessions {
		session.stop();
	}
	futures::future::join_all(tts_sessions.into_iter().map(TtsSession::stop)).await;
	let _ = tokio::task::spawn_blocking(move || sounds.shutdown()).await;

	router.shutdown();
	supervisor.shutdown().await;
	pool.shutdown().await;
	Ok(())
}

fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => default_config_path()?,
	};

	let rt = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.thread_name("streamtools-worker")
		.build()
		.context("build tokio runtime")?;
	let result = rt.block_on(run(config_path));
	// stdin is read on a blocking thread that cannot be cancelled.
	rt.shutdown_timeout(Duration::from_secs(2));
	result
}
