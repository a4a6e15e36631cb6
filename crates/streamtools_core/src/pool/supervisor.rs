#![forbid(unsafe_code)]

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt as _;
use streamtools_domain::ConnectionKey;
use streamtools_platform::{ChatTransport, TransportState};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{ChatConnectionPool, PoolInner};

/// Reconnect supervisor timing.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
	/// Pause between the end of one pass and the start of the next.
	pub interval: Duration,
	/// How long to wait for the connected/joined signal.
	pub signal_wait: Duration,
	/// Hard bound on one reconnect or rejoin step.
	pub step_timeout: Duration,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			interval: Duration::from_secs(1),
			signal_wait: Duration::from_secs(10),
			step_timeout: Duration::from_secs(15),
		}
	}
}

/// Periodically reconnects dropped transports and rejoins lost channels.
#[derive(Debug)]
pub struct Supervisor {
	stop_tx: watch::Sender<bool>,
	task: JoinHandle<()>,
}

impl Supervisor {
	/// The supervisor holds the pool weakly and exits once it is dropped.
	pub fn start(pool: &ChatConnectionPool, cfg: SupervisorConfig) -> Self {
		let (stop_tx, stop_rx) = watch::channel(false);
		let weak = pool.downgrade();
		let task = pool.inner.rt.spawn(run(weak, cfg, stop_rx));
		Self { stop_tx, task }
	}

	pub async fn shutdown(self) {
		let _ = self.stop_tx.send(true);
		if let Err(e) = self.task.await
			&& !e.is_cancelled()
		{
			warn!(error = %e, "supervisor task ended abnormally");
		}
	}
}

async fn run(pool: Weak<PoolInner>, cfg: SupervisorConfig, mut stop_rx: watch::Receiver<bool>) {
	info!(interval_ms = cfg.interval.as_millis() as u64, "supervisor started");
	loop {
		let Some(p) = ChatConnectionPool::upgrade(&pool) else {
			break;
		};

		tokio::select! {
			_ = run_pass(&p, &cfg) => {}
			_ = stop_rx.changed() => break,
		}
		drop(p);

		tokio::select! {
			_ = tokio::time::sleep(cfg.interval) => {}
			_ = stop_rx.changed() => break,
		}
	}
	info!("supervisor stopped");
}

/// One sweep over every pooled transport. Each entry is bounded and isolated.
pub(crate) async fn run_pass(pool: &ChatConnectionPool, cfg: &SupervisorConfig) {
	for (key, transport) in pool.transports() {
		if !transport.is_initialized() {
			continue;
		}

		let res = AssertUnwindSafe(check_entry(&key, &transport, cfg)).catch_unwind().await;
		if res.is_err() {
			metrics::counter!("streamtools_supervisor_panics_total").increment(1);
			warn!(key = %key, "supervisor: entry check panicked");
		}
	}
}

async fn check_entry(key: &ConnectionKey, transport: &Arc<dyn ChatTransport>, cfg: &SupervisorConfig) {
	if !transport.is_connected() {
		metrics::counter!("streamtools_supervisor_reconnects_total").increment(1);
		debug!(key = %key, "supervisor: transport disconnected; reconnecting");

		let step = async {
			transport.reconnect().await?;
			wait_for_state(transport.state(), cfg.signal_wait, |s| s.connected).await;
			anyhow::Ok(())
		};
		if !bounded(key, "reconnect", cfg.step_timeout, step).await {
			return;
		}
	}

	if transport.is_connected() && transport.joined_channels().is_empty() {
		metrics::counter!("streamtools_supervisor_rejoins_total").increment(1);
		debug!(key = %key, "supervisor: connected with no joined channel; rejoining");

		let step = async {
			transport.join(&key.channel).await?;
			wait_for_state(transport.state(), cfg.signal_wait, |s| !s.joined.is_empty()).await;
			anyhow::Ok(())
		};
		bounded(key, "rejoin", cfg.step_timeout, step).await;
	}
}

async fn bounded(
	key: &ConnectionKey,
	what: &'static str,
	limit: Duration,
	step: impl Future<Output = anyhow::Result<()>>,
) -> bool {
	match timeout(limit, step).await {
		Ok(Ok(())) => true,
		Ok(Err(e)) => {
			warn!(key = %key, step = what, error = %e, "supervisor: step failed");
			false
		}
		Err(_) => {
			warn!(key = %key, step = what, "supervisor: step abandoned after timeout");
			false
		}
	}
}

/// Returns whether the condition was observed within `wait`.
async fn wait_for_state(
	mut rx: watch::Receiver<TransportState>,
	wait: Duration,
	cond: impl FnMut(&TransportState) -> bool,
) -> bool {
	matches!(timeout(wait, rx.wait_for(cond)).await, Ok(Ok(_)))
}
