mod auth;
mod collaborators;
mod config;
mod coordinator;
mod events;
mod ws;

use anyhow::Result;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{channel, Receiver};
use tokio_graceful::Shutdown;
use tracing::{debug, info, trace, warn};

use filetto_lib::lobby::LobbyRegistry;
use filetto_lib::model::GameSummary;
use filetto_lib::rate_limit::RateLimiter;
use filetto_lib::session::SessionRegistry;
use filetto_lib::store::memory::MemoryStore;
use filetto_lib::store::redis::RedisStore;
use filetto_lib::store::store::KeyedStore;

use crate::auth::PlainTokenVerifier;
use crate::collaborators::{LocalProfileStore, LogInviteSender};
use crate::config::{configure, AppConfig};
use crate::coordinator::{sweeper, Coordinator};

/// Reference persistence collaborator: drain final results and log
/// them. A real deployment replaces this task with a writer against
/// permanent storage.
async fn results_handler(mut rx: Receiver<GameSummary>) {
    while let Some(summary) = rx.recv().await {
        counter!("filetto_results_recorded_total").increment(1);
        info!(
            "{}: result recorded, winner={:?} reason={:?} moves={} duration={}ms",
            summary.session_id,
            summary.winner_id,
            summary.reason,
            summary.num_moves,
            summary.total_time_ms
        );
    }
}

async fn run<T: KeyedStore>(cfg: Arc<AppConfig>, store: Arc<T>, shutdown: Shutdown) -> Result<()> {
    let limiter = Arc::new(RateLimiter::new(
        cfg.game.rate_limit_window,
        cfg.game.rate_limit_max_creates,
    ));
    let lobbies = Arc::new(LobbyRegistry::new(store.clone(), limiter.clone()));
    let (results_tx, results_rx) = channel(cfg.game.results_buffer_size);
    let sessions = Arc::new(SessionRegistry::new(store, results_tx));
    let coordinator = Coordinator::new(
        lobbies.clone(),
        sessions,
        Arc::new(LogInviteSender),
        cfg.game.grace_period,
    );

    let ws_task = shutdown.spawn_task(ws::serve(
        cfg.clone(),
        coordinator,
        Arc::new(PlainTokenVerifier),
        Arc::new(LocalProfileStore::new()),
    ));
    let results_task = shutdown.spawn_task(results_handler(results_rx));
    let sweeper_task = shutdown.spawn_task(sweeper(lobbies, limiter, cfg.game.sweep_interval));

    tokio::select! {
        biased;
        _ = shutdown.shutdown_with_limit(Duration::from_secs(1)) => {}
        _ = ws_task => {}
        _ = results_task => {}
        _ = sweeper_task => {}
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Arc::new(configure().await?);
    trace!("{:?}", cfg);

    let shutdown: Shutdown = Shutdown::default();

    if cfg.store.disable {
        warn!("shared store disabled - lobby and session state is process-local");
        run(cfg.clone(), Arc::new(MemoryStore::new()), shutdown).await
    } else {
        debug!("connecting to shared store at {}", cfg.store.url);
        let store = RedisStore::connect(&cfg.store.url)
            .await
            .map_err(|e| anyhow::anyhow!("failed to connect to shared store: {}", e))?;
        run(cfg.clone(), Arc::new(store), shutdown).await
    }
}
