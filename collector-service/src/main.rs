use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use collector_service::{
    config::AppConfig,
    metrics_server, observability,
    supervisor::{BackoffPolicy, DecoderLauncher, ReplayLauncher, RtlamrLauncher, Supervisor},
};
use monitor_client::ReadingStore;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let store = ReadingStore::open(&cfg.database.path, cfg.database.max_connections).await?;
    tracing::info!(
        db = %cfg.database.path.display(),
        readings = store.total_readings().await?,
        "reading store opened"
    );

    let backoff = BackoffPolicy {
        initial: Duration::from_millis(cfg.collector.restart_backoff_initial_ms),
        max: Duration::from_millis(cfg.collector.restart_backoff_max_ms),
    };
    let replay = cfg.collector.replay_csv.clone();
    let launcher: Arc<dyn DecoderLauncher> = match &replay {
        Some(path) => {
            tracing::info!(path = %path.display(), "replay mode, decoding a capture file");
            Arc::new(ReplayLauncher::new(path.clone()))
        }
        None => Arc::new(RtlamrLauncher::new(cfg.collector.clone())),
    };

    let mut supervisor = Supervisor::new(
        launcher,
        store,
        cfg.collector.filter_ids_path.clone(),
        backoff,
    );
    if replay.is_some() {
        supervisor = supervisor.one_shot();
    }
    let (handle, mut join) = supervisor.spawn();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            // The channel is gone if the supervisor already stopped on its
            // own (replay mode); that is not an error here.
            let _ = handle.shutdown().await;
            (&mut join).await?;
        }
        res = &mut join => res?,
    }

    Ok(())
}
