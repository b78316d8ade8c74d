//! Log trigger provider service.
//!
//! Polls an execution node for the trigger logs of the configured upkeeps and
//! reports the payloads that are ready to be checked:
//!
//! 1. Register the log filters of the configured upkeeps
//! 2. Read new logs into the windowed buffer on every read interval
//! 3. Recover logs older than the lookback in the background
//! 4. Periodically drain payloads and recovery proposals
//!
//! ## Architecture
//!
//! ```text
//!   EL node        LogEventProvider        LogRecoverer        payload loop
//!   |                    |                      |                    |
//!   |<---eth_getLogs-----|                      |                    |
//!   |------logs--------->|                      |                    |
//!   |                    |                      |                    |
//!   |<---eth_getLogs----------------------------|                    |
//!   |------logs------------------------------->|                    |
//!   |                    |                      |                    |
//!   |                    |<-------get_latest_payloads----------------|
//!   |                    |                      |<--get_proposals----|
//!   |                    |                      |                    |
//! ```

use std::{path::PathBuf, sync::Arc};

use anyhow::bail;
use clap::Parser;
use futures::future::select_all;
use log_trigger_provider::{
    AbiLogDataPacker, Config, FilterStore, InMemoryUpkeepStateStore, LogEventProvider,
    LogRecoverer, RpcClient, RpcLogPoller, metrics,
};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "log-trigger-provider")]
#[command(about = "Collect upkeep trigger logs and serve them as fair payloads")]
struct Cli {
    #[arg(long, short, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    let provider_opts = config.provider_options();
    let recoverer_opts = config.recoverer_options();

    info!(
        rpc_url = %config.rpc_url,
        chain_id = config.chain_id,
        upkeeps = config.upkeeps.len(),
        "Loaded configuration"
    );

    if let Some(listen) = config.metrics_listen {
        metrics::init_metrics(listen)?;
        info!(%listen, "Metrics exporter listening");
    }

    let client = RpcClient::new(config.rpc_url.clone());
    let poller = Arc::new(RpcLogPoller::new(client.clone()));
    let packer = Arc::new(AbiLogDataPacker);
    let filter_store = Arc::new(FilterStore::new());

    let provider = LogEventProvider::new(
        provider_opts.clone(),
        poller.clone(),
        packer.clone(),
        filter_store.clone(),
    );
    let recoverer = LogRecoverer::new(
        recoverer_opts,
        poller,
        Arc::new(client),
        Arc::new(InMemoryUpkeepStateStore::new()),
        packer,
        filter_store,
    );

    // Register static upkeeps.

    for upkeep in &config.upkeeps {
        if let Err(e) = provider
            .register_filter(upkeep.id, &upkeep.trigger, upkeep.update_block)
            .await
        {
            warn!(upkeep_id = %upkeep.id, error = %e, "Failed to register upkeep");
        }
    }

    provider.start()?;
    recoverer.start()?;

    let shutdown_token = CancellationToken::new();

    // Start payload loop.

    let payload_handle = {
        let provider = provider.clone();
        let recoverer = recoverer.clone();
        let shutdown_token = shutdown_token.clone();
        let mut interval = tokio::time::interval(provider_opts.read_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_token.cancelled() => break,

                    _ = interval.tick() => {
                        match provider.get_latest_payloads().await {
                            Ok(payloads) => {
                                for payload in payloads {
                                    info!(
                                        upkeep_id = %payload.upkeep_id,
                                        work_id = %payload.work_id,
                                        trigger = %payload.trigger,
                                        "Payload ready"
                                    );
                                }
                            }
                            Err(e) => warn!(error = %e, "Failed to get latest payloads"),
                        }

                        match recoverer.get_recovery_proposals().await {
                            Ok(proposals) => {
                                for proposal in proposals {
                                    info!(
                                        upkeep_id = %proposal.upkeep_id,
                                        work_id = %proposal.work_id,
                                        "Recovery proposal ready"
                                    );
                                }
                            }
                            Err(e) => warn!(error = %e, "Failed to get recovery proposals"),
                        }
                    }
                }
            }
        })
    };

    info!("All services started, waiting for shutdown signal");

    let mut signals: Vec<_> = [SignalKind::interrupt(), SignalKind::terminate()]
        .into_iter()
        .filter_map(|kind| signal(kind).ok())
        .collect();

    if signals.is_empty() {
        bail!("No shutdown signals could be registered");
    }

    let _ = select_all(signals.iter_mut().map(|s| Box::pin(s.recv()))).await;

    info!("Received shutdown signal, shutting down");

    shutdown_token.cancel();
    let _ = payload_handle.await;
    provider.close().await;
    recoverer.close().await;

    info!("All services stopped, exiting");

    Ok(())
}
