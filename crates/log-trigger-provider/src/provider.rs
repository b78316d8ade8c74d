//! Log event provider: reads trigger logs for registered upkeeps, buffers
//! them and hands out payloads fairly.
//!
//! ## Architecture
//!
//! ```text
//!   scheduler            readers (N)           LogPoller
//!      |                     |                     |
//!      |--partition ids----->|  (bounded queue,    |
//!      |   every tick        |   dropped if full)  |
//!      |                     |--logs_with_sigs---->|
//!      |                     |<-------logs---------|
//!      |                     |
//!      |              (match + enqueue)
//!      |                     v
//!      |               WindowedLogBuffer <---> DequeueCoordinator
//!      |                     ^
//!      |                     |
//!   get_latest_payloads -----+--> LogDataPacker --> UpkeepPayload
//! ```

mod lifecycle;
mod reader;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use self::lifecycle::{RefreshResult, filter_name, validate_trigger_config};
use crate::{
    buffer::{BufferConfig, BufferVersion, BufferedLog, LogBuffer, WindowedLogBuffer},
    config::ProviderOptions,
    coordinator::DequeueCoordinator,
    error::{Error, Result},
    filter_store::FilterStore,
    metrics,
    poller::{LogDataPacker, LogPoller},
    types::{BlockNumber, Trigger, UpkeepId, UpkeepPayload},
};

const SERVICE_NAME: &str = "LogEventProvider";

/// Cadence of dropping buffer queues whose filter is gone.
const BUFFER_SYNC_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Provides upkeep payloads built from trigger logs.
pub struct LogEventProvider<P, K> {
    opts: ProviderOptions,
    poller: Arc<P>,
    packer: Arc<K>,
    filter_store: Arc<FilterStore>,
    buffer: Arc<dyn LogBuffer>,
    coordinator: Arc<DequeueCoordinator>,
    /// Serializes filter registrations.
    register_lock: Arc<tokio::sync::Mutex<()>>,
    started: Arc<AtomicBool>,
    shutdown_token: CancellationToken,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<P, K> Clone for LogEventProvider<P, K> {
    fn clone(&self) -> Self {
        Self {
            opts: self.opts.clone(),
            poller: self.poller.clone(),
            packer: self.packer.clone(),
            filter_store: self.filter_store.clone(),
            buffer: self.buffer.clone(),
            coordinator: self.coordinator.clone(),
            register_lock: self.register_lock.clone(),
            started: self.started.clone(),
            shutdown_token: self.shutdown_token.clone(),
            handles: self.handles.clone(),
        }
    }
}

impl<P, K> LogEventProvider<P, K>
where
    P: LogPoller + 'static,
    K: LogDataPacker + 'static,
{
    pub fn new(
        opts: ProviderOptions,
        poller: Arc<P>,
        packer: Arc<K>,
        filter_store: Arc<FilterStore>,
    ) -> Self {
        let coordinator = Arc::new(DequeueCoordinator::new());
        let buffer_config = BufferConfig::new(opts.lookback_blocks, opts.block_rate, opts.log_limit);
        let buffer: Arc<dyn LogBuffer> = match opts.buffer_version {
            BufferVersion::V1 => Arc::new(WindowedLogBuffer::new(buffer_config, coordinator.clone())),
        };

        Self {
            opts,
            poller,
            packer,
            filter_store,
            buffer,
            coordinator,
            register_lock: Arc::new(tokio::sync::Mutex::new(())),
            started: Arc::new(AtomicBool::new(false)),
            shutdown_token: CancellationToken::new(),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn filter_store(&self) -> &Arc<FilterStore> {
        &self.filter_store
    }

    pub fn buffer(&self) -> &Arc<dyn LogBuffer> {
        &self.buffer
    }

    pub fn options(&self) -> &ProviderOptions {
        &self.opts
    }

    /// Update the live tunable buffer settings.
    pub fn set_config(&self, lookback: u64, block_rate: u64, log_limit: usize) {
        self.buffer.set_config(lookback, block_rate, log_limit);
    }

    /// Spawn the scheduler, the reader pool and the buffer sync loop. Calling
    /// it again is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("{SERVICE_NAME} already started");
            return Ok(());
        }

        info!(
            read_interval_ms = self.opts.read_interval.as_millis() as u64,
            read_max_batch_size = self.opts.read_max_batch_size,
            readers = self.opts.reader_threads,
            "Starting log event provider"
        );

        let (read_tx, read_rx) = mpsc::channel::<Vec<UpkeepId>>(self.opts.read_job_queue_size);
        let read_rx = Arc::new(tokio::sync::Mutex::new(read_rx));
        let mut handles = self.handles.lock();

        for worker in 0..self.opts.reader_threads {
            let provider = self.clone();
            let read_rx = read_rx.clone();
            let shutdown_token = self.shutdown_token.clone();
            handles.push(tokio::spawn(async move {
                provider.run_reader(worker, read_rx, shutdown_token).await;
            }));
        }

        {
            let provider = self.clone();
            let shutdown_token = self.shutdown_token.clone();
            handles.push(tokio::spawn(async move {
                provider.run_scheduler(read_tx, shutdown_token).await;
            }));
        }

        {
            let provider = self.clone();
            let shutdown_token = self.shutdown_token.clone();
            handles.push(tokio::spawn(async move {
                provider.run_buffer_sync(shutdown_token).await;
            }));
        }

        Ok(())
    }

    /// Stop all background tasks and wait for them to exit.
    pub async fn close(&self) {
        self.shutdown_token.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        info!("Log event provider stopped");
    }

    async fn run_buffer_sync(self, shutdown_token: CancellationToken) {
        let mut sync_interval = tokio::time::interval(BUFFER_SYNC_INTERVAL);
        sync_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // skip the immediate first tick
        sync_interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_token.cancelled() => break,

                _ = sync_interval.tick() => {
                    self.buffer.sync_filters(&self.filter_store);
                }
            }
        }
    }

    /// Payloads for the oldest buffered logs in the lookback range, at most
    /// `max_payloads`.
    pub async fn get_latest_payloads(&self) -> Result<Vec<UpkeepPayload>> {
        let latest = self
            .poller
            .latest_block()
            .await
            .map_err(|e| Error::HeadNotAvailable(Box::new(e)))?;

        let payloads = self.get_logs_from_buffer(latest.number);
        if !payloads.is_empty() {
            debug!(
                latest_block = latest.number,
                payloads = payloads.len(),
                "Fetched payloads from buffer"
            );
        }
        metrics::record_payloads(payloads.len());

        Ok(payloads)
    }

    fn get_logs_from_buffer(&self, latest_block: BlockNumber) -> Vec<UpkeepPayload> {
        let config = self.buffer.config();
        let start = latest_block.saturating_sub(config.lookback).max(1);
        let max_results = self.opts.max_payloads;
        let log_limit = self.dequeue_log_limit(config.log_limit, max_results);

        let mut payloads = Vec::new();
        while payloads.len() < max_results {
            let Some(window) = self.coordinator.get_dequeue_block_window(
                start,
                latest_block,
                config.block_rate,
                log_limit,
            ) else {
                break;
            };

            let selector = |id: &UpkeepId| window.allowance(id);
            let (logs, remaining) = self.buffer.dequeue(
                window.start,
                config.block_rate,
                log_limit,
                max_results - payloads.len(),
                &selector,
            );
            if logs.is_empty() {
                // nothing left for this window, move on to the next one
                if self
                    .coordinator
                    .settle_empty_window(window.start, window.is_best_effort())
                {
                    continue;
                }
                break;
            }
            debug!(
                window_start = window.start,
                window_end = window.end,
                best_effort = window.is_best_effort(),
                logs = logs.len(),
                remaining,
                "Dequeued logs for window"
            );
            self.coordinator
                .count_dequeued_logs_for_window(window.start, &logs, log_limit);

            payloads.extend(logs.into_iter().filter_map(|l| self.create_payload(l)));
        }

        payloads
    }

    /// Per-upkeep minimum, shrunk when the upkeeps cannot all get the full
    /// minimum within `max_results`.
    fn dequeue_log_limit(&self, log_limit: usize, max_results: usize) -> usize {
        let log_limit = log_limit.max(1);
        let upkeeps = self.buffer.num_of_upkeeps();
        if upkeeps == 0 || upkeeps.saturating_mul(log_limit) <= max_results {
            return log_limit;
        }
        let reduced = (max_results / upkeeps).max(1);
        warn!(
            upkeeps,
            log_limit,
            reduced,
            max_results,
            "Too many upkeeps for payload capacity, reducing per upkeep minimum"
        );
        reduced
    }

    fn create_payload(&self, buffered: BufferedLog) -> Option<UpkeepPayload> {
        let BufferedLog { id, log } = buffered;
        match self.packer.pack_log_data(&log) {
            Ok(check_data) => Some(UpkeepPayload::new(id, Trigger::from_log(&log), check_data)),
            Err(e) => {
                warn!(
                    upkeep_id = %id,
                    block_number = log.block_number,
                    tx_hash = %log.tx_hash,
                    log_index = log.log_index,
                    error = %e,
                    "Failed to pack log data"
                );
                None
            }
        }
    }
}
