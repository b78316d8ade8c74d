use std::{sync::Arc, time::Duration};

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::LogEventProvider;
use crate::{
    error::{Error, Result},
    filter_store::UpkeepFilter,
    metrics,
    poller::{LogDataPacker, LogPoller},
    types::{BlockNumber, UpkeepId},
};

/// Upper bound for a single `read_logs` call.
const READ_LOGS_TIMEOUT: Duration = Duration::from_secs(30);

/// Partition of an address among `partitions` buckets.
pub(crate) fn address_partition(address: &[u8], partitions: usize) -> usize {
    let digest = Sha256::digest(address);
    let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    value as usize % partitions.max(1)
}

impl<P, K> LogEventProvider<P, K>
where
    P: LogPoller + 'static,
    K: LogDataPacker + 'static,
{
    /// Every tick, push the ids of the next partition onto the read queue.
    /// Batches that do not fit in the queue are dropped.
    pub(super) async fn run_scheduler(
        self,
        read_tx: mpsc::Sender<Vec<UpkeepId>>,
        shutdown_token: CancellationToken,
    ) {
        let mut read_interval = tokio::time::interval(self.opts.read_interval);
        read_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut partition_idx: usize = 0;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_token.cancelled() => break,

                _ = read_interval.tick() => {
                    let ids = self.partition_ids(partition_idx);
                    for batch in ids.chunks(self.opts.read_max_batch_size) {
                        match read_tx.try_send(batch.to_vec()) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(batch)) => {
                                warn!(ids = batch.len(), "Read queue is full, dropping ids");
                                metrics::record_read_batch_dropped();
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
                        }
                    }
                    partition_idx = partition_idx.wrapping_add(1);
                }
            }
        }

        debug!("Scheduler stopped");
    }

    /// Ids of the upkeeps in partition `partition_idx`, wrapped around the
    /// current number of partitions.
    pub fn partition_ids(&self, partition_idx: usize) -> Vec<UpkeepId> {
        let partitions = self
            .filter_store
            .size()
            .div_ceil(self.opts.read_max_batch_size)
            .max(1);
        let partition = partition_idx % partitions;

        self.filter_store.get_ids(|f| {
            f.has_address() && address_partition(f.address.as_slice(), partitions) == partition
        })
    }

    pub(super) async fn run_reader(
        self,
        worker: usize,
        read_rx: Arc<Mutex<mpsc::Receiver<Vec<UpkeepId>>>>,
        shutdown_token: CancellationToken,
    ) {
        loop {
            let batch = tokio::select! {
                biased;

                _ = shutdown_token.cancelled() => break,

                batch = async { read_rx.lock().await.recv().await } => batch,
            };
            let Some(ids) = batch else {
                break;
            };

            tokio::select! {
                biased;

                _ = shutdown_token.cancelled() => break,

                result = tokio::time::timeout(READ_LOGS_TIMEOUT, self.read_logs(&ids)) => {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(worker, error = %e, "Failed to read logs"),
                        Err(_) => warn!(worker, ids = ids.len(), "Reading logs timed out"),
                    }
                }
            }
        }

        debug!(worker, "Reader stopped");
    }

    /// Read new logs of the given upkeeps into the buffer. A failure for one
    /// filter does not stop the others; all failures are returned together.
    pub async fn read_logs(&self, ids: &[UpkeepId]) -> Result<()> {
        let latest = self
            .poller
            .latest_block()
            .await
            .map_err(|e| Error::HeadNotAvailable(Box::new(e)))?;

        let config = self.buffer.config();
        let filters = self.get_filters(latest.number, ids);
        let errors = self
            .read_filters(latest.number, config.lookback, filters)
            .await;
        if errors.is_empty() {
            return Ok(());
        }
        metrics::record_read_errors(errors.len());
        Err(Error::ReadLogs(errors))
    }

    fn get_filters(&self, latest_block: BlockNumber, ids: &[UpkeepId]) -> Vec<UpkeepFilter> {
        let mut filters = Vec::with_capacity(ids.len());
        self.filter_store.range_filters_by_ids(ids, |_, f| {
            if !f.has_address() {
                debug!(upkeep_id = %f.upkeep_id, "Upkeep filter not found");
                return;
            }
            if f.config_update_block > latest_block {
                debug!(
                    upkeep_id = %f.upkeep_id,
                    config_update_block = f.config_update_block,
                    latest_block,
                    "Upkeep config update block is after latest block"
                );
                return;
            }
            filters.push(f.clone());
        });
        filters
    }

    async fn read_filters(
        &self,
        latest: BlockNumber,
        lookback: u64,
        filters: Vec<UpkeepFilter>,
    ) -> Vec<Error> {
        // a new chain may be shorter than the lookback
        let lookback = if latest < lookback {
            latest.saturating_sub(1)
        } else {
            lookback
        };

        let mut errors = Vec::new();
        let mut updated = Vec::with_capacity(filters.len());

        for mut filter in filters {
            let start = filter
                .last_poll_block
                .max(latest - lookback)
                .saturating_sub(self.opts.reorg_buffer)
                .max(filter.config_update_block);

            let logs = match self
                .poller
                .logs_with_sigs(start, latest, &[filter.event_sig()], filter.address)
                .await
            {
                Ok(logs) => logs,
                Err(e) => {
                    errors.push(Error::FilterRead {
                        upkeep_id: filter.upkeep_id,
                        source: Box::new(e),
                    });
                    continue;
                }
            };

            let matched = filter.select(logs);
            let (added, dropped) = self.buffer.enqueue(filter.upkeep_id, matched);
            if added > 0 || dropped > 0 {
                debug!(
                    upkeep_id = %filter.upkeep_id,
                    start,
                    latest,
                    added,
                    dropped,
                    "Read logs for upkeep"
                );
            }

            filter.last_poll_block = latest;
            updated.push(filter);
        }

        self.filter_store.update_filters(
            |current, updated| {
                let mut merged = current.clone();
                merged.last_poll_block = current.last_poll_block.max(updated.last_poll_block);
                merged
            },
            &updated,
        );

        if !errors.is_empty() {
            info!(failed = errors.len(), read = updated.len(), "Read logs with errors");
        }

        errors
    }
}
