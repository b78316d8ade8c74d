//! Log recoverer: finds trigger logs older than the provider's lookback that
//! were never performed, and proposes them for execution.
//!
//! The recoverer scans a backward band of roughly one day of blocks, ending
//! where the forward reader's coverage and the unfinalized blocks begin:
//!
//! ```text
//!   latest - blocks_per_day        latest - lookback - finality      latest
//!   |---------- recovery window ----------|------ provider + unfinalized ----|
//! ```
//!
//! Each scan picks a batch of filters, reads the next range after their
//! `last_re_poll_block`, and queues every log whose upkeep state is still
//! unknown. Proposals are handed out in a deterministic order so that all
//! nodes agree on them, and re-validated on chain before use.

mod block_time;
mod pending;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use alloy_primitives::{B256, Bytes};
use futures::future::join_all;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use self::block_time::{DEFAULT_BLOCK_TIME, DEFAULT_SAMPLE_SIZE};
use self::{
    block_time::{BlockTimeResolver, is_significant_change},
    pending::PendingQueue,
};
use crate::{
    config::RecovererOptions,
    error::{Error, Result},
    filter_store::{FilterStore, UpkeepFilter},
    metrics,
    poller::{ChainClient, LogDataPacker, LogPoller, UpkeepStateReader},
    types::{
        BlockNumber, CoordinatedProposal, Log, Trigger, UpkeepPayload, UpkeepState, UpkeepType,
        WorkId,
    },
    util::ExpiringHashMap,
};

/// Filters recovered per scan.
pub const RECOVERY_BATCH_SIZE: usize = 10;
/// Blocks read per filter per scan.
pub const RECOVERY_LOGS_BUFFER: u64 = 200;
/// Blocks read per filter per scan when far behind.
pub const RECOVERY_LOGS_BURST: u64 = 500;
/// Pending payloads allowed per upkeep.
pub const MAX_PENDING_PAYLOADS_PER_UPKEEP: usize = 500;
/// Age after which a visited entry is re-checked. Also the cleanup cadence.
pub const RECOVERY_CACHE_TTL: Duration = Duration::from_secs(10 * 60 - 1);
/// Cadence of block time measurement.
pub const BLOCK_TIME_UPDATE_CADENCE: Duration = Duration::from_secs(10 * 60);

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
struct RecoveryState {
    pending: PendingQueue,
    /// Payloads recovered recently, by work id.
    visited: ExpiringHashMap<WorkId, UpkeepPayload>,
}

/// Recovers missed trigger logs and serves them as proposals.
pub struct LogRecoverer<P, C, S, K> {
    opts: RecovererOptions,
    poller: Arc<P>,
    client: Arc<C>,
    states: Arc<S>,
    packer: Arc<K>,
    filter_store: Arc<FilterStore>,
    /// Measured block time in nanoseconds.
    block_time: Arc<AtomicU64>,
    state: Arc<Mutex<RecoveryState>>,
    started: Arc<AtomicBool>,
    shutdown_token: CancellationToken,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<P, C, S, K> Clone for LogRecoverer<P, C, S, K> {
    fn clone(&self) -> Self {
        Self {
            opts: self.opts.clone(),
            poller: self.poller.clone(),
            client: self.client.clone(),
            states: self.states.clone(),
            packer: self.packer.clone(),
            filter_store: self.filter_store.clone(),
            block_time: self.block_time.clone(),
            state: self.state.clone(),
            started: self.started.clone(),
            shutdown_token: self.shutdown_token.clone(),
            handles: self.handles.clone(),
        }
    }
}

impl<P, C, S, K> LogRecoverer<P, C, S, K>
where
    P: LogPoller + 'static,
    C: ChainClient + 'static,
    S: UpkeepStateReader + 'static,
    K: LogDataPacker + 'static,
{
    pub fn new(
        opts: RecovererOptions,
        poller: Arc<P>,
        client: Arc<C>,
        states: Arc<S>,
        packer: Arc<K>,
        filter_store: Arc<FilterStore>,
    ) -> Self {
        Self {
            opts,
            poller,
            client,
            states,
            packer,
            filter_store,
            block_time: Arc::new(AtomicU64::new(DEFAULT_BLOCK_TIME.as_nanos() as u64)),
            state: Arc::new(Mutex::new(RecoveryState {
                pending: PendingQueue::new(MAX_PENDING_PAYLOADS_PER_UPKEEP),
                visited: ExpiringHashMap::new(RECOVERY_CACHE_TTL),
            })),
            started: Arc::new(AtomicBool::new(false)),
            shutdown_token: CancellationToken::new(),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn block_time(&self) -> Duration {
        Duration::from_nanos(self.block_time.load(Ordering::Relaxed))
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn visited_len(&self) -> usize {
        self.state.lock().visited.len()
    }

    /// Spawn the recovery, cleanup and block time loops. Calling it again is
    /// a no-op.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Log recoverer already started");
            return Ok(());
        }

        info!(
            interval_ms = self.opts.interval.as_millis() as u64,
            lookback_blocks = self.opts.lookback_blocks,
            finality_depth = self.opts.finality_depth,
            "Starting log recoverer"
        );

        let mut handles = self.handles.lock();

        {
            let recoverer = self.clone();
            let shutdown_token = self.shutdown_token.clone();
            handles.push(tokio::spawn(async move {
                recoverer.run_block_time_updates(shutdown_token).await;
            }));
        }

        {
            let recoverer = self.clone();
            let shutdown_token = self.shutdown_token.clone();
            handles.push(tokio::spawn(async move {
                recoverer.run_recovery(shutdown_token).await;
            }));
        }

        {
            let recoverer = self.clone();
            let shutdown_token = self.shutdown_token.clone();
            handles.push(tokio::spawn(async move {
                recoverer.run_cleanup(shutdown_token).await;
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
        info!("Log recoverer stopped");
    }

    async fn run_block_time_updates(self, shutdown_token: CancellationToken) {
        let mut interval = tokio::time::interval(BLOCK_TIME_UPDATE_CADENCE);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_token.cancelled() => break,

                _ = interval.tick() => self.update_block_time().await,
            }
        }
    }

    async fn run_recovery(self, shutdown_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.opts.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_token.cancelled() => break,

                _ = interval.tick() => {
                    if let Err(e) = self.recover().await {
                        warn!(error = %e, "Failed to recover logs");
                    }
                }
            }
        }
    }

    async fn run_cleanup(self, shutdown_token: CancellationToken) {
        let mut interval = tokio::time::interval(RECOVERY_CACHE_TTL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_token.cancelled() => break,

                _ = interval.tick() => self.clean().await,
            }
        }
    }

    /// Re-measure the chain block time. Failures keep the previous value.
    pub async fn update_block_time(&self) {
        let block_time = match BlockTimeResolver::new(self.poller.as_ref())
            .block_time(DEFAULT_SAMPLE_SIZE)
            .await
        {
            Ok(block_time) => block_time,
            Err(e) => {
                warn!(error = %e, "Failed to measure block time");
                return;
            }
        };

        let current = self.block_time();
        if is_significant_change(current, block_time) {
            warn!(
                current_ms = current.as_millis() as u64,
                new_ms = block_time.as_millis() as u64,
                "Block time changed by more than 20%"
            );
        }
        self.block_time
            .store(block_time.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Recovery window `(start, end)` for the latest block. Either bound may
    /// be negative on a young chain.
    pub fn get_recovery_window(&self, latest: BlockNumber) -> (i64, i64) {
        let block_time = self.block_time.load(Ordering::Relaxed).max(1);
        let blocks_in_day = (DAY.as_nanos() as u64 / block_time) as i64;
        let latest = latest as i64;

        let start = latest - blocks_in_day;
        let end = latest - self.opts.lookback_blocks as i64 - self.opts.finality_depth as i64;
        (start, end)
    }

    /// Run one recovery scan over a batch of filters.
    pub async fn recover(&self) -> Result<()> {
        let latest = self
            .poller
            .latest_block()
            .await
            .map_err(|e| Error::HeadNotAvailable(Box::new(e)))?;

        let (start, offset) = self.get_recovery_window(latest.number);
        if offset < 0 {
            // chain is shorter than the lookback
            return Ok(());
        }
        let start = start.max(0) as BlockNumber;
        let offset = offset as BlockNumber;

        let filters = self.get_filter_batch(offset);
        if filters.is_empty() {
            return Ok(());
        }

        let results = join_all(
            filters
                .iter()
                .map(|f| self.recover_filter(f, start, offset)),
        )
        .await;

        for (filter, result) in filters.iter().zip(results) {
            if let Err(e) = result {
                debug!(upkeep_id = %filter.upkeep_id, error = %e, "Failed to recover filter");
            }
        }

        Ok(())
    }

    fn get_filter_batch(&self, offset: BlockNumber) -> Vec<UpkeepFilter> {
        let filters = self.filter_store.get_filters(|f| {
            f.has_address() && f.last_re_poll_block < offset && f.config_update_block <= offset
        });
        select_filter_batch(filters)
    }

    async fn recover_filter(
        &self,
        filter: &UpkeepFilter,
        start_block: BlockNumber,
        offset: BlockNumber,
    ) -> Result<()> {
        let start = (filter.last_re_poll_block + 1)
            .max(start_block)
            .max(filter.config_update_block);
        let mut end = start + RECOVERY_LOGS_BUFFER;
        if offset.saturating_sub(end) > 100 * RECOVERY_LOGS_BUFFER {
            end = start + RECOVERY_LOGS_BURST;
        }
        let end = end.min(offset);

        let logs = self
            .poller
            .logs_with_sigs(start, end, &[filter.event_sig()], filter.address)
            .await
            .map_err(|e| Error::Recovery(format!("could not read logs: {e}")))?;
        let logs = filter.select(logs);

        let work_ids: Vec<_> = logs
            .iter()
            .map(|log| WorkId::new(&filter.upkeep_id, &Trigger::from_log(log)))
            .collect();
        let states = self
            .states
            .select_by_work_ids(&work_ids)
            .await
            .map_err(|e| Error::Recovery(format!("could not read states: {e}")))?;
        if logs.len() != states.len() {
            return Err(Error::Recovery(format!(
                "log and state count mismatch: {} != {}",
                logs.len(),
                states.len()
            )));
        }

        let unresolved: Vec<_> = logs
            .into_iter()
            .zip(states)
            .filter_map(|(log, state)| (state == UpkeepState::Unknown).then_some(log))
            .collect();

        let (added, already_pending, accepted) = self.populate_pending(filter, &unresolved);
        if added > 0 {
            debug!(
                upkeep_id = %filter.upkeep_id,
                start,
                end,
                added,
                already_pending,
                "Found missed logs"
            );
            metrics::record_recovered_logs(added);
        }
        if !accepted {
            return Err(Error::Recovery(format!(
                "failed to add all logs to pending for upkeep {}",
                filter.upkeep_id
            )));
        }

        self.filter_store.update_filters(
            |current, _| {
                let mut merged = current.clone();
                merged.last_re_poll_block = current.last_re_poll_block.max(end);
                merged
            },
            std::slice::from_ref(filter),
        );

        Ok(())
    }

    /// Queue recovered logs. Returns the number added, the number already
    /// visited, and whether every new log was accepted.
    fn populate_pending(&self, filter: &UpkeepFilter, logs: &[Log]) -> (usize, usize, bool) {
        let mut state = self.state.lock();
        let before = state.pending.len();
        let mut already_pending = 0;
        let mut accepted = true;

        for log in logs {
            let mut trigger = Trigger::from_log(log);
            // check at the latest block
            trigger.block_number = 0;
            trigger.block_hash = B256::ZERO;

            let work_id = WorkId::new(&filter.upkeep_id, &trigger);
            if state.visited.contains_key(&work_id) {
                already_pending += 1;
                continue;
            }

            let check_data = match self.packer.pack_log_data(log) {
                Ok(check_data) => check_data,
                Err(e) => {
                    warn!(upkeep_id = %filter.upkeep_id, error = %e, "Failed to pack log data");
                    continue;
                }
            };

            let payload = UpkeepPayload::new(filter.upkeep_id, trigger, check_data);
            match state.pending.add(payload.clone()) {
                Ok(()) => state.visited.insert(work_id, payload),
                Err(e) => {
                    debug!(upkeep_id = %filter.upkeep_id, error = %e, "Dropped recovered log");
                    accepted = false;
                }
            }
        }

        metrics::set_pending_payloads(state.pending.len());
        (state.pending.len() - before, already_pending, accepted)
    }

    /// Pending payloads to propose, in an order every node derives from the
    /// latest block. At most `max_proposals` in total and
    /// `allowed_logs_per_upkeep` per upkeep; the rest stay pending.
    pub async fn get_recovery_proposals(&self) -> Result<Vec<UpkeepPayload>> {
        let latest = self
            .poller
            .latest_block()
            .await
            .map_err(|e| Error::HeadNotAvailable(Box::new(e)))?;

        let mut state = self.state.lock();
        if state.pending.is_empty() {
            return Ok(Vec::new());
        }

        state.pending.shuffle((latest.number / 100).max(1));
        let proposals = state
            .pending
            .take(self.opts.max_proposals, self.opts.allowed_logs_per_upkeep);

        if !proposals.is_empty() {
            debug!(
                proposals = proposals.len(),
                pending = state.pending.len(),
                "Returning recovery proposals"
            );
        }
        metrics::record_recovery_proposals(proposals.len());
        metrics::set_pending_payloads(state.pending.len());

        Ok(proposals)
    }

    /// Re-validate a proposal against the chain and return its check data.
    pub async fn get_proposal_data(&self, proposal: &CoordinatedProposal) -> Result<Bytes> {
        if proposal.upkeep_id.upkeep_type() != UpkeepType::LogTrigger {
            return Err(Error::proposal("not a log trigger upkeep ID"));
        }
        self.get_log_trigger_check_data(proposal).await
    }

    async fn get_log_trigger_check_data(&self, proposal: &CoordinatedProposal) -> Result<Bytes> {
        let upkeep_id = proposal.upkeep_id;
        if !self.filter_store.has(&upkeep_id) {
            return Err(Error::proposal(format!("filter not found for upkeep {upkeep_id}")));
        }

        let latest = self.poller.latest_block().await?;
        let (start, end) = self.get_recovery_window(latest.number);

        let Some(ext) = proposal.trigger.log_trigger_extension else {
            return Err(Error::proposal("missing log trigger extension"));
        };

        // the log block number is not part of the work id, so it is looked up
        let Some(tx_block) = self.client.tx_block(ext.tx_hash).await? else {
            return Err(Error::proposal("failed to get tx block"));
        };
        if tx_block.hash != ext.block_hash {
            return Err(Error::proposal("log tx reorged"));
        }
        let log_block = tx_block.number;
        if !(start < log_block as i64 && (log_block as i64) < end) {
            return Err(Error::proposal("log block is not recoverable"));
        }

        let states = self.states.select_by_work_ids(&[proposal.work_id]).await?;
        match states.first() {
            None => return Err(Error::proposal("could not get state for workID")),
            Some(UpkeepState::Unknown) => {}
            Some(_) => return Err(Error::proposal("upkeep state is not recoverable")),
        }

        let filter = self
            .filter_store
            .get(&upkeep_id)
            .unwrap_or_else(|| UpkeepFilter::empty(upkeep_id));
        if !filter.has_address() {
            return Err(Error::proposal(format!(
                "invalid filter found for upkeepID {upkeep_id}"
            )));
        }
        if filter.config_update_block > log_block {
            return Err(Error::proposal(format!(
                "log block {log_block} is before the filter configUpdateBlock {} for upkeepID {upkeep_id}",
                filter.config_update_block
            )));
        }

        let logs = self
            .poller
            .logs_with_sigs(
                log_block.saturating_sub(1),
                log_block + 1,
                &[filter.event_sig()],
                filter.address,
            )
            .await
            .map_err(|e| Error::proposal(format!("could not read logs: {e}")))?;

        for log in filter.select(logs) {
            let mut trigger = Trigger::from_log(&log);
            trigger.block_number = proposal.trigger.block_number;
            trigger.block_hash = proposal.trigger.block_hash;
            if WorkId::new(&upkeep_id, &trigger) == proposal.work_id {
                return self.packer.pack_log_data(&log);
            }
        }

        Err(Error::proposal(format!(
            "no log found for upkeepID {upkeep_id} and trigger {}",
            proposal.trigger
        )))
    }

    /// Re-check visited entries older than the cache TTL.
    pub async fn clean(&self) {
        let expired = self.state.lock().visited.expired_keys();
        if expired.is_empty() {
            return;
        }
        debug!(expired = expired.len(), "Cleaning expired visited entries");

        if let Err(e) = self.try_expire(expired).await {
            warn!(error = %e, "Failed to clean visited entries");
        }
    }

    async fn try_expire(&self, mut ids: Vec<WorkId>) -> Result<()> {
        let latest = self.poller.latest_block().await?;
        ids.sort();
        let states = self.states.select_by_work_ids(&ids).await?;
        let (start, _) = self.get_recovery_window(latest.number);

        let mut state = self.state.lock();
        let RecoveryState { pending, visited } = &mut *state;
        let mut removed = 0;

        for (id, upkeep_state) in ids.iter().zip(states) {
            if upkeep_state != UpkeepState::Unknown {
                visited.remove(id);
                removed += 1;
                continue;
            }

            let Some(payload) = visited.get(id).cloned() else {
                continue;
            };
            let log_block = payload
                .trigger
                .log_trigger_extension
                .map(|ext| ext.block_number)
                .unwrap_or_default();

            if (log_block as i64) < start {
                // out of the recovery window for good
                pending.remove(id);
                visited.remove(id);
                removed += 1;
                continue;
            }

            match pending.add(payload) {
                Ok(()) => {
                    visited.touch(id);
                }
                Err(e) => warn!(work_id = %id, error = %e, "Failed to re-queue expired payload"),
            }
        }

        if removed > 0 {
            debug!(removed, remaining = visited.len(), "Removed visited entries");
        }
        metrics::set_pending_payloads(pending.len());
        Ok(())
    }

    /// Whether the given work id is waiting to be proposed.
    pub fn is_pending(&self, work_id: &WorkId) -> bool {
        self.state.lock().pending.contains(work_id)
    }
}

/// Half the batch are the filters that were recovered longest ago, the other
/// half is picked at random from the rest.
fn select_filter_batch(mut filters: Vec<UpkeepFilter>) -> Vec<UpkeepFilter> {
    if filters.len() < RECOVERY_BATCH_SIZE {
        return filters;
    }

    filters.sort_by_key(|f| f.last_re_poll_block);
    let mut rest = filters.split_off(RECOVERY_BATCH_SIZE / 2);
    rest.shuffle(&mut rand::rng());
    filters.extend(rest.into_iter().take(RECOVERY_BATCH_SIZE - filters.len()));
    filters
}

#[cfg(test)]
mod tests {
    use alloy_primitives::Address;

    use super::*;
    use crate::types::UpkeepId;

    fn filter(id: u64, last_re_poll_block: BlockNumber) -> UpkeepFilter {
        UpkeepFilter {
            upkeep_id: UpkeepId::from(id),
            address: Address::repeat_byte(1),
            last_re_poll_block,
            ..Default::default()
        }
    }

    #[test]
    fn small_batches_are_kept_whole() {
        let filters: Vec<_> = (0..7).map(|i| filter(i, 0)).collect();
        assert_eq!(select_filter_batch(filters.clone()), filters);
    }

    #[test]
    fn batch_starts_with_oldest_filters() {
        let filters: Vec<_> = (0..30).map(|i| filter(i, 100 - i)).collect();
        let batch = select_filter_batch(filters);

        assert_eq!(batch.len(), RECOVERY_BATCH_SIZE);
        let oldest: Vec<_> = batch[..5].iter().map(|f| f.last_re_poll_block).collect();
        assert_eq!(oldest, vec![71, 72, 73, 74, 75]);
        assert!(batch[5..].iter().all(|f| f.last_re_poll_block > 75));

        let mut ids: Vec<_> = batch.iter().map(|f| f.upkeep_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), RECOVERY_BATCH_SIZE);
    }
}
