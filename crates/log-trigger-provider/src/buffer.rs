//! Block windowed buffer of matched logs.
//!
//! Every upkeep gets its own ordered queue. Logs older than the lookback
//! threshold expire, and each block window keeps at most `window_limit` logs
//! per upkeep so a single noisy contract cannot exhaust memory. Block hashes
//! are remembered per height; a differing hash for a known height evicts
//! every log of that block and reopens its window in the coordinator.

mod queue;

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use alloy_primitives::B256;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use self::queue::UpkeepLogQueue;
use crate::{
    coordinator::DequeueCoordinator,
    filter_store::FilterStore,
    metrics,
    types::{BlockNumber, Log, UpkeepId},
};

/// Multiplier from the per-upkeep log limit to the per-window capacity.
const WINDOW_LIMIT_MULTIPLIER: usize = 10;

/// Start and end (inclusive) of the window containing `block`.
pub fn block_window(block: BlockNumber, block_rate: u64) -> (BlockNumber, BlockNumber) {
    if block_rate == 0 {
        return (block, block);
    }
    let start = block - (block % block_rate);
    (start, start + block_rate - 1)
}

/// A log together with the upkeep it was matched for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedLog {
    pub id: UpkeepId,
    pub log: Log,
}

/// Buffer implementation selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferVersion {
    /// Windowed buffer driven by the dequeue coordinator.
    #[default]
    V1,
}

/// Live tunable buffer settings, always read and replaced as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    /// Number of blocks kept behind the latest seen block.
    pub lookback: u64,
    /// Blocks per window.
    pub block_rate: u64,
    /// Minimum logs per upkeep per window guaranteed to be dequeued.
    pub log_limit: usize,
    /// Maximum logs kept per upkeep per window.
    pub window_limit: usize,
}

impl BufferConfig {
    pub fn new(lookback: u64, block_rate: u64, log_limit: usize) -> Self {
        Self {
            lookback,
            block_rate: block_rate.max(1),
            log_limit,
            window_limit: log_limit * WINDOW_LIMIT_MULTIPLIER,
        }
    }

    pub fn with_window_limit(mut self, window_limit: usize) -> Self {
        self.window_limit = window_limit;
        self
    }
}

/// Decides how many logs an upkeep may take in one dequeue call, `None` skips
/// the upkeep.
pub type UpkeepSelector<'a> = &'a (dyn Fn(&UpkeepId) -> Option<usize> + Sync);

/// Selector admitting every upkeep without an extra cap.
pub fn select_all(_: &UpkeepId) -> Option<usize> {
    Some(usize::MAX)
}

/// Pluggable log buffering strategy.
pub trait LogBuffer: Send + Sync {
    /// Add logs of an upkeep. Returns the number of (added, dropped) logs.
    fn enqueue(&self, id: UpkeepId, logs: Vec<Log>) -> (usize, usize);

    /// Pull logs of the window starting at `window_start`, at most
    /// `upkeep_limit` per upkeep and `max_results` overall. Returns the logs
    /// and the number left in that window for the visited upkeeps.
    fn dequeue(
        &self,
        window_start: BlockNumber,
        block_rate: u64,
        upkeep_limit: usize,
        max_results: usize,
        selector: UpkeepSelector<'_>,
    ) -> (Vec<BufferedLog>, usize);

    fn set_config(&self, lookback: u64, block_rate: u64, log_limit: usize);

    fn config(&self) -> BufferConfig;

    fn num_of_upkeeps(&self) -> usize;

    /// Drop queues of upkeeps that no longer have a filter.
    fn sync_filters(&self, filter_store: &FilterStore);
}

#[derive(Debug, Default)]
struct BufferState {
    last_block_seen: BlockNumber,
    queues: HashMap<UpkeepId, UpkeepLogQueue>,
    /// Queue ids in creation order, the order upkeeps are visited on dequeue.
    queue_ids: Vec<UpkeepId>,
    block_hashes: BTreeMap<BlockNumber, B256>,
}

/// Windowed log buffer feeding the [`DequeueCoordinator`].
#[derive(Debug)]
pub struct WindowedLogBuffer {
    config: RwLock<BufferConfig>,
    state: Mutex<BufferState>,
    coordinator: Arc<DequeueCoordinator>,
}

impl WindowedLogBuffer {
    pub fn new(config: BufferConfig, coordinator: Arc<DequeueCoordinator>) -> Self {
        Self {
            config: RwLock::new(config),
            state: Mutex::new(BufferState::default()),
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &Arc<DequeueCoordinator> {
        &self.coordinator
    }

    pub fn last_block_seen(&self) -> BlockNumber {
        self.state.lock().last_block_seen
    }

    /// Number of buffered logs of an upkeep.
    pub fn queue_len(&self, id: &UpkeepId) -> usize {
        self.state.lock().queues.get(id).map_or(0, UpkeepLogQueue::len)
    }

    /// Number of buffered logs of an upkeep in the window containing `block`.
    pub fn window_len(&self, id: &UpkeepId, block: BlockNumber) -> usize {
        let block_rate = self.config.read().block_rate;
        let (start, end) = block_window(block, block_rate);
        self.state
            .lock()
            .queues
            .get(id)
            .map_or(0, |q| q.size_of_range(start, end))
    }

    /// Record block hashes of incoming logs. Returns the highest block number
    /// and the heights whose hash changed.
    fn detect_reorgs(state: &mut BufferState, logs: &[Log]) -> (BlockNumber, Vec<BlockNumber>) {
        let mut latest = 0;
        let mut reorged = Vec::new();
        for log in logs {
            latest = latest.max(log.block_number);
            if let Some(known) = state.block_hashes.insert(log.block_number, log.block_hash)
                && known != log.block_hash
                && !reorged.contains(&log.block_number)
            {
                reorged.push(log.block_number);
            }
        }
        (latest, reorged)
    }

    fn evict_reorged(&self, state: &mut BufferState, blocks: &[BlockNumber], block_rate: u64) {
        for block in blocks {
            let evicted: usize = state
                .queues
                .values_mut()
                .map(|q| q.evict_block(*block))
                .sum();
            info!(block = *block, evicted, "Reorg detected, evicting block logs");
            metrics::record_reorg();

            self.coordinator.mark_reorg(*block, block_rate);
            let (start, end) = block_window(*block, block_rate);
            for queue in state.queues.values() {
                self.coordinator
                    .record_window(start, queue.id(), 0, queue.size_of_range(start, end));
            }
        }
    }
}

impl LogBuffer for WindowedLogBuffer {
    fn enqueue(&self, id: UpkeepId, logs: Vec<Log>) -> (usize, usize) {
        let config = *self.config.read();
        let mut state = self.state.lock();

        let (latest_log_block, reorged) = Self::detect_reorgs(&mut state, &logs);
        if !reorged.is_empty() {
            self.evict_reorged(&mut state, &reorged, config.block_rate);
        }

        if latest_log_block > state.last_block_seen {
            state.last_block_seen = latest_log_block;
        } else if latest_log_block < state.last_block_seen {
            debug!(
                log_block = latest_log_block,
                last_block_seen = state.last_block_seen,
                "Enqueuing logs older than the latest seen block"
            );
        }

        let (block_threshold, _) = block_window(
            state.last_block_seen.saturating_sub(config.lookback),
            config.block_rate,
        );
        self.coordinator.clean(block_threshold, config.block_rate);
        state.block_hashes = state.block_hashes.split_off(&block_threshold);

        if !state.queues.contains_key(&id) {
            state.queues.insert(id, UpkeepLogQueue::new(id));
            state.queue_ids.push(id);
        }
        let Some(queue) = state.queues.get_mut(&id) else {
            return (0, 0);
        };
        let outcome = queue.enqueue(
            block_threshold,
            config.block_rate,
            config.window_limit,
            logs,
        );

        for (window_start, retained) in &outcome.retained_by_window {
            let (start, end) = block_window(*window_start, config.block_rate);
            self.coordinator
                .record_window(start, id, *retained, queue.size_of_range(start, end));
        }

        metrics::record_buffer_enqueue(outcome.added, outcome.dropped, outcome.expired);

        (outcome.added, outcome.dropped)
    }

    fn dequeue(
        &self,
        window_start: BlockNumber,
        block_rate: u64,
        upkeep_limit: usize,
        max_results: usize,
        selector: UpkeepSelector<'_>,
    ) -> (Vec<BufferedLog>, usize) {
        let (start, end) = block_window(window_start, block_rate.max(1));
        let mut state = self.state.lock();
        let BufferState {
            queues, queue_ids, ..
        } = &mut *state;

        let mut results = Vec::new();
        let mut remaining = 0;
        let mut capacity = max_results;

        for id in queue_ids.iter() {
            let Some(queue) = queues.get_mut(id) else {
                continue;
            };
            let Some(allowance) = selector(id) else {
                continue;
            };
            let in_range = queue.size_of_range(start, end);
            if in_range == 0 {
                continue;
            }
            if capacity == 0 {
                remaining += in_range;
                continue;
            }
            let limit = upkeep_limit.min(allowance).min(capacity);
            let (logs, left) = queue.dequeue(start, end, limit);
            capacity -= logs.len();
            remaining += left;
            self.coordinator.record_window(start, *id, 0, left);
            results.extend(logs.into_iter().map(|log| BufferedLog { id: *id, log }));
        }

        if !results.is_empty() {
            debug!(
                window_start = start,
                window_end = end,
                upkeep_limit,
                results = results.len(),
                remaining,
                "Dequeued logs"
            );
        }
        metrics::record_buffer_dequeue(results.len());

        (results, remaining)
    }

    fn set_config(&self, lookback: u64, block_rate: u64, log_limit: usize) {
        let state = self.state.lock();
        let mut config = self.config.write();
        let previous = *config;
        *config = BufferConfig::new(lookback, block_rate, log_limit);
        if config.block_rate == previous.block_rate {
            return;
        }

        // windows are keyed by their start, re-cut them under the new rate
        self.coordinator.clear();
        for queue in state.queues.values() {
            for window in queue.windows(config.block_rate) {
                let (start, end) = block_window(window, config.block_rate);
                let buffered = queue.size_of_range(start, end);
                self.coordinator
                    .record_window(start, queue.id(), buffered, buffered);
            }
        }
        info!(
            previous = previous.block_rate,
            block_rate = config.block_rate,
            windows = self.coordinator.num_of_windows(),
            "Block rate changed, rebuilt dequeue windows"
        );
    }

    fn config(&self) -> BufferConfig {
        *self.config.read()
    }

    fn num_of_upkeeps(&self) -> usize {
        self.state.lock().queues.len()
    }

    fn sync_filters(&self, filter_store: &FilterStore) {
        let block_rate = self.config.read().block_rate;
        let mut state = self.state.lock();
        let stale: Vec<_> = state
            .queue_ids
            .iter()
            .filter(|id| !filter_store.has(id))
            .copied()
            .collect();
        for id in &stale {
            if let Some(queue) = state.queues.remove(id) {
                for window in queue.windows(block_rate) {
                    self.coordinator.record_window(window, *id, 0, 0);
                }
            }
        }
        state.queue_ids.retain(|id| !stale.contains(id));
        if !stale.is_empty() {
            debug!(removed = stale.len(), "Removed buffer queues without filter");
        }
    }
}
