use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::debug;

use super::block_window;
use crate::types::{BlockNumber, Log, LogId, UpkeepId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogStatus {
    Enqueued,
    Dequeued,
    Dropped,
}

#[derive(Debug, Clone, Copy)]
struct LogState {
    status: LogStatus,
    block: BlockNumber,
}

/// Result of adding logs to a queue.
#[derive(Debug, Default)]
pub(crate) struct EnqueueOutcome {
    pub(crate) added: usize,
    pub(crate) dropped: usize,
    pub(crate) expired: usize,
    /// Newly added logs still retained after cleaning, per touched window.
    pub(crate) retained_by_window: BTreeMap<BlockNumber, usize>,
}

/// Ordered queue of logs for a single upkeep.
///
/// Every log seen while within the retention threshold keeps a state entry, so
/// re-reads of overlapping block ranges never enqueue the same log twice.
#[derive(Debug)]
pub(crate) struct UpkeepLogQueue {
    id: UpkeepId,
    logs: Vec<Log>,
    states: HashMap<LogId, LogState>,
}

impl UpkeepLogQueue {
    pub(crate) fn new(id: UpkeepId) -> Self {
        Self {
            id,
            logs: Vec::new(),
            states: HashMap::new(),
        }
    }

    pub(crate) fn id(&self) -> UpkeepId {
        self.id
    }

    pub(crate) fn len(&self) -> usize {
        self.logs.len()
    }

    #[cfg(test)]
    pub(crate) fn status(&self, id: &LogId) -> Option<LogStatus> {
        self.states.get(id).map(|s| s.status)
    }

    pub(crate) fn size_of_range(&self, start: BlockNumber, end: BlockNumber) -> usize {
        self.logs
            .iter()
            .filter(|l| l.block_number >= start && l.block_number <= end)
            .count()
    }

    /// Window starts of all buffered logs.
    pub(crate) fn windows(&self, block_rate: u64) -> BTreeSet<BlockNumber> {
        self.logs
            .iter()
            .map(|l| block_window(l.block_number, block_rate).0)
            .collect()
    }

    pub(crate) fn enqueue(
        &mut self,
        block_threshold: BlockNumber,
        block_rate: u64,
        window_limit: usize,
        logs: Vec<Log>,
    ) -> EnqueueOutcome {
        let mut outcome = EnqueueOutcome::default();
        let mut new_ids = HashSet::new();

        for log in logs {
            if log.block_number < block_threshold {
                continue;
            }
            let lid = log.id();
            if self.states.contains_key(&lid) {
                continue;
            }
            self.states.insert(
                lid,
                LogState {
                    status: LogStatus::Enqueued,
                    block: log.block_number,
                },
            );
            outcome
                .retained_by_window
                .entry(block_window(log.block_number, block_rate).0)
                .or_default();
            new_ids.insert(lid);
            self.logs.push(log);
            outcome.added += 1;
        }

        if outcome.added > 0 {
            self.logs.sort_by(Log::position_cmp);
        }
        let (dropped, expired) = self.clean(block_threshold, block_rate, window_limit);
        outcome.dropped = dropped;
        outcome.expired = expired;

        for log in &self.logs {
            if new_ids.contains(&log.id()) {
                *outcome
                    .retained_by_window
                    .entry(block_window(log.block_number, block_rate).0)
                    .or_default() += 1;
            }
        }

        if outcome.added > 0 {
            debug!(
                upkeep_id = %self.id,
                added = outcome.added,
                dropped,
                expired,
                block_threshold,
                queue_size = self.logs.len(),
                states = self.states.len(),
                "Enqueued logs"
            );
        }

        outcome
    }

    /// Evict logs below the threshold and logs beyond the per-window limit.
    /// Returns the number of (dropped, expired) logs.
    fn clean(
        &mut self,
        block_threshold: BlockNumber,
        block_rate: u64,
        window_limit: usize,
    ) -> (usize, usize) {
        let mut dropped = 0;
        let mut expired = 0;
        let mut current_window: Option<BlockNumber> = None;
        let mut window_count = 0;
        let mut retained = Vec::with_capacity(self.logs.len());

        for log in self.logs.drain(..) {
            if log.block_number < block_threshold {
                self.states.remove(&log.id());
                expired += 1;
                continue;
            }
            let (window_start, _) = block_window(log.block_number, block_rate);
            if current_window != Some(window_start) {
                current_window = Some(window_start);
                window_count = 0;
            }
            window_count += 1;
            if window_count > window_limit {
                if let Some(state) = self.states.get_mut(&log.id()) {
                    state.status = LogStatus::Dropped;
                }
                debug!(
                    upkeep_id = %self.id,
                    block_number = log.block_number,
                    block_hash = %log.block_hash,
                    tx_hash = %log.tx_hash,
                    log_index = log.log_index,
                    window_start,
                    window_limit,
                    "Reached log buffer limits, dropping log"
                );
                dropped += 1;
                continue;
            }
            retained.push(log);
        }
        self.logs = retained;
        self.states.retain(|_, s| s.block >= block_threshold);

        (dropped, expired)
    }

    /// Pull up to `limit` logs within `[start, end]`. Returns the logs and the
    /// number of logs left in that range.
    pub(crate) fn dequeue(
        &mut self,
        start: BlockNumber,
        end: BlockNumber,
        limit: usize,
    ) -> (Vec<Log>, usize) {
        let mut results = Vec::new();
        let mut remaining = 0;
        let mut kept = Vec::with_capacity(self.logs.len());

        for log in self.logs.drain(..) {
            if log.block_number >= start && log.block_number <= end {
                if results.len() < limit {
                    if let Some(state) = self.states.get_mut(&log.id()) {
                        state.status = LogStatus::Dequeued;
                    }
                    results.push(log);
                    continue;
                }
                remaining += 1;
            }
            kept.push(log);
        }
        self.logs = kept;

        (results, remaining)
    }

    /// Remove every log of a reorged block, forgetting their states so the
    /// canonical logs at that height can enter. Returns the number evicted.
    pub(crate) fn evict_block(&mut self, block: BlockNumber) -> usize {
        let before = self.logs.len();
        self.logs.retain(|l| l.block_number != block);
        self.states.retain(|_, s| s.block != block);
        before - self.logs.len()
    }
}
