//! Window fairness bookkeeping for dequeuing buffered logs.
//!
//! Windows are drained in two passes. The minimum-guarantee pass hands out up
//! to `min_guaranteed` logs per upkeep per window, oldest window first. Only
//! once no window owes any upkeep its minimum does the best-effort pass drain
//! leftovers, again oldest window first.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::{
    buffer::{BufferedLog, block_window},
    types::{BlockNumber, UpkeepId},
};

#[derive(Debug, Default)]
struct WindowState {
    /// Logs admitted per upkeep since the window was opened (or reset by a reorg).
    enqueued: HashMap<UpkeepId, usize>,
    /// Logs currently buffered and not yet dequeued per upkeep.
    remaining: HashMap<UpkeepId, usize>,
    dequeued: HashMap<UpkeepId, usize>,
    total_enqueued: usize,
    total_dequeued: usize,
    min_dequeued: bool,
    complete: bool,
}

impl WindowState {
    fn remaining_total(&self) -> usize {
        self.remaining.values().sum()
    }

    fn deficit(&self, id: &UpkeepId, min_guaranteed: usize) -> usize {
        let remaining = self.remaining.get(id).copied().unwrap_or_default();
        let dequeued = self.dequeued.get(id).copied().unwrap_or_default();
        min_guaranteed.saturating_sub(dequeued).min(remaining)
    }

    fn deficits(&self, min_guaranteed: usize) -> HashMap<UpkeepId, usize> {
        self.remaining
            .keys()
            .filter_map(|id| {
                let deficit = self.deficit(id, min_guaranteed);
                (deficit > 0).then_some((*id, deficit))
            })
            .collect()
    }
}

/// Snapshot of a window's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowStats {
    pub enqueued: usize,
    pub dequeued: usize,
    pub remaining: usize,
    pub min_dequeued: bool,
    pub complete: bool,
}

/// Window selected for the next dequeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeueWindow {
    pub start: BlockNumber,
    pub end: BlockNumber,
    /// Logs still owed per upkeep in the minimum-guarantee pass, `None` in the
    /// best-effort pass.
    pub deficits: Option<HashMap<UpkeepId, usize>>,
}

impl DequeueWindow {
    pub fn is_best_effort(&self) -> bool {
        self.deficits.is_none()
    }

    /// How many logs the upkeep may take from this window, `None` to skip it.
    pub fn allowance(&self, id: &UpkeepId) -> Option<usize> {
        match &self.deficits {
            None => Some(usize::MAX),
            Some(deficits) => deficits.get(id).copied().filter(|d| *d > 0),
        }
    }
}

/// Tracks per-window enqueue/dequeue counts and picks the next window to drain.
#[derive(Debug, Default)]
pub struct DequeueCoordinator {
    windows: Mutex<BTreeMap<BlockNumber, WindowState>>,
}

impl DequeueCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next window in `[start, latest_block]` to dequeue from, if any window
    /// still holds logs.
    pub fn get_dequeue_block_window(
        &self,
        start: BlockNumber,
        latest_block: BlockNumber,
        block_rate: u64,
        min_guaranteed: usize,
    ) -> Option<DequeueWindow> {
        let block_rate = block_rate.max(1);
        let (first, _) = block_window(start, block_rate);
        let mut windows = self.windows.lock();

        for (window_start, state) in windows.range_mut(first..=latest_block) {
            let (window_start, window_end) = block_window(*window_start, block_rate);
            if latest_block >= window_end {
                state.complete = true;
            }
            if state.min_dequeued {
                continue;
            }
            let deficits = state.deficits(min_guaranteed);
            if !deficits.is_empty() {
                return Some(DequeueWindow {
                    start: window_start,
                    end: window_end,
                    deficits: Some(deficits),
                });
            }
            if state.complete {
                state.min_dequeued = true;
            }
        }

        windows
            .range(first..=latest_block)
            .find(|(_, state)| state.remaining_total() > 0)
            .map(|(window_start, _)| {
                let (start, end) = block_window(*window_start, block_rate);
                DequeueWindow {
                    start,
                    end,
                    deficits: None,
                }
            })
    }

    /// Record logs just pulled from `window_start`.
    pub fn count_dequeued_logs_for_window(
        &self,
        window_start: BlockNumber,
        logs: &[BufferedLog],
        min_guaranteed: usize,
    ) {
        let mut windows = self.windows.lock();
        let state = windows.entry(window_start).or_default();
        for log in logs {
            *state.dequeued.entry(log.id).or_default() += 1;
        }
        state.total_dequeued += logs.len();
        state.min_dequeued = state.deficits(min_guaranteed).is_empty();
    }

    /// Record `added` newly admitted logs and the current buffered count of an
    /// upkeep in a window. Called by the buffer under its own lock.
    pub(crate) fn record_window(
        &self,
        window_start: BlockNumber,
        id: UpkeepId,
        added: usize,
        remaining: usize,
    ) {
        let mut windows = self.windows.lock();
        if added == 0 && remaining == 0 && !windows.contains_key(&window_start) {
            return;
        }
        let state = windows.entry(window_start).or_default();
        if added > 0 {
            *state.enqueued.entry(id).or_default() += added;
            state.total_enqueued += added;
            // new logs may owe their upkeep a minimum again
            state.min_dequeued = false;
        }
        if remaining == 0 {
            state.remaining.remove(&id);
        } else {
            state.remaining.insert(id, remaining);
        }
    }

    /// Reset the window containing `block` so it goes through the minimum
    /// pass again.
    pub fn mark_reorg(&self, block: BlockNumber, block_rate: u64) {
        let (window_start, _) = block_window(block, block_rate.max(1));
        let mut windows = self.windows.lock();
        if let Some(state) = windows.get_mut(&window_start) {
            let complete = state.complete;
            *state = WindowState {
                complete,
                ..Default::default()
            };
        }
    }

    /// Settle a window the buffer had nothing to hand out for, so the next
    /// lookup moves past it. In the minimum pass its minimum counts as met; in
    /// the best-effort pass it no longer counts as holding logs. Returns false
    /// if the window is unknown.
    pub fn settle_empty_window(&self, window_start: BlockNumber, best_effort: bool) -> bool {
        let mut windows = self.windows.lock();
        let Some(state) = windows.get_mut(&window_start) else {
            return false;
        };
        state.min_dequeued = true;
        if best_effort {
            state.remaining.clear();
        }
        true
    }

    /// Forget every window. Used when windows are re-cut with a new block rate.
    pub(crate) fn clear(&self) {
        self.windows.lock().clear();
    }

    /// Drop bookkeeping of windows strictly older than the window containing
    /// `block_threshold`.
    pub fn clean(&self, block_threshold: BlockNumber, block_rate: u64) {
        let (window_start, _) = block_window(block_threshold, block_rate.max(1));
        let mut windows = self.windows.lock();
        *windows = windows.split_off(&window_start);
    }

    pub fn window_stats(&self, window_start: BlockNumber) -> Option<WindowStats> {
        self.windows.lock().get(&window_start).map(|state| WindowStats {
            enqueued: state.total_enqueued,
            dequeued: state.total_dequeued,
            remaining: state.remaining_total(),
            min_dequeued: state.min_dequeued,
            complete: state.complete,
        })
    }

    pub fn num_of_windows(&self) -> usize {
        self.windows.lock().len()
    }
}
