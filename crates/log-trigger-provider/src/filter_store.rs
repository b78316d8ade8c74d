//! Registry of upkeep log filters shared by the provider, buffer and recoverer.

use std::collections::HashMap;

use alloy_primitives::{Address, B256};
use parking_lot::RwLock;

use crate::types::{BlockNumber, Log, LogTriggerConfig, UpkeepId};

/// Log matching filter of one upkeep together with its read cursors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpkeepFilter {
    pub upkeep_id: UpkeepId,
    /// Zero for a filter that is not registered.
    pub address: Address,
    pub topics: [B256; 4],
    /// Bitmask: bit `i` requires topic `i + 1` to match.
    pub selector: u8,
    /// Block at which this config became active.
    pub config_update_block: BlockNumber,
    /// High-water mark of the forward reader.
    pub last_poll_block: BlockNumber,
    /// High-water mark of the recovery scanner.
    pub last_re_poll_block: BlockNumber,
}

impl UpkeepFilter {
    pub fn new(upkeep_id: UpkeepId, cfg: &LogTriggerConfig, config_update_block: BlockNumber) -> Self {
        Self {
            upkeep_id,
            address: cfg.contract_address,
            topics: [cfg.topic0, cfg.topic1, cfg.topic2, cfg.topic3],
            selector: cfg.filter_selector,
            config_update_block,
            last_poll_block: 0,
            last_re_poll_block: 0,
        }
    }

    /// Placeholder for an id that has no filter.
    pub fn empty(upkeep_id: UpkeepId) -> Self {
        Self {
            upkeep_id,
            ..Default::default()
        }
    }

    pub fn has_address(&self) -> bool {
        !self.address.is_zero()
    }

    pub fn event_sig(&self) -> B256 {
        self.topics[0]
    }

    /// Whether the log satisfies the secondary topic selector.
    pub fn matches(&self, log: &Log) -> bool {
        (0..3).all(|i| {
            if self.selector & (1 << i) == 0 {
                return true;
            }
            log.topics.get(i + 1) == Some(&self.topics[i + 1])
        })
    }

    /// Logs matching this filter, order preserved.
    pub fn select(&self, logs: Vec<Log>) -> Vec<Log> {
        logs.into_iter().filter(|log| self.matches(log)).collect()
    }
}

/// Thread safe filter registry keyed by upkeep id.
///
/// Reads hand out clones so callers never observe a filter while it is being
/// replaced.
#[derive(Debug, Default)]
pub struct FilterStore {
    filters: RwLock<HashMap<UpkeepId, UpkeepFilter>>,
}

impl FilterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace filters.
    pub fn add_active_upkeeps(&self, filters: impl IntoIterator<Item = UpkeepFilter>) {
        let mut store = self.filters.write();
        for filter in filters {
            store.insert(filter.upkeep_id, filter);
        }
    }

    pub fn remove_active_upkeeps<'a>(&self, ids: impl IntoIterator<Item = &'a UpkeepId>) {
        let mut store = self.filters.write();
        for id in ids {
            store.remove(id);
        }
    }

    pub fn has(&self, id: &UpkeepId) -> bool {
        self.filters.read().contains_key(id)
    }

    pub fn size(&self) -> usize {
        self.filters.read().len()
    }

    pub fn get(&self, id: &UpkeepId) -> Option<UpkeepFilter> {
        self.filters.read().get(id).cloned()
    }

    /// Ids of all filters matching the predicate, sorted.
    pub fn get_ids(&self, predicate: impl Fn(&UpkeepFilter) -> bool) -> Vec<UpkeepId> {
        let mut ids: Vec<_> = self
            .filters
            .read()
            .values()
            .filter(|f| predicate(f))
            .map(|f| f.upkeep_id)
            .collect();
        ids.sort();
        ids
    }

    /// Clones of all filters matching the predicate, sorted by upkeep id.
    pub fn get_filters(&self, predicate: impl Fn(&UpkeepFilter) -> bool) -> Vec<UpkeepFilter> {
        let mut filters: Vec<_> = self
            .filters
            .read()
            .values()
            .filter(|f| predicate(f))
            .cloned()
            .collect();
        filters.sort_by_key(|f| f.upkeep_id);
        filters
    }

    /// Visit the filters of the given ids in order. Ids without a filter are
    /// visited with [`UpkeepFilter::empty`].
    pub fn range_filters_by_ids(&self, ids: &[UpkeepId], mut f: impl FnMut(usize, &UpkeepFilter)) {
        let snapshot: Vec<_> = {
            let store = self.filters.read();
            ids.iter()
                .map(|id| store.get(id).cloned().unwrap_or_else(|| UpkeepFilter::empty(*id)))
                .collect()
        };
        for (i, filter) in snapshot.iter().enumerate() {
            f(i, filter);
        }
    }

    /// Merge updated copies back into the store. `merge` receives the stored
    /// filter and the updated copy and returns the value to keep. Updates for
    /// ids no longer in the store are discarded.
    pub fn update_filters(
        &self,
        merge: impl Fn(&UpkeepFilter, &UpkeepFilter) -> UpkeepFilter,
        updated: &[UpkeepFilter],
    ) {
        let mut store = self.filters.write();
        for filter in updated {
            if let Some(current) = store.get(&filter.upkeep_id) {
                let merged = merge(current, filter);
                store.insert(filter.upkeep_id, merged);
            }
        }
    }
}
