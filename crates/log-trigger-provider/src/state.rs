//! In-memory upkeep state store.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::{
    error::Result,
    poller::UpkeepStateReader,
    types::{UpkeepState, WorkId},
};

/// Work states kept in memory. Work ids never recorded are `Unknown`.
#[derive(Debug, Default)]
pub struct InMemoryUpkeepStateStore {
    states: RwLock<HashMap<WorkId, UpkeepState>>,
}

impl InMemoryUpkeepStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, work_id: WorkId, state: UpkeepState) {
        self.states.write().insert(work_id, state);
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}

impl UpkeepStateReader for InMemoryUpkeepStateStore {
    async fn select_by_work_ids(&self, work_ids: &[WorkId]) -> Result<Vec<UpkeepState>> {
        let states = self.states.read();
        Ok(work_ids
            .iter()
            .map(|id| states.get(id).copied().unwrap_or_default())
            .collect())
    }
}
