use std::collections::HashMap;

use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use crate::{
    error::{Error, Result},
    types::{UpkeepId, UpkeepPayload, WorkId},
};

/// Recovered payloads waiting to be proposed, capped per upkeep.
#[derive(Debug)]
pub(crate) struct PendingQueue {
    payloads: Vec<UpkeepPayload>,
    max_per_upkeep: usize,
}

impl PendingQueue {
    pub(crate) fn new(max_per_upkeep: usize) -> Self {
        Self {
            payloads: Vec::new(),
            max_per_upkeep,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.payloads.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub(crate) fn contains(&self, work_id: &WorkId) -> bool {
        self.payloads.iter().any(|p| &p.work_id == work_id)
    }

    /// Add a payload unless its work id is already pending. Fails when the
    /// upkeep already has the maximum number of pending payloads.
    pub(crate) fn add(&mut self, payload: UpkeepPayload) -> Result<()> {
        let mut exists = false;
        let mut upkeep_payloads = 0;
        for p in &self.payloads {
            if p.upkeep_id == payload.upkeep_id {
                upkeep_payloads += 1;
            }
            if p.work_id == payload.work_id {
                exists = true;
            }
        }

        if upkeep_payloads >= self.max_per_upkeep {
            return Err(Error::PendingQueueFull(payload.upkeep_id));
        }
        if !exists {
            self.payloads.push(payload);
        }
        Ok(())
    }

    pub(crate) fn remove(&mut self, work_id: &WorkId) {
        self.payloads.retain(|p| &p.work_id != work_id);
    }

    /// Shuffle the queue with `seed`. Two queues holding the same payloads end
    /// up in the same order for the same seed, whatever order they were added in.
    pub(crate) fn shuffle(&mut self, seed: u64) {
        self.payloads.sort_by_key(|p| p.work_id);
        let mut rng = StdRng::seed_from_u64(seed);
        self.payloads.shuffle(&mut rng);
    }

    /// Take up to `max` payloads in queue order with at most `per_upkeep` per
    /// upkeep. Everything else stays pending, order preserved.
    pub(crate) fn take(&mut self, max: usize, per_upkeep: usize) -> Vec<UpkeepPayload> {
        let mut taken = Vec::new();
        let mut counts: HashMap<UpkeepId, usize> = HashMap::new();
        let mut remaining = Vec::with_capacity(self.payloads.len());

        for payload in self.payloads.drain(..) {
            let count = counts.entry(payload.upkeep_id).or_default();
            if taken.len() >= max || *count >= per_upkeep {
                remaining.push(payload);
                continue;
            }
            *count += 1;
            taken.push(payload);
        }

        self.payloads = remaining;
        taken
    }
}
