use std::time::Duration;

use tracing::{debug, info, warn};

use super::LogEventProvider;
use crate::{
    error::{Error, Result},
    filter_store::UpkeepFilter,
    poller::{LogDataPacker, LogPoller, PollerFilter},
    types::{BlockNumber, LogTriggerConfig, UpkeepId},
};

/// How long the poller keeps logs of a registered filter.
const LOG_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Name of the poller filter of an upkeep.
pub fn filter_name(id: &UpkeepId) -> String {
    format!("KeepersRegistry LogUpkeep - {id}")
}

/// Reject configs that can never match a log.
pub fn validate_trigger_config(cfg: &LogTriggerConfig) -> Result<()> {
    if cfg.contract_address.is_zero() {
        return Err(Error::InvalidTriggerConfig("invalid contract address: zeroed"));
    }
    if cfg.topic0.is_zero() {
        return Err(Error::InvalidTriggerConfig("invalid topic0: zeroed"));
    }
    if cfg.filter_selector >= 8 {
        return Err(Error::InvalidTriggerConfig(
            "invalid filter selector: larger or equal to 8",
        ));
    }
    Ok(())
}

/// Outcome of [`LogEventProvider::refresh_active_upkeeps`].
#[derive(Debug, Default)]
pub struct RefreshResult {
    /// Ids present in the input but without a filter.
    pub new_ids: Vec<UpkeepId>,
    /// Failures while unregistering inactive upkeeps.
    pub errors: Vec<Error>,
}

impl<P, K> LogEventProvider<P, K>
where
    P: LogPoller + 'static,
    K: LogDataPacker + 'static,
{
    /// Register or update the filter of an upkeep.
    ///
    /// A config older than the registered one is rejected, an identical update
    /// block is a no-op.
    pub async fn register_filter(
        &self,
        upkeep_id: UpkeepId,
        cfg: &LogTriggerConfig,
        update_block: BlockNumber,
    ) -> Result<()> {
        validate_trigger_config(cfg)?;

        let _guard = self.register_lock.lock().await;

        if let Some(current) = self.filter_store.get(&upkeep_id) {
            if current.config_update_block > update_block {
                return Err(Error::StaleFilterConfig(upkeep_id));
            }
            if current.config_update_block == update_block {
                debug!(%upkeep_id, update_block, "Filter already registered");
                return Ok(());
            }
        }

        self.register(UpkeepFilter::new(upkeep_id, cfg, update_block))
            .await
    }

    async fn register(&self, filter: UpkeepFilter) -> Result<()> {
        let latest = self
            .poller
            .latest_block()
            .await
            .map_err(|e| Error::HeadNotAvailable(Box::new(e)))?;

        let name = filter_name(&filter.upkeep_id);
        let poller_has_filter = self.poller.has_filter(&name);

        if poller_has_filter {
            // config update: drop the old filter first
            if let Err(e) = self.poller.unregister_filter(&name).await {
                warn!(upkeep_id = %filter.upkeep_id, error = %e, "Failed to unregister outdated filter");
                return Err(e);
            }
        }

        self.poller
            .register_filter(PollerFilter {
                name,
                event_sigs: vec![filter.event_sig()],
                addresses: vec![filter.address],
                retention: LOG_RETENTION,
            })
            .await?;

        let upkeep_id = filter.upkeep_id;
        let config_update_block = filter.config_update_block;
        self.filter_store.add_active_upkeeps([filter]);

        if !poller_has_filter {
            let backfill_block = latest
                .number
                .saturating_sub(self.opts.backfill_buffer)
                .max(config_update_block)
                .max(1);
            self.poller.replay_async(backfill_block);
            debug!(%upkeep_id, backfill_block, "Requested log backfill");
        }

        info!(%upkeep_id, config_update_block, "Registered upkeep filter");
        Ok(())
    }

    /// Remove the filter of an upkeep from the poller and the store.
    pub async fn unregister_filter(&self, upkeep_id: UpkeepId) -> Result<()> {
        let name = filter_name(&upkeep_id);
        if self.poller.has_filter(&name) {
            self.poller.unregister_filter(&name).await?;
        }
        self.filter_store.remove_active_upkeeps([&upkeep_id]);
        debug!(%upkeep_id, "Unregistered upkeep filter");
        Ok(())
    }

    /// Reconcile the registered filters with the set of active upkeeps.
    ///
    /// Filters of upkeeps not in `ids` are unregistered. Ids without a filter
    /// are returned so the caller can fetch their configs and register them.
    pub async fn refresh_active_upkeeps(&self, ids: &[UpkeepId]) -> RefreshResult {
        let mut result = RefreshResult::default();
        let active: std::collections::HashSet<_> = ids.iter().copied().collect();

        let inactive = self.filter_store.get_ids(|f| !active.contains(&f.upkeep_id));
        for id in inactive {
            if let Err(e) = self.unregister_filter(id).await {
                warn!(upkeep_id = %id, error = %e, "Failed to unregister inactive upkeep");
                result.errors.push(e);
            }
        }

        let mut seen = std::collections::HashSet::new();
        result.new_ids = ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id) && !self.filter_store.has(id))
            .collect();

        if !result.new_ids.is_empty() {
            debug!(new = result.new_ids.len(), "Found upkeeps without filters");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{Address, B256};

    use super::*;

    fn cfg() -> LogTriggerConfig {
        LogTriggerConfig {
            contract_address: Address::repeat_byte(1),
            topic0: B256::repeat_byte(2),
            ..Default::default()
        }
    }

    #[test]
    fn validation() {
        assert!(validate_trigger_config(&cfg()).is_ok());

        let mut zero_address = cfg();
        zero_address.contract_address = Address::ZERO;
        assert!(matches!(
            validate_trigger_config(&zero_address),
            Err(Error::InvalidTriggerConfig("invalid contract address: zeroed"))
        ));

        let mut zero_topic = cfg();
        zero_topic.topic0 = B256::ZERO;
        assert!(validate_trigger_config(&zero_topic).is_err());

        let mut selector = cfg();
        selector.filter_selector = 7;
        assert!(validate_trigger_config(&selector).is_ok());
        selector.filter_selector = 8;
        assert!(validate_trigger_config(&selector).is_err());
    }

    #[test]
    fn filter_names() {
        assert_eq!(
            filter_name(&UpkeepId::from(42)),
            "KeepersRegistry LogUpkeep - 42"
        );
    }
}
