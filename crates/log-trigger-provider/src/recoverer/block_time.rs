use std::time::Duration;

use crate::{
    error::{Error, Result},
    poller::LogPoller,
};

/// Block time assumed until it has been measured.
pub const DEFAULT_BLOCK_TIME: Duration = Duration::from_secs(1);

/// Number of blocks the block time is averaged over.
pub const DEFAULT_SAMPLE_SIZE: u32 = 10_000;

/// Measures the average block time over the most recent blocks.
pub(crate) struct BlockTimeResolver<'a, P> {
    poller: &'a P,
}

impl<'a, P: LogPoller> BlockTimeResolver<'a, P> {
    pub(crate) fn new(poller: &'a P) -> Self {
        Self { poller }
    }

    /// Average time between the latest block and the block `sample_size`
    /// before it. Chains shorter than the sample get the default.
    pub(crate) async fn block_time(&self, sample_size: u32) -> Result<Duration> {
        let latest = self.poller.latest_block().await?;
        if latest.number <= u64::from(sample_size) {
            return Ok(DEFAULT_BLOCK_TIME);
        }

        let start = latest.number - u64::from(sample_size);
        let blocks = self.poller.get_blocks_range(&[start, latest.number]).await?;
        let [first, last, ..] = blocks.as_slice() else {
            return Err(Error::Poller("failed to fetch blocks range".into()));
        };

        let elapsed = last.timestamp.saturating_sub(first.timestamp);
        let block_time = Duration::from_secs(elapsed) / sample_size.max(1);
        if block_time.is_zero() {
            return Err(Error::Poller(format!(
                "invalid block timestamps {} and {}",
                first.timestamp, last.timestamp
            )));
        }
        Ok(block_time)
    }
}

/// Whether moving from `current` to `new` changes the block time by more than 20%.
pub(crate) fn is_significant_change(current: Duration, new: Duration) -> bool {
    if current.is_zero() {
        return false;
    }
    let current = current.as_nanos();
    current.abs_diff(new.as_nanos()) * 100 / current > 20
}
