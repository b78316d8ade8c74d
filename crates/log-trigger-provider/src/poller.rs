//! Interfaces of the external collaborators the provider and recoverer rely on.
//!
//! The chain indexer, the transaction receipt source, the authoritative upkeep
//! state and the check data encoding all live outside this crate. Concrete
//! implementations backed by a JSON-RPC node are in [`crate::rpc`],
//! [`crate::state`] and [`crate::packer`].

use std::{future::Future, time::Duration};

use alloy_primitives::{Address, B256, Bytes};

use crate::{
    error::Result,
    types::{BlockNumber, Log, UpkeepState, WorkId},
};

/// A block header as seen by the log poller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockInfo {
    pub number: BlockNumber,
    pub hash: B256,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
}

/// Filter registered with the log poller so it indexes matching logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerFilter {
    pub name: String,
    pub event_sigs: Vec<B256>,
    pub addresses: Vec<Address>,
    pub retention: Duration,
}

/// Block in which a transaction was mined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxBlock {
    pub number: BlockNumber,
    pub hash: B256,
}

/// Chain log indexer.
pub trait LogPoller: Send + Sync {
    /// Start indexing logs matching the filter.
    fn register_filter(&self, filter: PollerFilter) -> impl Future<Output = Result<()>> + Send;

    /// Stop indexing logs for the named filter.
    fn unregister_filter(&self, name: &str) -> impl Future<Output = Result<()>> + Send;

    /// Whether the named filter is known to the poller.
    fn has_filter(&self, name: &str) -> bool;

    /// Latest indexed block.
    fn latest_block(&self) -> impl Future<Output = Result<BlockInfo>> + Send;

    /// Logs in `[from, to]` emitted by `address` whose first topic is one of `event_sigs`.
    fn logs_with_sigs(
        &self,
        from: BlockNumber,
        to: BlockNumber,
        event_sigs: &[B256],
        address: Address,
    ) -> impl Future<Output = Result<Vec<Log>>> + Send;

    /// Headers of the requested blocks, in request order.
    fn get_blocks_range(
        &self,
        numbers: &[BlockNumber],
    ) -> impl Future<Output = Result<Vec<BlockInfo>>> + Send;

    /// Fire and forget re-indexing from `from_block`.
    fn replay_async(&self, from_block: BlockNumber);
}

/// Source of transaction receipts.
pub trait ChainClient: Send + Sync {
    /// Block of a mined transaction, `None` if it is not (or no longer) mined.
    fn tx_block(&self, tx_hash: B256) -> impl Future<Output = Result<Option<TxBlock>>> + Send;
}

/// Authoritative store of upkeep work states.
pub trait UpkeepStateReader: Send + Sync {
    /// States for the given work ids, in the same order.
    fn select_by_work_ids(
        &self,
        work_ids: &[WorkId],
    ) -> impl Future<Output = Result<Vec<UpkeepState>>> + Send;
}

/// Encodes a log into the check data handed to the upkeep.
pub trait LogDataPacker: Send + Sync {
    fn pack_log_data(&self, log: &Log) -> Result<Bytes>;
}
