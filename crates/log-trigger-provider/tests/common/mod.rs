#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use alloy_primitives::{Address, B256, Bytes};
use log_trigger_provider::{
    BlockInfo, BlockNumber, ChainClient, Error, Log, LogDataPacker, LogPoller, LogTriggerConfig,
    PollerFilter, Result, TxBlock,
};
use parking_lot::{Mutex, RwLock};

/// Seconds between two mock blocks.
pub const BLOCK_TIME_SECS: u64 = 12;

pub fn block_hash(number: BlockNumber) -> B256 {
    B256::left_padding_from(&number.to_be_bytes())
}

pub fn address(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

pub fn topic(byte: u8) -> B256 {
    B256::repeat_byte(byte)
}

pub fn trigger_config(address_byte: u8, topic_byte: u8) -> LogTriggerConfig {
    LogTriggerConfig {
        contract_address: address(address_byte),
        topic0: topic(topic_byte),
        ..Default::default()
    }
}

/// A log emitted by `address_byte` with event signature `topic_byte`. The tx
/// hash is derived from block and index so every log is distinct.
pub fn log(block: BlockNumber, index: u32, address_byte: u8, topic_byte: u8) -> Log {
    let mut tx = [0u8; 32];
    tx[..8].copy_from_slice(&block.to_be_bytes());
    tx[8..12].copy_from_slice(&index.to_be_bytes());
    tx[31] = address_byte;
    Log {
        block_number: block,
        block_hash: block_hash(block),
        tx_hash: B256::from(tx),
        log_index: index,
        topics: vec![topic(topic_byte)],
        data: Bytes::from(format!("log-{block}-{index}-{address_byte}").into_bytes()),
        block_timestamp: block * BLOCK_TIME_SECS,
        address: address(address_byte),
    }
}

type ReadHook = Box<dyn Fn() + Send + Sync>;

/// In-memory log poller over a fixed set of logs.
#[derive(Default)]
pub struct MockLogPoller {
    latest: Mutex<Option<BlockNumber>>,
    logs: RwLock<Vec<Log>>,
    filters: RwLock<HashMap<String, PollerFilter>>,
    replays: Mutex<Vec<BlockNumber>>,
    read_queries: Mutex<Vec<(BlockNumber, BlockNumber, Address)>>,
    fail_logs: AtomicBool,
    fail_unregister: AtomicBool,
    on_read: Mutex<Option<ReadHook>>,
}

impl MockLogPoller {
    pub fn new(latest: BlockNumber) -> Self {
        let poller = Self::default();
        poller.set_latest(latest);
        poller
    }

    pub fn set_latest(&self, latest: BlockNumber) {
        *self.latest.lock() = Some(latest);
    }

    pub fn clear_latest(&self) {
        *self.latest.lock() = None;
    }

    pub fn add_logs(&self, logs: impl IntoIterator<Item = Log>) {
        self.logs.write().extend(logs);
    }

    pub fn fail_logs(&self, fail: bool) {
        self.fail_logs.store(fail, Ordering::SeqCst);
    }

    pub fn fail_unregister(&self, fail: bool) {
        self.fail_unregister.store(fail, Ordering::SeqCst);
    }

    /// Run `hook` on every log read, before the logs are returned.
    pub fn on_read(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_read.lock() = Some(Box::new(hook));
    }

    pub fn replays(&self) -> Vec<BlockNumber> {
        self.replays.lock().clone()
    }

    pub fn filter(&self, name: &str) -> Option<PollerFilter> {
        self.filters.read().get(name).cloned()
    }

    pub fn read_queries(&self) -> Vec<(BlockNumber, BlockNumber, Address)> {
        self.read_queries.lock().clone()
    }
}

impl LogPoller for MockLogPoller {
    async fn register_filter(&self, filter: PollerFilter) -> Result<()> {
        self.filters.write().insert(filter.name.clone(), filter);
        Ok(())
    }

    async fn unregister_filter(&self, name: &str) -> Result<()> {
        if self.fail_unregister.load(Ordering::SeqCst) {
            return Err(Error::Poller("unregister unavailable".into()));
        }
        self.filters.write().remove(name);
        Ok(())
    }

    fn has_filter(&self, name: &str) -> bool {
        self.filters.read().contains_key(name)
    }

    async fn latest_block(&self) -> Result<BlockInfo> {
        let latest = *self.latest.lock();
        let number = latest.ok_or_else(|| Error::Poller("no head".into()))?;
        Ok(BlockInfo {
            number,
            hash: block_hash(number),
            timestamp: number * BLOCK_TIME_SECS,
        })
    }

    async fn logs_with_sigs(
        &self,
        from: BlockNumber,
        to: BlockNumber,
        event_sigs: &[B256],
        address: Address,
    ) -> Result<Vec<Log>> {
        if self.fail_logs.load(Ordering::SeqCst) {
            return Err(Error::Poller("logs unavailable".into()));
        }
        self.read_queries.lock().push((from, to, address));
        if let Some(hook) = self.on_read.lock().as_ref() {
            hook();
        }
        Ok(self
            .logs
            .read()
            .iter()
            .filter(|l| l.block_number >= from && l.block_number <= to)
            .filter(|l| l.address == address)
            .filter(|l| l.topics.first().is_some_and(|t| event_sigs.contains(t)))
            .cloned()
            .collect())
    }

    async fn get_blocks_range(&self, numbers: &[BlockNumber]) -> Result<Vec<BlockInfo>> {
        Ok(numbers
            .iter()
            .map(|n| BlockInfo {
                number: *n,
                hash: block_hash(*n),
                timestamp: n * BLOCK_TIME_SECS,
            })
            .collect())
    }

    fn replay_async(&self, from_block: BlockNumber) {
        self.replays.lock().push(from_block);
    }
}

/// Receipts keyed by tx hash.
#[derive(Default)]
pub struct MockChainClient {
    receipts: RwLock<HashMap<B256, TxBlock>>,
}

impl MockChainClient {
    pub fn add_log_receipt(&self, log: &Log) {
        self.set_receipt(log.tx_hash, log.block_number, log.block_hash);
    }

    pub fn set_receipt(&self, tx_hash: B256, number: BlockNumber, hash: B256) {
        self.receipts.write().insert(tx_hash, TxBlock { number, hash });
    }
}

impl ChainClient for MockChainClient {
    async fn tx_block(&self, tx_hash: B256) -> Result<Option<TxBlock>> {
        Ok(self.receipts.read().get(&tx_hash).copied())
    }
}

/// Packs a log as its raw data.
#[derive(Default)]
pub struct DataPacker;

impl LogDataPacker for DataPacker {
    fn pack_log_data(&self, log: &Log) -> Result<Bytes> {
        Ok(log.data.clone())
    }
}
