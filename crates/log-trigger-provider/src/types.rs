//! Core data model: upkeep identifiers, logs, triggers and payloads.

use std::{cmp::Ordering, fmt};

use alloy_primitives::{Address, B256, Bytes, U256, hex, keccak256};
use serde::{Deserialize, Serialize};

/// Block height.
pub type BlockNumber = u64;

/// Index of the first byte that must be zero in a new-format upkeep id.
const UPKEEP_TYPE_START_INDEX: usize = 4;
/// Index of the byte carrying the upkeep trigger type.
const UPKEEP_TYPE_BYTE_INDEX: usize = 15;

/// Trigger type encoded in an upkeep id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpkeepType {
    Conditional,
    LogTrigger,
    Unknown(u8),
}

impl From<u8> for UpkeepType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Conditional,
            1 => Self::LogTrigger,
            other => Self::Unknown(other),
        }
    }
}

impl From<UpkeepType> for u8 {
    fn from(value: UpkeepType) -> Self {
        match value {
            UpkeepType::Conditional => 0,
            UpkeepType::LogTrigger => 1,
            UpkeepType::Unknown(other) => other,
        }
    }
}

/// 256-bit upkeep identifier.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UpkeepId(U256);

impl UpkeepId {
    pub const fn new(value: U256) -> Self {
        Self(value)
    }

    /// Derive a new-format id of the given type from arbitrary seed bytes.
    pub fn generate(upkeep_type: UpkeepType, seed: impl AsRef<[u8]>) -> Self {
        let mut bytes = keccak256(seed.as_ref()).0;
        bytes[UPKEEP_TYPE_START_INDEX..UPKEEP_TYPE_BYTE_INDEX].fill(0);
        bytes[UPKEEP_TYPE_BYTE_INDEX] = upkeep_type.into();
        Self(U256::from_be_bytes(bytes))
    }

    pub fn as_u256(&self) -> U256 {
        self.0
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        self.0.to_be_bytes()
    }

    /// Legacy ids (any non-zero byte in the type prefix) are conditional.
    pub fn upkeep_type(&self) -> UpkeepType {
        let bytes = self.to_be_bytes();
        if bytes[UPKEEP_TYPE_START_INDEX..UPKEEP_TYPE_BYTE_INDEX]
            .iter()
            .any(|b| *b != 0)
        {
            return UpkeepType::Conditional;
        }
        UpkeepType::from(bytes[UPKEEP_TYPE_BYTE_INDEX])
    }
}

impl From<U256> for UpkeepId {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl From<u64> for UpkeepId {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl fmt::Display for UpkeepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authoritative state of a (upkeep, trigger) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpkeepState {
    #[default]
    Unknown,
    Performed,
    Ineligible,
}

/// An immutable chain event log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub block_number: BlockNumber,
    pub block_hash: B256,
    pub tx_hash: B256,
    pub log_index: u32,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_timestamp: u64,
    pub address: Address,
}

impl Log {
    pub fn id(&self) -> LogId {
        LogId::new(self.block_hash, self.tx_hash, self.log_index)
    }

    /// Canonical buffer order: block number, then log index, then tx hash.
    pub fn position_cmp(&self, other: &Self) -> Ordering {
        self.block_number
            .cmp(&other.block_number)
            .then(self.log_index.cmp(&other.log_index))
            .then(self.tx_hash.cmp(&other.tx_hash))
    }
}

/// Fixed-size log identity: `block_hash || tx_hash || be(log_index)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogId([u8; 68]);

impl LogId {
    pub fn new(block_hash: B256, tx_hash: B256, log_index: u32) -> Self {
        let mut bytes = [0u8; 68];
        bytes[..32].copy_from_slice(block_hash.as_slice());
        bytes[32..64].copy_from_slice(tx_hash.as_slice());
        bytes[64..].copy_from_slice(&log_index.to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogId({self})")
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Log specific part of a trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogTriggerExtension {
    pub tx_hash: B256,
    pub index: u32,
    pub block_hash: B256,
    pub block_number: BlockNumber,
}

impl LogTriggerExtension {
    pub fn log_identifier(&self) -> LogId {
        LogId::new(self.block_hash, self.tx_hash, self.index)
    }
}

/// Describes what fired an upkeep and at which block it should be checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Trigger {
    pub block_number: BlockNumber,
    pub block_hash: B256,
    pub log_trigger_extension: Option<LogTriggerExtension>,
}

impl Trigger {
    pub fn from_log(log: &Log) -> Self {
        Self {
            block_number: log.block_number,
            block_hash: log.block_hash,
            log_trigger_extension: Some(LogTriggerExtension {
                tx_hash: log.tx_hash,
                index: log.log_index,
                block_hash: log.block_hash,
                block_number: log.block_number,
            }),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{block {} {}", self.block_number, self.block_hash)?;
        if let Some(ext) = &self.log_trigger_extension {
            write!(
                f,
                " log {}:{} in {} at {}",
                ext.tx_hash, ext.index, ext.block_hash, ext.block_number
            )?;
        }
        f.write_str("}")
    }
}

/// Identifies one unit of work: a single (upkeep, trigger log) pair.
///
/// Only the log identity contributes, so the check block of the trigger can
/// change without changing the work id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkId(B256);

impl WorkId {
    pub fn new(upkeep_id: &UpkeepId, trigger: &Trigger) -> Self {
        let mut preimage = Vec::with_capacity(32 + 68);
        preimage.extend_from_slice(&upkeep_id.to_be_bytes());
        if let Some(ext) = &trigger.log_trigger_extension {
            preimage.extend_from_slice(ext.log_identifier().as_bytes());
        }
        Self(keccak256(&preimage))
    }

    pub fn as_b256(&self) -> B256 {
        self.0
    }
}

impl fmt::Debug for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkId({self})")
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// The unit delivered downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpkeepPayload {
    pub upkeep_id: UpkeepId,
    pub trigger: Trigger,
    pub check_data: Bytes,
    pub work_id: WorkId,
}

impl UpkeepPayload {
    pub fn new(upkeep_id: UpkeepId, trigger: Trigger, check_data: Bytes) -> Self {
        let work_id = WorkId::new(&upkeep_id, &trigger);
        Self {
            upkeep_id,
            trigger,
            check_data,
            work_id,
        }
    }
}

/// A proposal agreed on by the network, to be re-validated before use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatedProposal {
    pub upkeep_id: UpkeepId,
    pub trigger: Trigger,
    pub work_id: WorkId,
}

impl From<&UpkeepPayload> for CoordinatedProposal {
    fn from(payload: &UpkeepPayload) -> Self {
        Self {
            upkeep_id: payload.upkeep_id,
            trigger: payload.trigger,
            work_id: payload.work_id,
        }
    }
}

/// On-chain log trigger configuration of an upkeep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTriggerConfig {
    pub contract_address: Address,
    /// Bitmask over topics 1..=3 that must match.
    pub filter_selector: u8,
    pub topic0: B256,
    #[serde(default)]
    pub topic1: B256,
    #[serde(default)]
    pub topic2: B256,
    #[serde(default)]
    pub topic3: B256,
}
