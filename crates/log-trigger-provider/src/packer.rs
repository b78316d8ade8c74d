//! ABI encoding of trigger logs into check data.

use alloy_primitives::{Bytes, U256};
use alloy_sol_types::{SolValue, sol};

use crate::{error::Result, poller::LogDataPacker, types::Log};

sol! {
    /// Log as passed to `checkLog` of a log trigger upkeep.
    struct AutomationLog {
        uint256 index;
        uint256 timestamp;
        bytes32 txHash;
        uint256 blockNumber;
        bytes32 blockHash;
        address source;
        bytes32[] topics;
        bytes data;
    }
}

impl From<&Log> for AutomationLog {
    fn from(log: &Log) -> Self {
        Self {
            index: U256::from(log.log_index),
            timestamp: U256::from(log.block_timestamp),
            txHash: log.tx_hash,
            blockNumber: U256::from(log.block_number),
            blockHash: log.block_hash,
            source: log.address,
            topics: log.topics.clone(),
            data: log.data.clone(),
        }
    }
}

/// Packs a log as the ABI encoding of a single `AutomationLog` tuple.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbiLogDataPacker;

impl LogDataPacker for AbiLogDataPacker {
    fn pack_log_data(&self, log: &Log) -> Result<Bytes> {
        Ok(AutomationLog::from(log).abi_encode().into())
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{Address, B256};

    use super::*;

    #[test]
    fn packed_log_decodes_back() {
        let log = Log {
            block_number: 1234,
            block_hash: B256::repeat_byte(1),
            tx_hash: B256::repeat_byte(2),
            log_index: 3,
            topics: vec![B256::repeat_byte(4), B256::repeat_byte(5)],
            data: Bytes::from_static(b"hello"),
            block_timestamp: 1_700_000_000,
            address: Address::repeat_byte(6),
        };

        let packed = AbiLogDataPacker.pack_log_data(&log).unwrap();
        // offset of the dynamic tuple
        assert_eq!(U256::from_be_slice(&packed[..32]), U256::from(32));

        let decoded = AutomationLog::abi_decode(&packed).unwrap();
        assert_eq!(decoded.blockNumber, U256::from(1234));
        assert_eq!(decoded.source, log.address);
        assert_eq!(decoded.topics, log.topics);
        assert_eq!(decoded.data, log.data);
    }
}
