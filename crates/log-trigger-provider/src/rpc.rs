//! JSON-RPC backed log poller and chain client.

use std::collections::{BTreeSet, HashMap};

use alloy_primitives::{Address, B256, Bytes, U64};
use futures::future::try_join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::{
    error::{Error, Result},
    poller::{BlockInfo, ChainClient, LogPoller, PollerFilter, TxBlock},
    types::{BlockNumber, Log},
};

/// JSON-RPC request structure.
#[derive(Debug, Clone, Serialize)]
struct JsonRpcRequest<T> {
    jsonrpc: &'static str,
    method: &'static str,
    params: T,
    id: u64,
}

/// JSON-RPC response structure.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse<T> {
    pub result: Option<T>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error structure.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct RpcBlock {
    number: U64,
    hash: B256,
    timestamp: U64,
}

impl From<RpcBlock> for BlockInfo {
    fn from(block: RpcBlock) -> Self {
        Self {
            number: block.number.saturating_to(),
            hash: block.hash,
            timestamp: block.timestamp.saturating_to(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
    block_number: U64,
    block_hash: B256,
    transaction_hash: B256,
    log_index: U64,
    #[serde(default)]
    block_timestamp: Option<U64>,
    #[serde(default)]
    removed: bool,
}

impl From<RpcLog> for Log {
    fn from(log: RpcLog) -> Self {
        Self {
            block_number: log.block_number.saturating_to(),
            block_hash: log.block_hash,
            tx_hash: log.transaction_hash,
            log_index: log.log_index.saturating_to(),
            topics: log.topics,
            data: log.data,
            block_timestamp: log.block_timestamp.map(|t| t.saturating_to()).unwrap_or_default(),
            address: log.address,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    block_number: U64,
    block_hash: B256,
}

/// Execution layer JSON-RPC client.
#[derive(Debug, Clone)]
pub struct RpcClient {
    url: Url,
    http_client: reqwest::Client,
}

impl RpcClient {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            http_client: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Send a JSON-RPC request. Returns `None` if the response has a null `result`.
    async fn request<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &'static str,
        params: P,
    ) -> Result<Option<R>> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        };

        let response = self
            .http_client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Rpc {
                code: response.status().as_u16() as i64,
                message: response.text().await.unwrap_or_default(),
            });
        }

        let rpc_response: JsonRpcResponse<R> = response.json().await?;

        if let Some(error) = rpc_response.error {
            return Err(Error::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        Ok(rpc_response.result)
    }

    async fn block_by_number(&self, tag: serde_json::Value) -> Result<BlockInfo> {
        let block: Option<RpcBlock> = self.request("eth_getBlockByNumber", (tag, false)).await?;
        block
            .map(BlockInfo::from)
            .ok_or_else(|| Error::Poller("block not found".into()))
    }

    pub async fn latest_block(&self) -> Result<BlockInfo> {
        self.block_by_number(json!("latest")).await
    }

    pub async fn block(&self, number: BlockNumber) -> Result<BlockInfo> {
        self.block_by_number(json!(U64::from(number))).await
    }

    pub async fn get_logs(
        &self,
        from: BlockNumber,
        to: BlockNumber,
        event_sigs: &[B256],
        address: Address,
    ) -> Result<Vec<Log>> {
        let filter = json!({
            "fromBlock": U64::from(from),
            "toBlock": U64::from(to),
            "address": address,
            "topics": [event_sigs],
        });
        let logs: Option<Vec<RpcLog>> = self.request("eth_getLogs", (filter,)).await?;
        Ok(logs
            .unwrap_or_default()
            .into_iter()
            .filter(|l| !l.removed)
            .map(Log::from)
            .collect())
    }
}

impl ChainClient for RpcClient {
    async fn tx_block(&self, tx_hash: B256) -> Result<Option<TxBlock>> {
        let receipt: Option<RpcReceipt> = self
            .request("eth_getTransactionReceipt", (tx_hash,))
            .await?;
        Ok(receipt.map(|r| TxBlock {
            number: r.block_number.saturating_to(),
            hash: r.block_hash,
        }))
    }
}

/// Log poller that queries the node directly on every call.
///
/// Registered filters are only tracked by name; the node already indexes
/// every log, so a replay has nothing to do.
#[derive(Debug)]
pub struct RpcLogPoller {
    client: RpcClient,
    filters: RwLock<HashMap<String, PollerFilter>>,
}

impl RpcLogPoller {
    pub fn new(client: RpcClient) -> Self {
        Self {
            client,
            filters: RwLock::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Fill in block timestamps for nodes that do not return them with logs.
    async fn fill_timestamps(&self, logs: &mut [Log]) -> Result<()> {
        let missing: BTreeSet<_> = logs
            .iter()
            .filter(|l| l.block_timestamp == 0)
            .map(|l| l.block_number)
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let numbers: Vec<_> = missing.into_iter().collect();
        let blocks = self.get_blocks_range(&numbers).await?;
        let timestamps: HashMap<_, _> = blocks.iter().map(|b| (b.number, b.timestamp)).collect();
        for log in logs.iter_mut().filter(|l| l.block_timestamp == 0) {
            if let Some(timestamp) = timestamps.get(&log.block_number) {
                log.block_timestamp = *timestamp;
            }
        }
        Ok(())
    }
}

impl LogPoller for RpcLogPoller {
    async fn register_filter(&self, filter: PollerFilter) -> Result<()> {
        if filter.event_sigs.is_empty() || filter.addresses.is_empty() {
            return Err(Error::Poller(format!("filter {} matches nothing", filter.name)));
        }
        debug!(name = %filter.name, "Registered poller filter");
        self.filters.write().insert(filter.name.clone(), filter);
        Ok(())
    }

    async fn unregister_filter(&self, name: &str) -> Result<()> {
        self.filters.write().remove(name);
        Ok(())
    }

    fn has_filter(&self, name: &str) -> bool {
        self.filters.read().contains_key(name)
    }

    async fn latest_block(&self) -> Result<BlockInfo> {
        self.client.latest_block().await
    }

    async fn logs_with_sigs(
        &self,
        from: BlockNumber,
        to: BlockNumber,
        event_sigs: &[B256],
        address: Address,
    ) -> Result<Vec<Log>> {
        let mut logs = self.client.get_logs(from, to, event_sigs, address).await?;
        self.fill_timestamps(&mut logs).await?;
        Ok(logs)
    }

    async fn get_blocks_range(&self, numbers: &[BlockNumber]) -> Result<Vec<BlockInfo>> {
        try_join_all(numbers.iter().map(|n| self.client.block(*n))).await
    }

    fn replay_async(&self, from_block: BlockNumber) {
        debug!(from_block, "Replay requested");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rpc_log() {
        let raw = r#"{
            "address": "0x1111111111111111111111111111111111111111",
            "topics": ["0x2222222222222222222222222222222222222222222222222222222222222222"],
            "data": "0x0102",
            "blockNumber": "0x10",
            "blockHash": "0x3333333333333333333333333333333333333333333333333333333333333333",
            "transactionHash": "0x4444444444444444444444444444444444444444444444444444444444444444",
            "logIndex": "0x2",
            "removed": false
        }"#;
        let log: Log = serde_json::from_str::<RpcLog>(raw).unwrap().into();

        assert_eq!(log.block_number, 16);
        assert_eq!(log.log_index, 2);
        assert_eq!(log.address, Address::repeat_byte(0x11));
        assert_eq!(log.data, Bytes::from_static(&[1, 2]));
        assert_eq!(log.block_timestamp, 0);
    }

    #[test]
    fn parse_error_response() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"header not found"}}"#;
        let response: JsonRpcResponse<RpcBlock> = serde_json::from_str(raw).unwrap();
        assert!(response.result.is_none());
        assert_eq!(response.error.map(|e| e.code), Some(-32000));
    }
}
