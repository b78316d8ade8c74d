//! Configuration types for the log trigger provider.

use std::{net::SocketAddr, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    buffer::BufferVersion,
    error::{Error, Result},
    types::{BlockNumber, LogTriggerConfig, UpkeepId},
};

/// Service configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Execution node JSON-RPC URL.
    pub rpc_url: Url,
    /// Chain id, used to pick chain specific defaults.
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    /// Address for the Prometheus exporter, disabled when unset.
    pub metrics_listen: Option<SocketAddr>,
    /// Log provider settings.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Log recoverer settings.
    #[serde(default)]
    pub recoverer: RecovererConfig,
    /// Upkeeps registered at startup.
    #[serde(default)]
    pub upkeeps: Vec<UpkeepConfig>,
}

/// Log provider configuration. Unset chain dependent values are derived from
/// the chain id.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Blocks read behind the latest block, at least `finality_depth`.
    pub lookback_blocks: Option<u64>,
    /// Poll cadence in milliseconds.
    pub read_interval_ms: u64,
    /// Blocks per buffer window.
    pub block_rate: Option<u64>,
    /// Minimum logs dequeued per upkeep per window.
    pub log_limit: Option<usize>,
    /// Blocks until a block is considered final.
    pub finality_depth: u64,
    /// Maximum payloads returned per call.
    pub max_payloads: usize,
    /// Buffer implementation.
    pub buffer_version: BufferVersion,
    /// Number of concurrent log readers.
    pub reader_threads: usize,
    /// Maximum upkeeps per read job.
    pub read_max_batch_size: usize,
    /// Capacity of the read job queue.
    pub read_job_queue_size: usize,
    /// Blocks re-read behind the last poll to catch reorged logs.
    pub reorg_buffer: u64,
    /// Blocks replayed by the poller for a newly registered filter.
    pub backfill_buffer: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            lookback_blocks: None,
            read_interval_ms: default_read_interval_ms(),
            block_rate: None,
            log_limit: None,
            finality_depth: 0,
            max_payloads: default_max_payloads(),
            buffer_version: BufferVersion::default(),
            reader_threads: default_reader_threads(),
            read_max_batch_size: default_read_max_batch_size(),
            read_job_queue_size: default_read_job_queue_size(),
            reorg_buffer: default_reorg_buffer(),
            backfill_buffer: default_backfill_buffer(),
        }
    }
}

/// Log recoverer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecovererConfig {
    /// Recovery scan cadence in milliseconds, five read intervals when unset.
    pub interval_ms: Option<u64>,
    /// Maximum proposals returned per call.
    pub max_proposals: usize,
    /// Maximum proposals per upkeep per call.
    pub allowed_logs_per_upkeep: usize,
}

impl Default for RecovererConfig {
    fn default() -> Self {
        Self {
            interval_ms: None,
            max_proposals: default_max_proposals(),
            allowed_logs_per_upkeep: default_allowed_logs_per_upkeep(),
        }
    }
}

/// Static upkeep registration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpkeepConfig {
    pub id: UpkeepId,
    #[serde(flatten)]
    pub trigger: LogTriggerConfig,
    #[serde(default)]
    pub update_block: BlockNumber,
}

fn default_chain_id() -> u64 {
    1
}

fn default_read_interval_ms() -> u64 {
    1000
}

fn default_max_payloads() -> usize {
    100
}

fn default_reader_threads() -> usize {
    4
}

fn default_read_max_batch_size() -> usize {
    32
}

fn default_read_job_queue_size() -> usize {
    64
}

fn default_reorg_buffer() -> u64 {
    32
}

fn default_backfill_buffer() -> u64 {
    100
}

fn default_max_proposals() -> usize {
    20
}

fn default_allowed_logs_per_upkeep() -> usize {
    5
}

/// Minimum lookback of the forward reader.
const DEFAULT_LOOKBACK_BLOCKS: u64 = 200;

/// Window size used on the given chain.
pub fn default_block_rate(chain_id: u64) -> u64 {
    match chain_id {
        // Arbitrum
        42161 | 421613 | 421614 => 2,
        _ => 1,
    }
}

/// Minimum guaranteed logs per upkeep per window on the given chain.
pub fn default_log_limit(chain_id: u64) -> usize {
    match chain_id {
        // Ethereum
        1 | 4 | 5 | 42 | 11155111 => 20,
        // Optimism, BSC, Polygon, Avalanche, Base
        10 | 420 | 56 | 97 | 137 | 80001 | 43113 | 43114 | 8453 | 84531 => 5,
        _ => 1,
    }
}

/// Resolved provider settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOptions {
    pub lookback_blocks: u64,
    pub read_interval: Duration,
    pub block_rate: u64,
    pub log_limit: usize,
    pub finality_depth: u64,
    pub max_payloads: usize,
    pub buffer_version: BufferVersion,
    pub reader_threads: usize,
    pub read_max_batch_size: usize,
    pub read_job_queue_size: usize,
    pub reorg_buffer: u64,
    pub backfill_buffer: u64,
}

impl ProviderOptions {
    /// Defaults for a chain.
    pub fn for_chain(chain_id: u64, finality_depth: u64) -> Self {
        ProviderConfig {
            finality_depth,
            ..Default::default()
        }
        .resolve(chain_id)
    }
}

impl ProviderConfig {
    pub fn resolve(&self, chain_id: u64) -> ProviderOptions {
        ProviderOptions {
            lookback_blocks: self
                .lookback_blocks
                .unwrap_or(DEFAULT_LOOKBACK_BLOCKS.max(self.finality_depth)),
            read_interval: Duration::from_millis(self.read_interval_ms),
            block_rate: self.block_rate.unwrap_or_else(|| default_block_rate(chain_id)),
            log_limit: self.log_limit.unwrap_or_else(|| default_log_limit(chain_id)),
            finality_depth: self.finality_depth,
            max_payloads: self.max_payloads,
            buffer_version: self.buffer_version,
            reader_threads: self.reader_threads.max(1),
            read_max_batch_size: self.read_max_batch_size.max(1),
            read_job_queue_size: self.read_job_queue_size.max(1),
            reorg_buffer: self.reorg_buffer,
            backfill_buffer: self.backfill_buffer,
        }
    }
}

/// Resolved recoverer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecovererOptions {
    pub interval: Duration,
    pub lookback_blocks: u64,
    pub finality_depth: u64,
    pub max_proposals: usize,
    pub allowed_logs_per_upkeep: usize,
}

impl RecovererConfig {
    pub fn resolve(&self, provider: &ProviderOptions) -> RecovererOptions {
        RecovererOptions {
            interval: self
                .interval_ms
                .map(Duration::from_millis)
                .unwrap_or(provider.read_interval * 5),
            lookback_blocks: provider.lookback_blocks,
            finality_depth: provider.finality_depth,
            max_proposals: self.max_proposals,
            allowed_logs_per_upkeep: self.allowed_logs_per_upkeep,
        }
    }
}

impl From<&ProviderOptions> for RecovererOptions {
    fn from(provider: &ProviderOptions) -> Self {
        RecovererConfig::default().resolve(provider)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml_edit::de::from_str(content)?;
        if config.provider.max_payloads == 0 {
            return Err(Error::Config("provider.max_payloads must be positive".into()));
        }
        if config.provider.read_interval_ms == 0 {
            return Err(Error::Config("provider.read_interval_ms must be positive".into()));
        }
        if config.recoverer.interval_ms == Some(0) {
            return Err(Error::Config("recoverer.interval_ms must be positive".into()));
        }
        Ok(config)
    }

    pub fn provider_options(&self) -> ProviderOptions {
        self.provider.resolve(self.chain_id)
    }

    pub fn recoverer_options(&self) -> RecovererOptions {
        self.recoverer.resolve(&self.provider_options())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use alloy_primitives::{Address, B256};

    use super::*;

    fn sample_config() -> &'static str {
        r#"
rpc_url = "http://localhost:8545"
chain_id = 42161
metrics_listen = "127.0.0.1:9464"

[provider]
finality_depth = 300
read_interval_ms = 500
reader_threads = 2

[recoverer]
max_proposals = 10

[[upkeeps]]
id = "0x10"
contract_address = "0x1111111111111111111111111111111111111111"
filter_selector = 1
topic0 = "0x2222222222222222222222222222222222222222222222222222222222222222"
update_block = 7
"#
    }

    #[test]
    fn parse_sample_config() {
        let config = Config::from_toml_str(sample_config()).unwrap();
        let provider = config.provider_options();

        assert_eq!(provider.lookback_blocks, 300);
        assert_eq!(provider.block_rate, 2);
        assert_eq!(provider.log_limit, 1);
        assert_eq!(provider.read_interval, Duration::from_millis(500));
        assert_eq!(provider.reader_threads, 2);
        assert_eq!(provider.max_payloads, 100);
        assert_eq!(provider.buffer_version, BufferVersion::V1);

        let recoverer = config.recoverer_options();
        assert_eq!(recoverer.interval, Duration::from_millis(2500));
        assert_eq!(recoverer.max_proposals, 10);
        assert_eq!(recoverer.allowed_logs_per_upkeep, 5);

        let upkeep = &config.upkeeps[0];
        assert_eq!(upkeep.id, UpkeepId::from(16));
        assert_eq!(upkeep.update_block, 7);
        assert_eq!(upkeep.trigger.contract_address, Address::repeat_byte(0x11));
        assert_eq!(upkeep.trigger.topic0, B256::repeat_byte(0x22));
        assert_eq!(upkeep.trigger.topic1, B256::ZERO);
    }

    #[test]
    fn chain_defaults() {
        let eth = ProviderOptions::for_chain(1, 0);
        assert_eq!((eth.lookback_blocks, eth.block_rate, eth.log_limit), (200, 1, 20));

        let polygon = ProviderOptions::for_chain(137, 500);
        assert_eq!((polygon.lookback_blocks, polygon.log_limit), (500, 5));
    }

    #[test]
    fn unknown_buffer_version_is_rejected() {
        let content = "rpc_url = \"http://localhost:8545\"\n[provider]\nbuffer_version = \"v2\"\n";
        assert!(matches!(Config::from_toml_str(content), Err(Error::Toml(_))));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        for section in ["[provider]\nread_interval_ms = 0", "[recoverer]\ninterval_ms = 0"] {
            let content = format!("rpc_url = \"http://localhost:8545\"\n{section}\n");
            assert!(matches!(
                Config::from_toml_str(&content),
                Err(Error::Config(_))
            ));
        }
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_config().as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.chain_id, 42161);

        assert!(matches!(
            Config::load(file.path().with_extension("missing")),
            Err(Error::Config(_))
        ));
    }
}
