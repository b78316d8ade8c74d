//! Log trigger provider - ingests on-chain logs that trigger upkeeps and
//! turns them into fair, deduplicated payloads.
//!
//! This crate provides:
//! - A filter registry of the log triggers of active upkeeps
//! - A windowed per-upkeep log buffer with reorg handling
//! - A dequeue coordinator that guarantees every upkeep a minimum share of
//!   each block window before any upkeep gets more
//! - A provider that polls logs on a schedule and assembles payloads
//! - A recoverer that finds logs older than the provider's lookback
//!
//! ## Example
//!
//! ```ignore
//! use log_trigger_provider::{AbiLogDataPacker, FilterStore, LogEventProvider, RpcClient, RpcLogPoller};
//!
//! let poller = Arc::new(RpcLogPoller::new(RpcClient::new(url)));
//! let provider = LogEventProvider::new(opts, poller, Arc::new(AbiLogDataPacker), Arc::new(FilterStore::new()));
//!
//! provider.register_filter(upkeep_id, &trigger_config, update_block).await?;
//! provider.start()?;
//!
//! for payload in provider.get_latest_payloads().await? {
//!     // Check and perform...
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod filter_store;
pub mod metrics;
pub mod packer;
pub mod poller;
pub mod provider;
pub mod recoverer;
pub mod rpc;
pub mod state;
pub mod types;
pub mod util;

// Re-export main types at crate root for convenience.
pub use buffer::{BufferConfig, BufferVersion, BufferedLog, LogBuffer, WindowedLogBuffer, block_window};
pub use config::{Config, ProviderOptions, RecovererOptions};
pub use coordinator::{DequeueCoordinator, DequeueWindow};
pub use error::{Error, Result};
pub use filter_store::{FilterStore, UpkeepFilter};
pub use packer::AbiLogDataPacker;
pub use poller::{BlockInfo, ChainClient, LogDataPacker, LogPoller, PollerFilter, TxBlock, UpkeepStateReader};
pub use provider::{LogEventProvider, RefreshResult};
pub use recoverer::LogRecoverer;
pub use rpc::{RpcClient, RpcLogPoller};
pub use state::InMemoryUpkeepStateStore;
pub use types::{
    BlockNumber, CoordinatedProposal, Log, LogId, LogTriggerConfig, LogTriggerExtension, Trigger,
    UpkeepId, UpkeepPayload, UpkeepState, UpkeepType, WorkId,
};
