//! Configuration for a matchmaking node.
//!
//! Configuration is loaded with precedence: Env vars > Config file > Defaults.
//!
//! # Example config file (rankmatch.toml)
//! ```toml
//! node_id = "node-a"
//!
//! [matchmaking]
//! rank_min = 0
//! rank_max = 9999
//! partition_count = 4
//! immediate_match_allowed_diff = 100
//!
//! [matchmaking.widening]
//! step_ms = 1000
//! step_diff = 50
//! cap = 1000
//!
//! [matchmaking.backpressure]
//! message_queue_limit = 512
//! queued_count_limit = 50000
//! ```

use crate::error::ConfigError;
use crate::model::RangeSpec;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

pub const DEFAULT_RANK_MIN: u32 = 0;
pub const DEFAULT_RANK_MAX: u32 = 9_999;
pub const DEFAULT_PARTITION_COUNT: u32 = 4;
pub const DEFAULT_CLAIM_SHARD_COUNT: u32 = 16;
pub const DEFAULT_IMMEDIATE_MATCH_ALLOWED_DIFF: u32 = 100;
pub const DEFAULT_WIDENING_STEP_MS: u64 = 1_000;
pub const DEFAULT_WIDENING_STEP_DIFF: u32 = 50;
pub const DEFAULT_WIDENING_CAP: u32 = 1_000;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 500;
pub const DEFAULT_MAX_TICK_ATTEMPTS: u32 = 16;
pub const DEFAULT_MAX_SCAN_RANKS: u32 = 64;
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 250;
pub const DEFAULT_ENQUEUE_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_MESSAGE_QUEUE_LIMIT: usize = 512;
pub const DEFAULT_QUEUED_COUNT_LIMIT: usize = 50_000;

/// Widening schedule: how fast the tolerated rank gap grows with ticket age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WideningConfig {
    /// Age increment per widening step, milliseconds.
    pub step_ms: u64,
    /// Rank increment per widening step.
    pub step_diff: u32,
    /// Maximum allowed diff reachable through widening.
    pub cap: u32,
}

impl Default for WideningConfig {
    fn default() -> Self {
        Self {
            step_ms: DEFAULT_WIDENING_STEP_MS,
            step_diff: DEFAULT_WIDENING_STEP_DIFF,
            cap: DEFAULT_WIDENING_CAP,
        }
    }
}

/// Admission-control thresholds. Either limit being exceeded sheds the
/// request before any range or epoch check runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Worker inbox depth beyond which enqueues are rejected.
    pub message_queue_limit: usize,
    /// Per-shard queued-ticket count beyond which enqueues are rejected.
    pub queued_count_limit: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            message_queue_limit: DEFAULT_MESSAGE_QUEUE_LIMIT,
            queued_count_limit: DEFAULT_QUEUED_COUNT_LIMIT,
        }
    }
}

/// Core matchmaking parameters. All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingConfig {
    /// Inclusive valid rank range.
    pub rank_min: u32,
    pub rank_max: u32,
    /// Number of rank-range shards.
    pub partition_count: u32,
    /// Hash-shard count of the claim index.
    pub user_index_shard_count: u32,
    /// Rank tolerance for the local immediate match on enqueue.
    pub immediate_match_allowed_diff: u32,
    pub widening: WideningConfig,
    /// Worker tick cadence.
    pub tick_interval_ms: u64,
    /// Upper bound on matches committed per tick.
    pub max_tick_attempts: u32,
    /// Upper bound on distinct ranks inspected per opponent search.
    pub max_scan_ranks: u32,
    /// Deadline for cross-shard peek/reserve calls.
    pub rpc_timeout_ms: u64,
    /// Deadline for the client→worker enqueue call.
    pub enqueue_timeout_ms: u64,
    pub backpressure: BackpressureConfig,
    /// Active assignment plan version.
    pub epoch: u64,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            rank_min: DEFAULT_RANK_MIN,
            rank_max: DEFAULT_RANK_MAX,
            partition_count: DEFAULT_PARTITION_COUNT,
            user_index_shard_count: DEFAULT_CLAIM_SHARD_COUNT,
            immediate_match_allowed_diff: DEFAULT_IMMEDIATE_MATCH_ALLOWED_DIFF,
            widening: WideningConfig::default(),
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            max_tick_attempts: DEFAULT_MAX_TICK_ATTEMPTS,
            max_scan_ranks: DEFAULT_MAX_SCAN_RANKS,
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            enqueue_timeout_ms: DEFAULT_ENQUEUE_TIMEOUT_MS,
            backpressure: BackpressureConfig::default(),
            epoch: 1,
        }
    }
}

impl MatchmakingConfig {
    /// The rank-space layout the assignment plan is computed over.
    pub fn range_spec(&self) -> RangeSpec {
        RangeSpec {
            rank_min: self.rank_min,
            rank_max: self.rank_max,
            partition_count: self.partition_count,
        }
    }

    /// Reject configurations the core cannot operate under.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rank_min > self.rank_max {
            return Err(ConfigError::InvertedRankRange {
                rank_min: self.rank_min,
                rank_max: self.rank_max,
            });
        }
        if self.partition_count == 0 {
            return Err(ConfigError::ZeroPartitions);
        }
        let total_ranks = self.range_spec().total_ranks();
        if u64::from(self.partition_count) > total_ranks {
            return Err(ConfigError::TooManyPartitions {
                partition_count: self.partition_count,
                total_ranks,
            });
        }
        if self.user_index_shard_count == 0 {
            return Err(ConfigError::ZeroClaimShards);
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "tick_interval_ms",
            });
        }
        if self.widening.step_ms == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "widening.step_ms",
            });
        }
        if self.rpc_timeout_ms == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "rpc_timeout_ms",
            });
        }
        if self.enqueue_timeout_ms == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "enqueue_timeout_ms",
            });
        }
        Ok(())
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's identity within the cluster. Empty means "node-0".
    pub node_id: String,
    pub matchmaking: MatchmakingConfig,
}

impl NodeConfig {
    /// Load configuration with precedence: Env > File > Defaults.
    ///
    /// Environment variables use the `RANKMATCH_` prefix with `__` as the
    /// section separator, e.g. `RANKMATCH_MATCHMAKING__RANK_MAX=5000`.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(NodeConfig::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("RANKMATCH_").split("__"));

        let config: NodeConfig = figment
            .extract()
            .map_err(|err| ConfigError::Load(err.to_string()))?;
        config.matchmaking.validate()?;
        Ok(config)
    }

    pub fn node_id_or_default(&self) -> String {
        if self.node_id.is_empty() {
            "node-0".to_string()
        } else {
            self.node_id.clone()
        }
    }
}
