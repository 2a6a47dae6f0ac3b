//! Error taxonomy for the matchmaking core.
//!
//! Client-visible errors render to the exact strings the edge API promises;
//! internal routing and RPC outcomes stay as typed enums so the worker and
//! handler logic can match on them without string comparison.

use thiserror::Error;

/// Errors surfaced to a client through `add_request`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The user already holds an outstanding ticket somewhere in the cluster.
    #[error("already_queued")]
    AlreadyQueued,

    #[error("userId must be a non-empty string")]
    EmptyUserId,

    #[error("rank must be a non-negative integer")]
    NegativeRank,

    /// Rank outside the configured `[rank_min, rank_max]` window.
    #[error("invalid_rank")]
    InvalidRank,

    /// Per-shard backpressure; the client may retry with backoff.
    #[error("overloaded")]
    Overloaded,

    /// The envelope's epoch no longer matches the target worker.
    #[error("stale_epoch")]
    StaleEpoch,

    /// Routing table empty (startup or transient).
    #[error("no_partition")]
    NoPartition,

    /// A claim shard stayed unreachable after bounded retries.
    #[error("index_unavailable")]
    IndexUnavailable,

    /// Assignment churn between routing and delivery; safe to retry.
    #[error("momentary interruption, try again")]
    MomentaryInterruption,
}

/// Routing failures. `StaleSnapshot` means the router's table is older than
/// the coordinator's active epoch and the caller should retry after the swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("invalid_rank")]
    InvalidRank,
    #[error("no_partition")]
    NoPartition,
    #[error("stale_routing_snapshot")]
    StaleSnapshot,
}

/// Transport-level failure of a worker RPC. In tick context both variants
/// mean "drop the candidate"; at the enqueue edge they surface as
/// `overloaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The call did not complete within its deadline.
    #[error("rpc timeout")]
    Timeout,
    /// The worker's inbox is gone (worker stopped or stopping).
    #[error("worker unavailable")]
    Unavailable,
}

/// Configuration rejected by validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(String),
    #[error("rank_min {rank_min} exceeds rank_max {rank_max}")]
    InvertedRankRange { rank_min: u32, rank_max: u32 },
    #[error("partition_count must be at least 1")]
    ZeroPartitions,
    #[error("partition_count {partition_count} exceeds {total_ranks} distinct ranks")]
    TooManyPartitions {
        partition_count: u32,
        total_ranks: u64,
    },
    #[error("user_index_shard_count must be at least 1")]
    ZeroClaimShards,
    #[error("{field} must be at least 1")]
    ZeroInterval { field: &'static str },
}
