//! # Data Model
//!
//! Core value types for the matchmaking cluster: tickets, shard identity,
//! assignment snapshots, and the monotonic clock tickets are stamped with.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;

/// Integer version of the assignment plan. All routing and worker identity
/// is scoped by it.
pub type Epoch = u64;

/// A skill rank. Validated against the configured `[rank_min, rank_max]`
/// window before it enters the core.
pub type Rank = u32;

/// Stable identifier of a shard, derived from its rank range.
///
/// Format: `p-<range_start:05>-<range_end:05>`, so identifiers sort in range
/// order and survive recomputation of the assignment plan unchanged as long
/// as the partition layout itself is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub String);

impl ShardId {
    /// Build the canonical shard identifier for an inclusive rank range.
    pub fn for_range(range_start: Rank, range_end: Rank) -> Self {
        Self(format!("p-{range_start:05}-{range_end:05}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a cluster node. Membership enumeration is a collaborator;
/// the core only requires that node names are totally ordered so the
/// assignment plan and leader election are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A queued matchmaking request.
///
/// `enqueued_at_ms` is captured on the monotonic clock when the owning worker
/// accepts the request, not when the client sent it. It drives widening and
/// age-based tie-breaking, and participates in the full-tuple equality that
/// `dequeue_head_if_matches` relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ticket {
    pub user_id: String,
    pub rank: Rank,
    pub enqueued_at_ms: u64,
}

impl Ticket {
    pub fn new(user_id: impl Into<String>, rank: Rank, enqueued_at_ms: u64) -> Self {
        Self {
            user_id: user_id.into(),
            rank,
            enqueued_at_ms,
        }
    }

    /// Age of this ticket at `now_ms` on the monotonic clock.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.enqueued_at_ms)
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.rank)
    }
}

/// The envelope a routed enqueue carries to a worker. Epoch and shard are
/// pinned at routing time so the worker can reject stale or misrouted
/// requests before touching its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueEnvelope {
    pub epoch: Epoch,
    pub shard_id: ShardId,
    pub user_id: String,
    pub rank: Rank,
}

/// One participant of a finalized match, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedUser {
    pub user_id: String,
    pub rank: Rank,
}

/// The payload published to both participants of a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchNotification {
    pub users: [MatchedUser; 2],
}

impl MatchNotification {
    pub fn from_tickets(a: &Ticket, b: &Ticket) -> Self {
        Self {
            users: [
                MatchedUser {
                    user_id: a.user_id.clone(),
                    rank: a.rank,
                },
                MatchedUser {
                    user_id: b.user_id.clone(),
                    rank: b.rank,
                },
            ],
        }
    }

    /// Whether `user_id` is one of the two participants.
    pub fn involves(&self, user_id: &str) -> bool {
        self.users.iter().any(|u| u.user_id == user_id)
    }
}

/// The rank-space layout the assignment plan is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSpec {
    pub rank_min: Rank,
    pub rank_max: Rank,
    pub partition_count: u32,
}

impl RangeSpec {
    /// Total number of distinct ranks covered, inclusive.
    pub fn total_ranks(&self) -> u64 {
        u64::from(self.rank_max) - u64::from(self.rank_min) + 1
    }

    pub fn contains(&self, rank: Rank) -> bool {
        rank >= self.rank_min && rank <= self.rank_max
    }
}

/// One shard's slot in the assignment plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeAssignment {
    pub epoch: Epoch,
    pub shard_id: ShardId,
    pub range_start: Rank,
    pub range_end: Rank,
    pub node: NodeId,
}

impl RangeAssignment {
    pub fn contains(&self, rank: Rank) -> bool {
        rank >= self.range_start && rank <= self.range_end
    }
}

/// The full versioned assignment plan, broadcast by the coordinator and
/// consumed by the router and partition manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentSnapshot {
    pub epoch: Epoch,
    pub spec: RangeSpec,
    pub nodes: Vec<NodeId>,
    pub assignments: Vec<RangeAssignment>,
    pub computed_at_ms: u64,
}

impl AssignmentSnapshot {
    /// An empty pre-membership snapshot; routing against it yields
    /// `no_partition` until the coordinator publishes a real plan.
    pub fn empty(epoch: Epoch, spec: RangeSpec) -> Self {
        Self {
            epoch,
            spec,
            nodes: Vec::new(),
            assignments: Vec::new(),
            computed_at_ms: 0,
        }
    }
}

/// Milliseconds elapsed on the process-wide monotonic clock.
///
/// All ticket stamps and widening ages use this clock; wall-clock time never
/// enters matching decisions.
pub fn monotonic_now_ms() -> u64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    let anchor = *ANCHOR.get_or_init(Instant::now);
    anchor.elapsed().as_millis() as u64
}
