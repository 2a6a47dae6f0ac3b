//! Cluster-wide single-enqueue claim index.
//!
//! A user may hold at most one outstanding ticket. The index is a logical set
//! of claimed user_ids, hash-sharded over a fixed shard count so claim traffic
//! for different users does not contend on one lock. `claim` is
//! compare-and-insert; `release` is an idempotent remove.
//!
//! Claims live only in memory. A process restart clears them, which is the
//! intended recovery path for clients whose tickets were lost. A worker crash
//! while holding claims leaks them until restart; owner-tracked auto-release
//! is a known follow-up, not implemented here.

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::hash::{BuildHasher, BuildHasherDefault, Hash, Hasher};
use std::time::Duration;

const CLAIM_LOCK_ATTEMPTS: u32 = 3;
const CLAIM_LOCK_WAIT: Duration = Duration::from_millis(20);

/// Outcome of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The user was not claimed and now is.
    Claimed,
    /// The user already holds an outstanding ticket.
    AlreadyQueued,
    /// The owning shard stayed unreachable after bounded retries.
    IndexUnavailable,
}

#[derive(Debug, Default)]
struct ClaimShard {
    users: Mutex<FxHashSet<String>>,
}

/// Sharded set of currently-claimed user_ids.
#[derive(Debug)]
pub struct ClaimIndex {
    shards: Vec<ClaimShard>,
}

impl ClaimIndex {
    pub fn new(shard_count: u32) -> Self {
        let shard_count = shard_count.max(1) as usize;
        let shards = (0..shard_count).map(|_| ClaimShard::default()).collect();
        Self { shards }
    }

    fn shard_for(&self, user_id: &str) -> &ClaimShard {
        let hasher_builder: BuildHasherDefault<rustc_hash::FxHasher> = Default::default();
        let mut hasher = hasher_builder.build_hasher();
        user_id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    /// Compare-and-insert the user into its shard.
    ///
    /// Retries a contended shard lock a small bounded number of times before
    /// reporting the index unavailable; callers surface that to the client
    /// rather than queueing blind.
    pub fn claim(&self, user_id: &str) -> ClaimOutcome {
        let shard = self.shard_for(user_id);
        for attempt in 0..CLAIM_LOCK_ATTEMPTS {
            if let Some(mut users) = shard.users.try_lock_for(CLAIM_LOCK_WAIT) {
                if users.contains(user_id) {
                    return ClaimOutcome::AlreadyQueued;
                }
                users.insert(user_id.to_string());
                return ClaimOutcome::Claimed;
            }
            tracing::debug!(user_id, attempt, "claim shard lock contended, retrying");
        }
        tracing::warn!(user_id, "claim shard unavailable after retries");
        ClaimOutcome::IndexUnavailable
    }

    /// Idempotent remove. Releasing a non-member is a no-op.
    pub fn release(&self, user_id: &str) {
        let shard = self.shard_for(user_id);
        shard.users.lock().remove(user_id);
    }

    /// Whether the user currently holds a claim.
    pub fn is_claimed(&self, user_id: &str) -> bool {
        let shard = self.shard_for(user_id);
        shard.users.lock().contains(user_id)
    }

    /// Total claims across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.users.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
