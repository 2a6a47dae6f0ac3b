//! Assignment plan computation and broadcast.
//!
//! The coordinator turns a sorted node set and the configured rank-space
//! layout into a deterministic `(epoch, shard → node)` plan. It never touches
//! live workers; it publishes snapshots on a single-writer watch channel and
//! the router and partition manager react. The cluster-wide broadcast is
//! leader-gated: only the deterministic leader (minimum of the sorted node
//! set) pushes the snapshot onto the membership transport, so one membership
//! event produces one broadcast. The local watch channel is how "every node
//! receives" is realized on each node, leader or not.

use crate::model::{
    monotonic_now_ms, AssignmentSnapshot, Epoch, NodeId, RangeAssignment, RangeSpec, ShardId,
};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Compute the partition layout for a sorted node set.
///
/// Pure and deterministic: equal inputs yield byte-equal plans on every node.
/// Partitions split the inclusive rank range into `partition_count` contiguous
/// slices of `total / partition_count` ranks, with the final slice absorbing
/// the remainder. Nodes are assigned round-robin in sorted order.
pub fn compute_assignments(
    nodes: &[NodeId],
    spec: &RangeSpec,
    epoch: Epoch,
) -> Vec<RangeAssignment> {
    if nodes.is_empty() || spec.partition_count == 0 {
        return Vec::new();
    }
    debug_assert!(nodes.windows(2).all(|w| w[0] <= w[1]));

    let base_width = (spec.total_ranks() / u64::from(spec.partition_count)) as u32;
    let mut assignments = Vec::with_capacity(spec.partition_count as usize);
    for i in 0..spec.partition_count {
        let range_start = spec.rank_min + i * base_width;
        let range_end = if i == spec.partition_count - 1 {
            spec.rank_max
        } else {
            range_start + base_width - 1
        };
        assignments.push(RangeAssignment {
            epoch,
            shard_id: ShardId::for_range(range_start, range_end),
            range_start,
            range_end,
            node: nodes[(i as usize) % nodes.len()].clone(),
        });
    }
    assignments
}

/// The deterministic broadcast leader for a sorted node set.
pub fn leader_of(nodes: &[NodeId]) -> Option<&NodeId> {
    nodes.iter().min()
}

/// Computes and publishes versioned assignment snapshots.
pub struct AssignmentCoordinator {
    node_id: NodeId,
    spec: RangeSpec,
    current_epoch: AtomicU64,
    tx: watch::Sender<std::sync::Arc<AssignmentSnapshot>>,
}

impl AssignmentCoordinator {
    pub fn new(node_id: NodeId, spec: RangeSpec, initial_epoch: Epoch) -> Self {
        let empty = std::sync::Arc::new(AssignmentSnapshot::empty(initial_epoch, spec));
        let (tx, _) = watch::channel(empty);
        Self {
            node_id,
            spec,
            current_epoch: AtomicU64::new(initial_epoch),
            tx,
        }
    }

    /// Subscribe to `assignments_updated` broadcasts. The receiver observes
    /// the latest snapshot immediately.
    pub fn subscribe(&self) -> watch::Receiver<std::sync::Arc<AssignmentSnapshot>> {
        self.tx.subscribe()
    }

    /// The epoch routing snapshots are validated against.
    pub fn current_epoch(&self) -> Epoch {
        self.current_epoch.load(Ordering::Acquire)
    }

    /// Whether this node is the one that pushes snapshots onto the cluster
    /// membership transport. The transport collaborator gates on this.
    pub fn is_leader(&self, nodes: &[NodeId]) -> bool {
        leader_of(nodes) == Some(&self.node_id)
    }

    /// React to a membership change: recompute the plan for `epoch` and
    /// publish it to this node's subscribers.
    ///
    /// Returns the snapshot so callers can inspect the plan directly.
    pub fn apply_membership(
        &self,
        mut nodes: Vec<NodeId>,
        epoch: Epoch,
    ) -> std::sync::Arc<AssignmentSnapshot> {
        nodes.sort();
        nodes.dedup();
        let assignments = compute_assignments(&nodes, &self.spec, epoch);
        let snapshot = std::sync::Arc::new(AssignmentSnapshot {
            epoch,
            spec: self.spec,
            nodes: nodes.clone(),
            assignments,
            computed_at_ms: monotonic_now_ms(),
        });

        self.current_epoch.store(epoch, Ordering::Release);
        tracing::info!(
            epoch,
            nodes = nodes.len(),
            shards = snapshot.assignments.len(),
            leader = self.is_leader(&nodes),
            "publishing assignment snapshot"
        );
        let _ = self.tx.send(std::sync::Arc::clone(&snapshot));
        snapshot
    }
}
