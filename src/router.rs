//! Hot-path rank→shard routing.
//!
//! The router keeps an immutable routing table behind a single-writer slot:
//! the table is rebuilt whole from each assignment snapshot and swapped in
//! atomically, so readers only ever clone an `Arc` out of the slot and never
//! observe a partially updated table. Staleness relative to the coordinator's
//! active epoch is detected on every lookup and surfaced to the caller, which
//! retries after the swap lands.

use crate::assignment::AssignmentCoordinator;
use crate::error::RouteError;
use crate::model::{AssignmentSnapshot, Epoch, NodeId, Rank, RangeAssignment, RangeSpec, ShardId};
use crate::registry::WorkerRegistry;
use crate::worker::WorkerHandle;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A resolved route for one rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub epoch: Epoch,
    pub shard_id: ShardId,
    pub node: NodeId,
}

/// Immutable routing table built from one assignment snapshot.
#[derive(Debug)]
pub struct RoutingTable {
    epoch: Epoch,
    spec: RangeSpec,
    /// Sorted by `range_start`; ranges are contiguous by construction.
    assignments: Vec<RangeAssignment>,
}

impl RoutingTable {
    fn from_snapshot(snapshot: &AssignmentSnapshot) -> Self {
        let mut assignments = snapshot.assignments.clone();
        assignments.sort_by_key(|a| a.range_start);
        Self {
            epoch: snapshot.epoch,
            spec: snapshot.spec,
            assignments,
        }
    }

    /// Index of the partition containing `rank`, if any.
    fn partition_index(&self, rank: Rank) -> Option<usize> {
        let idx = self.assignments.partition_point(|a| a.range_start <= rank);
        let candidate = idx.checked_sub(1)?;
        self.assignments[candidate]
            .contains(rank)
            .then_some(candidate)
    }
}

pub struct Router {
    coordinator: Arc<AssignmentCoordinator>,
    registry: Arc<WorkerRegistry>,
    table: RwLock<Arc<RoutingTable>>,
}

impl Router {
    pub fn new(coordinator: Arc<AssignmentCoordinator>, registry: Arc<WorkerRegistry>) -> Self {
        let initial = coordinator.subscribe().borrow().clone();
        Self {
            coordinator,
            registry,
            table: RwLock::new(Arc::new(RoutingTable::from_snapshot(&initial))),
        }
    }

    /// Rebuild and atomically swap the routing table. The router is the only
    /// writer of this slot.
    pub fn install_snapshot(&self, snapshot: &AssignmentSnapshot) {
        let table = Arc::new(RoutingTable::from_snapshot(snapshot));
        tracing::info!(
            epoch = table.epoch,
            shards = table.assignments.len(),
            "routing table swapped"
        );
        *self.table.write() = table;
    }

    /// React to `assignments_updated` broadcasts until the coordinator goes
    /// away. Installs the currently visible snapshot immediately.
    pub fn spawn_listener(
        self: &Arc<Self>,
        mut rx: watch::Receiver<Arc<AssignmentSnapshot>>,
    ) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                router.install_snapshot(&snapshot);
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    fn current_table(&self) -> Arc<RoutingTable> {
        self.table.read().clone()
    }

    /// Resolve the shard responsible for `rank` under the active epoch.
    pub fn route(&self, rank: Rank) -> Result<Route, RouteError> {
        let table = self.current_table();
        if !table.spec.contains(rank) {
            return Err(RouteError::InvalidRank);
        }
        if table.assignments.is_empty() {
            return Err(RouteError::NoPartition);
        }
        if table.epoch != self.coordinator.current_epoch() {
            return Err(RouteError::StaleSnapshot);
        }
        let idx = table.partition_index(rank).ok_or(RouteError::NoPartition)?;
        let assignment = &table.assignments[idx];
        Ok(Route {
            epoch: table.epoch,
            shard_id: assignment.shard_id.clone(),
            node: assignment.node.clone(),
        })
    }

    /// Resolve the immediate-lower and immediate-higher neighbors of the
    /// partition containing `rank` to live worker handles. A neighbor whose
    /// worker is not (yet) registered resolves to `None`; tick processing
    /// treats that as a dropped candidate.
    pub fn adjacent(&self, rank: Rank) -> (Option<WorkerHandle>, Option<WorkerHandle>) {
        let table = self.current_table();
        let Some(idx) = table.partition_index(rank) else {
            return (None, None);
        };
        let left = idx.checked_sub(1).and_then(|i| {
            self.registry
                .lookup(table.epoch, &table.assignments[i].shard_id)
        });
        let right = table.assignments.get(idx + 1).and_then(|a| {
            self.registry.lookup(table.epoch, &a.shard_id)
        });
        (left, right)
    }

    /// Epoch of the currently installed table.
    pub fn table_epoch(&self) -> Epoch {
        self.current_table().epoch
    }
}
