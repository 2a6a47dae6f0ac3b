//! # Rankmatch
//!
//! A real-time matchmaking queue that pairs players by skill rank.
//!
//! A request `(user_id, rank)` is claimed cluster-wide (at most one
//! outstanding ticket per user), routed to the shard owning its rank slice,
//! and either matched immediately against a close-ranked opponent or parked
//! in the shard's queue. A periodic per-shard tick widens the tolerated rank
//! gap with ticket age and commits pairs two-phase across shard boundaries.
//! Admission is bounded by explicit backpressure; match delivery is a
//! best-effort notification stream.

pub mod assignment;
pub mod backpressure;
pub mod claim;
pub mod config;
pub mod error;
pub mod manager;
pub mod model;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod router;
pub mod search;
pub mod widening;
pub mod worker;

// Re-export main types for convenience
pub use claim::{ClaimIndex, ClaimOutcome};
pub use config::{BackpressureConfig, MatchmakingConfig, NodeConfig, WideningConfig};
pub use error::{ConfigError, RequestError, RouteError};
pub use model::{AssignmentSnapshot, Epoch, MatchNotification, NodeId, Rank, ShardId, Ticket};
pub use publisher::MatchPublisher;
pub use worker::WorkerStats;

use crate::assignment::AssignmentCoordinator;
use crate::manager::{ManagerHandle, PartitionManager};
use crate::model::EnqueueEnvelope;
use crate::registry::WorkerRegistry;
use crate::router::Router;
use crate::worker::{EnqueueReply, WorkerHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

/// One running matchmaking node: the edge request handler plus the cluster
/// components it wires together (claim index, router, coordinator, partition
/// manager, publisher).
pub struct MatchmakingNode {
    node_id: NodeId,
    config: Arc<MatchmakingConfig>,
    claims: Arc<ClaimIndex>,
    publisher: Arc<MatchPublisher>,
    registry: Arc<WorkerRegistry>,
    coordinator: Arc<AssignmentCoordinator>,
    router: Arc<Router>,
    manager: ManagerHandle,
    router_listener: JoinHandle<()>,
    manager_join: JoinHandle<()>,
}

impl MatchmakingNode {
    /// Boot a single-node cluster: this node is the whole membership and
    /// therefore the broadcast leader. Workers for every partition are
    /// started before this returns.
    pub async fn start(config: NodeConfig) -> Result<Self, ConfigError> {
        config.matchmaking.validate()?;
        let node_id = NodeId::new(config.node_id_or_default());
        let matchmaking = Arc::new(config.matchmaking);

        let claims = Arc::new(ClaimIndex::new(matchmaking.user_index_shard_count));
        let publisher = Arc::new(MatchPublisher::new());
        let registry = Arc::new(WorkerRegistry::new());
        let coordinator = Arc::new(AssignmentCoordinator::new(
            node_id.clone(),
            matchmaking.range_spec(),
            matchmaking.epoch,
        ));
        let router = Arc::new(Router::new(
            Arc::clone(&coordinator),
            Arc::clone(&registry),
        ));
        let router_listener = router.spawn_listener(coordinator.subscribe());
        let (manager, manager_join) = PartitionManager::spawn(
            node_id.clone(),
            Arc::clone(&matchmaking),
            Arc::clone(&registry),
            Arc::clone(&claims),
            Arc::clone(&publisher),
            Arc::clone(&router),
            coordinator.subscribe(),
        );

        let node = Self {
            node_id,
            config: matchmaking,
            claims,
            publisher,
            registry,
            coordinator,
            router,
            manager,
            router_listener,
            manager_join,
        };
        node.apply_membership(vec![node.node_id.clone()], node.config.epoch)
            .await;
        Ok(node)
    }

    /// Submit a matchmaking request.
    ///
    /// `Ok(())` means the ticket is queued or already matched; any error
    /// means the user is not queued and the claim taken for this request has
    /// been released.
    pub async fn add_request(&self, user_id: &str, rank: i64) -> Result<(), RequestError> {
        if user_id.is_empty() {
            return Err(RequestError::EmptyUserId);
        }
        if rank < 0 {
            return Err(RequestError::NegativeRank);
        }
        let rank = Rank::try_from(rank).map_err(|_| RequestError::InvalidRank)?;
        if rank < self.config.rank_min || rank > self.config.rank_max {
            return Err(RequestError::InvalidRank);
        }

        match self.claims.claim(user_id) {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::AlreadyQueued => return Err(RequestError::AlreadyQueued),
            ClaimOutcome::IndexUnavailable => return Err(RequestError::IndexUnavailable),
        }

        match self.dispatch(user_id, rank).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // Release exactly once on every non-ok path after the claim.
                self.claims.release(user_id);
                Err(err)
            }
        }
    }

    async fn dispatch(&self, user_id: &str, rank: Rank) -> Result<(), RequestError> {
        let route = match self.router.route(rank) {
            Ok(route) => route,
            Err(RouteError::StaleSnapshot) => {
                // The table swap is in flight; give it one beat.
                tokio::task::yield_now().await;
                self.router.route(rank).map_err(Self::route_error)?
            }
            Err(err) => return Err(Self::route_error(err)),
        };

        let Some(worker) = self.registry.lookup(route.epoch, &route.shard_id) else {
            // Routed to a worker this node has not started (yet): assignment
            // churn, not a permanent condition.
            return Err(RequestError::MomentaryInterruption);
        };
        let envelope = EnqueueEnvelope {
            epoch: route.epoch,
            shard_id: route.shard_id,
            user_id: user_id.to_string(),
            rank,
        };
        let deadline = Duration::from_millis(self.config.enqueue_timeout_ms);
        match worker.enqueue(envelope, deadline).await {
            Ok(EnqueueReply::Ok) => Ok(()),
            Ok(EnqueueReply::Overloaded) => Err(RequestError::Overloaded),
            Ok(EnqueueReply::StaleEpoch) => Err(RequestError::StaleEpoch),
            Ok(EnqueueReply::OutOfRange) => Err(RequestError::MomentaryInterruption),
            Err(_) => Err(RequestError::Overloaded),
        }
    }

    fn route_error(err: RouteError) -> RequestError {
        match err {
            RouteError::InvalidRank => RequestError::InvalidRank,
            RouteError::NoPartition => RequestError::NoPartition,
            RouteError::StaleSnapshot => RequestError::MomentaryInterruption,
        }
    }

    /// Best-effort stream of match notifications involving `user_id`. Both
    /// participants of a match receive the same payload.
    pub fn subscribe_matches(&self, user_id: &str) -> ReceiverStream<MatchNotification> {
        self.publisher.subscribe(user_id)
    }

    /// Feed a membership change into the coordinator and reconcile local
    /// workers under the new epoch. Membership enumeration itself is a
    /// collaborator; callers hand the sorted-or-not node list straight in.
    pub async fn apply_membership(&self, nodes: Vec<NodeId>, epoch: Epoch) {
        let snapshot = self.coordinator.apply_membership(nodes, epoch);
        // Install synchronously so routing is correct the moment this
        // returns; the listener keeps the table fresh afterwards.
        self.router.install_snapshot(&snapshot);
        self.manager.rebalance().await;
    }

    /// Manual reconcile, bypassing the broadcast debounce.
    pub async fn rebalance(&self) {
        self.manager.rebalance().await;
    }

    /// Stats of every worker running on this node, in shard order.
    pub async fn worker_stats(&self) -> Vec<WorkerStats> {
        let deadline = Duration::from_millis(self.config.rpc_timeout_ms);
        let mut keys = self.registry.registered();
        keys.sort();
        let mut stats = Vec::with_capacity(keys.len());
        for (epoch, shard_id) in keys {
            if let Some(handle) = self.registry.lookup(epoch, &shard_id) {
                if let Ok(s) = handle.stats(deadline).await {
                    stats.push(s);
                }
            }
        }
        stats
    }

    /// Worker handle for a shard, if running. Mostly useful to tests and
    /// operator tooling.
    pub fn worker(&self, epoch: Epoch, shard_id: &ShardId) -> Option<WorkerHandle> {
        self.registry.lookup(epoch, shard_id)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &MatchmakingConfig {
        &self.config
    }

    pub fn claims(&self) -> &ClaimIndex {
        &self.claims
    }

    /// Stop all workers (releasing the claims of displaced tickets) and the
    /// background tasks.
    pub async fn shutdown(self) {
        self.manager.shutdown().await;
        let _ = self.manager_join.await;
        self.router_listener.abort();
    }
}
