//! Per-node worker lifecycle management.
//!
//! The manager subscribes to assignment broadcasts and reconciles the set of
//! locally running workers against the assignments targeting this node under
//! the active epoch. Broadcast bursts are debounced so rapid membership churn
//! coalesces into one reconcile; a manual rebalance bypasses the debounce.
//! Reconcile is idempotent: running workers whose `(epoch, shard_id)` is
//! still desired are left untouched.

use crate::claim::ClaimIndex;
use crate::config::MatchmakingConfig;
use crate::model::{AssignmentSnapshot, Epoch, NodeId, ShardId};
use crate::publisher::MatchPublisher;
use crate::registry::WorkerRegistry;
use crate::router::Router;
use crate::worker::{PartitionWorker, WorkerHandle};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const RECONCILE_DEBOUNCE: Duration = Duration::from_millis(25);
const COMMAND_BUFFER: usize = 8;

enum ManagerCommand {
    /// Reconcile now, bypassing the debounce.
    Rebalance { respond_to: oneshot::Sender<()> },
    /// Stop every local worker and exit.
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Control handle of a running partition manager.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<ManagerCommand>,
}

impl ManagerHandle {
    /// Reconcile immediately and wait until the diff has been applied.
    pub async fn rebalance(&self) {
        let (respond_to, ack) = oneshot::channel();
        if self
            .tx
            .send(ManagerCommand::Rebalance { respond_to })
            .await
            .is_ok()
        {
            let _ = ack.await;
        }
    }

    /// Stop all local workers and the manager itself.
    pub async fn shutdown(&self) {
        let (respond_to, ack) = oneshot::channel();
        if self
            .tx
            .send(ManagerCommand::Shutdown { respond_to })
            .await
            .is_ok()
        {
            let _ = ack.await;
        }
    }
}

struct RunningWorker {
    handle: WorkerHandle,
    join: JoinHandle<()>,
}

pub struct PartitionManager {
    node_id: NodeId,
    config: Arc<MatchmakingConfig>,
    registry: Arc<WorkerRegistry>,
    claims: Arc<ClaimIndex>,
    publisher: Arc<MatchPublisher>,
    router: Arc<Router>,
    running: FxHashMap<(Epoch, ShardId), RunningWorker>,
    snapshot_rx: watch::Receiver<Arc<AssignmentSnapshot>>,
    cmd_rx: mpsc::Receiver<ManagerCommand>,
}

impl PartitionManager {
    /// Start the manager task. Workers are started on the first reconcile
    /// (triggered by a broadcast or an explicit `rebalance`).
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        node_id: NodeId,
        config: Arc<MatchmakingConfig>,
        registry: Arc<WorkerRegistry>,
        claims: Arc<ClaimIndex>,
        publisher: Arc<MatchPublisher>,
        router: Arc<Router>,
        snapshot_rx: watch::Receiver<Arc<AssignmentSnapshot>>,
    ) -> (ManagerHandle, JoinHandle<()>) {
        let (tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let manager = Self {
            node_id,
            config,
            registry,
            claims,
            publisher,
            router,
            running: FxHashMap::default(),
            snapshot_rx,
            cmd_rx,
        };
        let join = tokio::spawn(manager.run());
        (ManagerHandle { tx }, join)
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(ManagerCommand::Rebalance { respond_to }) => {
                        let snapshot = self.snapshot_rx.borrow_and_update().clone();
                        self.reconcile(&snapshot).await;
                        let _ = respond_to.send(());
                    }
                    Some(ManagerCommand::Shutdown { respond_to }) => {
                        self.stop_all().await;
                        let _ = respond_to.send(());
                        return;
                    }
                    None => {
                        self.stop_all().await;
                        return;
                    }
                },
                changed = self.snapshot_rx.changed() => {
                    if changed.is_err() {
                        self.stop_all().await;
                        return;
                    }
                    // Coalesce bursts of assignment updates into one pass.
                    tokio::time::sleep(RECONCILE_DEBOUNCE).await;
                    let snapshot = self.snapshot_rx.borrow_and_update().clone();
                    self.reconcile(&snapshot).await;
                }
            }
        }
    }

    async fn reconcile(&mut self, snapshot: &AssignmentSnapshot) {
        let desired: FxHashMap<(Epoch, ShardId), (u32, u32)> = snapshot
            .assignments
            .iter()
            .filter(|a| a.node == self.node_id)
            .map(|a| {
                (
                    (a.epoch, a.shard_id.clone()),
                    (a.range_start, a.range_end),
                )
            })
            .collect();

        let stop: Vec<(Epoch, ShardId)> = self
            .running
            .keys()
            .filter(|key| !desired.contains_key(*key))
            .cloned()
            .collect();
        let start: Vec<(Epoch, ShardId)> = desired
            .keys()
            .filter(|key| !self.running.contains_key(*key))
            .cloned()
            .collect();
        if stop.is_empty() && start.is_empty() {
            return;
        }
        tracing::info!(
            node = %self.node_id,
            epoch = snapshot.epoch,
            starting = start.len(),
            stopping = stop.len(),
            "reconciling local workers"
        );

        for key in stop {
            if let Some(worker) = self.running.remove(&key) {
                self.registry.deregister(key.0, &key.1);
                worker.handle.shutdown().await;
                // Wait for the drain so displaced claims are released before
                // the reconcile is reported complete.
                let _ = worker.join.await;
            }
        }

        for key in start {
            let (range_start, range_end) = desired[&key];
            let (handle, join) = PartitionWorker::spawn(
                key.1.clone(),
                range_start,
                range_end,
                key.0,
                Arc::clone(&self.config),
                Arc::clone(&self.claims),
                Arc::clone(&self.publisher),
                Arc::clone(&self.router),
            );
            self.registry.register(handle.clone());
            self.running.insert(key, RunningWorker { handle, join });
        }
    }

    async fn stop_all(&mut self) {
        let keys: Vec<(Epoch, ShardId)> = self.running.keys().cloned().collect();
        for key in keys {
            if let Some(worker) = self.running.remove(&key) {
                self.registry.deregister(key.0, &key.1);
                worker.handle.shutdown().await;
                let _ = worker.join.await;
            }
        }
    }
}
