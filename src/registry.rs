//! Process registry of running partition workers.
//!
//! Workers are registered under `(epoch, shard_id)` so an epoch transition
//! can start the new generation before the old one is torn down without
//! identifier collisions. The registry hands out cheap handle clones; it does
//! not own worker lifecycles (the partition manager does).

use crate::model::{Epoch, ShardId};
use crate::worker::WorkerHandle;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: DashMap<(Epoch, ShardId), WorkerHandle>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: WorkerHandle) {
        self.workers
            .insert((handle.epoch(), handle.shard_id().clone()), handle);
    }

    pub fn deregister(&self, epoch: Epoch, shard_id: &ShardId) -> Option<WorkerHandle> {
        self.workers
            .remove(&(epoch, shard_id.clone()))
            .map(|(_, handle)| handle)
    }

    pub fn lookup(&self, epoch: Epoch, shard_id: &ShardId) -> Option<WorkerHandle> {
        self.workers
            .get(&(epoch, shard_id.clone()))
            .map(|entry| entry.value().clone())
    }

    /// Keys of all currently registered workers.
    pub fn registered(&self) -> Vec<(Epoch, ShardId)> {
        self.workers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
