//! Per-shard partition worker.
//!
//! Each worker is a single-threaded task that exclusively owns one
//! [`ShardQueue`] and serializes every access through its bounded inbox of
//! typed messages. The enqueue path performs a strictly local immediate
//! match; the periodic tick widens tolerances with ticket age and commits
//! pairs two-phase, crossing shard boundaries through the peek/reserve RPC
//! pair on neighbor handles.
//!
//! An outbound RPC blocks only the calling worker, which does not process its
//! own mailbox during the call; the deadline on every call turns a slow or
//! dead callee into a dropped candidate, never a fatal error.

use crate::backpressure::{check_overload, Admission};
use crate::claim::ClaimIndex;
use crate::config::MatchmakingConfig;
use crate::error::RpcError;
use crate::model::{monotonic_now_ms, EnqueueEnvelope, Epoch, Rank, ShardId, Ticket};
use crate::publisher::MatchPublisher;
use crate::queue::{HeadRemoval, ShardQueue};
use crate::router::Router;
use crate::search;
use crate::widening;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

/// Inbox slots reserved beyond the backpressure limit so control messages
/// (shutdown, stats) are not starved by a saturated enqueue stream.
const CONTROL_SLACK: usize = 16;

/// Per-shard tick phase within the interval. Two neighbors ticking at the
/// same instant would each block on the other's peek until the RPC deadline,
/// so shards are spread deterministically across the period.
fn tick_phase(shard_id: &ShardId, tick_interval_ms: u64) -> Duration {
    use std::hash::{Hash, Hasher};
    let mut hasher = rustc_hash::FxHasher::default();
    shard_id.hash(&mut hasher);
    Duration::from_millis(hasher.finish() % tick_interval_ms.max(1))
}

/// Reply to an enqueue envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueReply {
    /// Accepted: queued or immediately matched.
    Ok,
    Overloaded,
    OutOfRange,
    StaleEpoch,
}

/// Reply to a read-only nearest-opponent peek.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeekReply {
    Ok(Option<Ticket>),
    EpochMismatch,
}

/// Reply to a reserve (second phase of a cross-shard commit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveReply {
    /// The ticket was removed and its ownership transferred to the caller.
    /// The callee does NOT release the claim; finalization is the caller's.
    Ok(Ticket),
    NotFound,
    EpochMismatch,
}

/// Point-in-time worker counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub shard_id: ShardId,
    pub epoch: Epoch,
    pub range_start: Rank,
    pub range_end: Rank,
    pub queued_count: usize,
}

enum WorkerRequest {
    Enqueue {
        envelope: EnqueueEnvelope,
        respond_to: oneshot::Sender<EnqueueReply>,
    },
    PeekNearest {
        rank: Rank,
        allowed_diff: u32,
        exclude_user_id: String,
        epoch: Epoch,
        respond_to: oneshot::Sender<PeekReply>,
    },
    Reserve {
        user_id: String,
        rank: Rank,
        enqueued_at_ms: u64,
        epoch: Epoch,
        respond_to: oneshot::Sender<ReserveReply>,
    },
    Stats {
        respond_to: oneshot::Sender<WorkerStats>,
    },
    HealthCheck {
        respond_to: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Cheaply cloneable reference to a running worker. All interaction goes
/// through the worker's inbox; the handle never touches worker state.
#[derive(Clone)]
pub struct WorkerHandle {
    shard_id: ShardId,
    epoch: Epoch,
    range_start: Rank,
    range_end: Rank,
    tx: mpsc::Sender<WorkerRequest>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("shard_id", &self.shard_id)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl PartialEq for WorkerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.shard_id == other.shard_id
            && self.epoch == other.epoch
            && self.range_start == other.range_start
            && self.range_end == other.range_end
            && self.tx.same_channel(&other.tx)
    }
}

impl WorkerHandle {
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn range_start(&self) -> Rank {
        self.range_start
    }

    pub fn range_end(&self) -> Rank {
        self.range_end
    }

    async fn call<R>(
        &self,
        deadline: Duration,
        build: impl FnOnce(oneshot::Sender<R>) -> WorkerRequest,
    ) -> Result<R, RpcError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = build(reply_tx);
        let exchange = async {
            self.tx
                .send(request)
                .await
                .map_err(|_| RpcError::Unavailable)?;
            reply_rx.await.map_err(|_| RpcError::Unavailable)
        };
        match timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout),
        }
    }

    /// Deliver an enqueue envelope; the deadline covers both inbox admission
    /// and the worker's reply.
    pub async fn enqueue(
        &self,
        envelope: EnqueueEnvelope,
        deadline: Duration,
    ) -> Result<EnqueueReply, RpcError> {
        self.call(deadline, |respond_to| WorkerRequest::Enqueue {
            envelope,
            respond_to,
        })
        .await
    }

    /// Read-only nearest-opponent peek, used by neighbor ticks.
    pub async fn peek_nearest(
        &self,
        rank: Rank,
        allowed_diff: u32,
        exclude_user_id: String,
        epoch: Epoch,
        deadline: Duration,
    ) -> Result<PeekReply, RpcError> {
        self.call(deadline, |respond_to| WorkerRequest::PeekNearest {
            rank,
            allowed_diff,
            exclude_user_id,
            epoch,
            respond_to,
        })
        .await
    }

    /// Second phase of a cross-shard commit: atomic remove-if-matches of a
    /// previously peeked ticket.
    pub async fn reserve(
        &self,
        ticket: &Ticket,
        epoch: Epoch,
        deadline: Duration,
    ) -> Result<ReserveReply, RpcError> {
        self.call(deadline, |respond_to| WorkerRequest::Reserve {
            user_id: ticket.user_id.clone(),
            rank: ticket.rank,
            enqueued_at_ms: ticket.enqueued_at_ms,
            epoch,
            respond_to,
        })
        .await
    }

    pub async fn stats(&self, deadline: Duration) -> Result<WorkerStats, RpcError> {
        self.call(deadline, |respond_to| WorkerRequest::Stats { respond_to })
            .await
    }

    pub async fn health_check(&self, deadline: Duration) -> Result<(), RpcError> {
        self.call(deadline, |respond_to| WorkerRequest::HealthCheck { respond_to })
            .await
    }

    /// Ask the worker to stop. Best-effort; the worker drains its state and
    /// releases displaced claims before exiting.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WorkerRequest::Shutdown).await;
    }
}

/// Where the opponent of a candidate pair lives.
enum PairSource {
    Local,
    Remote(WorkerHandle),
}

/// Result of one pair-commit attempt within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitOutcome {
    Finalized,
    /// A concurrent decision path claimed one side first; state is intact.
    LostRace,
    /// The remote reserve failed after the local remove; rolled back.
    Failed,
}

struct BestPair {
    requester: Ticket,
    opponent: Ticket,
    source: PairSource,
}

impl BestPair {
    fn diff(&self) -> u32 {
        self.opponent.rank.abs_diff(self.requester.rank)
    }

    /// Cross-requester pair order: the opponent tuple order of the search,
    /// extended by the requester's identity so the scan over heads is
    /// deterministic regardless of rank iteration order.
    fn beats(&self, other: &BestPair) -> bool {
        let key = |pair: &BestPair| {
            (
                pair.diff(),
                pair.opponent.enqueued_at_ms,
                pair.opponent.rank,
                pair.opponent.user_id.clone(),
                pair.requester.enqueued_at_ms,
                pair.requester.rank,
                pair.requester.user_id.clone(),
            )
        };
        key(self).cmp(&key(other)) == Ordering::Less
    }
}

/// The actor that owns one shard's queue state.
pub struct PartitionWorker {
    state: ShardQueue,
    config: Arc<MatchmakingConfig>,
    claims: Arc<ClaimIndex>,
    publisher: Arc<MatchPublisher>,
    router: Arc<Router>,
    rx: mpsc::Receiver<WorkerRequest>,
    /// Clone of the inbox sender, held to measure mailbox depth.
    tx: mpsc::Sender<WorkerRequest>,
}

impl PartitionWorker {
    /// Spawn a worker for one assignment and return its handle.
    pub fn spawn(
        shard_id: ShardId,
        range_start: Rank,
        range_end: Rank,
        epoch: Epoch,
        config: Arc<MatchmakingConfig>,
        claims: Arc<ClaimIndex>,
        publisher: Arc<MatchPublisher>,
        router: Arc<Router>,
    ) -> (WorkerHandle, JoinHandle<()>) {
        let capacity = config.backpressure.message_queue_limit + CONTROL_SLACK;
        let (tx, rx) = mpsc::channel(capacity);
        let handle = WorkerHandle {
            shard_id: shard_id.clone(),
            epoch,
            range_start,
            range_end,
            tx: tx.clone(),
        };
        let worker = Self {
            state: ShardQueue::new(shard_id, range_start, range_end, epoch),
            config,
            claims,
            publisher,
            router,
            rx,
            tx,
        };
        let join = tokio::spawn(worker.run());
        (handle, join)
    }

    async fn run(mut self) {
        tracing::info!(
            shard_id = %self.state.shard_id(),
            epoch = self.state.epoch(),
            range_start = self.state.range_start(),
            range_end = self.state.range_end(),
            "partition worker started"
        );
        let period = Duration::from_millis(self.config.tick_interval_ms);
        let phase = tick_phase(self.state.shard_id(), self.config.tick_interval_ms);
        let mut tick = interval_at(Instant::now() + period + phase, period);
        // Skip keeps each shard on its own phase grid after a late tick.
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                request = self.rx.recv() => match request {
                    Some(WorkerRequest::Shutdown) | None => break,
                    Some(request) => self.handle_request(request),
                },
                _ = tick.tick() => self.run_tick().await,
            }
        }

        self.release_displaced_claims();
        tracing::info!(
            shard_id = %self.state.shard_id(),
            epoch = self.state.epoch(),
            "partition worker stopped"
        );
    }

    /// Messages currently waiting in the inbox (the one being processed has
    /// already released its slot).
    fn mailbox_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    fn handle_request(&mut self, request: WorkerRequest) {
        match request {
            WorkerRequest::Enqueue {
                envelope,
                respond_to,
            } => {
                let reply = self.handle_enqueue(envelope);
                let _ = respond_to.send(reply);
            }
            WorkerRequest::PeekNearest {
                rank,
                allowed_diff,
                exclude_user_id,
                epoch,
                respond_to,
            } => {
                let reply = self.handle_peek(rank, allowed_diff, &exclude_user_id, epoch);
                let _ = respond_to.send(reply);
            }
            WorkerRequest::Reserve {
                user_id,
                rank,
                enqueued_at_ms,
                epoch,
                respond_to,
            } => {
                let reply = self.handle_reserve(user_id, rank, enqueued_at_ms, epoch);
                let _ = respond_to.send(reply);
            }
            WorkerRequest::Stats { respond_to } => {
                let _ = respond_to.send(WorkerStats {
                    shard_id: self.state.shard_id().clone(),
                    epoch: self.state.epoch(),
                    range_start: self.state.range_start(),
                    range_end: self.state.range_end(),
                    queued_count: self.state.queued_count(),
                });
            }
            WorkerRequest::HealthCheck { respond_to } => {
                let _ = respond_to.send(());
            }
            WorkerRequest::Shutdown => unreachable!("handled in run loop"),
        }
    }

    /// Admission order is strict: epoch, overload, range, then the local
    /// immediate match. The immediate match never touches adjacent shards.
    fn handle_enqueue(&mut self, envelope: EnqueueEnvelope) -> EnqueueReply {
        if envelope.epoch != self.state.epoch() {
            return EnqueueReply::StaleEpoch;
        }
        let admission = check_overload(
            self.state.queued_count(),
            self.mailbox_depth(),
            &self.config.backpressure,
        );
        if admission == Admission::Overloaded {
            tracing::debug!(
                shard_id = %self.state.shard_id(),
                queued = self.state.queued_count(),
                "enqueue shed by backpressure"
            );
            return EnqueueReply::Overloaded;
        }
        if !self.state.contains_rank(envelope.rank) {
            return EnqueueReply::OutOfRange;
        }

        let ticket = Ticket::new(envelope.user_id, envelope.rank, monotonic_now_ms());
        if let Some(opponent) = search::peek_best_opponent(
            &self.state,
            ticket.rank,
            self.config.immediate_match_allowed_diff,
            &ticket.user_id,
            self.config.max_scan_ranks,
        ) {
            if search::take_best_opponent(&mut self.state, &opponent) {
                self.finalize(&ticket, &opponent);
                return EnqueueReply::Ok;
            }
        }
        self.state.enqueue(ticket);
        EnqueueReply::Ok
    }

    fn handle_peek(
        &self,
        rank: Rank,
        allowed_diff: u32,
        exclude_user_id: &str,
        epoch: Epoch,
    ) -> PeekReply {
        if epoch != self.state.epoch() {
            return PeekReply::EpochMismatch;
        }
        PeekReply::Ok(search::peek_best_opponent(
            &self.state,
            rank,
            allowed_diff,
            exclude_user_id,
            self.config.max_scan_ranks,
        ))
    }

    /// Pure state transfer: the removed ticket's claim stays held for the
    /// caller to release at finalization.
    fn handle_reserve(
        &mut self,
        user_id: String,
        rank: Rank,
        enqueued_at_ms: u64,
        epoch: Epoch,
    ) -> ReserveReply {
        if epoch != self.state.epoch() {
            return ReserveReply::EpochMismatch;
        }
        let expected = Ticket::new(user_id, rank, enqueued_at_ms);
        match self.state.dequeue_head_if_matches(rank, &expected) {
            HeadRemoval::Removed(ticket) => ReserveReply::Ok(ticket),
            HeadRemoval::Mismatch => ReserveReply::NotFound,
        }
    }

    async fn run_tick(&mut self) {
        for _ in 0..self.config.max_tick_attempts {
            let Some(pair) = self.find_globally_best_pair().await else {
                break;
            };
            // Every rollback path falls through to the next attempt; the
            // attempt bound caps the tick's work either way.
            self.try_commit_pair(pair).await;
        }
    }

    /// Scan every queue head, widen its window by age, and gather the best
    /// local and neighbor candidates under the shared strict ordering.
    async fn find_globally_best_pair(&self) -> Option<BestPair> {
        let now = monotonic_now_ms();
        let ranks: Vec<Rank> = self.state.non_empty_ranks().collect();
        let mut best: Option<BestPair> = None;

        for rank in ranks {
            let Some(requester) = self.state.peek_head(rank).cloned() else {
                continue;
            };
            let allowed = widening::allowed_diff(requester.age_ms(now), &self.config.widening);

            let mut candidate = search::peek_best_opponent(
                &self.state,
                requester.rank,
                allowed,
                &requester.user_id,
                self.config.max_scan_ranks,
            )
            .map(|opponent| BestPair {
                requester: requester.clone(),
                opponent,
                source: PairSource::Local,
            });

            let allowed = i64::from(allowed);
            let crosses_left =
                i64::from(requester.rank) - allowed < i64::from(self.state.range_start());
            let crosses_right =
                i64::from(requester.rank) + allowed > i64::from(self.state.range_end());
            if crosses_left || crosses_right {
                let (left, right) = self.router.adjacent(requester.rank);
                for neighbor in [
                    crosses_left.then_some(left).flatten(),
                    crosses_right.then_some(right).flatten(),
                ]
                .into_iter()
                .flatten()
                {
                    if let Some(opponent) =
                        self.remote_peek(&neighbor, &requester, allowed as u32).await
                    {
                        let remote = BestPair {
                            requester: requester.clone(),
                            opponent,
                            source: PairSource::Remote(neighbor),
                        };
                        candidate = Some(match candidate {
                            Some(current) if !remote.beats(&current) => current,
                            _ => remote,
                        });
                    }
                }
            }

            if let Some(pair) = candidate {
                best = Some(match best {
                    Some(current) if !pair.beats(&current) => current,
                    _ => pair,
                });
            }
        }
        best
    }

    async fn remote_peek(
        &self,
        neighbor: &WorkerHandle,
        requester: &Ticket,
        allowed_diff: u32,
    ) -> Option<Ticket> {
        let deadline = Duration::from_millis(self.config.rpc_timeout_ms);
        match neighbor
            .peek_nearest(
                requester.rank,
                allowed_diff,
                requester.user_id.clone(),
                self.state.epoch(),
                deadline,
            )
            .await
        {
            Ok(PeekReply::Ok(ticket)) => ticket,
            Ok(PeekReply::EpochMismatch) => {
                tracing::trace!(neighbor = %neighbor.shard_id(), "peek dropped: epoch mismatch");
                None
            }
            Err(err) => {
                tracing::trace!(neighbor = %neighbor.shard_id(), %err, "peek dropped");
                None
            }
        }
    }

    /// Two-phase commit of one pair: atomic local head-remove, then either a
    /// local take or a remote reserve. Any failure after the local remove
    /// rolls the requester back to the head of its FIFO with its original
    /// stamp, so retrying never penalizes age.
    async fn try_commit_pair(&mut self, pair: BestPair) -> CommitOutcome {
        let BestPair {
            requester,
            opponent,
            source,
        } = pair;
        let removed = self
            .state
            .dequeue_head_if_matches(requester.rank, &requester);
        if removed == HeadRemoval::Mismatch {
            // Another decision path claimed this head since the scan.
            return CommitOutcome::LostRace;
        }

        match source {
            PairSource::Local => {
                if search::take_best_opponent(&mut self.state, &opponent) {
                    self.finalize(&requester, &opponent);
                    CommitOutcome::Finalized
                } else {
                    self.state.enqueue_front(requester);
                    CommitOutcome::LostRace
                }
            }
            PairSource::Remote(neighbor) => {
                let deadline = Duration::from_millis(self.config.rpc_timeout_ms);
                match neighbor
                    .reserve(&opponent, self.state.epoch(), deadline)
                    .await
                {
                    Ok(ReserveReply::Ok(reserved)) => {
                        self.finalize(&requester, &reserved);
                        CommitOutcome::Finalized
                    }
                    Ok(ReserveReply::NotFound) | Ok(ReserveReply::EpochMismatch) | Err(_) => {
                        tracing::trace!(
                            neighbor = %neighbor.shard_id(),
                            opponent = %opponent,
                            "reserve failed, rolling requester back"
                        );
                        self.state.enqueue_front(requester);
                        CommitOutcome::Failed
                    }
                }
            }
        }
    }

    /// Finalization owns both claims regardless of which worker held the
    /// opponent; the publisher is best-effort and cannot fail the match.
    fn finalize(&self, a: &Ticket, b: &Ticket) {
        self.claims.release(&a.user_id);
        self.claims.release(&b.user_id);
        self.publisher.publish_match(a, b);
        tracing::debug!(
            shard_id = %self.state.shard_id(),
            a = %a,
            b = %b,
            "match finalized"
        );
    }

    /// Tickets queued at stop time are lost; their claims are released so the
    /// displaced clients can resubmit immediately.
    fn release_displaced_claims(&mut self) {
        let displaced = self.state.drain_all();
        if displaced.is_empty() {
            return;
        }
        tracing::info!(
            shard_id = %self.state.shard_id(),
            count = displaced.len(),
            "releasing claims of displaced tickets"
        );
        for ticket in displaced {
            self.claims.release(&ticket.user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::AssignmentCoordinator;
    use crate::model::NodeId;
    use crate::registry::WorkerRegistry;
    use tokio_stream::StreamExt;

    struct Harness {
        config: Arc<MatchmakingConfig>,
        claims: Arc<ClaimIndex>,
        publisher: Arc<MatchPublisher>,
        router: Arc<Router>,
        registry: Arc<WorkerRegistry>,
    }

    fn harness(mutate: impl FnOnce(&mut MatchmakingConfig)) -> Harness {
        let mut config = MatchmakingConfig {
            rank_min: 0,
            rank_max: 999,
            partition_count: 2,
            ..Default::default()
        };
        mutate(&mut config);
        let config = Arc::new(config);
        let claims = Arc::new(ClaimIndex::new(config.user_index_shard_count));
        let publisher = Arc::new(MatchPublisher::new());
        let registry = Arc::new(WorkerRegistry::new());
        let coordinator = Arc::new(AssignmentCoordinator::new(
            NodeId::new("node-a"),
            config.range_spec(),
            config.epoch,
        ));
        let router = Arc::new(Router::new(
            Arc::clone(&coordinator),
            Arc::clone(&registry),
        ));
        let snapshot = coordinator.apply_membership(vec![NodeId::new("node-a")], config.epoch);
        router.install_snapshot(&snapshot);
        Harness {
            config,
            claims,
            publisher,
            router,
            registry,
        }
    }

    /// A monotonic stamp exactly `age` ms in the past, sleeping if the
    /// process clock has not run that long yet.
    fn aged_stamp(age: u64) -> u64 {
        let now = monotonic_now_ms();
        if now >= age {
            return now - age;
        }
        std::thread::sleep(Duration::from_millis(age - now));
        monotonic_now_ms() - age
    }

    fn direct_worker(h: &Harness, range_start: Rank, range_end: Rank) -> PartitionWorker {
        let capacity = h.config.backpressure.message_queue_limit + CONTROL_SLACK;
        let (tx, rx) = mpsc::channel(capacity);
        PartitionWorker {
            state: ShardQueue::new(
                ShardId::for_range(range_start, range_end),
                range_start,
                range_end,
                h.config.epoch,
            ),
            config: Arc::clone(&h.config),
            claims: Arc::clone(&h.claims),
            publisher: Arc::clone(&h.publisher),
            router: Arc::clone(&h.router),
            rx,
            tx,
        }
    }

    fn envelope(h: &Harness, shard: &ShardId, user: &str, rank: Rank) -> EnqueueEnvelope {
        EnqueueEnvelope {
            epoch: h.config.epoch,
            shard_id: shard.clone(),
            user_id: user.to_string(),
            rank,
        }
    }

    #[tokio::test]
    async fn enqueue_rejects_stale_epoch_before_anything_else() {
        let h = harness(|_| {});
        let mut worker = direct_worker(&h, 0, 999);
        let mut env = envelope(&h, worker.state.shard_id(), "u1", 5_000);
        env.epoch = h.config.epoch + 1;
        // Rank is also out of range, but the epoch check comes first.
        assert_eq!(worker.handle_enqueue(env), EnqueueReply::StaleEpoch);
    }

    #[tokio::test]
    async fn enqueue_rejects_out_of_range_rank() {
        let h = harness(|_| {});
        let mut worker = direct_worker(&h, 0, 499);
        let env = envelope(&h, worker.state.shard_id(), "u1", 500);
        assert_eq!(worker.handle_enqueue(env), EnqueueReply::OutOfRange);
        assert_eq!(worker.state.queued_count(), 0);
    }

    #[tokio::test]
    async fn backpressure_precedes_range_check() {
        let h = harness(|config| {
            config.backpressure.queued_count_limit = 1;
        });
        let mut worker = direct_worker(&h, 0, 499);
        worker.state.enqueue(Ticket::new("a", 10, 0));
        worker.state.enqueue(Ticket::new("b", 20, 0));
        // Out-of-range rank still sheds as overloaded: the cheap check wins.
        let env = envelope(&h, worker.state.shard_id(), "u1", 900);
        assert_eq!(worker.handle_enqueue(env), EnqueueReply::Overloaded);
    }

    #[tokio::test]
    async fn immediate_match_finalizes_and_releases_claims() {
        let h = harness(|_| {});
        let mut worker = direct_worker(&h, 0, 999);
        let mut sub = h.publisher.subscribe("u2");

        h.claims.claim("u1");
        h.claims.claim("u2");
        assert_eq!(
            worker.handle_enqueue(envelope(&h, worker.state.shard_id(), "u1", 500)),
            EnqueueReply::Ok
        );
        assert_eq!(worker.state.queued_count(), 1);
        assert_eq!(
            worker.handle_enqueue(envelope(&h, worker.state.shard_id(), "u2", 510)),
            EnqueueReply::Ok
        );
        assert_eq!(worker.state.queued_count(), 0);
        assert!(!h.claims.is_claimed("u1"));
        assert!(!h.claims.is_claimed("u2"));
        let note = sub.next().await.unwrap();
        assert!(note.involves("u1") && note.involves("u2"));
    }

    #[tokio::test]
    async fn immediate_match_respects_allowed_diff() {
        let h = harness(|config| {
            config.immediate_match_allowed_diff = 5;
        });
        let mut worker = direct_worker(&h, 0, 999);
        worker.handle_enqueue(envelope(&h, worker.state.shard_id(), "u1", 500));
        worker.handle_enqueue(envelope(&h, worker.state.shard_id(), "u2", 510));
        // Gap of 10 exceeds the immediate tolerance of 5: both stay queued.
        assert_eq!(worker.state.queued_count(), 2);
    }

    #[tokio::test]
    async fn reserve_transfers_the_ticket_but_keeps_the_claim() {
        let h = harness(|_| {});
        let mut worker = direct_worker(&h, 0, 999);
        h.claims.claim("u1");
        let ticket = Ticket::new("u1", 400, 77);
        worker.state.enqueue(ticket.clone());

        let reply = worker.handle_reserve("u1".into(), 400, 77, h.config.epoch);
        assert_eq!(reply, ReserveReply::Ok(ticket));
        assert_eq!(worker.state.queued_count(), 0);
        // Finalization belongs to the caller.
        assert!(h.claims.is_claimed("u1"));
    }

    #[tokio::test]
    async fn reserve_misses_on_stale_tuple_or_epoch() {
        let h = harness(|_| {});
        let mut worker = direct_worker(&h, 0, 999);
        worker.state.enqueue(Ticket::new("u1", 400, 77));

        assert_eq!(
            worker.handle_reserve("u1".into(), 400, 76, h.config.epoch),
            ReserveReply::NotFound
        );
        assert_eq!(
            worker.handle_reserve("u1".into(), 400, 77, h.config.epoch + 1),
            ReserveReply::EpochMismatch
        );
        assert_eq!(worker.state.queued_count(), 1);
    }

    #[tokio::test]
    async fn peek_validates_epoch_and_never_mutates() {
        let h = harness(|_| {});
        let mut worker = direct_worker(&h, 0, 999);
        worker.state.enqueue(Ticket::new("u1", 400, 0));

        assert_eq!(
            worker.handle_peek(410, 20, "someone", h.config.epoch + 1),
            PeekReply::EpochMismatch
        );
        let reply = worker.handle_peek(410, 20, "someone", h.config.epoch);
        assert_eq!(reply, PeekReply::Ok(Some(Ticket::new("u1", 400, 0))));
        assert_eq!(worker.state.queued_count(), 1);
    }

    #[tokio::test]
    async fn failed_remote_reserve_rolls_requester_back_to_head() {
        let h = harness(|_| {});
        // A live right-shard worker whose queue does NOT hold the opponent.
        let (right_handle, _join) = PartitionWorker::spawn(
            ShardId::for_range(500, 999),
            500,
            999,
            h.config.epoch,
            Arc::clone(&h.config),
            Arc::clone(&h.claims),
            Arc::clone(&h.publisher),
            Arc::clone(&h.router),
        );
        h.registry.register(right_handle.clone());

        let mut left = direct_worker(&h, 0, 499);
        let requester = Ticket::new("uL", 499, 1_234);
        left.state.enqueue(requester.clone());
        left.state.enqueue(Ticket::new("uL2", 499, 2_000));
        h.claims.claim("uL");

        // The opponent was peeked earlier but has since been matched away.
        let vanished = Ticket::new("uR", 520, 500);
        let outcome = left
            .try_commit_pair(BestPair {
                requester: requester.clone(),
                opponent: vanished,
                source: PairSource::Remote(right_handle),
            })
            .await;
        assert_eq!(outcome, CommitOutcome::Failed);

        assert_eq!(left.state.peek_head(499), Some(&requester));
        assert_eq!(left.state.peek_head(499).unwrap().enqueued_at_ms, 1_234);
        assert_eq!(left.state.queued_count(), 2);
        assert!(h.claims.is_claimed("uL"));
    }

    #[tokio::test]
    async fn tick_matches_locally_across_ranks_once_widened() {
        let h = harness(|config| {
            config.widening = crate::config::WideningConfig {
                step_ms: 100,
                step_diff: 25,
                cap: 1_000,
            };
        });
        let mut worker = direct_worker(&h, 0, 999);
        // Age 300ms at 25 ranks per 100ms step: a 75-point window.
        let aged = aged_stamp(300);
        worker.state.enqueue(Ticket::new("u1", 400, aged));
        worker.state.enqueue(Ticket::new("u2", 440, aged));
        h.claims.claim("u1");
        h.claims.claim("u2");

        worker.run_tick().await;
        assert_eq!(worker.state.queued_count(), 0);
        assert!(!h.claims.is_claimed("u1"));
        assert!(!h.claims.is_claimed("u2"));
    }

    #[tokio::test]
    async fn tick_leaves_pairs_outside_the_widened_window() {
        let h = harness(|config| {
            config.widening = crate::config::WideningConfig {
                step_ms: 100,
                step_diff: 25,
                cap: 1_000,
            };
        });
        let mut worker = direct_worker(&h, 0, 999);
        let fresh = monotonic_now_ms();
        worker.state.enqueue(Ticket::new("u1", 400, fresh));
        worker.state.enqueue(Ticket::new("u2", 440, fresh));

        worker.run_tick().await;
        assert_eq!(worker.state.queued_count(), 2);
    }

    #[tokio::test]
    async fn cross_shard_tick_reserves_from_the_neighbor() {
        let h = harness(|config| {
            config.widening = crate::config::WideningConfig {
                step_ms: 100,
                step_diff: 25,
                cap: 1_000,
            };
        });
        let (right_handle, _join) = PartitionWorker::spawn(
            ShardId::for_range(500, 999),
            500,
            999,
            h.config.epoch,
            Arc::clone(&h.config),
            Arc::clone(&h.claims),
            Arc::clone(&h.publisher),
            Arc::clone(&h.router),
        );
        h.registry.register(right_handle.clone());

        // Seed the neighbor through its inbox so its state is authoritative.
        let deadline = Duration::from_millis(h.config.enqueue_timeout_ms);
        h.claims.claim("uR");
        let reply = right_handle
            .enqueue(
                EnqueueEnvelope {
                    epoch: h.config.epoch,
                    shard_id: right_handle.shard_id().clone(),
                    user_id: "uR".to_string(),
                    rank: 520,
                },
                deadline,
            )
            .await
            .unwrap();
        assert_eq!(reply, EnqueueReply::Ok);

        let mut left = direct_worker(&h, 0, 499);
        // Aged for a window of at least 21 ranks: 499+25 crosses 499.
        left.state.enqueue(Ticket::new("uL", 499, aged_stamp(150)));
        h.claims.claim("uL");

        let mut sub = h.publisher.subscribe("uL");
        left.run_tick().await;

        assert_eq!(left.state.queued_count(), 0);
        let right_stats = right_handle.stats(deadline).await.unwrap();
        assert_eq!(right_stats.queued_count, 0);
        assert!(!h.claims.is_claimed("uL"));
        assert!(!h.claims.is_claimed("uR"));
        let note = sub.next().await.unwrap();
        assert!(note.involves("uL") && note.involves("uR"));
    }

    #[tokio::test]
    async fn shutdown_releases_claims_of_displaced_tickets() {
        let h = harness(|_| {});
        let (handle, join) = PartitionWorker::spawn(
            ShardId::for_range(0, 999),
            0,
            999,
            h.config.epoch,
            Arc::clone(&h.config),
            Arc::clone(&h.claims),
            Arc::clone(&h.publisher),
            Arc::clone(&h.router),
        );
        let deadline = Duration::from_millis(h.config.enqueue_timeout_ms);
        h.claims.claim("u1");
        handle
            .enqueue(
                EnqueueEnvelope {
                    epoch: h.config.epoch,
                    shard_id: handle.shard_id().clone(),
                    user_id: "u1".to_string(),
                    rank: 300,
                },
                deadline,
            )
            .await
            .unwrap();
        assert!(h.claims.is_claimed("u1"));

        handle.shutdown().await;
        join.await.unwrap();
        assert!(!h.claims.is_claimed("u1"));
    }

    #[tokio::test]
    async fn health_check_answers_while_idle() {
        let h = harness(|_| {});
        let (handle, _join) = PartitionWorker::spawn(
            ShardId::for_range(0, 999),
            0,
            999,
            h.config.epoch,
            Arc::clone(&h.config),
            Arc::clone(&h.claims),
            Arc::clone(&h.publisher),
            Arc::clone(&h.router),
        );
        handle
            .health_check(Duration::from_millis(500))
            .await
            .unwrap();
    }
}
