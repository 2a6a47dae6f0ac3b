//! Per-shard queue state.
//!
//! `ShardQueue` keeps one FIFO of tickets per rank, plus an ordered index of
//! non-empty ranks realized directly as the `BTreeMap` key set: a rank is
//! present in the map exactly while its FIFO is non-empty, so ordered
//! iteration and neighbor queries come from the map itself. The structure is
//! mutated only by its owning worker; every operation keeps `queued_count`
//! equal to the sum of all FIFO lengths.

use crate::model::{Epoch, Rank, ShardId, Ticket};
use std::collections::{BTreeMap, VecDeque};

/// Outcome of a compare-and-pop on a rank's head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadRemoval {
    /// The head matched the expected ticket and was removed.
    Removed(Ticket),
    /// The head was absent or not the expected ticket; nothing changed.
    Mismatch,
}

/// Queue state of a single shard: per-rank FIFOs over an inclusive rank range.
#[derive(Debug, Clone)]
pub struct ShardQueue {
    shard_id: ShardId,
    range_start: Rank,
    range_end: Rank,
    epoch: Epoch,
    queues_by_rank: BTreeMap<Rank, VecDeque<Ticket>>,
    queued_count: usize,
}

impl ShardQueue {
    pub fn new(shard_id: ShardId, range_start: Rank, range_end: Rank, epoch: Epoch) -> Self {
        Self {
            shard_id,
            range_start,
            range_end,
            epoch,
            queues_by_rank: BTreeMap::new(),
            queued_count: 0,
        }
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn range_start(&self) -> Rank {
        self.range_start
    }

    pub fn range_end(&self) -> Rank {
        self.range_end
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn queued_count(&self) -> usize {
        self.queued_count
    }

    pub fn contains_rank(&self, rank: Rank) -> bool {
        rank >= self.range_start && rank <= self.range_end
    }

    /// Ordered iterator over ranks that currently hold at least one ticket.
    pub fn non_empty_ranks(&self) -> impl Iterator<Item = Rank> + '_ {
        self.queues_by_rank.keys().copied()
    }

    /// Ordered map access for the nearest-opponent scan.
    pub(crate) fn queues(&self) -> &BTreeMap<Rank, VecDeque<Ticket>> {
        &self.queues_by_rank
    }

    /// Append a ticket at the tail of its rank's FIFO.
    pub fn enqueue(&mut self, ticket: Ticket) {
        debug_assert!(self.contains_rank(ticket.rank));
        self.queues_by_rank
            .entry(ticket.rank)
            .or_default()
            .push_back(ticket);
        self.queued_count += 1;
    }

    /// Prepend a ticket at the head of its rank's FIFO.
    ///
    /// Used only for rollback after a failed match commit, so the requester
    /// keeps its original `enqueued_at_ms` and its place at the head.
    pub fn enqueue_front(&mut self, ticket: Ticket) {
        debug_assert!(self.contains_rank(ticket.rank));
        self.queues_by_rank
            .entry(ticket.rank)
            .or_default()
            .push_front(ticket);
        self.queued_count += 1;
    }

    /// Pop the head ticket of a rank, if any.
    pub fn dequeue_head(&mut self, rank: Rank) -> Option<Ticket> {
        let queue = self.queues_by_rank.get_mut(&rank)?;
        let ticket = queue.pop_front();
        if queue.is_empty() {
            self.queues_by_rank.remove(&rank);
        }
        if ticket.is_some() {
            self.queued_count -= 1;
        }
        ticket
    }

    pub fn peek_head(&self, rank: Rank) -> Option<&Ticket> {
        self.queues_by_rank.get(&rank).and_then(|q| q.front())
    }

    /// Compare-and-pop by full ticket tuple equality.
    ///
    /// This is the primitive that lets the immediate-match path and the tick
    /// path race for the same head without double-matching: whichever caller
    /// reaches the owning worker first removes the ticket, the other sees a
    /// mismatch.
    pub fn dequeue_head_if_matches(&mut self, rank: Rank, expected: &Ticket) -> HeadRemoval {
        match self.peek_head(rank) {
            Some(head) if head == expected => {
                let ticket = self.dequeue_head(rank).expect("head just observed");
                HeadRemoval::Removed(ticket)
            }
            _ => HeadRemoval::Mismatch,
        }
    }

    /// Peek the head of a rank, skipping the excluded user.
    ///
    /// If the head belongs to `exclude_user_id`, only the second element is
    /// considered; deeper entries are never inspected. Never mutates.
    pub fn peek_head_skipping_user(&self, rank: Rank, exclude_user_id: &str) -> Option<&Ticket> {
        let queue = self.queues_by_rank.get(&rank)?;
        let head = queue.front()?;
        if head.user_id == exclude_user_id {
            queue.get(1)
        } else {
            Some(head)
        }
    }

    /// Drain every queued ticket, emptying the state. Used when a worker is
    /// stopped so the claims of displaced tickets can be released.
    pub fn drain_all(&mut self) -> Vec<Ticket> {
        let mut drained = Vec::with_capacity(self.queued_count);
        for (_, mut queue) in std::mem::take(&mut self.queues_by_rank) {
            drained.extend(queue.drain(..));
        }
        self.queued_count = 0;
        drained
    }

    /// Structural invariant check, used by tests.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let mut total = 0;
        for (rank, queue) in &self.queues_by_rank {
            assert!(!queue.is_empty(), "empty FIFO left at rank {rank}");
            assert!(self.contains_rank(*rank), "rank {rank} outside shard range");
            total += queue.len();
        }
        assert_eq!(self.queued_count, total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard() -> ShardQueue {
        ShardQueue::new(ShardId::for_range(0, 999), 0, 999, 1)
    }

    fn ticket(user: &str, rank: Rank, at: u64) -> Ticket {
        Ticket::new(user, rank, at)
    }

    #[test]
    fn enqueue_dequeue_is_fifo_per_rank() {
        let mut queue = shard();
        queue.enqueue(ticket("u1", 100, 1));
        queue.enqueue(ticket("u2", 100, 2));
        queue.enqueue(ticket("u3", 200, 3));
        queue.assert_invariants();
        assert_eq!(queue.queued_count(), 3);

        assert_eq!(queue.dequeue_head(100).unwrap().user_id, "u1");
        assert_eq!(queue.dequeue_head(100).unwrap().user_id, "u2");
        assert_eq!(queue.dequeue_head(100), None);
        queue.assert_invariants();
        assert_eq!(queue.queued_count(), 1);
    }

    #[test]
    fn non_empty_ranks_tracks_fifo_occupancy() {
        let mut queue = shard();
        queue.enqueue(ticket("u1", 300, 1));
        queue.enqueue(ticket("u2", 100, 2));
        queue.enqueue(ticket("u3", 100, 3));
        assert_eq!(queue.non_empty_ranks().collect::<Vec<_>>(), vec![100, 300]);

        queue.dequeue_head(100);
        assert_eq!(queue.non_empty_ranks().collect::<Vec<_>>(), vec![100, 300]);
        queue.dequeue_head(100);
        assert_eq!(queue.non_empty_ranks().collect::<Vec<_>>(), vec![300]);
        queue.assert_invariants();
    }

    #[test]
    fn dequeue_head_if_matches_requires_full_tuple_equality() {
        let mut queue = shard();
        let queued = ticket("u1", 100, 10);
        queue.enqueue(queued.clone());

        // Same user and rank but different stamp is a different ticket.
        let stale = ticket("u1", 100, 9);
        assert_eq!(queue.dequeue_head_if_matches(100, &stale), HeadRemoval::Mismatch);
        assert_eq!(queue.queued_count(), 1);

        assert_eq!(
            queue.dequeue_head_if_matches(100, &queued),
            HeadRemoval::Removed(queued)
        );
        assert_eq!(queue.queued_count(), 0);
        queue.assert_invariants();
    }

    #[test]
    fn dequeue_head_if_matches_only_sees_the_head() {
        let mut queue = shard();
        let first = ticket("u1", 100, 1);
        let second = ticket("u2", 100, 2);
        queue.enqueue(first.clone());
        queue.enqueue(second.clone());

        // The second ticket is queued but not at the head.
        assert_eq!(queue.dequeue_head_if_matches(100, &second), HeadRemoval::Mismatch);
        assert_eq!(
            queue.dequeue_head_if_matches(100, &first),
            HeadRemoval::Removed(first)
        );
        assert_eq!(
            queue.dequeue_head_if_matches(100, &second),
            HeadRemoval::Removed(second)
        );
    }

    #[test]
    fn enqueue_front_restores_head_position_and_stamp() {
        let mut queue = shard();
        let requester = ticket("u1", 100, 5);
        queue.enqueue(requester.clone());
        queue.enqueue(ticket("u2", 100, 6));

        let removed = queue.dequeue_head(100).unwrap();
        assert_eq!(removed, requester);

        queue.enqueue_front(removed);
        assert_eq!(queue.peek_head(100), Some(&requester));
        assert_eq!(queue.peek_head(100).unwrap().enqueued_at_ms, 5);
        queue.assert_invariants();
    }

    #[test]
    fn peek_head_skipping_user_looks_one_deep_only() {
        let mut queue = shard();
        queue.enqueue(ticket("u1", 100, 1));
        assert_eq!(queue.peek_head_skipping_user(100, "u1"), None);

        queue.enqueue(ticket("u2", 100, 2));
        assert_eq!(
            queue.peek_head_skipping_user(100, "u1").unwrap().user_id,
            "u2"
        );
        // Head is not excluded: second element is irrelevant.
        assert_eq!(
            queue.peek_head_skipping_user(100, "u2").unwrap().user_id,
            "u1"
        );
        assert_eq!(queue.peek_head_skipping_user(100, "u3").unwrap().user_id, "u1");
    }

    #[test]
    fn drain_all_empties_state_and_returns_every_ticket() {
        let mut queue = shard();
        queue.enqueue(ticket("u1", 100, 1));
        queue.enqueue(ticket("u2", 100, 2));
        queue.enqueue(ticket("u3", 500, 3));

        let mut drained = queue.drain_all();
        drained.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        assert_eq!(drained.len(), 3);
        assert_eq!(queue.queued_count(), 0);
        assert_eq!(queue.non_empty_ranks().count(), 0);
        queue.assert_invariants();
    }
}
