//! Closest-rank opponent search over a shard queue.
//!
//! The search walks the non-empty-rank index outward from the requester's
//! rank, alternating between the nearer of the two frontiers, peeking only
//! FIFO heads (one element deeper when the head is the excluded user). The
//! candidate ordering is a strict total order; every selector in the system
//! uses it, so matches are reproducible under permutation of insertion order.

use crate::model::{Rank, Ticket};
use crate::queue::{HeadRemoval, ShardQueue};
use std::cmp::Ordering;
use std::ops::Bound;

/// Strict total order over candidate opponents for a given requester rank.
///
/// `Less` means "better": smaller rank distance first, then older enqueue,
/// then lower rank, then lexicographically smaller user_id.
pub fn candidate_cmp(a: &Ticket, b: &Ticket, requester_rank: Rank) -> Ordering {
    let diff_a = a.rank.abs_diff(requester_rank);
    let diff_b = b.rank.abs_diff(requester_rank);
    diff_a
        .cmp(&diff_b)
        .then_with(|| a.enqueued_at_ms.cmp(&b.enqueued_at_ms))
        .then_with(|| a.rank.cmp(&b.rank))
        .then_with(|| a.user_id.cmp(&b.user_id))
}

/// Find the best opponent for `(requester_rank, allowed_diff)` excluding
/// `exclude_user_id`, inspecting at most `max_scan_ranks` distinct ranks.
///
/// Never mutates; the caller must follow up with an atomic
/// [`take_best_opponent`] to claim the ticket.
pub fn peek_best_opponent(
    state: &ShardQueue,
    requester_rank: Rank,
    allowed_diff: u32,
    exclude_user_id: &str,
    max_scan_ranks: u32,
) -> Option<Ticket> {
    let mut lower = state
        .queues()
        .range(..=requester_rank)
        .rev()
        .map(|(rank, _)| *rank)
        .peekable();
    let mut upper = state
        .queues()
        .range((Bound::Excluded(requester_rank), Bound::Unbounded))
        .map(|(rank, _)| *rank)
        .peekable();

    let mut best: Option<Ticket> = None;
    let mut scanned = 0u32;

    while scanned < max_scan_ranks {
        let lower_diff = lower.peek().map(|rank| requester_rank - *rank);
        let upper_diff = upper.peek().map(|rank| *rank - requester_rank);

        // A frontier stops once it leaves the allowed window; ranks only get
        // farther from here on.
        let lower_live = lower_diff.is_some_and(|diff| diff <= allowed_diff);
        let upper_live = upper_diff.is_some_and(|diff| diff <= allowed_diff);

        let take_lower = match (lower_live, upper_live) {
            (false, false) => break,
            (true, false) => true,
            (false, true) => false,
            // Equidistant goes left first; the full comparator decides anyway.
            (true, true) => lower_diff <= upper_diff,
        };
        let rank = if take_lower {
            lower.next().expect("live lower frontier")
        } else {
            upper.next().expect("live upper frontier")
        };
        scanned += 1;
        let diff = rank.abs_diff(requester_rank);

        // We always advance the nearer frontier, so once the chosen rank is
        // strictly farther than the best's distance, nothing can beat it.
        if let Some(current) = &best {
            if diff > current.rank.abs_diff(requester_rank) {
                break;
            }
        }

        if let Some(candidate) = state.peek_head_skipping_user(rank, exclude_user_id) {
            if diff == 0 {
                // Distance zero is minimal; the search terminates.
                return Some(candidate.clone());
            }
            let better = match &best {
                None => true,
                Some(current) => candidate_cmp(candidate, current, requester_rank) == Ordering::Less,
            };
            if better {
                best = Some(candidate.clone());
            }
        }
    }

    best
}

/// Atomically remove a previously peeked opponent. Returns `false` when
/// another decision path claimed the head first.
pub fn take_best_opponent(state: &mut ShardQueue, opponent: &Ticket) -> bool {
    matches!(
        state.dequeue_head_if_matches(opponent.rank, opponent),
        HeadRemoval::Removed(_)
    )
}
