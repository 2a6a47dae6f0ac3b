//! Best-effort match notification sink.
//!
//! Subscribers register per user_id; a finalized match is fanned out to the
//! subscribers of both participants. Delivery is fire-and-forget: a full or
//! closed subscriber buffer drops the notification for that subscriber only,
//! and duplicates are possible under upstream retry. No acknowledgement.

use crate::model::{MatchNotification, Ticket};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const SUBSCRIBER_BUFFER: usize = 32;

#[derive(Debug, Default)]
pub struct MatchPublisher {
    subscribers: DashMap<String, Vec<mpsc::Sender<MatchNotification>>>,
}

impl MatchPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream of match notifications involving `user_id`.
    ///
    /// A subscriber that stops polling is pruned on the next publish to that
    /// user; a subscriber that polls too slowly misses notifications.
    pub fn subscribe(&self, user_id: &str) -> ReceiverStream<MatchNotification> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .entry(user_id.to_string())
            .or_default()
            .push(tx);
        ReceiverStream::new(rx)
    }

    /// Deliver the match payload to the subscribers of both participants.
    pub fn publish_match(&self, ticket_a: &Ticket, ticket_b: &Ticket) {
        let notification = MatchNotification::from_tickets(ticket_a, ticket_b);
        for user in [&ticket_a.user_id, &ticket_b.user_id] {
            self.notify(user, &notification);
        }
    }

    fn notify(&self, user_id: &str, notification: &MatchNotification) {
        let Some(mut entry) = self.subscribers.get_mut(user_id) else {
            tracing::trace!(user_id, "no subscribers for match participant");
            return;
        };
        entry.retain(|tx| match tx.try_send(notification.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(user_id, "subscriber buffer full, dropping notification");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Number of live subscriber channels for a user, for tests.
    pub fn subscriber_count(&self, user_id: &str) -> usize {
        self.subscribers
            .get(user_id)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }
}
