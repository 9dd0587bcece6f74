//! # Local Subscription Table
//!
//! Node-local registry of active subscriptions. Each subscription is a
//! set of AND/OR topic groups plus a delivery channel; the table derives
//! the node's aggregate interest filter as the union of all active
//! subscriptions' filters.
//!
//! The aggregate is recomputed lazily at the next interest-advertisement
//! tick rather than per mutation, which bounds update amplification when
//! subscriptions churn faster than the advertisement interval.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::debug;

use crate::bloom::BloomFilter;
use crate::error::MeshError;
use crate::topics::{Topic, TopicMatcher};

/// Handle identifying one active subscription.
pub type SubscriptionId = u64;

/// Per-subscription delivery queue depth. A subscriber that stops
/// draining its channel loses messages rather than stalling the loop.
pub const SUBSCRIPTION_QUEUE_DEPTH: usize = 256;

/// A publication delivered to a matching subscription.
#[derive(Clone, Debug)]
pub struct MatchedPublication {
    /// Identity of the originating publisher.
    pub publisher: [u8; 16],
    /// Publisher-local sequence number.
    pub sequence: u64,
    /// Topic strings the publication carries.
    pub topics: Vec<String>,
    /// Opaque payload, decrypted if the publication was sealed.
    pub payload: Vec<u8>,
    /// True if the publisher asked for an acknowledgment.
    pub ack_requested: bool,
}

struct Subscription {
    groups: Vec<Vec<Topic>>,
    filter: BloomFilter,
    sender: mpsc::Sender<MatchedPublication>,
}

/// Registry of the node's active subscriptions. Owned and mutated only
/// by the node actor.
pub struct SubscriptionTable {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    next_id: SubscriptionId,
    aggregate: BloomFilter,
    dirty: bool,
}

impl SubscriptionTable {
    pub fn new(matcher: &TopicMatcher) -> Self {
        Self {
            subscriptions: HashMap::new(),
            next_id: 1,
            aggregate: BloomFilter::new(matcher.params()),
            dirty: false,
        }
    }

    /// Register a subscription. Returns its handle and keeps the
    /// delivery sender; the receiver side belongs to the subscriber.
    pub fn add(
        &mut self,
        groups: Vec<Vec<Topic>>,
        sender: mpsc::Sender<MatchedPublication>,
        matcher: &TopicMatcher,
    ) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        let filter = matcher.interest_filter(&groups);
        self.subscriptions.insert(
            id,
            Subscription {
                groups,
                filter,
                sender,
            },
        );
        self.dirty = true;
        id
    }

    /// Remove a subscription by handle.
    pub fn remove(&mut self, id: SubscriptionId) -> Result<(), MeshError> {
        match self.subscriptions.remove(&id) {
            Some(_) => {
                self.dirty = true;
                Ok(())
            }
            None => Err(MeshError::NotFound),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// True if a mutation happened since the last aggregate recompute.
    #[cfg(test)]
    pub fn interests_changed(&self) -> bool {
        self.dirty
    }

    /// The aggregate interest filter, recomputed if stale. Called from
    /// the interest-advertisement tick.
    pub fn aggregate(&mut self, matcher: &TopicMatcher) -> &BloomFilter {
        if self.dirty {
            let mut aggregate = BloomFilter::new(matcher.params());
            for sub in self.subscriptions.values() {
                aggregate = aggregate.union(&sub.filter);
            }
            self.aggregate = aggregate;
            self.dirty = false;
        }
        &self.aggregate
    }

    /// Subscriptions whose AND/OR groups match the publication's topic
    /// filter. Order across subscriptions is unspecified.
    pub fn local_matches(
        &self,
        publication_filter: &BloomFilter,
        matcher: &TopicMatcher,
    ) -> Vec<SubscriptionId> {
        self.subscriptions
            .iter()
            .filter(|(_, sub)| matcher.matches(&sub.groups, publication_filter))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Deliver a matched publication to one subscription. A full queue
    /// drops the message for that subscriber only.
    pub fn deliver(&self, id: SubscriptionId, publication: MatchedPublication) {
        if let Some(sub) = self.subscriptions.get(&id) {
            if sub.sender.try_send(publication).is_err() {
                debug!(subscription = id, "subscriber queue full, dropping delivery");
            }
        }
    }
}
