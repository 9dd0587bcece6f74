//! # Acknowledgment Return Path
//!
//! Correlates ack requests with the publication that asked for them and
//! returns acks along the reverse path: the link a publication last
//! arrived on, or directly to the local publisher for self-published
//! publications.
//!
//! Acks are unicast, never flooded. An ack for a publication with no
//! pending request is dropped silently; that is a stale or duplicate
//! ack, not an error. At-most-one ack per requester is expected but not
//! enforced here.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::debug;

use crate::link::LinkId;
use crate::wire::PublisherId;

/// How long a pending ack request outlives its publication's arrival.
/// Matches the dedup retention so neither side resurrects stale state.
pub const ACK_RETENTION: Duration = Duration::from_secs(60);

/// Bound on simultaneously pending ack requests.
pub const MAX_PENDING_ACKS: usize = 4096;

/// Where an ack for a given publication must be sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReversePath {
    /// The publication was published by this node; deliver the ack to
    /// the local ack stream.
    Local,
    /// The publication arrived over this link; unicast the ack back.
    Link(LinkId, SocketAddr),
}

/// An acknowledgment delivered to the local publisher.
#[derive(Clone, Debug)]
pub struct ReceivedAck {
    pub publisher: PublisherId,
    pub sequence: u64,
    pub payload: Vec<u8>,
}

/// Pending ack-request table. Owned and mutated only by the node actor.
pub struct AckChannel {
    pending: HashMap<(PublisherId, u64), (ReversePath, Instant)>,
    retention: Duration,
    local: mpsc::Sender<ReceivedAck>,
}

impl AckChannel {
    pub fn new(local: mpsc::Sender<ReceivedAck>) -> Self {
        Self {
            pending: HashMap::new(),
            retention: ACK_RETENTION,
            local,
        }
    }

    /// Record the reverse path for a publication that requested an ack.
    /// Re-arrival over a different link refreshes the path; the latest
    /// arrival is the one the requester is reachable through.
    pub fn register(&mut self, publisher: PublisherId, sequence: u64, path: ReversePath) {
        if self.pending.len() >= MAX_PENDING_ACKS
            && !self.pending.contains_key(&(publisher, sequence))
        {
            debug!("pending ack table full, dropping ack request");
            return;
        }
        self.pending
            .insert((publisher, sequence), (path, Instant::now()));
    }

    /// Reverse path for a publication, if an ack request is pending.
    pub fn reverse_path(&self, publisher: PublisherId, sequence: u64) -> Option<&ReversePath> {
        self.pending.get(&(publisher, sequence)).map(|(path, _)| path)
    }

    /// Hand an ack to the local publisher's ack stream.
    pub fn deliver_local(&self, ack: ReceivedAck) {
        if self.local.try_send(ack).is_err() {
            debug!("local ack stream full or gone, dropping ack");
        }
    }

    /// Forget a link's reverse paths when the link goes away. Acks that
    /// can no longer be routed are dropped at the source instead.
    pub fn remove_link(&mut self, link: LinkId) {
        self.pending
            .retain(|_, (path, _)| !matches!(path, ReversePath::Link(id, _) if *id == link));
    }

    /// Evict entries older than the retention window.
    pub fn sweep(&mut self) {
        let retention = self.retention;
        self.pending
            .retain(|_, (_, created)| created.elapsed() <= retention);
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
