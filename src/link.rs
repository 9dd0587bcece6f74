//! # Neighbor Link Management
//!
//! Maintains the set of mesh edges. Each link walks the state machine
//! `Connecting → Established → Closing → Closed`; only Established
//! links participate in routing. A link owns the neighbor's address,
//! its most-recently-received aggregate interest filter, and an
//! advisory mesh identifier used to spot redundant flood paths.
//!
//! Mesh ids are loop hints, not identities: a mesh-id change on a live
//! link is logged and stored, never treated as an error.
//!
//! Interest updates flow both ways. Inbound updates replace the stored
//! neighbor filter; outbound advertisement skips any neighbor from
//! which an identical filter was just received, which stops two nodes
//! with the same interests from ping-ponging updates forever.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::RngCore;
use tracing::{debug, trace};

use crate::bloom::BloomFilter;
use crate::error::MeshError;
use crate::wire::MeshId;

/// Handle identifying one link.
pub type LinkId = u64;

/// Give up on a connection attempt after this long without an accept.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum number of simultaneous links.
/// Bounds per-node routing state.
pub const MAX_LINKS: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Established,
    Closing,
    Closed,
}

/// One mesh edge.
pub struct Link {
    pub addr: SocketAddr,
    pub state: LinkState,
    /// Most recent aggregate interest filter received from the neighbor.
    /// Summarizes the neighbor and everything behind it.
    pub remote_interests: Option<BloomFilter>,
    /// The filter we last advertised to this neighbor.
    pub advertised: Option<BloomFilter>,
    /// Advisory mesh id last reported by the neighbor.
    pub remote_mesh_id: Option<MeshId>,
    /// True for links we initiated (outbound).
    pub outbound: bool,
    created: Instant,
}

/// The node's neighbor set. Owned and mutated only by the node actor.
pub struct LinkManager {
    links: HashMap<LinkId, Link>,
    by_addr: HashMap<SocketAddr, LinkId>,
    next_id: LinkId,
    mesh_id: MeshId,
}

impl LinkManager {
    pub fn new() -> Self {
        let mut mesh_id = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut mesh_id);
        Self {
            links: HashMap::new(),
            by_addr: HashMap::new(),
            next_id: 1,
            mesh_id,
        }
    }

    /// This node's mesh id, advertised on every link.
    pub fn mesh_id(&self) -> MeshId {
        self.mesh_id
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn get(&self, id: LinkId) -> Option<&Link> {
        self.links.get(&id)
    }

    pub fn id_for_addr(&self, addr: &SocketAddr) -> Option<LinkId> {
        self.by_addr.get(addr).copied()
    }

    fn insert(&mut self, addr: SocketAddr, state: LinkState, outbound: bool) -> Result<LinkId, MeshError> {
        if self.links.len() >= MAX_LINKS {
            return Err(MeshError::Resource);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.links.insert(
            id,
            Link {
                addr,
                state,
                remote_interests: None,
                advertised: None,
                remote_mesh_id: None,
                outbound,
                created: Instant::now(),
            },
        );
        self.by_addr.insert(addr, id);
        Ok(id)
    }

    /// Begin an outbound connection attempt. The link sits in
    /// `Connecting` until the neighbor's accept arrives.
    pub fn link_to(&mut self, addr: SocketAddr) -> Result<LinkId, MeshError> {
        if let Some(existing) = self.id_for_addr(&addr) {
            return Ok(existing);
        }
        self.insert(addr, LinkState::Connecting, true)
    }

    /// Accept an inbound link request. Inbound links are Established
    /// immediately; the accept datagram we send completes the peer side.
    pub fn accept_inbound(&mut self, addr: SocketAddr, mesh_id: MeshId) -> Result<LinkId, MeshError> {
        let id = match self.id_for_addr(&addr) {
            Some(id) => id,
            None => self.insert(addr, LinkState::Established, false)?,
        };
        let link = self.links.get_mut(&id).expect("just inserted");
        link.state = LinkState::Established;
        link.remote_mesh_id = Some(mesh_id);
        Ok(id)
    }

    /// Complete an outbound attempt: the neighbor accepted.
    /// Returns the link id if a Connecting link existed for the address.
    pub fn on_accept(&mut self, addr: SocketAddr, mesh_id: MeshId) -> Option<LinkId> {
        let id = self.id_for_addr(&addr)?;
        let link = self.links.get_mut(&id)?;
        if link.state == LinkState::Connecting {
            link.state = LinkState::Established;
        }
        link.remote_mesh_id = Some(mesh_id);
        Some(id)
    }

    /// Replace a neighbor's stored interest filter.
    ///
    /// A mesh-id change for the same physical path is not an error;
    /// mesh ids are advisory loop hints only.
    pub fn update_remote_interest(
        &mut self,
        id: LinkId,
        filter: BloomFilter,
        mesh_id: MeshId,
    ) -> Result<(), MeshError> {
        let link = self.links.get_mut(&id).ok_or(MeshError::NotFound)?;
        if let Some(previous) = link.remote_mesh_id {
            if previous != mesh_id {
                debug!(link = id, "neighbor mesh id changed");
            }
        }
        link.remote_mesh_id = Some(mesh_id);
        link.remote_interests = Some(filter);
        trace!(link = id, "remote interests updated");
        Ok(())
    }

    /// Established neighbors whose stored interests admit the
    /// publication filter, excluding the arrival link. A neighbor that
    /// has not yet advertised interests is included: unknown interests
    /// must not cause missed delivery.
    pub fn forward_targets(
        &self,
        publication_filter: &BloomFilter,
        exclude: Option<LinkId>,
    ) -> Vec<(LinkId, SocketAddr)> {
        self.links
            .iter()
            .filter(|(id, link)| {
                link.state == LinkState::Established
                    && Some(**id) != exclude
                    && match &link.remote_interests {
                        Some(interests) => interests.intersects(publication_filter),
                        None => true,
                    }
            })
            .map(|(id, link)| (*id, link.addr))
            .collect()
    }

    /// The interest filter to advertise to `target`: the union of the
    /// local aggregate and every other Established neighbor's filter.
    /// Interests propagate transitively through the mesh this way; the
    /// target's own filter is excluded (split horizon) so a neighbor is
    /// not told about interests it supplied itself.
    pub fn interests_for(&self, target: LinkId, local: &BloomFilter) -> BloomFilter {
        let mut aggregate = local.clone();
        for (id, link) in &self.links {
            if *id == target || link.state != LinkState::Established {
                continue;
            }
            if let Some(remote) = &link.remote_interests {
                aggregate = aggregate.union(remote);
            }
        }
        aggregate
    }

    /// Remember the filter last advertised to a neighbor, so unchanged
    /// interests are not resent every tick.
    pub fn record_advertised(&mut self, id: LinkId, filter: BloomFilter) {
        if let Some(link) = self.links.get_mut(&id) {
            link.advertised = Some(filter);
        }
    }

    /// All Established neighbors.
    pub fn established(&self) -> Vec<(LinkId, SocketAddr)> {
        self.links
            .iter()
            .filter(|(_, link)| link.state == LinkState::Established)
            .map(|(id, link)| (*id, link.addr))
            .collect()
    }

    /// Mark a link Closing. It stops participating in routing while a
    /// farewell message is in flight; `remove` finishes the close.
    pub fn begin_close(&mut self, id: LinkId) -> Result<SocketAddr, MeshError> {
        let link = self.links.get_mut(&id).ok_or(MeshError::NotFound)?;
        link.state = LinkState::Closing;
        Ok(link.addr)
    }

    /// Remove a link (explicit unlink or transport failure). The link
    /// reaches Closed and leaves the routing tables; already-routed
    /// publications stay delivered.
    pub fn remove(&mut self, id: LinkId) -> Result<SocketAddr, MeshError> {
        let mut link = self.links.remove(&id).ok_or(MeshError::NotFound)?;
        self.by_addr.remove(&link.addr);
        link.state = LinkState::Closed;
        debug!(
            link = id,
            addr = %link.addr,
            outbound = link.outbound,
            state = ?link.state,
            "link closed"
        );
        Ok(link.addr)
    }

    /// Expire Connecting links older than the connect timeout. Returns
    /// the expired ids so pending callers can be failed.
    pub fn expire_connecting(&mut self, timeout: Duration) -> Vec<(LinkId, SocketAddr)> {
        let expired: Vec<(LinkId, SocketAddr)> = self
            .links
            .iter()
            .filter(|(_, link)| {
                link.state == LinkState::Connecting && link.created.elapsed() > timeout
            })
            .map(|(id, link)| (*id, link.addr))
            .collect();
        for (id, _) in &expired {
            let _ = self.remove(*id);
        }
        expired
    }
}

impl Default for LinkManager {
    fn default() -> Self {
        Self::new()
    }
}
