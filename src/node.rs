//! # High-Level Node API
//!
//! A [`Node`] combines the mesh components (links, router,
//! subscriptions, acks, secure envelope, transport) behind a single
//! handle.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind("0.0.0.0:0").await?;
//!
//! // Join the mesh explicitly, or enable multicast discovery.
//! node.link_to("192.168.1.20:7000".parse()?).await?;
//!
//! // Subscribe to a topic group and receive matching publications.
//! let (_id, mut rx) = node.subscribe(&["a.b", "c"]).await?;
//! node.publish(&["a.b", "c"], b"hello".to_vec(), 16, false).await?;
//! while let Some(m) = rx.recv().await {
//!     println!("matched: {:?}", m.topics);
//! }
//! ```
//!
//! ## Execution Model
//!
//! All protocol state lives in a single actor task; the `Node` handle
//! is cheap to clone and submits commands over a channel. Commands from
//! one caller are executed in submission order; timers (interest
//! advertisement, dedup and ack sweeps, connect timeouts) are
//! multiplexed into the same loop and never preempt an in-progress
//! operation. The only blocking point exposed to callers is awaiting a
//! command's completion signal.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, trace, warn};

use crate::ack::{AckChannel, ReceivedAck};
use crate::bloom::{BloomFilter, FilterParams};
use crate::buffer::RxBuffer;
use crate::envelope::{AllowAll, KeyId, KeyStore, MemoryKeyStore, PermissionStore, SecureEnvelope};
use crate::error::MeshError;
use crate::link::{LinkId, LinkManager, CONNECT_TIMEOUT};
use crate::router::{Outbound, PublicationHandle, PublicationRouter, DEFAULT_TTL};
use crate::subscription::{
    MatchedPublication, SubscriptionId, SubscriptionTable, SUBSCRIPTION_QUEUE_DEPTH,
};
use crate::topics::{TopicMatcher, DEFAULT_SEPARATORS};
use crate::transport::{Datagram, Transport, UdpTransport};
use crate::wire::{
    decode_message, encode_message, MeshMessage, PublisherId, SubscriptionUpdate,
    SUB_FLAG_SYNC_REQUEST, SUB_FLAG_UNLINK,
};

/// Interval between interest-advertisement ticks.
pub const ADVERTISE_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between maintenance sweeps (dedup aging, ack aging,
/// connect timeouts).
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Depth of the command channel between handles and the actor.
const COMMAND_QUEUE_DEPTH: usize = 256;

/// Depth of the local ack stream.
const ACK_QUEUE_DEPTH: usize = 64;

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = Mutex<Option<mpsc::Receiver<T>>>;

// ============================================================================
// Configuration
// ============================================================================

/// Node configuration, fixed at construction.
#[derive(Clone)]
pub struct MeshConfig {
    /// Characters accepted as topic segment separators.
    pub separators: String,
    /// Bloom filter sizing; must match across the mesh.
    pub filter: FilterParams,
    /// Hierarchical prefix matching (a subscription to `a.b` matches a
    /// publication of `a.b.c`). Exact-segment semantics when false.
    pub prefix_matching: bool,
    /// Key id to seal outbound publications under. None sends plaintext.
    pub key_id: Option<KeyId>,
    /// Embed a signer identity in sealed messages.
    pub sign: bool,
    /// Automatically link to nodes heard via multicast discovery.
    pub auto_link_discovered: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            separators: DEFAULT_SEPARATORS.to_string(),
            filter: FilterParams::default(),
            prefix_matching: true,
            key_id: None,
            sign: false,
            auto_link_discovered: true,
        }
    }
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

type SubscribeReply = Result<(SubscriptionId, mpsc::Receiver<MatchedPublication>), MeshError>;

enum Command {
    Subscribe(Vec<String>, oneshot::Sender<SubscribeReply>),
    Unsubscribe(SubscriptionId, oneshot::Sender<Result<(), MeshError>>),
    Publish {
        topics: Vec<String>,
        payload: Vec<u8>,
        ttl: i16,
        ack_requested: bool,
        reply: oneshot::Sender<Result<PublicationHandle, MeshError>>,
    },
    Ack {
        publisher: PublisherId,
        sequence: u64,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    LinkTo(SocketAddr, oneshot::Sender<Result<LinkId, MeshError>>),
    Unlink(LinkId, oneshot::Sender<Result<(), MeshError>>),
    EnableDiscovery(oneshot::Sender<Result<(), MeshError>>),
    Shutdown(oneshot::Sender<()>),
}

// ============================================================================
// Node Handle (public API, cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct Node {
    cmd_tx: mpsc::Sender<Command>,
    local_addr: SocketAddr,
    publisher_id: PublisherId,
    ack_receiver: Arc<TakeOnce<ReceivedAck>>,
}

impl Node {
    /// Start a node with default configuration and an open trust model.
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::start(
            addr,
            MeshConfig::default(),
            Arc::new(MemoryKeyStore::new()),
            Arc::new(AllowAll),
        )
        .await
    }

    /// Start a node. Bind failure is fatal: the error is returned and
    /// no partial node state is left running.
    pub async fn start(
        addr: &str,
        config: MeshConfig,
        keys: Arc<dyn KeyStore>,
        permissions: Arc<dyn PermissionStore>,
    ) -> Result<Self> {
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;
        let (transport, events) = UdpTransport::bind(addr)
            .await
            .context("failed to bind mesh transport")?;
        let local_addr = transport.local_addr().context("failed to get local address")?;

        let matcher = TopicMatcher::new(config.filter, &config.separators, config.prefix_matching);
        let router = PublicationRouter::new(matcher.clone());
        let publisher_id = router.publisher_id();
        let subscriptions = SubscriptionTable::new(&matcher);
        let links = LinkManager::new();

        let (ack_tx, ack_rx) = mpsc::channel(ACK_QUEUE_DEPTH);
        let acks = AckChannel::new(ack_tx);

        let signer = config.sign.then(SecureEnvelope::generate_signer);
        let envelope = SecureEnvelope::new(config.key_id, signer);

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        let actor = NodeActor {
            transport,
            matcher,
            router,
            subscriptions,
            links,
            acks,
            envelope,
            keys,
            permissions,
            config,
            local_port: local_addr.port(),
            pending_links: HashMap::new(),
        };
        tokio::spawn(actor.run(cmd_rx, events));

        info!("node {} publisher {}", local_addr, hex::encode(publisher_id));

        Ok(Self {
            cmd_tx,
            local_addr,
            publisher_id,
            ack_receiver: Arc::new(Mutex::new(Some(ack_rx))),
        })
    }

    async fn command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, MeshError>>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| anyhow::anyhow!("node actor closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("node actor closed"))?
            .map_err(Into::into)
    }

    /// Register a subscription for one AND/OR topic group list. Topics
    /// are AND-combined; a `|` entry splits the list into independent
    /// OR-groups. Returns the handle and the delivery stream.
    pub async fn subscribe(
        &self,
        topics: &[&str],
    ) -> Result<(SubscriptionId, mpsc::Receiver<MatchedPublication>)> {
        let topics: Vec<String> = topics.iter().map(|s| s.to_string()).collect();
        self.command(|tx| Command::Subscribe(topics, tx)).await
    }

    /// Remove a subscription. Takes effect at the next loop iteration;
    /// deliveries already dispatched are not recalled.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.command(|tx| Command::Unsubscribe(id, tx)).await
    }

    /// Publish a publication into the mesh.
    pub async fn publish(
        &self,
        topics: &[&str],
        payload: Vec<u8>,
        ttl: i16,
        ack_requested: bool,
    ) -> Result<PublicationHandle> {
        let topics: Vec<String> = topics.iter().map(|s| s.to_string()).collect();
        self.command(|tx| Command::Publish {
            topics,
            payload,
            ttl,
            ack_requested,
            reply: tx,
        })
        .await
    }

    /// Acknowledge a received publication back to its publisher.
    pub async fn ack(&self, publication: &MatchedPublication, payload: Vec<u8>) -> Result<()> {
        self.command(|tx| Command::Ack {
            publisher: publication.publisher,
            sequence: publication.sequence,
            payload,
            reply: tx,
        })
        .await
    }

    /// Acks returned for this node's ack-requested publications.
    /// The stream can be taken once.
    pub async fn acks(&self) -> Result<mpsc::Receiver<ReceivedAck>> {
        self.ack_receiver
            .lock()
            .await
            .take()
            .context("ack receiver already taken")
    }

    /// Link to another node. Resolves once the link is Established or
    /// fails with a transport error; a failed attempt never reaches
    /// Established.
    pub async fn link_to(&self, addr: SocketAddr) -> Result<LinkId> {
        self.command(|tx| Command::LinkTo(addr, tx)).await
    }

    /// Drop a link. The neighbor is notified and removed from routing.
    pub async fn unlink(&self, link: LinkId) -> Result<()> {
        self.command(|tx| Command::Unlink(link, tx)).await
    }

    /// Join the local-network discovery group and start beaconing.
    pub async fn enable_discovery(&self) -> Result<()> {
        self.command(Command::EnableDiscovery).await
    }

    /// Tear the node down: drain pending work, notify and close all
    /// links, then resolve. Returns only after the actor has stopped;
    /// that is the safe point to release node resources.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown(tx))
            .await
            .map_err(|_| anyhow::anyhow!("node actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("node actor closed"))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// This node's publisher identity, hex-encoded.
    pub fn publisher_id(&self) -> String {
        hex::encode(self.publisher_id)
    }
}

// ============================================================================
// Node Actor (owns all mutable protocol state)
// ============================================================================

struct NodeActor {
    transport: Arc<UdpTransport>,
    matcher: TopicMatcher,
    router: PublicationRouter,
    subscriptions: SubscriptionTable,
    links: LinkManager,
    acks: AckChannel,
    envelope: SecureEnvelope,
    keys: Arc<dyn KeyStore>,
    permissions: Arc<dyn PermissionStore>,
    config: MeshConfig,
    local_port: u16,
    /// Callers awaiting link establishment, by neighbor address.
    pending_links: HashMap<SocketAddr, Vec<oneshot::Sender<Result<LinkId, MeshError>>>>,
}

impl NodeActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, mut events: mpsc::Receiver<Datagram>) {
        let mut advertise = tokio::time::interval(ADVERTISE_INTERVAL);
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Subscribe(topics, reply)) => {
                            let _ = reply.send(self.handle_subscribe(&topics));
                        }
                        Some(Command::Unsubscribe(id, reply)) => {
                            let _ = reply.send(self.subscriptions.remove(id));
                        }
                        Some(Command::Publish { topics, payload, ttl, ack_requested, reply }) => {
                            let result = self.handle_publish(&topics, payload, ttl, ack_requested).await;
                            let _ = reply.send(result);
                        }
                        Some(Command::Ack { publisher, sequence, payload, reply }) => {
                            let result = self.handle_ack(publisher, sequence, payload).await;
                            let _ = reply.send(result);
                        }
                        Some(Command::LinkTo(addr, reply)) => {
                            self.handle_link_to(addr, reply).await;
                        }
                        Some(Command::Unlink(link, reply)) => {
                            let _ = reply.send(self.handle_unlink(link).await);
                        }
                        Some(Command::EnableDiscovery(reply)) => {
                            let _ = reply.send(self.handle_enable_discovery().await);
                        }
                        Some(Command::Shutdown(reply)) => {
                            self.teardown().await;
                            let _ = reply.send(());
                            break;
                        }
                        None => {
                            debug!("all node handles dropped, actor quitting");
                            self.teardown().await;
                            break;
                        }
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(datagram) => self.on_datagram(datagram).await,
                        None => {
                            warn!("transport event channel closed");
                            break;
                        }
                    }
                }
                _ = advertise.tick() => {
                    self.advertise_local_interest().await;
                }
                _ = sweep.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Command handling
    // ------------------------------------------------------------------

    fn handle_subscribe(&mut self, topics: &[String]) -> SubscribeReply {
        let groups = TopicMatcher::split_groups(topics);
        if groups.is_empty() {
            return Err(MeshError::Protocol("subscription carries no topics".into()));
        }
        let mut canonical = Vec::with_capacity(groups.len());
        for group in &groups {
            canonical.push(self.matcher.topics(group)?);
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_DEPTH);
        let id = self.subscriptions.add(canonical, tx, &self.matcher);
        Ok((id, rx))
    }

    async fn handle_publish(
        &mut self,
        topics: &[String],
        payload: Vec<u8>,
        ttl: i16,
        ack_requested: bool,
    ) -> Result<PublicationHandle, MeshError> {
        // Negative means "use the default"; zero is a valid local-only
        // publication.
        let ttl = if ttl < 0 { DEFAULT_TTL } else { ttl };
        let (handle, outbound) = self.router.publish(
            topics,
            payload,
            ttl,
            ack_requested,
            &self.envelope,
            self.keys.as_ref(),
            &self.subscriptions,
            &self.links,
            &mut self.acks,
        )?;
        self.transmit(outbound).await;
        Ok(handle)
    }

    async fn handle_ack(
        &mut self,
        publisher: PublisherId,
        sequence: u64,
        payload: Vec<u8>,
    ) -> Result<(), MeshError> {
        let outbound = self.router.send_ack(
            publisher,
            sequence,
            payload,
            &self.envelope,
            self.keys.as_ref(),
            &self.acks,
        )?;
        if let Some(out) = outbound {
            self.transmit(vec![out]).await;
        }
        Ok(())
    }

    async fn handle_link_to(
        &mut self,
        addr: SocketAddr,
        reply: oneshot::Sender<Result<LinkId, MeshError>>,
    ) {
        let id = match self.links.link_to(addr) {
            Ok(id) => id,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        if let Some(link) = self.links.get(id) {
            if link.state == crate::link::LinkState::Established {
                let _ = reply.send(Ok(id));
                return;
            }
        }

        let request = MeshMessage::LinkRequest {
            port: self.local_port,
            mesh_id: self.links.mesh_id(),
        };
        match encode_message(&request) {
            Ok(bytes) => {
                if let Err(e) = self.transport.send(addr, &bytes).await {
                    let _ = self.links.remove(id);
                    let _ = reply.send(Err(e));
                    return;
                }
                self.pending_links.entry(addr).or_default().push(reply);
            }
            Err(e) => {
                let _ = self.links.remove(id);
                let _ = reply.send(Err(e));
            }
        }
    }

    async fn handle_unlink(&mut self, link: LinkId) -> Result<(), MeshError> {
        let addr = self.links.begin_close(link)?;
        self.acks.remove_link(link);
        // Final interest update so the neighbor stops routing to us.
        let farewell = MeshMessage::Subscription(SubscriptionUpdate {
            port: self.local_port,
            flags: SUB_FLAG_UNLINK,
            mesh_id: self.links.mesh_id(),
            needs: Vec::new(),
            interests: Vec::new(),
        });
        if let Ok(bytes) = encode_message(&farewell) {
            let _ = self.transport.send(addr, &bytes).await;
        }
        let _ = self.links.remove(link);
        Ok(())
    }

    async fn handle_enable_discovery(&mut self) -> Result<(), MeshError> {
        let beacon = encode_message(&MeshMessage::Beacon {
            port: self.local_port,
            mesh_id: self.links.mesh_id(),
        })?;
        self.transport.enable_discovery(beacon).await
    }

    // ------------------------------------------------------------------
    // Inbound datagrams
    // ------------------------------------------------------------------

    async fn on_datagram(&mut self, datagram: Datagram) {
        let from = datagram.from;
        let message = match decode_message(RxBuffer::new(datagram.bytes)) {
            Ok(message) => message,
            Err(e) => {
                debug!(%from, "dropping malformed datagram: {}", e);
                return;
            }
        };

        match message {
            MeshMessage::LinkRequest { port: _, mesh_id } => {
                self.on_link_request(from, mesh_id).await;
            }
            MeshMessage::LinkAccept { port: _, mesh_id } => {
                self.on_link_accept(from, mesh_id).await;
            }
            MeshMessage::Subscription(update) => {
                self.on_subscription(from, update).await;
            }
            MeshMessage::Publication(publication) => {
                let Some(link) = self.links.id_for_addr(&from) else {
                    trace!(%from, "publication from unlinked address dropped");
                    return;
                };
                let raw = self.router.on_publication(
                    publication,
                    link,
                    from,
                    self.keys.as_ref(),
                    self.permissions.as_ref(),
                    &self.subscriptions,
                    &self.links,
                    &mut self.acks,
                );
                match raw {
                    Ok(outbound) => self.transmit(outbound).await,
                    Err(e) => debug!(%from, "publication dropped: {}", e),
                }
            }
            MeshMessage::Acknowledgement(ack) => {
                let raw_bytes = match encode_message(&MeshMessage::Acknowledgement(ack.clone())) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        debug!("ack re-encode failed: {}", e);
                        return;
                    }
                };
                let result = self.router.on_ack(
                    ack,
                    &raw_bytes,
                    from,
                    self.keys.as_ref(),
                    self.permissions.as_ref(),
                    &self.acks,
                );
                match result {
                    Ok(Some(out)) => self.transmit(vec![out]).await,
                    Ok(None) => {}
                    Err(e) => debug!(%from, "ack dropped: {}", e),
                }
            }
            MeshMessage::Beacon { port, mesh_id } => {
                self.on_beacon(from, port, mesh_id).await;
            }
        }
    }

    async fn on_link_request(&mut self, from: SocketAddr, mesh_id: crate::wire::MeshId) {
        let link = match self.links.accept_inbound(from, mesh_id) {
            Ok(link) => link,
            Err(e) => {
                debug!(%from, "inbound link rejected: {}", e);
                return;
            }
        };
        debug!(%from, link, "inbound link established");

        // Simultaneous connect: we were also dialing this address.
        for waiter in self.pending_links.remove(&from).unwrap_or_default() {
            let _ = waiter.send(Ok(link));
        }

        let accept = MeshMessage::LinkAccept {
            port: self.local_port,
            mesh_id: self.links.mesh_id(),
        };
        if let Ok(bytes) = encode_message(&accept) {
            if let Err(e) = self.transport.send(from, &bytes).await {
                warn!(%from, "link accept send failed: {}", e);
                self.drop_link(link).await;
                return;
            }
        }
        // Immediate interest exchange on establishment.
        self.send_interest_update(link, from, SUB_FLAG_SYNC_REQUEST).await;
    }

    async fn on_link_accept(&mut self, from: SocketAddr, mesh_id: crate::wire::MeshId) {
        let Some(link) = self.links.on_accept(from, mesh_id) else {
            trace!(%from, "unsolicited link accept ignored");
            return;
        };
        debug!(%from, link, "outbound link established");

        for waiter in self.pending_links.remove(&from).unwrap_or_default() {
            let _ = waiter.send(Ok(link));
        }
        self.send_interest_update(link, from, SUB_FLAG_SYNC_REQUEST).await;
    }

    async fn on_subscription(&mut self, from: SocketAddr, update: SubscriptionUpdate) {
        let Some(link) = self.links.id_for_addr(&from) else {
            trace!(%from, "interest update from unlinked address dropped");
            return;
        };

        if update.flags & SUB_FLAG_UNLINK != 0 {
            debug!(%from, link, "neighbor unlinked");
            let _ = self.links.remove(link);
            self.acks.remove_link(link);
            return;
        }

        match BloomFilter::from_bytes(&update.interests) {
            Some(filter) => {
                let _ = self.links.update_remote_interest(link, filter, update.mesh_id);
            }
            None => {
                debug!(%from, "malformed interest filter dropped");
                return;
            }
        }

        if update.flags & SUB_FLAG_SYNC_REQUEST != 0 {
            self.send_interest_update(link, from, 0).await;
        }
    }

    async fn on_beacon(&mut self, from: SocketAddr, _port: u16, mesh_id: crate::wire::MeshId) {
        if mesh_id == self.links.mesh_id() {
            return; // our own beacon looped back
        }
        trace!(%from, "discovery beacon heard");
        if !self.config.auto_link_discovered || self.links.id_for_addr(&from).is_some() {
            return;
        }
        let (tx, _rx) = oneshot::channel();
        self.handle_link_to(from, tx).await;
    }

    // ------------------------------------------------------------------
    // Interest advertisement
    // ------------------------------------------------------------------

    /// Advertise interest filters on the periodic tick. Each
    /// Established neighbor gets the union of the local aggregate and
    /// every other neighbor's interests (split horizon), so interests
    /// propagate transitively through the mesh. A neighbor is skipped
    /// when the filter is unchanged since the last advertisement, and
    /// when it is identical to the filter that neighbor itself just
    /// sent (ping-pong suppression).
    async fn advertise_local_interest(&mut self) {
        let local = self.subscriptions.aggregate(&self.matcher).clone();
        for (link, addr) in self.links.established() {
            let filter = self.links.interests_for(link, &local);
            let entry = match self.links.get(link) {
                Some(entry) => entry,
                None => continue,
            };
            if entry.advertised.as_ref() == Some(&filter)
                || entry.remote_interests.as_ref() == Some(&filter)
            {
                continue;
            }
            self.send_interest_update(link, addr, 0).await;
        }
    }

    /// Send the interest filter for a single link and record it.
    async fn send_interest_update(&mut self, link: LinkId, addr: SocketAddr, flags: u8) {
        let local = self.subscriptions.aggregate(&self.matcher).clone();
        let filter = self.links.interests_for(link, &local);
        let message = MeshMessage::Subscription(SubscriptionUpdate {
            port: self.local_port,
            flags,
            mesh_id: self.links.mesh_id(),
            needs: Vec::new(),
            interests: filter.to_bytes(),
        });
        match encode_message(&message) {
            Ok(bytes) => {
                if let Err(e) = self.transport.send(addr, &bytes).await {
                    warn!(%addr, "interest update send failed: {}", e);
                    self.drop_link(link).await;
                    return;
                }
                self.links.record_advertised(link, filter);
            }
            Err(e) => warn!("interest update encode failed: {}", e),
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    async fn sweep(&mut self) {
        self.router.sweep();
        self.acks.sweep();
        for (link, addr) in self.links.expire_connecting(CONNECT_TIMEOUT) {
            debug!(%addr, link, "connection attempt timed out");
            for waiter in self.pending_links.remove(&addr).unwrap_or_default() {
                let _ = waiter.send(Err(MeshError::Transport(format!(
                    "connect to {} timed out",
                    addr
                ))));
            }
        }
    }

    async fn transmit(&mut self, outbound: Vec<Outbound>) {
        for out in outbound {
            if let Err(e) = self.transport.send(out.addr, &out.bytes).await {
                warn!(addr = %out.addr, "send failed, dropping link: {}", e);
                self.drop_link(out.link).await;
            }
        }
    }

    /// Transport failure on a link demotes it to Closed and removes it
    /// from routing. Other links are unaffected.
    async fn drop_link(&mut self, link: LinkId) {
        if self.links.remove(link).is_ok() {
            self.acks.remove_link(link);
        }
    }

    async fn teardown(&mut self) {
        self.transport.disable_discovery().await;
        let established = self.links.established();
        for (link, _) in &established {
            let _ = self.handle_unlink(*link).await;
        }
        for waiters in std::mem::take(&mut self.pending_links).into_values() {
            for waiter in waiters {
                let _ = waiter.send(Err(MeshError::Transport("node shutting down".into())));
            }
        }
        debug!("node actor torn down");
    }
}
