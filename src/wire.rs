//! # Wire Protocol Messages
//!
//! Serializable message types exchanged between mesh neighbors, encoded
//! with bincode under a hard size limit.
//!
//! | Message | Direction | Purpose |
//! |----------------------|--------------------|----------------------------------|
//! | `LinkRequest/Accept` | unicast | link establishment handshake |
//! | `SubscriptionUpdate` | unicast per link | aggregate interest advertisement |
//! | `Publication` | flood | publication forwarding |
//! | `Acknowledgement` | reverse-path unicast | ack return |
//! | `Beacon` | multicast | local-network discovery |
//!
//! Outbound messages are assembled through a [`TxBuffer`] arena so
//! oversized messages surface as a resource error before they reach the
//! socket; inbound bytes pass through an [`RxBuffer`] cursor and a
//! bounded deserializer, so truncated or oversized input is rejected
//! without unbounded allocation.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::buffer::{RxBuffer, TxBuffer};
use crate::envelope::EnvelopeBody;
use crate::error::MeshError;

/// Identity of a publishing node, unique across the mesh.
pub type PublisherId = [u8; 16];

/// Advisory mesh identifier used to spot redundant flood paths.
pub type MeshId = [u8; 16];

/// Maximum encoded message size, also the datagram budget.
pub const MAX_MESSAGE_SIZE: usize = 63 * 1024;

/// Maximum buffer size accepted by the deserializer. Slightly above
/// `MAX_MESSAGE_SIZE` to allow framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_MESSAGE_SIZE as u64) + 1024;

/// Subscription flag: the sender is unlinking and this is its final
/// interest update.
pub const SUB_FLAG_UNLINK: u8 = 0x01;

/// Subscription flag: the sender requests a full interest exchange in
/// return (set on the first update after link establishment).
pub const SUB_FLAG_SYNC_REQUEST: u8 = 0x02;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

// ============================================================================
// Message Types
// ============================================================================

/// A publication in flight. The clear header carries what every hop
/// needs for routing; topics and payload live in the protected body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublicationMessage {
    /// Remaining hop budget, decremented at each receiving node.
    pub ttl: i16,
    pub publisher: PublisherId,
    pub sequence: u64,
    pub ack_requested: bool,
    /// Encoded topic filter driving the forwarding admission test.
    pub filter: Vec<u8>,
    /// Protected region: topics and payload, plain or sealed.
    pub body: EnvelopeBody,
}

/// Aggregate interest advertisement for one link.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    /// Listen port of the sender, for reverse connections.
    pub port: u16,
    /// `SUB_FLAG_*` bits.
    pub flags: u8,
    pub mesh_id: MeshId,
    /// Requested missing state; empty in steady state.
    pub needs: Vec<u8>,
    /// Encoded aggregate interest filter.
    pub interests: Vec<u8>,
}

/// Unicast acknowledgment returned along the reverse path of the
/// publication identified by (publisher, sequence).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub publisher: PublisherId,
    pub sequence: u64,
    /// Protected region: ack payload, empty topic list.
    pub body: EnvelopeBody,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MeshMessage {
    /// Link establishment, initiator side.
    LinkRequest { port: u16, mesh_id: MeshId },
    /// Link establishment, acceptor side.
    LinkAccept { port: u16, mesh_id: MeshId },
    Subscription(SubscriptionUpdate),
    Publication(PublicationMessage),
    Acknowledgement(Acknowledgement),
    /// Multicast discovery beacon advertising the sender's listen port.
    Beacon { port: u16, mesh_id: MeshId },
}

// ============================================================================
// Encode / Decode
// ============================================================================

/// Encode a message through a transmit arena. Messages that would
/// exceed the datagram budget fail with `Resource` before reaching the
/// socket.
pub fn encode_message(message: &MeshMessage) -> Result<Vec<u8>, MeshError> {
    let bytes = bincode_options()
        .serialize(message)
        .map_err(|e| match *e {
            bincode::ErrorKind::SizeLimit => MeshError::Resource,
            _ => MeshError::Protocol(format!("encode: {}", e)),
        })?;
    let mut tx = TxBuffer::new(MAX_MESSAGE_SIZE);
    tx.append(&bytes)?;
    Ok(tx.into_bytes())
}

/// Decode a received datagram.
pub fn decode_message(rx: RxBuffer) -> Result<MeshMessage, MeshError> {
    let bytes = rx.remaining();
    deserialize_bounded(&bytes).map_err(|e| MeshError::Protocol(format!("decode: {}", e)))
}
