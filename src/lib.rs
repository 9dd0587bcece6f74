//! # Pubmesh - Interest-Flooding Publish/Subscribe Mesh
//!
//! Pubmesh is a decentralized pub/sub messaging substrate. Nodes
//! self-organize into a mesh, advertise topic interests as compact
//! Bloom filters, and flood publications only toward nodes whose
//! aggregate interests admit them.
//!
//! ## Protocol Overview
//!
//! - **Interest aggregation**: each node unions its subscriptions into
//!   one Bloom filter and advertises it to every neighbor; neighbors
//!   use it as a probabilistic forwarding admission test.
//! - **Loop-free flooding**: publications are identified by
//!   (publisher id, sequence number); a bounded-retention dedup cache
//!   suppresses re-delivery and re-forwarding, and a per-hop TTL bounds
//!   flood depth.
//! - **Acknowledgments**: a publication may request an ack, which
//!   returns hop by hop along the recorded reverse path, never flooded.
//! - **Secure envelope**: payload and topics are optionally sealed with
//!   an AEAD under a pluggable key store, and every inbound message is
//!   authorized against a pluggable permission store before it reaches
//!   routing. Failures drop the message, fail closed.
//!
//! ## Execution Model
//!
//! One actor task per node owns all protocol state; the [`Node`] handle
//! is cheap to clone and submits commands over a channel, so
//! application threads never touch shared state. Mesh membership is
//! formed explicitly ([`Node::link_to`]) or via local-network multicast
//! discovery ([`Node::enable_discovery`]).
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |----------------|----------------------------------------------------|
//! | `node` | High-level API combining all components |
//! | `bloom` | Fixed-size Bloom filter over topic tokens |
//! | `topics` | Topic canonicalization and AND/OR matching |
//! | `subscription` | Local subscription table, aggregate interests |
//! | `link` | Neighbor link set and interest propagation |
//! | `router` | Flood/forward engine, dedup, TTL |
//! | `ack` | Acknowledgment return path |
//! | `envelope` | Secure envelope, key and permission seams |
//! | `wire` | Wire message types, bounded serialization |
//! | `buffer` | Owned transmit/receive byte arenas |
//! | `transport` | UDP datagram transport, multicast discovery |
//! | `error` | Error taxonomy |

mod ack;
mod bloom;
mod buffer;
mod envelope;
mod error;
mod link;
mod node;
mod router;
mod subscription;
mod topics;
mod transport;
mod wire;

pub use ack::ReceivedAck;
pub use bloom::{BloomFilter, FilterParams};
pub use buffer::{RxBuffer, TxBuffer};
pub use envelope::{
    AllowAll, EnvelopeAad, EnvelopeBody, GrantList, Key, KeyId, KeyStore, MemoryKeyStore,
    Permission, PermissionStore, ProtectedFields, SecureEnvelope, SenderId, SignerId,
};
pub use error::{AuthError, MeshError};
pub use link::LinkId;
pub use node::{MeshConfig, Node};
pub use router::{PublicationHandle, DEFAULT_TTL, MAX_TTL};
pub use subscription::{MatchedPublication, SubscriptionId};
pub use topics::{Topic, TopicMatcher, DEFAULT_SEPARATORS, GROUP_MARKER};
pub use wire::{MeshId, PublisherId};
