//! # Secure Envelope
//!
//! Wraps and unwraps the protected region of every message the router
//! touches. Three concerns, each pluggable at node construction:
//!
//! - **Key resolution**: a [`KeyStore`] maps an opaque [`KeyId`] to
//!   symmetric key material. Unknown ids fail with
//!   [`AuthError::KeyMissing`].
//! - **Confidentiality and integrity**: ChaCha20-Poly1305 AEAD over the
//!   topic list and payload, with the publication's immutable identity
//!   (publisher id, sequence, ack flag) as associated data. TTL is
//!   excluded from the AAD because it changes per hop.
//! - **Authorization**: a [`PermissionStore`] decides whether the sender
//!   (the embedded signer identity when present, the network identity
//!   otherwise) holds the required permission. Denial fails closed with
//!   [`AuthError::Denied`] before the message reaches matching or
//!   forwarding.
//!
//! The optional embedded signer is a domain-separated Ed25519 signature
//! over the sealed content, binding it to a stable sender identity that
//! survives multi-hop forwarding where the network identity does not.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, MeshError};

/// Opaque key identifier carried in sealed messages.
pub type KeyId = [u8; 16];

/// Stable sender identity: an Ed25519 public key.
pub type SignerId = [u8; 32];

/// Domain separation prefix for envelope signatures.
/// Prevents cross-protocol signature replay.
pub const ENVELOPE_SIGNATURE_DOMAIN: &[u8] = b"pubmesh-envelope-v1:";

/// Upper bound on a protected region's plaintext.
pub const MAX_PLAINTEXT_SIZE: usize = 64 * 1024;

// ============================================================================
// Keys and Permissions
// ============================================================================

/// Symmetric key material resolved from a [`KeyStore`].
#[derive(Clone)]
pub struct Key(pub [u8; 32]);

impl Key {
    /// Derive a full-width key from shorter preshared material.
    pub fn from_material(material: &[u8]) -> Key {
        Key(*blake3::hash(material).as_bytes())
    }
}

/// Permission checked before a message is exposed to routing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Permission {
    /// May inject publications into the mesh.
    Publish,
    /// May return acknowledgments for publications it received.
    Acknowledge,
}

/// The authenticated identity presented to the permission store.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SenderId {
    /// Transport-level identity of the adjacent hop.
    Network(String),
    /// Embedded signer identity, stable across hops.
    Signer(SignerId),
}

/// Key resolution collaborator. Lookups are local and synchronous; they
/// must not block the node loop.
pub trait KeyStore: Send + Sync {
    fn key(&self, id: &KeyId) -> Option<Key>;
}

/// Authorization collaborator.
pub trait PermissionStore: Send + Sync {
    fn allowed(&self, sender: &SenderId, permission: Permission) -> bool;
}

/// In-memory key store.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: std::collections::HashMap<KeyId, Key>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: KeyId, key: Key) {
        self.keys.insert(id, key);
    }
}

impl KeyStore for MemoryKeyStore {
    fn key(&self, id: &KeyId) -> Option<Key> {
        self.keys.get(id).cloned()
    }
}

/// Permission store that allows every sender. The default trust model
/// for closed deployments.
pub struct AllowAll;

impl PermissionStore for AllowAll {
    fn allowed(&self, _sender: &SenderId, _permission: Permission) -> bool {
        true
    }
}

/// Permission store with explicit grants; anything not granted is denied.
#[derive(Default)]
pub struct GrantList {
    grants: std::collections::HashSet<(SenderId, Permission)>,
}

impl GrantList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&mut self, sender: SenderId, permission: Permission) {
        self.grants.insert((sender, permission));
    }
}

impl PermissionStore for GrantList {
    fn allowed(&self, sender: &SenderId, permission: Permission) -> bool {
        self.grants.contains(&(sender.clone(), permission))
    }
}

// ============================================================================
// Envelope Body
// ============================================================================

/// Immutable identity of a publication, bound into the AEAD as
/// associated data. Excludes TTL, which mutates per hop.
#[derive(Clone, Copy, Debug)]
pub struct EnvelopeAad {
    pub publisher: [u8; 16],
    pub sequence: u64,
    pub ack_requested: bool,
}

impl EnvelopeAad {
    fn to_bytes(self) -> [u8; 25] {
        let mut out = [0u8; 25];
        out[..16].copy_from_slice(&self.publisher);
        out[16..24].copy_from_slice(&self.sequence.to_le_bytes());
        out[24] = self.ack_requested as u8;
        out
    }
}

/// The fields an envelope protects: topic list plus opaque payload.
/// Acks carry an empty topic list.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtectedFields {
    pub topics: Vec<String>,
    pub data: Vec<u8>,
}

/// Wire form of the protected region. The variant tag is the format
/// discriminant the receiver dispatches on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EnvelopeBody {
    /// Unencrypted passthrough.
    Plain(ProtectedFields),
    /// AEAD-sealed fields, optionally bound to a signer identity.
    Sealed {
        key_id: KeyId,
        nonce: [u8; 12],
        ciphertext: Vec<u8>,
        signer: Option<SignerId>,
        signature: Vec<u8>,
    },
}

// ============================================================================
// Signing Helpers
// ============================================================================

/// Canonical byte string an envelope signature covers.
fn signed_payload(aad: &[u8], key_id: &KeyId, nonce: &[u8; 12], ciphertext: &[u8]) -> Vec<u8> {
    let mut payload =
        Vec::with_capacity(ENVELOPE_SIGNATURE_DOMAIN.len() + aad.len() + 16 + 12 + ciphertext.len());
    payload.extend_from_slice(ENVELOPE_SIGNATURE_DOMAIN);
    payload.extend_from_slice(aad);
    payload.extend_from_slice(key_id);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(ciphertext);
    payload
}

fn verify_signer(
    signer: &SignerId,
    payload: &[u8],
    signature: &[u8],
) -> Result<(), AuthError> {
    let key = VerifyingKey::from_bytes(signer).map_err(|_| AuthError::BadSignature)?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| AuthError::BadSignature)?;
    key.verify(payload, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| AuthError::BadSignature)
}

// ============================================================================
// SecureEnvelope
// ============================================================================

/// Per-node envelope configuration: the key id to seal outbound
/// messages under (None sends plaintext) and an optional signer keypair
/// embedding a stable sender identity.
pub struct SecureEnvelope {
    key_id: Option<KeyId>,
    signer: Option<SigningKey>,
}

impl SecureEnvelope {
    pub fn new(key_id: Option<KeyId>, signer: Option<SigningKey>) -> Self {
        Self { key_id, signer }
    }

    /// Generate a fresh signer keypair.
    pub fn generate_signer() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    /// The signer identity embedded in sealed messages, if configured.
    pub fn signer_id(&self) -> Option<SignerId> {
        self.signer.as_ref().map(|k| k.verifying_key().to_bytes())
    }

    /// True if outbound messages will be sealed.
    pub fn sealing(&self) -> bool {
        self.key_id.is_some()
    }

    /// Wrap the protected fields for transmission. Plaintext passthrough
    /// when no key id is configured; otherwise resolve the key, seal,
    /// and sign when a signer is present.
    pub fn seal(
        &self,
        aad: EnvelopeAad,
        fields: &ProtectedFields,
        keys: &dyn KeyStore,
    ) -> Result<EnvelopeBody, MeshError> {
        let key_id = match self.key_id {
            None => return Ok(EnvelopeBody::Plain(fields.clone())),
            Some(id) => id,
        };
        let key = keys.key(&key_id).ok_or(MeshError::Auth(AuthError::KeyMissing))?;

        let plaintext = bincode::serialize(fields)
            .map_err(|e| MeshError::Protocol(format!("encode protected fields: {}", e)))?;
        if plaintext.len() > MAX_PLAINTEXT_SIZE {
            return Err(MeshError::Resource);
        }

        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        let aad_bytes = aad.to_bytes();

        let cipher = ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&key.0));
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: &aad_bytes,
                },
            )
            .map_err(|_| MeshError::Auth(AuthError::Integrity))?;

        let (signer, signature) = match &self.signer {
            Some(keypair) => {
                let payload = signed_payload(&aad_bytes, &key_id, &nonce, &ciphertext);
                (
                    Some(keypair.verifying_key().to_bytes()),
                    keypair.sign(&payload).to_bytes().to_vec(),
                )
            }
            None => (None, Vec::new()),
        };

        Ok(EnvelopeBody::Sealed {
            key_id,
            nonce,
            ciphertext,
            signer,
            signature,
        })
    }

    /// Unwrap a received protected region and authorize the sender.
    /// Fails closed: any error means the message never reaches routing.
    pub fn open(
        body: &EnvelopeBody,
        aad: EnvelopeAad,
        network_sender: &str,
        required: Permission,
        keys: &dyn KeyStore,
        permissions: &dyn PermissionStore,
    ) -> Result<ProtectedFields, AuthError> {
        let (fields, sender) = match body {
            EnvelopeBody::Plain(fields) => (
                fields.clone(),
                SenderId::Network(network_sender.to_string()),
            ),
            EnvelopeBody::Sealed {
                key_id,
                nonce,
                ciphertext,
                signer,
                signature,
            } => {
                let key = keys.key(key_id).ok_or(AuthError::KeyMissing)?;
                let aad_bytes = aad.to_bytes();

                let sender = match signer {
                    Some(id) => {
                        let payload = signed_payload(&aad_bytes, key_id, nonce, ciphertext);
                        verify_signer(id, &payload, signature)?;
                        SenderId::Signer(*id)
                    }
                    None => SenderId::Network(network_sender.to_string()),
                };

                let cipher = ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&key.0));
                let plaintext = cipher
                    .decrypt(
                        Nonce::from_slice(nonce),
                        Payload {
                            msg: ciphertext.as_slice(),
                            aad: &aad_bytes,
                        },
                    )
                    .map_err(|_| AuthError::Integrity)?;

                let fields: ProtectedFields = bincode::deserialize(&plaintext)
                    .map_err(|_| AuthError::Integrity)?;
                (fields, sender)
            }
        };

        if !permissions.allowed(&sender, required) {
            return Err(AuthError::Denied);
        }
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aad() -> EnvelopeAad {
        EnvelopeAad {
            publisher: [9; 16],
            sequence: 42,
            ack_requested: false,
        }
    }

    fn fields() -> ProtectedFields {
        ProtectedFields {
            topics: vec!["a.b".into(), "c".into()],
            data: b"payload".to_vec(),
        }
    }

    fn keystore_with(id: KeyId) -> MemoryKeyStore {
        let mut keys = MemoryKeyStore::new();
        keys.insert(id, Key::from_material(b"preshared test key"));
        keys
    }

    #[test]
    fn plaintext_passthrough() {
        let envelope = SecureEnvelope::new(None, None);
        let keys = MemoryKeyStore::new();
        let body = envelope.seal(aad(), &fields(), &keys).unwrap();
        assert!(matches!(body, EnvelopeBody::Plain(_)));

        let opened = SecureEnvelope::open(
            &body,
            aad(),
            "127.0.0.1:1",
            Permission::Publish,
            &keys,
            &AllowAll,
        )
        .unwrap();
        assert_eq!(opened, fields());
    }

    #[test]
    fn sealed_roundtrip() {
        let key_id: KeyId = [7; 16];
        let keys = keystore_with(key_id);
        let envelope = SecureEnvelope::new(Some(key_id), None);

        let body = envelope.seal(aad(), &fields(), &keys).unwrap();
        match &body {
            EnvelopeBody::Sealed { ciphertext, .. } => {
                assert!(!ciphertext.windows(7).any(|w| w == b"payload"));
            }
            _ => panic!("expected sealed body"),
        }

        let opened = SecureEnvelope::open(
            &body,
            aad(),
            "127.0.0.1:1",
            Permission::Publish,
            &keys,
            &AllowAll,
        )
        .unwrap();
        assert_eq!(opened, fields());
    }

    #[test]
    fn unknown_key_fails_missing() {
        let key_id: KeyId = [7; 16];
        let keys = keystore_with(key_id);
        let envelope = SecureEnvelope::new(Some(key_id), None);
        let body = envelope.seal(aad(), &fields(), &keys).unwrap();

        let empty = MemoryKeyStore::new();
        let err = SecureEnvelope::open(
            &body,
            aad(),
            "127.0.0.1:1",
            Permission::Publish,
            &empty,
            &AllowAll,
        )
        .unwrap_err();
        assert_eq!(err, AuthError::KeyMissing);
    }

    #[test]
    fn tampered_ciphertext_fails_integrity() {
        let key_id: KeyId = [7; 16];
        let keys = keystore_with(key_id);
        let envelope = SecureEnvelope::new(Some(key_id), None);
        let mut body = envelope.seal(aad(), &fields(), &keys).unwrap();

        if let EnvelopeBody::Sealed { ciphertext, .. } = &mut body {
            ciphertext[0] ^= 0xff;
        }
        let err = SecureEnvelope::open(
            &body,
            aad(),
            "127.0.0.1:1",
            Permission::Publish,
            &keys,
            &AllowAll,
        )
        .unwrap_err();
        assert_eq!(err, AuthError::Integrity);
    }

    #[test]
    fn aad_mismatch_fails_integrity() {
        let key_id: KeyId = [7; 16];
        let keys = keystore_with(key_id);
        let envelope = SecureEnvelope::new(Some(key_id), None);
        let body = envelope.seal(aad(), &fields(), &keys).unwrap();

        let other = EnvelopeAad {
            sequence: 43,
            ..aad()
        };
        let err = SecureEnvelope::open(
            &body,
            other,
            "127.0.0.1:1",
            Permission::Publish,
            &keys,
            &AllowAll,
        )
        .unwrap_err();
        assert_eq!(err, AuthError::Integrity);
    }

    #[test]
    fn denied_sender_fails_closed() {
        let envelope = SecureEnvelope::new(None, None);
        let keys = MemoryKeyStore::new();
        let body = envelope.seal(aad(), &fields(), &keys).unwrap();

        let deny_all = GrantList::new();
        let err = SecureEnvelope::open(
            &body,
            aad(),
            "127.0.0.1:1",
            Permission::Publish,
            &keys,
            &deny_all,
        )
        .unwrap_err();
        assert_eq!(err, AuthError::Denied);
    }

    #[test]
    fn signer_identity_reaches_permission_store() {
        let key_id: KeyId = [7; 16];
        let keys = keystore_with(key_id);
        let signer = SecureEnvelope::generate_signer();
        let signer_id = signer.verifying_key().to_bytes();
        let envelope = SecureEnvelope::new(Some(key_id), Some(signer));

        let body = envelope.seal(aad(), &fields(), &keys).unwrap();

        // Grant the signer identity, not the network identity.
        let mut grants = GrantList::new();
        grants.grant(SenderId::Signer(signer_id), Permission::Publish);

        let opened = SecureEnvelope::open(
            &body,
            aad(),
            "10.0.0.1:9",
            Permission::Publish,
            &keys,
            &grants,
        );
        assert!(opened.is_ok());

        // The same message fails for a different permission.
        let err = SecureEnvelope::open(
            &body,
            aad(),
            "10.0.0.1:9",
            Permission::Acknowledge,
            &keys,
            &grants,
        )
        .unwrap_err();
        assert_eq!(err, AuthError::Denied);
    }

    #[test]
    fn forged_signature_fails() {
        let key_id: KeyId = [7; 16];
        let keys = keystore_with(key_id);
        let signer = SecureEnvelope::generate_signer();
        let envelope = SecureEnvelope::new(Some(key_id), Some(signer));
        let mut body = envelope.seal(aad(), &fields(), &keys).unwrap();

        if let EnvelopeBody::Sealed { signature, .. } = &mut body {
            signature[0] ^= 0xff;
        }
        let err = SecureEnvelope::open(
            &body,
            aad(),
            "127.0.0.1:1",
            Permission::Publish,
            &keys,
            &AllowAll,
        )
        .unwrap_err();
        assert_eq!(err, AuthError::BadSignature);
    }
}
