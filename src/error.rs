//! Crate-wide error taxonomy.
//!
//! Two layers:
//!
//! - [`AuthError`] covers every way the secure envelope can reject a
//!   message (missing key, failed integrity, denied permission). These
//!   are per-message and fail closed.
//! - [`MeshError`] is the node-level taxonomy returned through the
//!   public API. Per-message failures never surface here; they are
//!   dropped and logged by the router.

// ============================================================================
// Envelope Errors
// ============================================================================

/// Error type for secure envelope failures.
///
/// Every variant results in the offending message being dropped before
/// it reaches matching or forwarding. None of them are fatal to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// The key id embedded in the message is unknown to the key store.
    KeyMissing,
    /// Decryption or integrity verification failed.
    Integrity,
    /// The embedded signer signature did not verify.
    BadSignature,
    /// The permission store denied the sender the required permission.
    Denied,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::KeyMissing => write!(f, "key not found"),
            AuthError::Integrity => write!(f, "decryption or integrity check failed"),
            AuthError::BadSignature => write!(f, "signer verification failed"),
            AuthError::Denied => write!(f, "permission denied"),
        }
    }
}

impl std::error::Error for AuthError {}

// ============================================================================
// Node-Level Errors
// ============================================================================

/// Node-level error taxonomy.
///
/// | Variant | Surfaced to | Effect |
/// |-----------|---------------------------------|-----------------------------------|
/// | `Resource`| caller of the triggering op | operation rejected synchronously |
/// | `Auth` | diagnostics only | message dropped, loop continues |
/// | `Protocol`| diagnostics only | message dropped, loop continues |
/// | `Transport`| caller / link owner | link demoted to Closed |
/// | `NotFound`| caller of unsubscribe/unlink | no state change |
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// Allocation or buffer capacity exhausted.
    Resource,
    /// The secure envelope rejected the message.
    Auth(AuthError),
    /// Malformed wire message (truncated, missing required field).
    Protocol(String),
    /// Link connect or send failure.
    Transport(String),
    /// Unsubscribe or unlink on an unknown handle.
    NotFound,
}

impl std::fmt::Display for MeshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeshError::Resource => write!(f, "resource limit exceeded"),
            MeshError::Auth(e) => write!(f, "authorization failure: {}", e),
            MeshError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            MeshError::Transport(msg) => write!(f, "transport error: {}", msg),
            MeshError::NotFound => write!(f, "unknown handle"),
        }
    }
}

impl std::error::Error for MeshError {}

impl From<AuthError> for MeshError {
    fn from(e: AuthError) -> Self {
        MeshError::Auth(e)
    }
}
