//! Error Taxonomy
//!
//! All failure kinds the replication core can report. Packet-level failures
//! (validation, decryption, deserialization) are deliberately distinct so
//! callers can tell a tampered ciphertext from a malformed payload from a
//! business-rule violation.

/// Errors produced by the replication core.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Invalid or incomplete configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A packet failed a business rule (empty path, checksum mismatch).
    #[error("packet validation failed: {0}")]
    Validation(String),

    /// AEAD encryption failed while building the wire payload.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// AEAD authentication or decryption failed. The bytes are
    /// untrustworthy and must never be retried.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// The decrypted payload could not be decoded into a packet.
    #[error("packet decoding failed: {0}")]
    Deserialization(#[from] bincode::Error),

    /// Dial, stream, or write failure at the transport layer. Retried
    /// only by the master's fan-out policy, never by the transport itself.
    #[error("transport error: {0}")]
    Transport(String),

    /// Local filesystem failure (watch setup, read, write, delete).
    #[error("filesystem error: {0}")]
    FileSystem(#[from] std::io::Error),
}
