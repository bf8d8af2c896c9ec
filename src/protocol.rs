//! Sync Packet Codec
//!
//! Defines the wire unit of the replication protocol: an operation, a path,
//! the file content, and a CRC32 checksum over the content. Packets are
//! bincode-encoded and sealed with AES-256-GCM before they touch the wire,
//! so content stays confidential and tamper-evident independently of
//! whatever the transport layer negotiates.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// AES-256-GCM key length in bytes.
pub const KEY_LEN: usize = 32;

/// AES-GCM nonce length in bytes (96 bits), prefixed to every ciphertext.
pub const NONCE_LEN: usize = 12;

/// Replication operation carried by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Op {
    Create,
    Modify,
    Delete,
    SyncRequest,
    /// Reserved on the wire; no current flow produces it.
    SyncResponse,
    Heartbeat,
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Op::Create => "CREATE",
            Op::Modify => "MODIFY",
            Op::Delete => "DELETE",
            Op::SyncRequest => "SYNC_REQUEST",
            Op::SyncResponse => "SYNC_RESPONSE",
            Op::Heartbeat => "HEARTBEAT",
        };
        write!(f, "{}", name)
    }
}

/// The wire unit of the sync protocol.
///
/// `path` is op-dependent: a relative forward-slash file path for
/// `Create`/`Modify`/`Delete`, and the sender's node identifier for
/// `SyncRequest`/`Heartbeat`. The dual meaning is part of the wire
/// contract, not an accident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPacket {
    pub op: Op,
    pub path: String,
    /// File content; empty for `Delete`, `SyncRequest`, and `Heartbeat`.
    pub content: Vec<u8>,
    /// CRC32 over `content`.
    pub checksum: u32,
}

impl SyncPacket {
    /// Build a packet with the checksum computed over `content`.
    pub fn new(op: Op, path: impl Into<String>, content: Vec<u8>) -> Self {
        let checksum = crc32fast::hash(&content);
        Self {
            op,
            path: path.into(),
            content,
            checksum,
        }
    }

    /// Check the packet's business rules.
    ///
    /// The checksum is not enforced for `Delete` since deletes carry no
    /// content worth guarding.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.path.is_empty() {
            return Err(SyncError::Validation("path must not be empty".to_string()));
        }

        if self.op != Op::Delete {
            let expected = crc32fast::hash(&self.content);
            if self.checksum != expected {
                return Err(SyncError::Validation(format!(
                    "checksum mismatch: expected {}, got {}",
                    expected, self.checksum
                )));
            }
        }

        Ok(())
    }

    /// Serialize and seal the packet.
    ///
    /// Output layout: 12-byte random nonce followed by the tagged
    /// ciphertext. A fresh nonce is drawn per call.
    pub fn encrypt(&self, key: &[u8; KEY_LEN]) -> Result<Vec<u8>, SyncError> {
        let plaintext = bincode::serialize(self)?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|e| SyncError::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open and decode a sealed packet.
    ///
    /// The three failure kinds are distinct: tampering or a wrong key is a
    /// `Decryption` error, a malformed plaintext is a `Deserialization`
    /// error, and a rule violation in an authentic packet is a
    /// `Validation` error.
    pub fn decrypt(data: &[u8], key: &[u8; KEY_LEN]) -> Result<SyncPacket, SyncError> {
        if data.len() < NONCE_LEN {
            return Err(SyncError::Decryption(
                "ciphertext shorter than nonce".to_string(),
            ));
        }

        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SyncError::Decryption("authentication failed".to_string()))?;

        let packet: SyncPacket = bincode::deserialize(&plaintext)?;
        packet.validate()?;
        Ok(packet)
    }
}
