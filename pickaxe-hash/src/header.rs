//! The 80-byte header template hashed by the search loop

use crate::digest::{double_sha256, Hash256};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Serialized header size in bytes
pub const HEADER_SIZE: usize = 80;

/// Byte offset of the nonce inside the serialized header
pub const NONCE_OFFSET: usize = 76;

/// Block header template.
///
/// The serialized form is hashed directly, so the field order below and the
/// absence of padding are part of the wire contract. Integers are written
/// little-endian field by field; the struct's memory layout is irrelevant.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeaderTemplate {
    /// Block format version
    pub version: u32,
    /// Previous block hash
    pub prev_hash: Hash256,
    /// Commitment (merkle) root
    pub merkle_root: Hash256,
    /// Block timestamp
    pub timestamp: u32,
    /// Compact difficulty bits
    pub bits: u32,
    /// Nonce value
    pub nonce: u32,
}

impl HeaderTemplate {
    /// Serialize to the exact 80-byte hashing layout
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut bytes[0..4], self.version);
        bytes[4..36].copy_from_slice(self.prev_hash.as_bytes());
        bytes[36..68].copy_from_slice(self.merkle_root.as_bytes());
        LittleEndian::write_u32(&mut bytes[68..72], self.timestamp);
        LittleEndian::write_u32(&mut bytes[72..76], self.bits);
        LittleEndian::write_u32(&mut bytes[NONCE_OFFSET..HEADER_SIZE], self.nonce);
        bytes
    }

    /// Parse the 80-byte layout
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            version: LittleEndian::read_u32(&bytes[0..4]),
            prev_hash: Hash256(bytes[4..36].try_into().unwrap_or_default()),
            merkle_root: Hash256(bytes[36..68].try_into().unwrap_or_default()),
            timestamp: LittleEndian::read_u32(&bytes[68..72]),
            bits: LittleEndian::read_u32(&bytes[72..76]),
            nonce: LittleEndian::read_u32(&bytes[NONCE_OFFSET..HEADER_SIZE]),
        }
    }

    /// Overwrite the nonce in an already serialized header
    #[inline]
    pub fn write_nonce(bytes: &mut [u8; HEADER_SIZE], nonce: u32) {
        LittleEndian::write_u32(&mut bytes[NONCE_OFFSET..HEADER_SIZE], nonce);
    }

    /// Copy of this template with a different nonce
    pub fn with_nonce(&self, nonce: u32) -> Self {
        Self {
            nonce,
            ..self.clone()
        }
    }

    /// Double SHA-256 of the serialized header
    pub fn hash(&self) -> Hash256 {
        double_sha256(&self.to_bytes())
    }
}
