//! # Peer Identity
//!
//! [`Identity`] is the 32-byte public identifier of a peer. The ticket engine
//! never interprets the full key: only the leading 64 bits take part in
//! distance arithmetic, so every topic radius and every lookup target lives in
//! the `u64` prefix space.
//!
//! ## Invariants
//!
//! - `Identity::from_bytes(bytes).as_bytes() == bytes`
//! - `prefix_distance` is symmetric and zero only for equal prefixes
//! - `Identity::from_prefix(p).prefix() == p`

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Build a lookup target whose leading 8 bytes carry `prefix` and whose
    /// remaining bytes are zero.
    #[inline]
    pub fn from_prefix(prefix: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&prefix.to_be_bytes());
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Leading 64 bits, big-endian.
    #[inline]
    pub fn prefix(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(head)
    }

    #[inline]
    pub fn prefix_distance(&self, other: &Identity) -> u64 {
        self.prefix() ^ other.prefix()
    }

    /// Short hex rendering used in log fields.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<Identity> for [u8; 32] {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
