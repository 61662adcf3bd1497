//! Core types for the conclave node.
//!
//! This crate provides the foundational types used throughout the node core:
//!
//! - **Primitives**: Hash, PublicKey, Signature, Sequence, RoundNumber
//! - **Wire framing**: Packet headers, block request/reply layouts
//! - **Aggregates**: Pool, TransactionsPacket, HashVector, HashMatrix, RoundTable
//! - **BitHeap**: the dense sparse-sequence window tracker
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod bitheap;
mod packet;
mod pool;

pub use bitheap::BitHeap;
pub use packet::{
    BlockReply, BlockRequest, CodecError, Fragment, MessageKind, Packet, PacketHeader,
    FLAG_FRAGMENTED, FLAG_NETWORK_MSG,
};
pub use pool::{HashMatrix, HashVector, Pool, RoundTable, TransactionsPacket};

use sha2::{Digest, Sha256};
use std::fmt;
use std::net::SocketAddr;

/// Monotone block height. The local chain always has a well-defined last
/// sequence, initially 0.
pub type Sequence = u64;

/// Monotone consensus round counter.
pub type RoundNumber = u64;

/// A transport address. May change for a given [`PublicKey`] across
/// reconnects; identity is always the key, never the endpoint.
pub type Endpoint = SocketAddr;

/// 32-byte content hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sbor::prelude::BasicSbor)]
pub struct Hash([u8; 32]);

impl Hash {
    pub const LENGTH: usize = 32;

    /// Create a hash from raw bytes. Panics if `bytes` is not 32 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; Self::LENGTH];
        buf.copy_from_slice(bytes);
        Self(buf)
    }

    /// Hash arbitrary data. Same bytes, same hash.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub const fn zero() -> Self {
        Self([0u8; Self::LENGTH])
    }

    pub fn as_bytes(&self) -> &[u8; Self::LENGTH] {
        &self.0
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

/// 32-byte node identity. Two peers with identical keys are the same logical
/// peer regardless of endpoint.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sbor::prelude::BasicSbor)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub const LENGTH: usize = 32;

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; Self::LENGTH];
        buf.copy_from_slice(bytes);
        Self(buf)
    }

    pub const fn zero() -> Self {
        Self([0u8; Self::LENGTH])
    }

    pub fn as_bytes(&self) -> &[u8; Self::LENGTH] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

/// 64-byte signature. Also serves as the key of the synchronous rendezvous
/// primitive, which pairs a blocking waiter with a later signal.
#[derive(Clone, Copy, sbor::prelude::BasicSbor)]
pub struct Signature([u8; 64]);

impl Signature {
    pub const LENGTH: usize = 64;

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; Self::LENGTH];
        buf.copy_from_slice(bytes);
        Self(buf)
    }

    pub const fn zero() -> Self {
        Self([0u8; Self::LENGTH])
    }

    pub fn as_bytes(&self) -> &[u8; Self::LENGTH] {
        &self.0
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}

impl Eq for Signature {}

impl PartialOrd for Signature {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Signature {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0[..].cmp(&other.0[..])
    }
}

impl std::hash::Hash for Signature {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0[..].hash(state);
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_digest_is_stable() {
        let a = Hash::digest(b"same bytes");
        let b = Hash::digest(b"same bytes");
        assert_eq!(a, b);
        assert_ne!(a, Hash::digest(b"other bytes"));
    }

    #[test]
    fn signature_equality_covers_full_width() {
        let mut raw = [0u8; 64];
        raw[63] = 1;
        assert_ne!(Signature::from_bytes(&raw), Signature::zero());
    }
}
