//! Wire packet framing.
//!
//! # Wire Format
//!
//! Every framed packet begins with a 5-byte header:
//!
//! ```text
//! [flags: u8][id_lo: u16][packet_count: u16]
//! ```
//!
//! When the `Fragmented` flag is set, the next 12 bytes carry
//! `[message_id: u64][fragment_index: u16][fragment_count: u16]`. When the
//! `NetworkMsg` flag is set the header is followed directly by the payload;
//! otherwise a 32-byte sender public key precedes it.
//!
//! All multi-byte integers are little-endian. The layout is byte-exact for
//! compatibility with existing deployments; payload bodies are SBOR-encoded
//! except for the block request/reply layouts, which are fixed-format.

use crate::{Hash, PublicKey, Sequence};
use thiserror::Error;

/// Payload has no sender key; it is a transport-level message.
pub const FLAG_NETWORK_MSG: u8 = 0x01;
/// Packet is one fragment of a larger message.
pub const FLAG_FRAGMENTED: u8 = 0x02;

const BASE_HEADER_LEN: usize = 5;
const FRAGMENT_LEN: usize = 12;

/// Errors that can occur during packet encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("packet too short: need {need} bytes, have {have}")]
    TooShort { need: usize, have: usize },

    #[error("unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("unknown flags: {0:#04x}")]
    UnknownFlags(u8),

    #[error("SBOR decode error: {0}")]
    SborDecode(String),

    #[error("SBOR encode error: {0}")]
    SborEncode(String),

    #[error("length field out of bounds: {0}")]
    BadLength(u64),
}

/// Fragmentation extension of the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub message_id: u64,
    pub index: u16,
    pub count: u16,
}

/// Decoded packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: u8,
    pub id_lo: u16,
    pub packet_count: u16,
    /// Present iff `flags & FLAG_FRAGMENTED`.
    pub fragment: Option<Fragment>,
    /// Present iff `flags & FLAG_NETWORK_MSG` is clear.
    pub sender: Option<PublicKey>,
}

impl PacketHeader {
    pub fn is_network(&self) -> bool {
        self.flags & FLAG_NETWORK_MSG != 0
    }

    pub fn is_fragmented(&self) -> bool {
        self.flags & FLAG_FRAGMENTED != 0
    }

    /// Serialize the header, appending to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.flags);
        out.extend_from_slice(&self.id_lo.to_le_bytes());
        out.extend_from_slice(&self.packet_count.to_le_bytes());

        if let Some(fragment) = &self.fragment {
            out.extend_from_slice(&fragment.message_id.to_le_bytes());
            out.extend_from_slice(&fragment.index.to_le_bytes());
            out.extend_from_slice(&fragment.count.to_le_bytes());
        }
        if let Some(sender) = &self.sender {
            out.extend_from_slice(sender.as_bytes());
        }
    }

    /// Decode a header from the front of `data`. Returns the header and the
    /// offset at which the payload begins.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), CodecError> {
        if data.len() < BASE_HEADER_LEN {
            return Err(CodecError::TooShort {
                need: BASE_HEADER_LEN,
                have: data.len(),
            });
        }

        let flags = data[0];
        if flags & !(FLAG_NETWORK_MSG | FLAG_FRAGMENTED) != 0 {
            return Err(CodecError::UnknownFlags(flags));
        }

        let id_lo = u16::from_le_bytes([data[1], data[2]]);
        let packet_count = u16::from_le_bytes([data[3], data[4]]);
        let mut offset = BASE_HEADER_LEN;

        let fragment = if flags & FLAG_FRAGMENTED != 0 {
            if data.len() < offset + FRAGMENT_LEN {
                return Err(CodecError::TooShort {
                    need: offset + FRAGMENT_LEN,
                    have: data.len(),
                });
            }
            let message_id = u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap());
            let index = u16::from_le_bytes([data[offset + 8], data[offset + 9]]);
            let count = u16::from_le_bytes([data[offset + 10], data[offset + 11]]);
            offset += FRAGMENT_LEN;
            Some(Fragment {
                message_id,
                index,
                count,
            })
        } else {
            None
        };

        let sender = if flags & FLAG_NETWORK_MSG == 0 {
            if data.len() < offset + PublicKey::LENGTH {
                return Err(CodecError::TooShort {
                    need: offset + PublicKey::LENGTH,
                    have: data.len(),
                });
            }
            let key = PublicKey::from_bytes(&data[offset..offset + PublicKey::LENGTH]);
            offset += PublicKey::LENGTH;
            Some(key)
        } else {
            None
        };

        Ok((
            Self {
                flags,
                id_lo,
                packet_count,
                fragment,
                sender,
            },
            offset,
        ))
    }
}

/// Discriminates payload bodies on the wire. First payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    RoundTable = 0,
    Vector = 1,
    Matrix = 2,
    TransactionList = 3,
    Block = 4,
    BlockRequest = 5,
    BlockReply = 6,
    Ping = 7,
}

impl MessageKind {
    pub fn from_byte(byte: u8) -> Result<Self, CodecError> {
        match byte {
            0 => Ok(Self::RoundTable),
            1 => Ok(Self::Vector),
            2 => Ok(Self::Matrix),
            3 => Ok(Self::TransactionList),
            4 => Ok(Self::Block),
            5 => Ok(Self::BlockRequest),
            6 => Ok(Self::BlockReply),
            7 => Ok(Self::Ping),
            other => Err(CodecError::UnknownKind(other)),
        }
    }
}

/// An immutable framed byte buffer plus its content hash.
///
/// Same bytes, same hash. Packets never change after creation; re-framing
/// produces a new packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Vec<u8>,
    payload_offset: usize,
    header: PacketHeader,
    hash: Hash,
}

impl Packet {
    /// Frame a payload into a packet.
    pub fn frame(header: PacketHeader, payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(BASE_HEADER_LEN + FRAGMENT_LEN + payload.len());
        header.encode(&mut data);
        let payload_offset = data.len();
        data.extend_from_slice(payload);
        let hash = Hash::digest(&data);
        Self {
            data,
            payload_offset,
            header,
            hash,
        }
    }

    /// Parse a received byte buffer.
    pub fn parse(data: Vec<u8>) -> Result<Self, CodecError> {
        let (header, payload_offset) = PacketHeader::decode(&data)?;
        let hash = Hash::digest(&data);
        Ok(Self {
            data,
            payload_offset,
            header,
            hash,
        })
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload_offset..]
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }
}

/// A directed request for a batch of block sequences.
///
/// Layout: `target_key(32) | packet_id(8) | sequence_count(4) | sequences[n](8 each)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    pub target: PublicKey,
    pub packet_id: u64,
    pub sequences: Vec<Sequence>,
}

impl BlockRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(44 + self.sequences.len() * 8);
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(&self.packet_id.to_le_bytes());
        out.extend_from_slice(&(self.sequences.len() as u32).to_le_bytes());
        for sequence in &self.sequences {
            out.extend_from_slice(&sequence.to_le_bytes());
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < 44 {
            return Err(CodecError::TooShort {
                need: 44,
                have: data.len(),
            });
        }
        let target = PublicKey::from_bytes(&data[..32]);
        let packet_id = u64::from_le_bytes(data[32..40].try_into().unwrap());
        let count = u32::from_le_bytes(data[40..44].try_into().unwrap()) as usize;

        let need = 44 + count * 8;
        if data.len() < need {
            return Err(CodecError::TooShort {
                need,
                have: data.len(),
            });
        }
        let mut sequences = Vec::with_capacity(count);
        for i in 0..count {
            let start = 44 + i * 8;
            sequences.push(u64::from_le_bytes(data[start..start + 8].try_into().unwrap()));
        }
        Ok(Self {
            target,
            packet_id,
            sequences,
        })
    }
}

/// A batch of pools answering a [`BlockRequest`].
///
/// Layout: `packet_id(8) | pool_count(4) | (pool_len(4) | encoded_pool)*`.
/// Each pool body is SBOR-encoded and length-prefixed so the batch can be
/// walked without decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockReply {
    pub packet_id: u64,
    pub pools: Vec<crate::Pool>,
}

impl BlockReply {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.packet_id.to_le_bytes());
        out.extend_from_slice(&(self.pools.len() as u32).to_le_bytes());
        for pool in &self.pools {
            let body = sbor::basic_encode(pool)
                .map_err(|e| CodecError::SborEncode(format!("{:?}", e)))?;
            out.extend_from_slice(&(body.len() as u32).to_le_bytes());
            out.extend_from_slice(&body);
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < 12 {
            return Err(CodecError::TooShort {
                need: 12,
                have: data.len(),
            });
        }
        let packet_id = u64::from_le_bytes(data[..8].try_into().unwrap());
        let count = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;

        let mut pools = Vec::with_capacity(count);
        let mut offset = 12;
        for _ in 0..count {
            if data.len() < offset + 4 {
                return Err(CodecError::TooShort {
                    need: offset + 4,
                    have: data.len(),
                });
            }
            let len = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
            offset += 4;
            if data.len() < offset + len {
                return Err(CodecError::BadLength(len as u64));
            }
            let pool = sbor::basic_decode(&data[offset..offset + len])
                .map_err(|e| CodecError::SborDecode(format!("{:?}", e)))?;
            offset += len;
            pools.push(pool);
        }
        Ok(Self { packet_id, pools })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Pool;

    #[test]
    fn base_header_is_five_bytes() {
        let header = PacketHeader {
            flags: FLAG_NETWORK_MSG,
            id_lo: 0x0102,
            packet_count: 1,
            fragment: None,
            sender: None,
        };
        let mut out = Vec::new();
        header.encode(&mut out);
        assert_eq!(out, vec![0x01, 0x02, 0x01, 0x01, 0x00]);

        let (decoded, offset) = PacketHeader::decode(&out).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(offset, 5);
    }

    #[test]
    fn fragmented_header_carries_twelve_extra_bytes() {
        let header = PacketHeader {
            flags: FLAG_NETWORK_MSG | FLAG_FRAGMENTED,
            id_lo: 7,
            packet_count: 3,
            fragment: Some(Fragment {
                message_id: 0xAABB,
                index: 1,
                count: 3,
            }),
            sender: None,
        };
        let mut out = Vec::new();
        header.encode(&mut out);
        assert_eq!(out.len(), 5 + 12);

        let (decoded, offset) = PacketHeader::decode(&out).unwrap();
        assert_eq!(decoded.fragment.unwrap().message_id, 0xAABB);
        assert_eq!(offset, 17);
    }

    #[test]
    fn sender_key_follows_header_for_node_messages() {
        let sender = PublicKey::from_bytes(&[9u8; 32]);
        let header = PacketHeader {
            flags: 0,
            id_lo: 0,
            packet_count: 1,
            fragment: None,
            sender: Some(sender),
        };
        let packet = Packet::frame(header, b"payload");
        assert_eq!(packet.bytes().len(), 5 + 32 + 7);
        assert_eq!(packet.payload(), b"payload");

        let parsed = Packet::parse(packet.bytes().to_vec()).unwrap();
        assert_eq!(parsed.header().sender, Some(sender));
        assert_eq!(parsed.hash(), packet.hash());
    }

    #[test]
    fn block_request_layout_is_exact() {
        let request = BlockRequest {
            target: PublicKey::from_bytes(&[1u8; 32]),
            packet_id: 0x0807060504030201,
            sequences: vec![5, 6, 7],
        };
        let bytes = request.encode();
        assert_eq!(bytes.len(), 32 + 8 + 4 + 3 * 8);
        assert_eq!(&bytes[..32], &[1u8; 32]);
        assert_eq!(&bytes[32..40], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[40..44], &[3, 0, 0, 0]);
        assert_eq!(BlockRequest::decode(&bytes).unwrap(), request);
    }

    #[test]
    fn block_reply_walks_pool_batch() {
        let reply = BlockReply {
            packet_id: 42,
            pools: vec![Pool::new(1, b"a".to_vec()), Pool::new(2, b"bb".to_vec())],
        };
        let bytes = reply.encode().unwrap();
        let decoded = BlockReply::decode(&bytes).unwrap();
        assert_eq!(decoded.packet_id, 42);
        assert_eq!(decoded.pools.len(), 2);
        assert_eq!(decoded.pools[1].sequence(), 2);
    }

    #[test]
    fn truncated_request_is_rejected() {
        let request = BlockRequest {
            target: PublicKey::zero(),
            packet_id: 1,
            sequences: vec![1, 2],
        };
        let bytes = request.encode();
        assert!(BlockRequest::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
