//! Message encoding and decoding for the transport.
//!
//! # Wire Format
//!
//! ```text
//! [packet header][kind: u8][body]
//! ```
//!
//! The packet header is the byte-exact frame from `conclave_types::packet`.
//! The kind byte selects the body layout: block requests and replies use the
//! fixed layouts, everything else is SBOR-encoded.

use conclave_core::{Event, OutboundMessage};
use conclave_types::{
    BlockReply, BlockRequest, CodecError, MessageKind, Packet, PacketHeader, PublicKey,
    FLAG_NETWORK_MSG,
};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotone packet id counter; only the low 16 bits travel in the header.
static PACKET_ID: AtomicU64 = AtomicU64::new(1);

fn next_packet_id() -> u64 {
    PACKET_ID.fetch_add(1, Ordering::Relaxed)
}

fn sbor_body<T: sbor::BasicEncode + ?Sized>(kind: MessageKind, value: &T) -> Result<Vec<u8>, CodecError> {
    let encoded =
        sbor::basic_encode(value).map_err(|e| CodecError::SborEncode(format!("{:?}", e)))?;
    let mut body = Vec::with_capacity(1 + encoded.len());
    body.push(kind as u8);
    body.extend_from_slice(&encoded);
    Ok(body)
}

/// Frame an outbound message into a packet carrying our sender key.
pub fn encode_message(own_key: &PublicKey, message: &OutboundMessage) -> Result<Packet, CodecError> {
    let body = match message {
        OutboundMessage::RoundTable(table) => sbor_body(MessageKind::RoundTable, table)?,
        OutboundMessage::Vector(vector) => sbor_body(MessageKind::Vector, vector)?,
        OutboundMessage::Matrix(matrix) => sbor_body(MessageKind::Matrix, matrix)?,
        OutboundMessage::TransactionList(pack) => sbor_body(MessageKind::TransactionList, pack)?,
        OutboundMessage::Block(pool) => sbor_body(MessageKind::Block, pool)?,
        OutboundMessage::BlockReply { packet_id, pools } => {
            let reply = BlockReply {
                packet_id: *packet_id,
                pools: pools.clone(),
            };
            let mut body = vec![MessageKind::BlockReply as u8];
            body.extend_from_slice(&reply.encode()?);
            body
        }
        OutboundMessage::Ping { sequence } => {
            let mut body = vec![MessageKind::Ping as u8];
            body.extend_from_slice(&sequence.to_le_bytes());
            body
        }
    };

    let header = PacketHeader {
        flags: 0,
        id_lo: next_packet_id() as u16,
        packet_count: 1,
        fragment: None,
        sender: Some(*own_key),
    };
    Ok(Packet::frame(header, &body))
}

/// Frame a block request. Block requests are transport-level messages: the
/// target key travels in the body, not the header.
pub fn encode_block_request(request: &BlockRequest) -> Packet {
    let mut body = vec![MessageKind::BlockRequest as u8];
    body.extend_from_slice(&request.encode());
    let header = PacketHeader {
        flags: FLAG_NETWORK_MSG,
        id_lo: request.packet_id as u16,
        packet_count: 1,
        fragment: None,
        sender: None,
    };
    Packet::frame(header, &body)
}

/// Result of decoding an inbound packet.
#[derive(Debug)]
pub enum DecodedMessage {
    /// An event for the core state machine.
    Event(Event),
    /// A block request served directly by the runtime from storage.
    BlockRequest(BlockRequest),
}

fn sender_of(packet: &Packet) -> Result<PublicKey, CodecError> {
    packet
        .header()
        .sender
        .ok_or(CodecError::UnknownFlags(packet.header().flags))
}

/// Decode an inbound packet into an event or a serveable request.
pub fn decode_message(packet: &Packet) -> Result<DecodedMessage, CodecError> {
    let payload = packet.payload();
    if payload.is_empty() {
        return Err(CodecError::TooShort { need: 1, have: 0 });
    }
    let kind = MessageKind::from_byte(payload[0])?;
    let body = &payload[1..];

    let decode_err = |e: sbor::DecodeError| CodecError::SborDecode(format!("{:?}", e));

    let message = match kind {
        MessageKind::RoundTable => DecodedMessage::Event(Event::RoundTableReceived {
            table: sbor::basic_decode(body).map_err(decode_err)?,
        }),
        MessageKind::Vector => DecodedMessage::Event(Event::VectorReceived {
            vector: sbor::basic_decode(body).map_err(decode_err)?,
        }),
        MessageKind::Matrix => DecodedMessage::Event(Event::MatrixReceived {
            matrix: sbor::basic_decode(body).map_err(decode_err)?,
        }),
        MessageKind::TransactionList => DecodedMessage::Event(Event::TransactionListReceived {
            pack: sbor::basic_decode(body).map_err(decode_err)?,
        }),
        MessageKind::Block => DecodedMessage::Event(Event::BlockReceived {
            pool: sbor::basic_decode(body).map_err(decode_err)?,
            sender: sender_of(packet)?,
        }),
        MessageKind::BlockRequest => DecodedMessage::BlockRequest(BlockRequest::decode(body)?),
        MessageKind::BlockReply => {
            let reply = BlockReply::decode(body)?;
            DecodedMessage::Event(Event::BlockRepliesReceived {
                pools: reply.pools,
                packet_id: reply.packet_id,
            })
        }
        MessageKind::Ping => {
            if body.len() < 8 {
                return Err(CodecError::TooShort {
                    need: 8,
                    have: body.len(),
                });
            }
            DecodedMessage::Event(Event::PingReceived {
                key: sender_of(packet)?,
                sequence: u64::from_le_bytes(body[..8].try_into().unwrap()),
            })
        }
    };
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_types::{Pool, RoundTable};

    fn key(n: u8) -> PublicKey {
        PublicKey::from_bytes(&[n; 32])
    }

    #[test]
    fn round_table_round_trips_through_the_frame() {
        let table = RoundTable {
            round: 12,
            writer: key(1),
            confidants: vec![key(1), key(2)],
        };
        let packet = encode_message(&key(3), &OutboundMessage::RoundTable(table.clone())).unwrap();
        let parsed = Packet::parse(packet.bytes().to_vec()).unwrap();

        match decode_message(&parsed).unwrap() {
            DecodedMessage::Event(Event::RoundTableReceived { table: decoded }) => {
                assert_eq!(decoded, table);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn block_carries_its_sender() {
        let pool = Pool::new(4, b"block".to_vec());
        let packet = encode_message(&key(5), &OutboundMessage::Block(pool)).unwrap();

        match decode_message(&packet).unwrap() {
            DecodedMessage::Event(Event::BlockReceived { sender, pool }) => {
                assert_eq!(sender, key(5));
                assert_eq!(pool.sequence(), 4);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn block_request_is_a_network_message() {
        let request = BlockRequest {
            target: key(2),
            packet_id: 9,
            sequences: vec![1, 2, 3],
        };
        let packet = encode_block_request(&request);
        assert!(packet.header().is_network());
        assert!(packet.header().sender.is_none());

        match decode_message(&packet).unwrap() {
            DecodedMessage::BlockRequest(decoded) => assert_eq!(decoded, request),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let header = PacketHeader {
            flags: FLAG_NETWORK_MSG,
            id_lo: 0,
            packet_count: 1,
            fragment: None,
            sender: None,
        };
        let packet = Packet::frame(header, &[0xEE]);
        assert!(decode_message(&packet).is_err());
    }
}
