//! Peer set management and packet delivery.
//!
//! The [`Neighbourhood`] owns everything the transport threads need to know
//! about peers: who is connected, which of them are neighbours, confidants or
//! signal servers, which packets each has already seen, and who has earned
//! enough strikes to be black-listed.
//!
//! This crate lives in the network I/O zone: its maps are protected by two
//! short-held mutexes (one for the neighbour roster, one for the connections
//! map) and no handler performs I/O while holding either. The state-machine
//! crates never call in here directly; the runtime does, when executing
//! actions.

mod codec;
mod neighbourhood;
mod peer;

pub use codec::{decode_message, encode_block_request, encode_message, DecodedMessage};
pub use neighbourhood::{Neighbourhood, NeighbourhoodConfig, RegisterError};
pub use peer::{MsgRel, MsgRelMap, Peer, PendingSend};
