//! Per-peer bookkeeping.

use conclave_types::{Endpoint, Hash, Packet, PublicKey, Sequence};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Relation of a peer to one packet hash.
#[derive(Debug, Clone, Copy)]
pub struct MsgRel {
    /// We still owe this peer the packet (no ack seen).
    pub need_send: bool,
    /// We have already pushed the packet to this peer at least once.
    pub sent: bool,
}

impl Default for MsgRel {
    fn default() -> Self {
        Self {
            need_send: true,
            sent: false,
        }
    }
}

/// Size-bounded FIFO map of the packet hashes a peer is known to relate to.
///
/// Retains the most recent `capacity` hashes; older entries are evicted in
/// insertion order, after which a later re-broadcast of the same hash is
/// permitted again.
#[derive(Debug)]
pub struct MsgRelMap {
    capacity: usize,
    order: VecDeque<Hash>,
    rels: HashMap<Hash, MsgRel>,
}

impl MsgRelMap {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            rels: HashMap::with_capacity(capacity),
        }
    }

    /// Look up or create the relation for `hash`, evicting the oldest entry
    /// when the map is full.
    pub fn entry(&mut self, hash: Hash) -> &mut MsgRel {
        if !self.rels.contains_key(&hash) {
            if self.order.len() == self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.rels.remove(&evicted);
                }
            }
            self.order.push_back(hash);
            self.rels.insert(hash, MsgRel::default());
        }
        self.rels.get_mut(&hash).expect("inserted above")
    }

    pub fn get(&self, hash: &Hash) -> Option<&MsgRel> {
        self.rels.get(hash)
    }

    pub fn get_mut(&mut self, hash: &Hash) -> Option<&mut MsgRel> {
        self.rels.get_mut(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.rels.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// An unacked packet owed to a peer, with its resend attempts.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub packet: Arc<Packet>,
    pub attempts: u32,
}

/// A known peer, as the transport side sees it.
///
/// Created on first registration, destroyed when pruned for inactivity.
/// Identity is the public key; endpoints may change across reconnects. The
/// per-peer requested-sequence queue lives in the synchronizer, which is the
/// sole mutator of that state on the core consumer task.
#[derive(Debug)]
pub struct Peer {
    pub key: PublicKey,
    pub endpoint_in: Endpoint,
    pub endpoint_out: Option<Endpoint>,

    /// The tip this peer last advertised.
    pub last_sequence: Sequence,

    pub strikes: u32,
    pub black_listed: bool,
    pub is_signal_server: bool,

    /// Packet hashes this peer is known to have seen or been sent.
    pub msg_rels: MsgRelMap,

    /// Packets sent to this peer and not yet acknowledged.
    pub pending: HashMap<Hash, PendingSend>,
}

impl Peer {
    pub fn new(key: PublicKey, endpoint_in: Endpoint, msg_rel_capacity: usize) -> Self {
        Self {
            key,
            endpoint_in,
            endpoint_out: None,
            last_sequence: 0,
            strikes: 0,
            black_listed: false,
            is_signal_server: false,
            msg_rels: MsgRelMap::new(msg_rel_capacity),
            pending: HashMap::new(),
        }
    }

    /// The endpoint to send to.
    pub fn out_endpoint(&self) -> Endpoint {
        self.endpoint_out.unwrap_or(self.endpoint_in)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn hash(n: u8) -> Hash {
        Hash::digest(&[n])
    }

    #[test]
    fn msg_rel_map_evicts_fifo() {
        let mut map = MsgRelMap::new(2);
        map.entry(hash(1));
        map.entry(hash(2));
        map.entry(hash(3));
        assert_eq!(map.len(), 2);
        assert!(!map.contains(&hash(1)));
        assert!(map.contains(&hash(2)));
        assert!(map.contains(&hash(3)));
    }

    #[test]
    fn msg_rel_entry_is_stable_for_known_hash() {
        let mut map = MsgRelMap::new(2);
        map.entry(hash(1)).need_send = false;
        assert!(!map.entry(hash(1)).need_send);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn outbound_endpoint_prefers_the_special_out() {
        let mut peer = Peer::new(PublicKey::zero(), endpoint(), 8);
        assert_eq!(peer.out_endpoint(), endpoint());

        let out: Endpoint = "127.0.0.1:9999".parse().unwrap();
        peer.endpoint_out = Some(out);
        assert_eq!(peer.out_endpoint(), out);
    }
}
