//! The active peer set.

use crate::peer::{Peer, PendingSend};
use conclave_core::{Event, Transport};
use conclave_types::{Endpoint, Hash, Packet, PublicKey, Sequence};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Configuration for the neighbourhood.
#[derive(Debug, Clone)]
pub struct NeighbourhoodConfig {
    /// Maximum peers tracked in total.
    pub max_connections: usize,
    /// Maximum active neighbours.
    pub max_neighbours: usize,
    /// Below this many neighbours the node actively dials new peers.
    pub min_neighbours: usize,
    /// Resend attempts per packet per peer before the peer takes a strike.
    pub max_resend_times: u32,
    /// Most recent packet hashes remembered per peer.
    pub max_messages_to_keep: usize,
    /// Strikes before a peer is black-listed.
    pub strike_threshold: u32,
}

impl Default for NeighbourhoodConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            max_neighbours: 256,
            min_neighbours: 3,
            max_resend_times: 4,
            max_messages_to_keep: 128,
            strike_threshold: 16,
        }
    }
}

/// Errors from peer registration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("peer table full ({0} connections)")]
    Capacity(usize),
}

/// Neighbour / confidant rosters. Guarded by its own lock so broadcast paths
/// never contend with connection registration.
#[derive(Debug, Default)]
struct Roster {
    neighbours: VecDeque<PublicKey>,
    confidants: Vec<PublicKey>,
}

/// Manages the set of known peers, delivers packets, and classifies peers
/// into neighbours, confidants and signal servers.
///
/// Two mutexes: one for the rosters, one for the connections map (which
/// carries all per-peer state, unacked sends included). Lock order: `roster`
/// before `peers`. Both are held briefly; transport sends happen after every
/// lock is released.
pub struct Neighbourhood {
    config: NeighbourhoodConfig,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<Event>,
    peers: Mutex<HashMap<PublicKey, Peer>>,
    roster: Mutex<Roster>,
}

impl Neighbourhood {
    pub fn new(
        config: NeighbourhoodConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            config,
            transport,
            events,
            peers: Mutex::new(HashMap::new()),
            roster: Mutex::new(Roster::default()),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Registration and classification
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert or update a peer by public key. On endpoint change the old
    /// endpoint is retired. Fails once the connection table is full and the
    /// peer is unknown.
    pub fn register(&self, key: PublicKey, endpoint: Endpoint) -> Result<(), RegisterError> {
        let mut roster = self.roster.lock();
        let mut peers = self.peers.lock();

        if let Some(peer) = peers.get_mut(&key) {
            if peer.endpoint_in != endpoint {
                trace!(?key, old = %peer.endpoint_in, new = %endpoint, "Peer endpoint changed");
                peer.endpoint_in = endpoint;
                peer.endpoint_out = None;
            }
            return Ok(());
        }

        if peers.len() >= self.config.max_connections {
            return Err(RegisterError::Capacity(self.config.max_connections));
        }

        peers.insert(
            key,
            Peer::new(key, endpoint, self.config.max_messages_to_keep),
        );
        debug!(?key, %endpoint, "Peer registered");

        if roster.neighbours.len() < self.config.max_neighbours {
            roster.neighbours.push_back(key);
            let _ = self.events.send(Event::NeighbourAdded { key, sequence: 0 });
        }
        Ok(())
    }

    /// Register a bootstrap peer. Signal servers never count toward the
    /// neighbour roster and are excluded from sync selection.
    pub fn add_signal_server(
        &self,
        key: PublicKey,
        endpoint_in: Endpoint,
        endpoint_out: Option<Endpoint>,
    ) {
        let mut peers = self.peers.lock();
        let peer = peers
            .entry(key)
            .or_insert_with(|| Peer::new(key, endpoint_in, self.config.max_messages_to_keep));
        peer.endpoint_in = endpoint_in;
        peer.endpoint_out = endpoint_out;
        peer.is_signal_server = true;
        debug!(?key, %endpoint_in, "Signal server registered");
    }

    /// Mark a known peer as a confidant for the current round.
    pub fn add_confidant(&self, key: PublicKey) {
        let mut roster = self.roster.lock();
        let peers = self.peers.lock();
        let eligible = peers
            .get(&key)
            .is_some_and(|peer| !peer.black_listed);
        if eligible && !roster.confidants.contains(&key) {
            roster.confidants.push(key);
        }
    }

    /// The confidant set is rebuilt from each round table.
    pub fn reset_confidants(&self) {
        self.roster.lock().confidants.clear();
    }

    /// Record a peer's advertised tip.
    pub fn update_sequence(&self, key: &PublicKey, sequence: Sequence) {
        if let Some(peer) = self.peers.lock().get_mut(key) {
            peer.last_sequence = sequence;
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Delivery
    // ═══════════════════════════════════════════════════════════════════════

    /// Broadcast to every current neighbour that has not acknowledged the
    /// packet's hash. A peer never receives the same hash twice through this
    /// path while the hash is still present in its relation map.
    pub fn send_by_neighbours(&self, packet: &Packet) {
        let keys: Vec<PublicKey> = self.roster.lock().neighbours.iter().copied().collect();
        self.dispatch(packet, &keys);
    }

    /// Directed send to each confidant of the current round; same dedup
    /// discipline as neighbour broadcast.
    pub fn send_by_confidants(&self, packet: &Packet) {
        let keys: Vec<PublicKey> = self.roster.lock().confidants.clone();
        self.dispatch(packet, &keys);
    }

    /// Directed send to one peer.
    pub fn send_to(&self, key: &PublicKey, packet: &Packet) {
        self.dispatch(packet, std::slice::from_ref(key));
    }

    fn dispatch(&self, packet: &Packet, keys: &[PublicKey]) {
        let hash = packet.hash();
        let shared = Arc::new(packet.clone());
        let mut sends: Vec<Endpoint> = Vec::new();

        {
            let mut peers = self.peers.lock();
            for key in keys {
                let Some(peer) = peers.get_mut(key) else {
                    continue;
                };
                if peer.black_listed {
                    continue;
                }
                let rel = peer.msg_rels.entry(hash);
                if !rel.need_send || rel.sent {
                    continue;
                }
                rel.sent = true;
                peer.pending.insert(
                    hash,
                    PendingSend {
                        packet: shared.clone(),
                        attempts: 0,
                    },
                );
                sends.push(peer.out_endpoint());
            }
        }

        if sends.is_empty() {
            return;
        }

        trace!(?hash, count = sends.len(), "Dispatching packet");
        for endpoint in sends {
            self.transport.send(endpoint, packet.bytes());
        }
    }

    /// Re-enqueue unacked packets. A packet that exhausts its resend budget
    /// for a peer is dropped for that peer, who takes a strike. Returns the
    /// number of strikes issued this pass.
    pub fn resend_pending(&self) -> usize {
        let mut sends: Vec<(Endpoint, Arc<Packet>)> = Vec::new();
        let mut struck: Vec<PublicKey> = Vec::new();

        {
            let mut peers = self.peers.lock();
            for peer in peers.values_mut() {
                if peer.black_listed || peer.pending.is_empty() {
                    continue;
                }
                let endpoint = peer.out_endpoint();
                let key = peer.key;
                let max_resend = self.config.max_resend_times;
                let msg_rels = &peer.msg_rels;
                peer.pending.retain(|hash, send| {
                    match msg_rels.get(hash) {
                        // acked, or evicted from the relation map
                        Some(rel) if !rel.need_send => false,
                        None => false,
                        Some(_) => {
                            send.attempts += 1;
                            if send.attempts > max_resend {
                                struck.push(key);
                                false
                            } else {
                                sends.push((endpoint, send.packet.clone()));
                                true
                            }
                        }
                    }
                });
            }
        }

        for (endpoint, packet) in sends {
            self.transport.send(endpoint, packet.bytes());
        }

        let strikes = struck.len();
        for key in struck {
            warn!(?key, "Peer exhausted resend budget");
            self.strike(&key);
        }
        strikes
    }

    /// Mark that `key` has seen `hash`; clears any future sends of it.
    pub fn neighbour_has_packet(&self, key: &PublicKey, hash: &Hash, _is_direct: bool) {
        let mut peers = self.peers.lock();
        if let Some(peer) = peers.get_mut(key) {
            peer.msg_rels.entry(*hash).need_send = false;
            peer.pending.remove(hash);
        }
    }

    /// Record that `key` originated `hash` itself, so our re-broadcast skips
    /// it.
    pub fn neighbour_sent_packet(&self, key: &PublicKey, hash: &Hash) {
        let mut peers = self.peers.lock();
        if let Some(peer) = peers.get_mut(key) {
            peer.msg_rels.entry(*hash).need_send = false;
            peer.pending.remove(hash);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Failure accounting
    // ═══════════════════════════════════════════════════════════════════════

    /// Increment a peer's strike counter. At the threshold the peer is
    /// black-listed and removed from the active sets; black-listing is
    /// terminal for the identity until manual reset or process restart.
    pub fn strike(&self, key: &PublicKey) {
        let black_listed = {
            let mut peers = self.peers.lock();
            let Some(peer) = peers.get_mut(key) else {
                return;
            };
            peer.strikes += 1;
            if peer.strikes >= self.config.strike_threshold && !peer.black_listed {
                peer.black_listed = true;
                peer.pending.clear();
                true
            } else {
                false
            }
        };

        if black_listed {
            warn!(?key, "Peer black-listed");
            let mut roster = self.roster.lock();
            roster.neighbours.retain(|k| k != key);
            roster.confidants.retain(|k| k != key);
            drop(roster);
            let _ = self.events.send(Event::NeighbourRemoved { key: *key });
        }
    }

    /// Clear a peer's strikes and black-list flag (manual operator reset).
    pub fn reset_strikes(&self, key: &PublicKey) {
        if let Some(peer) = self.peers.lock().get_mut(key) {
            peer.strikes = 0;
            peer.black_listed = false;
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Selection
    // ═══════════════════════════════════════════════════════════════════════

    /// Refill the neighbour roster up to capacity with an approximately
    /// uniform sample of the known peers, preferring peers whose advertised
    /// sequence is at least the local one.
    pub fn choose_neighbours(&self, local_sequence: Sequence) {
        let mut added: Vec<(PublicKey, Sequence)> = Vec::new();
        {
            let mut roster = self.roster.lock();
            let peers = self.peers.lock();

            let mut preferred: Vec<&Peer> = Vec::new();
            let mut fallback: Vec<&Peer> = Vec::new();
            for peer in peers.values() {
                if peer.black_listed
                    || peer.is_signal_server
                    || roster.neighbours.contains(&peer.key)
                {
                    continue;
                }
                if peer.last_sequence >= local_sequence {
                    preferred.push(peer);
                } else {
                    fallback.push(peer);
                }
            }

            let mut rng = rand::thread_rng();
            preferred.shuffle(&mut rng);
            fallback.shuffle(&mut rng);

            for peer in preferred.into_iter().chain(fallback) {
                if roster.neighbours.len() >= self.config.max_neighbours {
                    break;
                }
                roster.neighbours.push_back(peer.key);
                added.push((peer.key, peer.last_sequence));
            }
        }

        for (key, sequence) in added {
            debug!(?key, sequence, "Neighbour chosen");
            let _ = self.events.send(Event::NeighbourAdded { key, sequence });
        }
    }

    /// Drop the whole neighbour roster and refill it. Used when sync stalls.
    pub fn reselect_neighbours(&self, local_sequence: Sequence) {
        let dropped: Vec<PublicKey> = {
            let mut roster = self.roster.lock();
            roster.neighbours.drain(..).collect()
        };
        for key in dropped {
            let _ = self.events.send(Event::NeighbourRemoved { key });
        }
        self.choose_neighbours(local_sequence);
    }

    /// A uniformly random neighbour whose advertised sequence is strictly
    /// greater than the local one; `None` if no neighbour qualifies.
    pub fn get_random_sync_neighbour(
        &self,
        local_sequence: Sequence,
    ) -> Option<(PublicKey, Sequence)> {
        let keys: Vec<PublicKey> = self.roster.lock().neighbours.iter().copied().collect();
        let peers = self.peers.lock();
        let qualified: Vec<(PublicKey, Sequence)> = keys
            .iter()
            .filter_map(|key| peers.get(key))
            .filter(|peer| {
                !peer.black_listed
                    && !peer.is_signal_server
                    && peer.last_sequence > local_sequence
            })
            .map(|peer| (peer.key, peer.last_sequence))
            .collect();
        if qualified.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..qualified.len());
        Some(qualified[index])
    }

    /// Snapshot iteration over the active neighbours under the peers lock.
    /// The callback must not perform I/O.
    pub fn for_each_neighbour(&self, mut cb: impl FnMut(&Peer)) {
        let keys: Vec<PublicKey> = self.roster.lock().neighbours.iter().copied().collect();
        let peers = self.peers.lock();
        for key in &keys {
            if let Some(peer) = peers.get(key) {
                if !peer.black_listed && !peer.is_signal_server {
                    cb(peer);
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn neighbour_count(&self) -> usize {
        self.roster.lock().neighbours.len()
    }

    pub fn confidant_count(&self) -> usize {
        self.roster.lock().confidants.len()
    }

    pub fn is_neighbour(&self, key: &PublicKey) -> bool {
        self.roster.lock().neighbours.contains(key)
    }

    /// Whether the node should actively dial for more peers.
    pub fn needs_more_neighbours(&self) -> bool {
        self.neighbour_count() < self.config.min_neighbours
    }

    pub fn endpoint_of(&self, key: &PublicKey) -> Option<Endpoint> {
        self.peers.lock().get(key).map(|peer| peer.out_endpoint())
    }

    pub fn config(&self) -> &NeighbourhoodConfig {
        &self.config
    }
}
