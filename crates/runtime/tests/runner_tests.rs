//! End-to-end tests of the runner loop against mock collaborators.

use conclave_core::{BlockChain, Event, StoreResult, Transport};
use conclave_network::{decode_message, DecodedMessage, Neighbourhood, NeighbourhoodConfig};
use conclave_node::{NodeConfig, NodeStateMachine};
use conclave_runtime::{Rendezvous, Runner, RoundScheduler};
use conclave_types::{Endpoint, Packet, Pool, PublicKey, Sequence};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn key(n: u8) -> PublicKey {
    PublicKey::from_bytes(&[n; 32])
}

fn endpoint(port: u16) -> Endpoint {
    format!("127.0.0.1:{port}").parse().unwrap()
}

#[derive(Default)]
struct RecordingTransport {
    sends: Mutex<Vec<(Endpoint, Vec<u8>)>>,
}

impl Transport for RecordingTransport {
    fn send(&self, endpoint: Endpoint, bytes: &[u8]) {
        self.sends.lock().push((endpoint, bytes.to_vec()));
    }
}

/// A chain that caches out-of-order pools and drains contiguously.
#[derive(Default)]
struct MockChain {
    inner: Mutex<MockChainInner>,
}

#[derive(Default)]
struct MockChainInner {
    last: Sequence,
    blocks: BTreeMap<Sequence, Pool>,
    cache: BTreeMap<Sequence, Pool>,
}

impl MockChain {
    fn with_blocks(range: std::ops::RangeInclusive<Sequence>) -> Self {
        let chain = Self::default();
        {
            let mut inner = chain.inner.lock();
            for sequence in range {
                inner.blocks.insert(sequence, Pool::new(sequence, vec![sequence as u8]));
                inner.last = sequence;
            }
        }
        chain
    }
}

impl BlockChain for MockChain {
    fn last_sequence(&self) -> Sequence {
        self.inner.lock().last
    }

    fn store_block(&self, pool: Pool) -> StoreResult {
        let mut inner = self.inner.lock();
        let sequence = pool.sequence();
        if sequence <= inner.last {
            return StoreResult::Duplicate;
        }
        inner.cache.insert(sequence, pool);
        while let Some(next) = { let want = inner.last + 1; inner.cache.remove(&want) } {
            let stored = inner.last + 1;
            inner.blocks.insert(stored, next);
            inner.last = stored;
        }
        StoreResult::Stored
    }

    fn get_block(&self, sequence: Sequence) -> Option<Pool> {
        self.inner.lock().blocks.get(&sequence).cloned()
    }
}

struct Fixture {
    handle: conclave_runtime::RunnerHandle,
    transport: Arc<RecordingTransport>,
    chain: Arc<MockChain>,
    neighbourhood: Arc<Neighbourhood>,
}

fn spawn_runner(own: PublicKey, chain: Arc<MockChain>) -> Fixture {
    let transport = Arc::new(RecordingTransport::default());
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let neighbourhood = Arc::new(Neighbourhood::new(
        NeighbourhoodConfig::default(),
        transport.clone(),
        events_tx.clone(),
    ));
    let (scheduler, queue) = RoundScheduler::new();
    tokio::spawn(queue.run());

    let state = NodeStateMachine::new(NodeConfig::default(), own, chain.last_sequence());
    let (runner, handle) = Runner::new(
        state,
        own,
        scheduler,
        neighbourhood.clone(),
        chain.clone(),
        transport.clone(),
        events_tx,
        events_rx,
    );
    tokio::spawn(runner.run());

    Fixture {
        handle,
        transport,
        chain,
        neighbourhood,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn far_ahead_ping_produces_a_block_request_on_the_wire() {
    let own = key(1);
    let peer = key(2);
    let fixture = spawn_runner(own, Arc::new(MockChain::default()));

    fixture.neighbourhood.register(peer, endpoint(9001)).unwrap();
    fixture.handle.send_event(Event::PingReceived {
        key: peer,
        sequence: 20,
    });

    tokio::time::sleep(Duration::from_millis(100)).await;

    let sends = fixture.transport.sends.lock().clone();
    let request = sends
        .iter()
        .find_map(|(_, bytes)| {
            let packet = Packet::parse(bytes.clone()).ok()?;
            match decode_message(&packet).ok()? {
                DecodedMessage::BlockRequest(request) => Some(request),
                _ => None,
            }
        })
        .expect("a block request was sent");
    assert_eq!(request.target, peer);
    assert_eq!(request.sequences, (1..=16).collect::<Vec<_>>());

    fixture.handle.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn block_requests_are_served_from_storage() {
    let own = key(1);
    let requester = endpoint(9100);
    let fixture = spawn_runner(own, Arc::new(MockChain::with_blocks(1..=5)));

    let request = conclave_types::BlockRequest {
        target: own,
        packet_id: 77,
        sequences: vec![2, 3, 9],
    };
    let packet = conclave_network::encode_block_request(&request);
    fixture.handle.on_packet(packet.bytes().to_vec(), requester);

    tokio::time::sleep(Duration::from_millis(50)).await;

    let sends = fixture.transport.sends.lock().clone();
    let reply = sends
        .iter()
        .filter(|(endpoint, _)| *endpoint == requester)
        .find_map(|(_, bytes)| {
            let packet = Packet::parse(bytes.clone()).ok()?;
            match decode_message(&packet).ok()? {
                DecodedMessage::Event(Event::BlockRepliesReceived { pools, packet_id }) => {
                    Some((pools, packet_id))
                }
                _ => None,
            }
        })
        .expect("a block reply was sent");
    assert_eq!(reply.1, 77);
    // sequence 9 is not stored and is simply absent from the reply
    let sequences: Vec<_> = reply.0.iter().map(|pool| pool.sequence()).collect();
    assert_eq!(sequences, vec![2, 3]);

    fixture.handle.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stored_replies_advance_the_chain() {
    let own = key(1);
    let peer = key(2);
    let chain = Arc::new(MockChain::default());
    let fixture = spawn_runner(own, chain.clone());

    fixture.neighbourhood.register(peer, endpoint(9001)).unwrap();
    fixture.handle.send_event(Event::PingReceived {
        key: peer,
        sequence: 20,
    });
    // the head of the requested window arrives, out of order
    fixture.handle.send_event(Event::BlockRepliesReceived {
        pools: vec![
            Pool::new(2, vec![2]),
            Pool::new(1, vec![1]),
            Pool::new(4, vec![4]),
            Pool::new(3, vec![3]),
        ],
        packet_id: 1,
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fixture.chain.last_sequence(), 4);

    fixture.handle.shutdown();
}

#[test]
fn rendezvous_pairs_request_and_response_threads() {
    let rendezvous = Arc::new(Rendezvous::new());
    let signature = conclave_types::Signature::from_bytes(&[7u8; 64]);
    assert!(rendezvous.add(signature));

    let responder = rendezvous.clone();
    let handle = std::thread::spawn(move || {
        responder.signal(&signature, conclave_runtime::Condition::Success);
    });

    assert_eq!(
        rendezvous.wait(&signature),
        conclave_runtime::Condition::Success
    );
    handle.join().unwrap();
}
