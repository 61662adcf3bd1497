//! Block pool synchronization.
//!
//! The [`PoolSynchronizer`] decides which block sequences are missing,
//! partitions them among neighbours, issues block requests, accepts replies,
//! enforces request timeouts, and reports completion.
//!
//! This is a pure state machine: events in, actions out, no I/O. Peer
//! snapshots arrive through neighbour-membership and ping events; requests
//! leave as [`conclave_core::Action::SendBlockRequest`] actions; storage
//! happens in the runtime, which answers with `BlockStored` events.

mod state;

pub use state::{PoolSynchronizer, SequenceRemovalAccuracy, SyncConfig};
