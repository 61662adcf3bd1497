//! The composed node state machine.

mod state;

pub use state::{NodeConfig, NodeStateMachine};
