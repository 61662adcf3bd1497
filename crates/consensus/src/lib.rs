//! Role-based consensus state machine.
//!
//! The node moves through role states as rounds proceed: `Normal` nodes
//! flush transactions, `Trusted` nodes exchange hash vectors and matrices,
//! the round's `Writer` composes the block, `Collect` waits for it, and
//! `Syncing` defers to the pool synchronizer.
//!
//! The deep inheritance chain of role classes this protocol is usually
//! described with is collapsed here into a tagged [`Role`] variant over
//! state structs sharing default handlers through [`RoleBehavior`]; the
//! trusted M/V sub-states become two orthogonal completion flags on a single
//! `Trusted` state.

mod roles;
mod state;

pub use roles::{Outcome, Role, RoleBehavior, RoleKind};
pub use state::{ConsensusConfig, ConsensusState, RoundContext};
