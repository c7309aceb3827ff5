//! xln-entity
//!
//! The replicated entity machine: entity transactions, the BFT
//! proposer/validator loop with per-hash precommits and quorum hankos,
//! account-input routing, and J-block observation consensus.

pub mod config;
pub mod replica;
pub mod routing;
pub mod state;
pub mod tx;

pub use config::{ConsensusConfig, ValidatorEntry};
pub use replica::{EntityReplica, LockedFrame, ProposedFrame};
pub use routing::{DirectPathfinder, PathQuery, Pathfinder, RouteCandidate};
pub use state::{
    canonical_pair, EntityCtx, EntityState, GovProposal, ObservationSlot, Profile, RouteHops,
    StagedOutput, TxEffects,
};
pub use tx::{EntityMsg, EntityTx, JSubmission, ProposedFrameWire, RoutedMessage};
