//! xln-account
//!
//! The bilateral account machine: per-token delta table, capacity
//! derivation, account transactions, frame consensus with the left/right
//! tiebreaker, HTLC and swap lifecycles, and dispute proof building.

pub mod delta;
pub mod frame;
pub mod htlc;
pub mod machine;
pub mod proof;
pub mod state;
pub mod tx;

pub use delta::{Delta, DerivedCapacity};
pub use frame::{snapshot_deltas, AccountFrame, AccountInput, AckPart, ProposalPart};
pub use htlc::{HtlcLock, SwapOffer, FILL_RATIO_FULL};
pub use machine::{
    AccountMachine, AckDraft, HandleOutcome, PendingProposal, ProposeOutcome, StagedFrame,
};
pub use proof::{build_proof, dispute_hash, DisputeProof, ProofBody};
pub use state::{AccountCtx, AccountState, ProofHeader};
pub use tx::{AccountEvent, AccountTx, HtlcOutcome};
