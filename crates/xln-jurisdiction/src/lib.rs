//! xln-jurisdiction
//!
//! The on-chain boundary: the Depository ABI surface, the per-entity batch
//! aggregator with its ack/fail lifecycle, the event model, and an
//! in-process deterministic Depository the runtime drives between ticks.

pub mod abi;
pub mod batch;
pub mod depository;
pub mod events;

pub use abi::{batch_hash, c2r_hash, encode_batch, settlement_hash};
pub use batch::{
    Batch, BatchStatus, CollateralPair, CollateralToReserve, DisputeFinalization, DisputeStart,
    ExternalTokenToReserve, Flashloan, JBatchState, PreparedBroadcast, ReserveToCollateral,
    ReserveToExternalToken, ReserveToReserve, RevealSecret, SentBatch, SettlementOp,
};
pub use depository::{CollateralRow, Depository, JurisdictionAdapter};
pub use events::{JBlock, JEvent, JObservation};
