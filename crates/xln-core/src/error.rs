use thiserror::Error;

use crate::types::{Hash32, Height, TokenId};

/// Coarse classification used by the runtime to route an error: consensus
/// failures freeze the affected account, validation errors evict one tx,
/// broadcast errors schedule a retry, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConsensusFailure,
    ValidationError,
    EncodingError,
    BroadcastError,
    StorageError,
    ProtocolError,
}

#[derive(Debug, Error)]
pub enum XlnError {
    // ── Consensus failures ───────────────────────────────────────────────────
    #[error("bilateral state mismatch on token {token_id} field {field}")]
    BilateralMismatch { token_id: TokenId, field: &'static str },

    #[error("frame chain break at height {height}: expected prev {expected}, got {got}")]
    FrameChainBreak { height: Height, expected: Hash32, got: Hash32 },

    #[error("frame height mismatch: expected {expected}, got {got}")]
    FrameHeightMismatch { expected: Height, got: Height },

    #[error("state hash mismatch at height {height}")]
    StateHashMismatch { height: Height },

    #[error("invalid hanko: {0}")]
    InvalidHanko(String),

    #[error("state injection detected: {0}")]
    StateInjection(String),

    #[error("second unresolved rollback on the same account")]
    DoubleRollback,

    #[error("frame timestamp regressed or drifted: prev {prev}, got {got}")]
    FrameTimestamp { prev: u64, got: u64 },

    #[error("conflicting proposal locked at height {height}")]
    ProposalLocked { height: Height },

    // ── Validation errors ────────────────────────────────────────────────────
    #[error("outgoing capacity exceeded on token {token_id}: need {need}, have {have}")]
    CapacityExceeded { token_id: TokenId, need: String, have: String },

    #[error("htlc lock {0} unknown")]
    UnknownHtlcLock(String),

    #[error("htlc lock {lock_id} expired (reveal deadline {deadline}, j-height {j_height})")]
    HtlcExpired { lock_id: String, deadline: Height, j_height: Height },

    #[error("htlc secret does not hash to the lock's hashlock")]
    HtlcBadSecret,

    #[error("duplicate htlc lock id {0}")]
    DuplicateHtlcLock(String),

    #[error("swap offer {0} unknown")]
    UnknownSwapOffer(String),

    #[error("duplicate swap offer id {0}")]
    DuplicateSwapOffer(String),

    #[error("fill ratio below offer minimum: got {got}, min {min}")]
    FillBelowMinimum { got: u16, min: u16 },

    #[error("credit limit and allowance values must be non-negative")]
    NegativeLimit,

    #[error("amount must be positive")]
    NonPositiveAmount,

    #[error("account mempool full ({cap} entries)")]
    MempoolFull { cap: usize },

    #[error("j_sync references j-block {got}, counterparty finalized {expected}")]
    JSyncBlockMismatch { expected: Height, got: Height },

    #[error("settlement diffs do not conserve value on token {token_id}")]
    SettlementNotConserved { token_id: TokenId },

    #[error("unknown account {0}")]
    UnknownAccount(String),

    #[error("unknown proposal {0}")]
    UnknownProposal(String),

    #[error("vote already recorded for this signer")]
    DuplicateVote,

    // ── Encoding errors ──────────────────────────────────────────────────────
    #[error("canonical encoding rejected: {0}")]
    Encoding(String),

    #[error("floating point values are forbidden in the canonical domain")]
    FloatInCanonicalValue,

    #[error("encoded frame exceeds {max} bytes")]
    FrameTooLarge { max: usize },

    // ── Broadcast errors ─────────────────────────────────────────────────────
    #[error("jurisdiction rejected batch: {0}")]
    Broadcast(String),

    #[error("batch already sent; awaiting ack for nonce {nonce}")]
    BatchAlreadySent { nonce: u64 },

    #[error("batch preflight failed: {0}")]
    BatchPreflight(String),

    // ── Storage errors ───────────────────────────────────────────────────────
    #[error("storage error: {0}")]
    Storage(String),

    #[error("replay version {0} not supported")]
    ReplayVersion(String),

    // ── Protocol errors ──────────────────────────────────────────────────────
    #[error("malformed message: {0}")]
    Protocol(String),

    #[error("message exceeds {max} bytes")]
    MessageTooLarge { max: usize },

    #[error("unknown transaction type {0}")]
    UnknownTxType(String),
}

impl XlnError {
    /// Map a concrete error to its coarse kind.
    pub fn kind(&self) -> ErrorKind {
        use XlnError::*;
        match self {
            BilateralMismatch { .. }
            | FrameChainBreak { .. }
            | FrameHeightMismatch { .. }
            | StateHashMismatch { .. }
            | InvalidHanko(_)
            | StateInjection(_)
            | DoubleRollback
            | FrameTimestamp { .. }
            | ProposalLocked { .. } => ErrorKind::ConsensusFailure,

            CapacityExceeded { .. }
            | UnknownHtlcLock(_)
            | HtlcExpired { .. }
            | HtlcBadSecret
            | DuplicateHtlcLock(_)
            | UnknownSwapOffer(_)
            | DuplicateSwapOffer(_)
            | FillBelowMinimum { .. }
            | NegativeLimit
            | NonPositiveAmount
            | MempoolFull { .. }
            | JSyncBlockMismatch { .. }
            | SettlementNotConserved { .. }
            | UnknownAccount(_)
            | UnknownProposal(_)
            | DuplicateVote => ErrorKind::ValidationError,

            Encoding(_) | FloatInCanonicalValue | FrameTooLarge { .. } => ErrorKind::EncodingError,

            Broadcast(_) | BatchAlreadySent { .. } | BatchPreflight(_) => {
                ErrorKind::BroadcastError
            }

            Storage(_) | ReplayVersion(_) => ErrorKind::StorageError,

            Protocol(_) | MessageTooLarge { .. } | UnknownTxType(_) => ErrorKind::ProtocolError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_cover_all_six() {
        assert_eq!(
            XlnError::DoubleRollback.kind(),
            ErrorKind::ConsensusFailure
        );
        assert_eq!(XlnError::NonPositiveAmount.kind(), ErrorKind::ValidationError);
        assert_eq!(XlnError::FloatInCanonicalValue.kind(), ErrorKind::EncodingError);
        assert_eq!(
            XlnError::Broadcast("revert".into()).kind(),
            ErrorKind::BroadcastError
        );
        assert_eq!(XlnError::Storage("io".into()).kind(), ErrorKind::StorageError);
        assert_eq!(
            XlnError::UnknownTxType("x".into()).kind(),
            ErrorKind::ProtocolError
        );
    }
}
