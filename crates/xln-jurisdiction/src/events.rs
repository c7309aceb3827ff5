//! Jurisdiction blocks and the events the off-chain layers consume.

use serde::{Deserialize, Serialize};

use xln_core::{Amount, EntityId, EvmAddress, Hash32, Height, SignerId, TimestampMs, TokenId};

// ── JEvent ───────────────────────────────────────────────────────────────────

/// Every log the Depository emits that the entity layer reacts to. Replayed
/// into entity state once the block carrying it is finalized by observation
/// consensus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JEvent {
    ReserveUpdated {
        entity: EntityId,
        token_id: TokenId,
        new_balance: Amount,
    },
    /// Absolute post-settlement collateral row for an account pair; feeds
    /// `j_sync` on both sides.
    AccountSettled {
        left: EntityId,
        right: EntityId,
        token_id: TokenId,
        collateral: Amount,
        ondelta: Amount,
    },
    InsuranceRegistered {
        insured: EntityId,
        insurer: EntityId,
        token_id: TokenId,
        amount: Amount,
    },
    InsuranceClaimed {
        insured: EntityId,
        insurer: EntityId,
        token_id: TokenId,
        amount: Amount,
    },
    InsuranceExpired {
        insured: EntityId,
        insurer: EntityId,
        token_id: TokenId,
    },
    DebtCreated {
        debtor: EntityId,
        creditor: EntityId,
        token_id: TokenId,
        amount: Amount,
    },
    DebtEnforced {
        debtor: EntityId,
        creditor: EntityId,
        token_id: TokenId,
        amount: Amount,
    },
    DisputeStarted {
        initiator: EntityId,
        counterentity: EntityId,
        nonce: u64,
    },
    DisputeFinalized {
        left: EntityId,
        right: EntityId,
    },
    HankoBatchProcessed {
        entity: EntityId,
        nonce: u64,
        success: bool,
    },
    SecretRevealed {
        transformer: EvmAddress,
        secret: Hash32,
    },
    GovernanceEnabled {
        entity: EntityId,
    },
}

// ── JBlock ───────────────────────────────────────────────────────────────────

/// One jurisdiction block: number, hashes, and the events it emitted. The
/// observation consensus agrees on `(number, hash)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JBlock {
    pub number: Height,
    pub timestamp: TimestampMs,
    pub prev_hash: Hash32,
    pub hash: Hash32,
    pub state_root: Hash32,
    pub events: Vec<JEvent>,
}

/// One signer's observation of a J-block, submitted as a `j_event` entity
/// transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JObservation {
    pub signer_id: SignerId,
    pub j_height: Height,
    pub j_block_hash: Hash32,
    pub events: Vec<JEvent>,
}
