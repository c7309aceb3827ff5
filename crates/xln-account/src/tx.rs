use serde::{Deserialize, Serialize};

use xln_core::{Amount, Hash32, Height, SettleDiff, TimestampMs, TokenId};

// ── AccountTx ────────────────────────────────────────────────────────────────

/// Every bilateral state change rides in one of these variants. A frame is
/// an ordered list of them, applied under the proposer's side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccountTx {
    /// Move `amount` from the sender's outgoing capacity to the receiver by
    /// mutating `offdelta`.
    DirectPayment { token_id: TokenId, amount: Amount },

    /// Ensure a delta row exists for `token_id`.
    AddDelta { token_id: TokenId },

    /// Set the sender-side credit limit (the credit the sender extends).
    SetCreditLimit { token_id: TokenId, amount: Amount },

    /// Reserve `amount` of the sender's outgoing capacity behind a hashlock.
    HtlcLock {
        lock_id: String,
        hashlock: Hash32,
        timelock: TimestampMs,
        reveal_before_height: Height,
        amount: Amount,
        token_id: TokenId,
        envelope: Option<String>,
    },

    /// Resolve a lock: a correct secret pays the receiver, an error refunds
    /// the origin.
    HtlcResolve { lock_id: String, outcome: HtlcOutcome },

    /// Place a swap offer, holding `give_amount` of the sender's capacity.
    SwapOffer {
        offer_id: String,
        give_token_id: TokenId,
        give_amount: Amount,
        want_token_id: TokenId,
        want_amount: Amount,
        min_fill_ratio: u16,
    },

    /// Withdraw an open offer (sender must be the offer owner).
    SwapCancel { offer_id: String },

    /// Counterparty fills `fill_ratio / 65535` of an offer; both token rows
    /// move atomically.
    SwapResolve { offer_id: String, fill_ratio: u16, cancel_remainder: bool },

    /// Ring-fence settlement amounts during a workspace negotiation.
    SettleHold { workspace_version: u64, diffs: Vec<SettleDiff> },

    /// Release previously ring-fenced settlement amounts.
    SettleRelease { workspace_version: u64, diffs: Vec<SettleDiff> },

    /// Propagate a finalized J-event that fixes the absolute `collateral`
    /// and `ondelta` for a token. Both sides must cite the same j-block.
    JSync {
        j_block_number: Height,
        token_id: TokenId,
        collateral: Amount,
        ondelta: Amount,
    },
}

/// HTLC resolution outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HtlcOutcome {
    /// Reveal the preimage; `keccak256(secret)` must equal the hashlock.
    Secret { secret: Hash32 },
    /// Fail the lock and refund the origin.
    Error { reason: String },
}

impl AccountTx {
    /// Short tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AccountTx::DirectPayment { .. } => "direct_payment",
            AccountTx::AddDelta { .. } => "add_delta",
            AccountTx::SetCreditLimit { .. } => "set_credit_limit",
            AccountTx::HtlcLock { .. } => "htlc_lock",
            AccountTx::HtlcResolve { .. } => "htlc_resolve",
            AccountTx::SwapOffer { .. } => "swap_offer",
            AccountTx::SwapCancel { .. } => "swap_cancel",
            AccountTx::SwapResolve { .. } => "swap_resolve",
            AccountTx::SettleHold { .. } => "settle_hold",
            AccountTx::SettleRelease { .. } => "settle_release",
            AccountTx::JSync { .. } => "j_sync",
        }
    }
}

// ── AccountEvent ─────────────────────────────────────────────────────────────

/// Events bubbled from the account layer to the owning entity after a frame
/// commits. The entity turns these into follow-up entity transactions on the
/// next tick — never same-tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccountEvent {
    /// A secret was revealed on this account; the entity propagates it to
    /// the inbound leg of the route.
    HtlcRevealed { hashlock: Hash32, secret: Hash32 },

    /// A lock failed (validation or timeout); the originator can cancel
    /// upstream.
    HtlcFailed { lock_id: String, hashlock: Hash32, reason: String },

    SwapOfferFilled { offer_id: String, fill_ratio: u16 },

    SwapOfferCancelled { offer_id: String },
}
