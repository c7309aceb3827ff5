use serde::{Deserialize, Serialize};

use xln_core::{Amount, Hash32, Height, TimestampMs, TokenId};

/// Full fill in the swap ratio domain: ratios are `0..=65535` / 65535.
pub const FILL_RATIO_FULL: u16 = u16::MAX;

// ── HtlcLock ─────────────────────────────────────────────────────────────────

/// An in-flight hash-time-locked amount. The lock ages against the shared
/// finalized J-height, never against wall time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcLock {
    pub lock_id: String,
    pub hashlock: Hash32,
    /// Informational wall-time deadline carried for routing UIs.
    pub timelock: TimestampMs,
    /// The lock is dead once the finalized J-height reaches this value.
    pub reveal_before_height: Height,
    pub amount: Amount,
    pub token_id: TokenId,
    /// Which side placed the lock (and gets refunded on timeout).
    pub by_left: bool,
    /// Opaque onion payload for multi-hop routing.
    pub envelope: Option<String>,
}

impl HtlcLock {
    pub fn expired(&self, j_height: Height) -> bool {
        self.reveal_before_height <= j_height
    }
}

// ── SwapOffer ────────────────────────────────────────────────────────────────

/// A resting limit-order-like offer: give `give_amount` of one token for
/// `want_amount` of another, accepting partial fills down to
/// `min_fill_ratio / 65535`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapOffer {
    pub offer_id: String,
    pub give_token_id: TokenId,
    pub give_amount: Amount,
    pub want_token_id: TokenId,
    pub want_amount: Amount,
    pub min_fill_ratio: u16,
    /// Which side placed the offer (whose capacity is held).
    pub by_left: bool,
}

impl SwapOffer {
    /// Portion of `amount` covered by `ratio / 65535`, rounded down.
    pub fn apply_ratio(amount: &Amount, ratio: u16) -> Amount {
        Amount((&amount.0 * ratio as u64) / FILL_RATIO_FULL as u64)
    }
}
