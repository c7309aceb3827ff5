//! Per-token bilateral accounting record and derived capacities.
//!
//! The axis: `totalDelta = ondelta + offdelta` positions the channel on
//! `[-rightCreditLimit, collateral + leftCreditLimit]`. The left side's
//! collateral claim is `clamp(totalDelta, 0, collateral)`; negative values
//! are left debt (bounded by the credit the right side extends), values
//! above `collateral` are right debt (bounded by the left side's credit).
//! A deposit credited to the left side moves `ondelta` by `+amount`; one
//! credited to the right side leaves `ondelta` untouched.

use serde::{Deserialize, Serialize};

use xln_core::{Amount, TokenId};

// ── Delta ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub token_id: TokenId,
    /// On-chain collateral backing this token row. Never negative.
    pub collateral: Amount,
    /// On-chain portion of the signed net flow (driven by J-events only).
    pub ondelta: Amount,
    /// Off-chain portion of the signed net flow (driven by frames only).
    pub offdelta: Amount,
    /// Credit the left side extends (bounds right-side debt).
    pub left_credit_limit: Amount,
    /// Credit the right side extends (bounds left-side debt).
    pub right_credit_limit: Amount,
    pub left_allowance: Amount,
    pub right_allowance: Amount,
    // Holds partition capacity reserved for in-flight operations.
    pub left_htlc_hold: Amount,
    pub right_htlc_hold: Amount,
    pub left_swap_hold: Amount,
    pub right_swap_hold: Amount,
    pub left_settle_hold: Amount,
    pub right_settle_hold: Amount,
}

impl Delta {
    pub fn new(token_id: TokenId) -> Self {
        Self {
            token_id,
            collateral: Amount::zero(),
            ondelta: Amount::zero(),
            offdelta: Amount::zero(),
            left_credit_limit: Amount::zero(),
            right_credit_limit: Amount::zero(),
            left_allowance: Amount::zero(),
            right_allowance: Amount::zero(),
            left_htlc_hold: Amount::zero(),
            right_htlc_hold: Amount::zero(),
            left_swap_hold: Amount::zero(),
            right_swap_hold: Amount::zero(),
            left_settle_hold: Amount::zero(),
            right_settle_hold: Amount::zero(),
        }
    }

    pub fn total_delta(&self) -> Amount {
        &self.ondelta + &self.offdelta
    }

    pub fn total_capacity(&self) -> Amount {
        &(&self.collateral + &self.left_credit_limit) + &self.right_credit_limit
    }

    pub fn holds(&self, left: bool) -> Amount {
        if left {
            &(&self.left_htlc_hold + &self.left_swap_hold) + &self.left_settle_hold
        } else {
            &(&self.right_htlc_hold + &self.right_swap_hold) + &self.right_settle_hold
        }
    }

    pub fn allowance(&self, left: bool) -> &Amount {
        if left {
            &self.left_allowance
        } else {
            &self.right_allowance
        }
    }

    pub fn credit_limit_of(&self, left: bool) -> &Amount {
        if left {
            &self.left_credit_limit
        } else {
            &self.right_credit_limit
        }
    }

    /// Raw outgoing capacity of one side, before holds and allowances.
    fn raw_out(&self, left: bool) -> Amount {
        let zero = Amount::zero();
        let total = self.total_capacity();
        let raw = if left {
            &self.total_delta() + &self.right_credit_limit
        } else {
            &(&self.collateral + &self.left_credit_limit) - &self.total_delta()
        };
        Amount::clamp(&raw, &zero, &total)
    }

    /// Hold-and-allowance-adjusted capacities viewed from one side.
    pub fn derive(&self, left: bool) -> DerivedCapacity {
        let out = (&(&self.raw_out(left) - &self.holds(left)) - self.allowance(left))
            .non_negative();
        let in_ = (&(&self.raw_out(!left) - &self.holds(!left)) - self.allowance(!left))
            .non_negative();
        DerivedCapacity { out_capacity: out, in_capacity: in_ }
    }

    /// True when every bilateral field is zero — such rows are elided from
    /// frame snapshots.
    pub fn is_bilateral_zero(&self) -> bool {
        self.offdelta.is_zero()
            && self.left_credit_limit.is_zero()
            && self.right_credit_limit.is_zero()
            && self.left_allowance.is_zero()
            && self.right_allowance.is_zero()
            && self.holds(true).is_zero()
            && self.holds(false).is_zero()
    }

    /// Compare the fields both sides must agree on exactly. `ondelta` and
    /// `collateral` are excluded: they follow asynchronously observed
    /// J-events and may legitimately diverge until both sides finalize the
    /// same J-block.
    pub fn bilateral_eq(&self, other: &Delta) -> Result<(), &'static str> {
        if self.offdelta != other.offdelta {
            return Err("offdelta");
        }
        if self.left_credit_limit != other.left_credit_limit {
            return Err("left_credit_limit");
        }
        if self.right_credit_limit != other.right_credit_limit {
            return Err("right_credit_limit");
        }
        if self.left_allowance != other.left_allowance {
            return Err("left_allowance");
        }
        if self.right_allowance != other.right_allowance {
            return Err("right_allowance");
        }
        Ok(())
    }
}

/// Derived spendable amounts for one side of a delta row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedCapacity {
    pub out_capacity: Amount,
    pub in_capacity: Amount,
}
