//! Canonical bilateral account state and the transaction apply engine.
//!
//! Both sides hold an identical `AccountState`; everything side-specific
//! (mempool, pending proposal, rollback bookkeeping) lives on the
//! [`crate::machine::AccountMachine`]. Application always happens against a
//! working clone first; a failing transaction leaves the persistent state
//! untouched.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use xln_core::{Amount, EntityId, EvmAddress, Hash32, Height, TimestampMs, TokenId, XlnError};
use xln_crypto::keccak256;

use crate::delta::Delta;
use crate::htlc::{HtlcLock, SwapOffer, FILL_RATIO_FULL};
use crate::tx::{AccountEvent, AccountTx, HtlcOutcome};

// ── Context ──────────────────────────────────────────────────────────────────

/// Deterministic inputs a tx application may consult. Supplied by the
/// entity layer; never read from a wall clock.
#[derive(Debug, Clone)]
pub struct AccountCtx {
    /// `env.timestamp` at the current tick.
    pub timestamp: TimestampMs,
    /// The proposing entity's last finalized J-height.
    pub j_height: Height,
    /// Depository address for dispute hash domains.
    pub depository: EvmAddress,
}

// ── ProofHeader ──────────────────────────────────────────────────────────────

/// On-chain dispute domain header. `dispute_nonce` is the current frame
/// height; `cooperative_nonce` advances once per committed frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofHeader {
    pub from_entity: EntityId,
    pub to_entity: EntityId,
    pub cooperative_nonce: u64,
    pub dispute_nonce: u64,
}

// ── AccountState ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub left: EntityId,
    pub right: EntityId,
    pub height: Height,
    pub timestamp: TimestampMs,
    pub deltas: BTreeMap<TokenId, Delta>,
    pub htlc_locks: BTreeMap<String, HtlcLock>,
    pub swap_offers: BTreeMap<String, SwapOffer>,
    /// Advances once per committed frame; the on-chain dispute domain
    /// requires a single monotone counter.
    pub cooperative_nonce: u64,
    /// Nonce of the last on-chain settlement observed for this pair.
    pub last_settlement_nonce: u64,
    /// Version of the settlement workspace whose holds are in place.
    pub settle_workspace_version: u64,
}

impl AccountState {
    pub fn new(a: EntityId, b: EntityId) -> Self {
        let (left, right) = if a < b { (a, b) } else { (b, a) };
        Self {
            left,
            right,
            height: 0,
            timestamp: 0,
            deltas: BTreeMap::new(),
            htlc_locks: BTreeMap::new(),
            swap_offers: BTreeMap::new(),
            cooperative_nonce: 0,
            last_settlement_nonce: 0,
            settle_workspace_version: 0,
        }
    }

    pub fn delta_mut(&mut self, token_id: TokenId) -> &mut Delta {
        self.deltas.entry(token_id).or_insert_with(|| Delta::new(token_id))
    }

    fn ensure_out_capacity(
        &self,
        token_id: TokenId,
        by_left: bool,
        amount: &Amount,
    ) -> Result<(), XlnError> {
        let have = self
            .deltas
            .get(&token_id)
            .map(|d| d.derive(by_left).out_capacity)
            .unwrap_or_else(Amount::zero);
        if &have < amount {
            return Err(XlnError::CapacityExceeded {
                token_id,
                need: amount.to_decimal(),
                have: have.to_decimal(),
            });
        }
        Ok(())
    }

    /// Move `amount` of off-chain flow from `by_left`'s side to the peer.
    fn pay_offdelta(&mut self, token_id: TokenId, by_left: bool, amount: &Amount) {
        let row = self.delta_mut(token_id);
        if by_left {
            row.offdelta -= amount;
        } else {
            row.offdelta += amount;
        }
    }

    /// Apply one transaction sent by the `by_left` side. Returns the events
    /// the entity layer bubbles after commit.
    pub fn apply_tx(
        &mut self,
        tx: &AccountTx,
        by_left: bool,
        ctx: &AccountCtx,
    ) -> Result<Vec<AccountEvent>, XlnError> {
        match tx {
            AccountTx::DirectPayment { token_id, amount } => {
                if !amount.is_positive() {
                    return Err(XlnError::NonPositiveAmount);
                }
                self.ensure_out_capacity(*token_id, by_left, amount)?;
                self.pay_offdelta(*token_id, by_left, amount);
                Ok(Vec::new())
            }

            AccountTx::AddDelta { token_id } => {
                self.delta_mut(*token_id);
                Ok(Vec::new())
            }

            AccountTx::SetCreditLimit { token_id, amount } => {
                if amount.is_negative() {
                    return Err(XlnError::NegativeLimit);
                }
                let row = self.delta_mut(*token_id);
                if by_left {
                    row.left_credit_limit = amount.clone();
                } else {
                    row.right_credit_limit = amount.clone();
                }
                Ok(Vec::new())
            }

            AccountTx::HtlcLock {
                lock_id,
                hashlock,
                timelock,
                reveal_before_height,
                amount,
                token_id,
                envelope,
            } => {
                if !amount.is_positive() {
                    return Err(XlnError::NonPositiveAmount);
                }
                if self.htlc_locks.contains_key(lock_id) {
                    return Err(XlnError::DuplicateHtlcLock(lock_id.clone()));
                }
                if *reveal_before_height <= ctx.j_height {
                    return Err(XlnError::HtlcExpired {
                        lock_id: lock_id.clone(),
                        deadline: *reveal_before_height,
                        j_height: ctx.j_height,
                    });
                }
                self.ensure_out_capacity(*token_id, by_left, amount)?;
                let row = self.delta_mut(*token_id);
                if by_left {
                    row.left_htlc_hold += amount;
                } else {
                    row.right_htlc_hold += amount;
                }
                self.htlc_locks.insert(
                    lock_id.clone(),
                    HtlcLock {
                        lock_id: lock_id.clone(),
                        hashlock: *hashlock,
                        timelock: *timelock,
                        reveal_before_height: *reveal_before_height,
                        amount: amount.clone(),
                        token_id: *token_id,
                        by_left,
                        envelope: envelope.clone(),
                    },
                );
                Ok(Vec::new())
            }

            AccountTx::HtlcResolve { lock_id, outcome } => {
                let lock = self
                    .htlc_locks
                    .get(lock_id)
                    .cloned()
                    .ok_or_else(|| XlnError::UnknownHtlcLock(lock_id.clone()))?;
                match outcome {
                    HtlcOutcome::Secret { secret } => {
                        if keccak256(secret.as_bytes()) != lock.hashlock {
                            return Err(XlnError::HtlcBadSecret);
                        }
                        if lock.expired(ctx.j_height) {
                            return Err(XlnError::HtlcExpired {
                                lock_id: lock_id.clone(),
                                deadline: lock.reveal_before_height,
                                j_height: ctx.j_height,
                            });
                        }
                        self.release_htlc_hold(&lock);
                        self.pay_offdelta(lock.token_id, lock.by_left, &lock.amount);
                        self.htlc_locks.remove(lock_id);
                        Ok(vec![AccountEvent::HtlcRevealed {
                            hashlock: lock.hashlock,
                            secret: *secret,
                        }])
                    }
                    HtlcOutcome::Error { reason } => {
                        self.release_htlc_hold(&lock);
                        self.htlc_locks.remove(lock_id);
                        Ok(vec![AccountEvent::HtlcFailed {
                            lock_id: lock_id.clone(),
                            hashlock: lock.hashlock,
                            reason: reason.clone(),
                        }])
                    }
                }
            }

            AccountTx::SwapOffer {
                offer_id,
                give_token_id,
                give_amount,
                want_token_id,
                want_amount,
                min_fill_ratio,
            } => {
                if !give_amount.is_positive() || !want_amount.is_positive() {
                    return Err(XlnError::NonPositiveAmount);
                }
                if self.swap_offers.contains_key(offer_id) {
                    return Err(XlnError::DuplicateSwapOffer(offer_id.clone()));
                }
                self.ensure_out_capacity(*give_token_id, by_left, give_amount)?;
                let row = self.delta_mut(*give_token_id);
                if by_left {
                    row.left_swap_hold += give_amount;
                } else {
                    row.right_swap_hold += give_amount;
                }
                self.swap_offers.insert(
                    offer_id.clone(),
                    SwapOffer {
                        offer_id: offer_id.clone(),
                        give_token_id: *give_token_id,
                        give_amount: give_amount.clone(),
                        want_token_id: *want_token_id,
                        want_amount: want_amount.clone(),
                        min_fill_ratio: *min_fill_ratio,
                        by_left,
                    },
                );
                Ok(Vec::new())
            }

            AccountTx::SwapCancel { offer_id } => {
                let offer = self
                    .swap_offers
                    .get(offer_id)
                    .cloned()
                    .ok_or_else(|| XlnError::UnknownSwapOffer(offer_id.clone()))?;
                if offer.by_left != by_left {
                    return Err(XlnError::UnknownSwapOffer(offer_id.clone()));
                }
                self.release_swap_hold(&offer, &offer.give_amount);
                self.swap_offers.remove(offer_id);
                Ok(vec![AccountEvent::SwapOfferCancelled { offer_id: offer_id.clone() }])
            }

            AccountTx::SwapResolve { offer_id, fill_ratio, cancel_remainder } => {
                let offer = self
                    .swap_offers
                    .get(offer_id)
                    .cloned()
                    .ok_or_else(|| XlnError::UnknownSwapOffer(offer_id.clone()))?;
                if offer.by_left == by_left {
                    // Only the counterparty fills.
                    return Err(XlnError::UnknownSwapOffer(offer_id.clone()));
                }
                if *fill_ratio == 0 && *cancel_remainder {
                    // A declined offer: release everything.
                    self.release_swap_hold(&offer, &offer.give_amount);
                    self.swap_offers.remove(offer_id);
                    return Ok(vec![AccountEvent::SwapOfferCancelled {
                        offer_id: offer_id.clone(),
                    }]);
                }
                if *fill_ratio < offer.min_fill_ratio {
                    return Err(XlnError::FillBelowMinimum {
                        got: *fill_ratio,
                        min: offer.min_fill_ratio,
                    });
                }

                let give_fill = SwapOffer::apply_ratio(&offer.give_amount, *fill_ratio);
                let want_fill = SwapOffer::apply_ratio(&offer.want_amount, *fill_ratio);

                // Filler pays the want leg from live capacity.
                self.ensure_out_capacity(offer.want_token_id, by_left, &want_fill)?;

                // Owner's give leg comes out of the swap hold.
                self.release_swap_hold(&offer, &give_fill);
                self.pay_offdelta(offer.give_token_id, offer.by_left, &give_fill);
                self.pay_offdelta(offer.want_token_id, by_left, &want_fill);

                let remainder = &offer.give_amount - &give_fill;
                if *cancel_remainder || *fill_ratio == FILL_RATIO_FULL || remainder.is_zero() {
                    self.release_swap_hold(&offer, &remainder);
                    self.swap_offers.remove(offer_id);
                } else {
                    let entry = self
                        .swap_offers
                        .get_mut(offer_id)
                        .expect("offer present above");
                    entry.give_amount = remainder;
                    entry.want_amount = &offer.want_amount - &want_fill;
                }
                Ok(vec![AccountEvent::SwapOfferFilled {
                    offer_id: offer_id.clone(),
                    fill_ratio: *fill_ratio,
                }])
            }

            AccountTx::SettleHold { workspace_version, diffs } => {
                for diff in diffs {
                    if !diff.conserves_value() {
                        return Err(XlnError::SettlementNotConserved { token_id: diff.token_id });
                    }
                }
                for diff in diffs {
                    let row = self.delta_mut(diff.token_id);
                    if diff.left_diff.is_positive() {
                        row.left_settle_hold += &diff.left_diff;
                    }
                    if diff.right_diff.is_positive() {
                        row.right_settle_hold += &diff.right_diff;
                    }
                }
                self.settle_workspace_version = *workspace_version;
                Ok(Vec::new())
            }

            AccountTx::SettleRelease { workspace_version, diffs } => {
                if *workspace_version != self.settle_workspace_version {
                    return Err(XlnError::Protocol(format!(
                        "settle release for workspace {workspace_version}, holds at {}",
                        self.settle_workspace_version
                    )));
                }
                for diff in diffs {
                    let row = self.delta_mut(diff.token_id);
                    if diff.left_diff.is_positive() {
                        if row.left_settle_hold < diff.left_diff {
                            return Err(XlnError::Protocol("settle release exceeds hold".into()));
                        }
                        row.left_settle_hold -= &diff.left_diff;
                    }
                    if diff.right_diff.is_positive() {
                        if row.right_settle_hold < diff.right_diff {
                            return Err(XlnError::Protocol("settle release exceeds hold".into()));
                        }
                        row.right_settle_hold -= &diff.right_diff;
                    }
                }
                Ok(Vec::new())
            }

            AccountTx::JSync { j_block_number, token_id, collateral, ondelta } => {
                if *j_block_number > ctx.j_height {
                    return Err(XlnError::JSyncBlockMismatch {
                        expected: ctx.j_height,
                        got: *j_block_number,
                    });
                }
                if collateral.is_negative() {
                    return Err(XlnError::NonPositiveAmount);
                }
                let row = self.delta_mut(*token_id);
                row.collateral = collateral.clone();
                row.ondelta = ondelta.clone();
                Ok(Vec::new())
            }
        }
    }

    fn release_htlc_hold(&mut self, lock: &HtlcLock) {
        let row = self.delta_mut(lock.token_id);
        if lock.by_left {
            row.left_htlc_hold -= &lock.amount;
        } else {
            row.right_htlc_hold -= &lock.amount;
        }
    }

    fn release_swap_hold(&mut self, offer: &SwapOffer, amount: &Amount) {
        let row = self.delta_mut(offer.give_token_id);
        if offer.by_left {
            row.left_swap_hold -= amount;
        } else {
            row.right_swap_hold -= amount;
        }
    }

    /// Locks whose deadline has passed at `j_height`, owned by the `left`
    /// side. The owner resolves these with a timeout error on its next frame.
    pub fn expired_locks(&self, j_height: Height, left: bool) -> Vec<String> {
        self.htlc_locks
            .values()
            .filter(|l| l.by_left == left && l.expired(j_height))
            .map(|l| l.lock_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> AccountCtx {
        AccountCtx { timestamp: 1_000, j_height: 1, depository: EvmAddress::default() }
    }

    fn pair() -> (EntityId, EntityId) {
        (EntityId::from_bytes([1; 32]), EntityId::from_bytes([2; 32]))
    }

    fn deposited(amount: i64) -> AccountState {
        let (a, b) = pair();
        let mut st = AccountState::new(a, b);
        let row = st.delta_mut(1);
        row.collateral = Amount::from_i64(amount);
        row.ondelta = Amount::from_i64(amount);
        st
    }

    #[test]
    fn direct_payment_moves_offdelta() {
        let mut st = deposited(1000);
        st.apply_tx(
            &AccountTx::DirectPayment { token_id: 1, amount: Amount::from_i64(100) },
            true,
            &ctx(),
        )
        .unwrap();
        let row = &st.deltas[&1];
        assert_eq!(row.offdelta, Amount::from_i64(-100));
        assert_eq!(row.derive(true).out_capacity, Amount::from_i64(900));
        assert_eq!(row.derive(false).out_capacity, Amount::from_i64(100));
    }

    #[test]
    fn payment_over_capacity_rejected() {
        let mut st = deposited(1000);
        let err = st
            .apply_tx(
                &AccountTx::DirectPayment { token_id: 1, amount: Amount::from_i64(1001) },
                true,
                &ctx(),
            )
            .unwrap_err();
        assert!(matches!(err, XlnError::CapacityExceeded { .. }));
        // Nothing was mutated.
        assert_eq!(st.deltas[&1].offdelta, Amount::zero());
    }

    #[test]
    fn htlc_lock_resolve_secret() {
        let mut st = deposited(1000);
        let secret = Hash32::from_bytes([7; 32]);
        let hashlock = keccak256(secret.as_bytes());
        st.apply_tx(
            &AccountTx::HtlcLock {
                lock_id: "l1".into(),
                hashlock,
                timelock: 0,
                reveal_before_height: 10,
                amount: Amount::from_i64(50),
                token_id: 1,
                envelope: None,
            },
            true,
            &ctx(),
        )
        .unwrap();
        assert_eq!(st.deltas[&1].derive(true).out_capacity, Amount::from_i64(950));

        let events = st
            .apply_tx(
                &AccountTx::HtlcResolve {
                    lock_id: "l1".into(),
                    outcome: HtlcOutcome::Secret { secret },
                },
                false,
                &ctx(),
            )
            .unwrap();
        assert!(matches!(events[0], AccountEvent::HtlcRevealed { .. }));
        assert!(st.htlc_locks.is_empty());
        // Amount moved to the right side.
        assert_eq!(st.deltas[&1].offdelta, Amount::from_i64(-50));
        assert_eq!(st.deltas[&1].derive(false).out_capacity, Amount::from_i64(50));
    }

    #[test]
    fn htlc_timeout_refunds_origin() {
        let mut st = deposited(1000);
        let hashlock = keccak256(b"whatever");
        st.apply_tx(
            &AccountTx::HtlcLock {
                lock_id: "l1".into(),
                hashlock,
                timelock: 0,
                reveal_before_height: 5,
                amount: Amount::from_i64(50),
                token_id: 1,
                envelope: None,
            },
            true,
            &ctx(),
        )
        .unwrap();

        // At j-height 5 the lock is expired; the owner sweeps it.
        assert_eq!(st.expired_locks(5, true), vec!["l1".to_string()]);
        st.apply_tx(
            &AccountTx::HtlcResolve {
                lock_id: "l1".into(),
                outcome: HtlcOutcome::Error { reason: "timeout".into() },
            },
            true,
            &ctx(),
        )
        .unwrap();
        assert_eq!(st.deltas[&1].offdelta, Amount::zero());
        assert_eq!(st.deltas[&1].derive(true).out_capacity, Amount::from_i64(1000));
    }

    #[test]
    fn expired_lock_refused_at_creation() {
        let mut st = deposited(1000);
        let err = st
            .apply_tx(
                &AccountTx::HtlcLock {
                    lock_id: "l1".into(),
                    hashlock: Hash32::ZERO,
                    timelock: 0,
                    reveal_before_height: 1,
                    amount: Amount::from_i64(50),
                    token_id: 1,
                    envelope: None,
                },
                true,
                &ctx(),
            )
            .unwrap_err();
        assert!(matches!(err, XlnError::HtlcExpired { .. }));
    }

    #[test]
    fn swap_partial_fill() {
        let mut st = deposited(1000);
        // Fund the right side on token 2.
        let row = st.delta_mut(2);
        row.collateral = Amount::from_i64(600);
        // Credited to right: ondelta stays 0.

        st.apply_tx(
            &AccountTx::SwapOffer {
                offer_id: "o1".into(),
                give_token_id: 1,
                give_amount: Amount::from_i64(400),
                want_token_id: 2,
                want_amount: Amount::from_i64(200),
                min_fill_ratio: 0,
            },
            true,
            &ctx(),
        )
        .unwrap();
        assert_eq!(st.deltas[&1].derive(true).out_capacity, Amount::from_i64(600));

        // Right fills half.
        let events = st
            .apply_tx(
                &AccountTx::SwapResolve {
                    offer_id: "o1".into(),
                    fill_ratio: FILL_RATIO_FULL / 2,
                    cancel_remainder: false,
                },
                false,
                &ctx(),
            )
            .unwrap();
        assert!(matches!(events[0], AccountEvent::SwapOfferFilled { .. }));
        let offer = &st.swap_offers["o1"];
        // 32767/65535 of 400 = 199 filled; 201 remains on offer.
        assert_eq!(offer.give_amount, Amount::from_i64(201));
        // Token 1 moved 199 left→right, token 2 moved 99 right→left.
        assert_eq!(st.deltas[&1].offdelta, Amount::from_i64(-199));
        assert_eq!(st.deltas[&2].offdelta, Amount::from_i64(99));
    }

    #[test]
    fn settle_hold_and_release() {
        let mut st = deposited(1000);
        let diff = xln_core::SettleDiff {
            token_id: 1,
            left_diff: Amount::from_i64(500),
            right_diff: Amount::from_i64(0),
            collateral_diff: Amount::from_i64(-500),
            ondelta_diff: Amount::from_i64(-500),
        };
        st.apply_tx(
            &AccountTx::SettleHold { workspace_version: 1, diffs: vec![diff.clone()] },
            true,
            &ctx(),
        )
        .unwrap();
        assert_eq!(st.deltas[&1].derive(true).out_capacity, Amount::from_i64(500));

        st.apply_tx(
            &AccountTx::SettleRelease { workspace_version: 1, diffs: vec![diff] },
            true,
            &ctx(),
        )
        .unwrap();
        assert_eq!(st.deltas[&1].derive(true).out_capacity, Amount::from_i64(1000));
    }

    #[test]
    fn j_sync_sets_absolute_values() {
        let mut st = deposited(1000);
        st.apply_tx(
            &AccountTx::JSync {
                j_block_number: 1,
                token_id: 1,
                collateral: Amount::from_i64(1500),
                ondelta: Amount::from_i64(1500),
            },
            true,
            &ctx(),
        )
        .unwrap();
        assert_eq!(st.deltas[&1].collateral, Amount::from_i64(1500));
        // A j-sync ahead of our finalized height is refused.
        let err = st
            .apply_tx(
                &AccountTx::JSync {
                    j_block_number: 9,
                    token_id: 1,
                    collateral: Amount::zero(),
                    ondelta: Amount::zero(),
                },
                true,
                &ctx(),
            )
            .unwrap_err();
        assert!(matches!(err, XlnError::JSyncBlockMismatch { .. }));
    }
}
