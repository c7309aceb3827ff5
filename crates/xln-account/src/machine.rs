//! The bilateral account machine: proposer/acceptor frame consensus with a
//! deterministic tiebreaker.
//!
//! Either side may propose when it has pending transactions and no frame in
//! flight. The counterparty re-applies the transactions on its own working
//! copy, compares the bilateral fields, commits its own computed rows, and
//! acks with a hanko over its recomputed state hash. Simultaneous proposals
//! at the same height resolve by canonical order: the right side rolls back.
//!
//! Signing is not done here — the machine returns the hashes that need
//! hankos and the entity layer's BFT round produces them.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

use xln_core::{
    EntityId, EvmAddress, Hash32, Height, XlnError, ACCOUNT_MEMPOOL_MAX, FRAME_HISTORY_CAP,
    FRAME_TX_MAX, TIMESTAMP_DRIFT_MAX_MS,
};
use xln_crypto::{genesis_frame_hash, verify_hanko_for_entity, Hanko};

use crate::frame::{snapshot_deltas, AccountFrame, AccountInput, AckPart, ProposalPart};
use crate::proof::build_proof;
use crate::state::{AccountCtx, AccountState};
use crate::tx::{AccountEvent, AccountTx, HtlcOutcome};

// ── Pending records ──────────────────────────────────────────────────────────

/// A frame we proposed and are waiting on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingProposal {
    pub frame: AccountFrame,
    pub dispute_hash: Hash32,
    /// Set once the proposal has been handed to the output queue, so a
    /// machine is never asked to send the same frame twice.
    pub sent: bool,
}

/// An ack we owe the counterparty, awaiting hankos from the entity round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckDraft {
    pub height: Height,
    pub state_hash: Hash32,
    pub dispute_hash: Hash32,
}

// ── Outcomes ─────────────────────────────────────────────────────────────────

/// Hashes of a freshly staged frame, awaiting hankos.
#[derive(Debug, Clone, Copy)]
pub struct StagedFrame {
    pub state_hash: Hash32,
    pub dispute_hash: Hash32,
}

/// Result of a propose pass.
#[derive(Debug, Clone, Default)]
pub struct ProposeOutcome {
    /// Present when a frame was staged.
    pub staged: Option<StagedFrame>,
    /// Failure reports for transactions dropped during the dry run.
    pub events: Vec<AccountEvent>,
}

/// Result of processing one incoming `AccountInput`.
#[derive(Debug, Clone, Default)]
pub struct HandleOutcome {
    pub events: Vec<AccountEvent>,
    /// Hashes the entity round must produce hankos for (ack state hash,
    /// dispute hash).
    pub to_sign: Vec<Hash32>,
    /// The ack part failed; the proposal part was still processed.
    pub ack_failed: Option<String>,
    /// The incoming proposal lost the tiebreaker and was ignored.
    pub proposal_ignored: bool,
    /// Our own pending frame was rolled back before processing the peer's.
    pub rolled_back: bool,
    /// Height committed by this input, if any.
    pub committed_height: Option<Height>,
}

// ── AccountMachine ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountMachine {
    pub my_entity: EntityId,
    pub state: AccountState,
    pub mempool: VecDeque<AccountTx>,
    pub pending: Option<PendingProposal>,
    pub pending_ack: Option<AckDraft>,
    /// Last committed frames, newest at the back.
    pub frames: VecDeque<AccountFrame>,
    pub rollback_count: u64,
    pub last_rollback_hash: Option<Hash32>,
    /// The counterparty's most recent dispute hanko and the hash it covers —
    /// the instrument for a unilateral exit.
    pub peer_dispute_hanko: Option<Hanko>,
    pub peer_dispute_hash: Option<Hash32>,
}

impl AccountMachine {
    pub fn new(my_entity: EntityId, peer: EntityId) -> Self {
        Self {
            my_entity,
            state: AccountState::new(my_entity, peer),
            mempool: VecDeque::new(),
            pending: None,
            pending_ack: None,
            frames: VecDeque::new(),
            rollback_count: 0,
            last_rollback_hash: None,
            peer_dispute_hanko: None,
            peer_dispute_hash: None,
        }
    }

    pub fn is_left(&self) -> bool {
        self.my_entity == self.state.left
    }

    pub fn peer_entity(&self) -> EntityId {
        if self.is_left() {
            self.state.right
        } else {
            self.state.left
        }
    }

    pub fn push_tx(&mut self, tx: AccountTx) -> Result<(), XlnError> {
        if self.mempool.len() >= ACCOUNT_MEMPOOL_MAX {
            return Err(XlnError::MempoolFull { cap: ACCOUNT_MEMPOOL_MAX });
        }
        self.mempool.push_back(tx);
        Ok(())
    }

    /// Enqueue timeout resolutions for our own expired locks.
    pub fn enqueue_expired_htlcs(&mut self, j_height: Height) {
        for lock_id in self.state.expired_locks(j_height, self.is_left()) {
            let already = self.mempool.iter().any(|tx| {
                matches!(tx, AccountTx::HtlcResolve { lock_id: l, .. } if *l == lock_id)
            });
            if !already {
                self.mempool.push_back(AccountTx::HtlcResolve {
                    lock_id,
                    outcome: HtlcOutcome::Error { reason: "timeout".into() },
                });
            }
        }
    }

    fn last_state_hash(&self) -> Hash32 {
        self.frames
            .back()
            .map(|f| f.state_hash)
            .unwrap_or_else(genesis_frame_hash)
    }

    fn push_frame(&mut self, frame: AccountFrame) {
        self.frames.push_back(frame);
        while self.frames.len() > FRAME_HISTORY_CAP {
            self.frames.pop_front();
        }
    }

    // ── Proposing ────────────────────────────────────────────────────────────

    /// Dry-run the mempool against a working copy and stage a new frame.
    /// Failing transactions are dropped (HTLC locks report back so the
    /// originator can cancel upstream). `staged` is `None` when there is
    /// nothing to propose or a frame is already in flight.
    pub fn propose(&mut self, ctx: &AccountCtx) -> Result<ProposeOutcome, XlnError> {
        if self.pending.is_some() || self.mempool.is_empty() {
            return Ok(ProposeOutcome::default());
        }

        let mut working = self.state.clone();
        let mut applied = Vec::new();
        let mut events = Vec::new();
        let by_left = self.is_left();

        while applied.len() < FRAME_TX_MAX {
            let Some(tx) = self.mempool.pop_front() else { break };
            match working.apply_tx(&tx, by_left, ctx) {
                Ok(_) => applied.push(tx),
                Err(err) => {
                    debug!(kind = tx.kind(), %err, "dropping failed account tx");
                    if let AccountTx::HtlcLock { lock_id, hashlock, .. } = &tx {
                        events.push(AccountEvent::HtlcFailed {
                            lock_id: lock_id.clone(),
                            hashlock: *hashlock,
                            reason: err.to_string(),
                        });
                    }
                }
            }
        }

        if applied.is_empty() {
            return Ok(ProposeOutcome { staged: None, events });
        }

        let height = self.state.height + 1;
        let timestamp = ctx.timestamp.max(self.state.timestamp + 1);
        let (token_ids, deltas, full_delta_states) = snapshot_deltas(&working.deltas);

        let frame = AccountFrame {
            height,
            timestamp,
            j_height: ctx.j_height,
            account_txs: applied,
            prev_frame_hash: self.last_state_hash(),
            token_ids,
            deltas,
            full_delta_states,
            by_left,
            state_hash: Hash32::ZERO,
        }
        .seal()?;

        working.height = height;
        working.timestamp = timestamp;
        working.cooperative_nonce += 1;
        let (_, _, dispute_hash) = build_proof(&working, self.my_entity, &ctx.depository);

        let state_hash = frame.state_hash;
        self.pending = Some(PendingProposal { frame, dispute_hash, sent: false });
        Ok(ProposeOutcome { staged: Some(StagedFrame { state_hash, dispute_hash }), events })
    }

    /// Assemble the outgoing message once the entity round produced hankos.
    /// Combines a due ack with the pending (unsent) proposal.
    pub fn take_outgoing(
        &mut self,
        hanko_for: &dyn Fn(&Hash32) -> Option<Hanko>,
    ) -> Option<AccountInput> {
        let ack_hankos = self
            .pending_ack
            .as_ref()
            .map(|d| (hanko_for(&d.state_hash), hanko_for(&d.dispute_hash)));
        let ack = match ack_hankos {
            Some((Some(ack_hanko), Some(dispute_hanko))) => {
                let draft = self.pending_ack.take().expect("checked above");
                Some(AckPart {
                    height: draft.height,
                    state_hash: draft.state_hash,
                    ack_hanko,
                    dispute_hanko,
                    dispute_hash: draft.dispute_hash,
                })
            }
            // Hankos not witnessed yet; the draft stays queued.
            _ => None,
        };

        let proposal = match &mut self.pending {
            Some(p) if !p.sent => {
                let frame_hanko = hanko_for(&p.frame.state_hash);
                let dispute_hanko = hanko_for(&p.dispute_hash);
                match (frame_hanko, dispute_hanko) {
                    (Some(f), Some(d)) => {
                        p.sent = true;
                        Some(ProposalPart {
                            frame: p.frame.clone(),
                            frame_hanko: f,
                            dispute_hanko: d,
                            dispute_hash: p.dispute_hash,
                        })
                    }
                    _ => None,
                }
            }
            _ => None,
        };

        if ack.is_none() && proposal.is_none() {
            return None;
        }
        Some(AccountInput {
            from_entity: self.my_entity,
            to_entity: self.peer_entity(),
            ack,
            proposal,
        })
    }

    // ── Handling ─────────────────────────────────────────────────────────────

    /// Process one incoming message. The ack and proposal parts are
    /// independent: an ack failure is recorded but does not stop the
    /// proposal part.
    pub fn handle_input(
        &mut self,
        ctx: &AccountCtx,
        input: &AccountInput,
        peer_validators: Option<&[EvmAddress]>,
    ) -> Result<HandleOutcome, XlnError> {
        let mut outcome = HandleOutcome::default();

        if let Some(ack) = &input.ack {
            match self.handle_ack(ctx, ack, peer_validators) {
                Ok(mut events) => {
                    outcome.committed_height = Some(ack.height);
                    outcome.events.append(&mut events);
                }
                Err(err) => {
                    warn!(%err, "ack part rejected");
                    outcome.ack_failed = Some(err.to_string());
                }
            }
        }

        if let Some(proposal) = &input.proposal {
            self.handle_proposal(ctx, proposal, peer_validators, &mut outcome)?;
        }

        Ok(outcome)
    }

    fn handle_ack(
        &mut self,
        ctx: &AccountCtx,
        ack: &AckPart,
        peer_validators: Option<&[EvmAddress]>,
    ) -> Result<Vec<AccountEvent>, XlnError> {
        let pending = self
            .pending
            .as_ref()
            .ok_or_else(|| XlnError::Protocol("ack without pending proposal".into()))?;

        if ack.height != pending.frame.height {
            return Err(XlnError::FrameHeightMismatch {
                expected: pending.frame.height,
                got: ack.height,
            });
        }
        if ack.state_hash != pending.frame.state_hash {
            return Err(XlnError::StateHashMismatch { height: ack.height });
        }
        verify_hanko_for_entity(
            &ack.ack_hanko,
            &ack.state_hash,
            &self.peer_entity(),
            peer_validators,
        )?;

        // Re-apply the agreed transactions against the persistent state.
        let pending = self.pending.take().expect("checked above");
        let frame = pending.frame;
        let apply_ctx = AccountCtx { j_height: frame.j_height, ..ctx.clone() };
        let by_left = frame.by_left;
        let mut events = Vec::new();
        for tx in &frame.account_txs {
            let mut evs = self.state.apply_tx(tx, by_left, &apply_ctx)?;
            events.append(&mut evs);
        }
        self.state.height = frame.height;
        self.state.timestamp = frame.timestamp;
        self.state.cooperative_nonce += 1;
        self.push_frame(frame);
        self.last_rollback_hash = None;
        self.peer_dispute_hanko = Some(ack.dispute_hanko.clone());
        self.peer_dispute_hash = Some(ack.dispute_hash);

        debug!(height = self.state.height, "frame committed on ack");
        Ok(events)
    }

    fn handle_proposal(
        &mut self,
        ctx: &AccountCtx,
        part: &ProposalPart,
        peer_validators: Option<&[EvmAddress]>,
        outcome: &mut HandleOutcome,
    ) -> Result<(), XlnError> {
        let frame = &part.frame;

        // Simultaneous proposal at the same height: left wins, right rolls
        // back and then processes the peer's frame.
        let simultaneous = self
            .pending
            .as_ref()
            .map(|p| p.frame.height == frame.height)
            .unwrap_or(false);
        if simultaneous {
            if self.is_left() {
                debug!(height = frame.height, "ignoring losing simultaneous proposal");
                outcome.proposal_ignored = true;
                return Ok(());
            }
            self.rollback()?;
            outcome.rolled_back = true;
        }

        if frame.height != self.state.height + 1 {
            // A re-delivered frame we already committed is dropped quietly.
            if frame.height == self.state.height
                && self.frames.back().map(|f| f.height) == Some(frame.height)
            {
                outcome.proposal_ignored = true;
                return Ok(());
            }
            return Err(XlnError::FrameHeightMismatch {
                expected: self.state.height + 1,
                got: frame.height,
            });
        }

        let expected_prev = self.last_state_hash();
        if frame.prev_frame_hash != expected_prev {
            return Err(XlnError::FrameChainBreak {
                height: frame.height,
                expected: expected_prev,
                got: frame.prev_frame_hash,
            });
        }

        if frame.timestamp < self.state.timestamp {
            return Err(XlnError::FrameTimestamp {
                prev: self.state.timestamp,
                got: frame.timestamp,
            });
        }
        let drift = frame.timestamp.abs_diff(ctx.timestamp);
        if drift > TIMESTAMP_DRIFT_MAX_MS {
            return Err(XlnError::FrameTimestamp { prev: ctx.timestamp, got: frame.timestamp });
        }

        verify_hanko_for_entity(
            &part.frame_hanko,
            &frame.state_hash,
            &self.peer_entity(),
            peer_validators,
        )?;

        // Re-apply on our own working copy under the frame's J-height.
        let apply_ctx = AccountCtx { j_height: frame.j_height, ..ctx.clone() };
        let mut working = self.state.clone();
        let mut events = Vec::new();
        for tx in &frame.account_txs {
            let mut evs = working.apply_tx(tx, frame.by_left, &apply_ctx)?;
            events.append(&mut evs);
        }

        // Compare the bilateral fields entry by entry. `ondelta` and
        // `collateral` are excluded — they follow independently observed
        // J-events.
        let (token_ids, deltas, rows) = snapshot_deltas(&working.deltas);
        if token_ids != frame.token_ids {
            return Err(XlnError::StateInjection("token id set mismatch".into()));
        }
        for (ours, theirs) in rows.iter().zip(&frame.full_delta_states) {
            if let Err(field) = ours.bilateral_eq(theirs) {
                return Err(XlnError::BilateralMismatch { token_id: ours.token_id, field });
            }
        }

        // Store our own computed rows and recompute the state hash locally —
        // the proposer's hash is never trusted directly.
        let own_frame = AccountFrame {
            token_ids,
            deltas,
            full_delta_states: rows,
            state_hash: Hash32::ZERO,
            ..frame.clone()
        }
        .seal()?;

        if own_frame.state_hash != frame.state_hash {
            // Bilateral fields already matched above, so the divergence is
            // acceptable only if it sits in the j-driven fields.
            let j_field_diverged = own_frame
                .full_delta_states
                .iter()
                .zip(&frame.full_delta_states)
                .any(|(a, b)| a.ondelta != b.ondelta || a.collateral != b.collateral);
            if j_field_diverged {
                warn!(
                    height = frame.height,
                    "accepting frame with divergent j-driven fields; keeping own values"
                );
            } else {
                return Err(XlnError::StateHashMismatch { height: frame.height });
            }
        }

        // Commit our own values.
        working.height = own_frame.height;
        working.timestamp = own_frame.timestamp;
        working.cooperative_nonce += 1;
        self.state = working;
        self.push_frame(own_frame.clone());
        self.last_rollback_hash = None;
        self.peer_dispute_hanko = Some(part.dispute_hanko.clone());
        self.peer_dispute_hash = Some(part.dispute_hash);

        // Draft the ack; the entity round signs our recomputed hash and our
        // new dispute hash.
        let (_, _, dispute_hash) = build_proof(&self.state, self.my_entity, &ctx.depository);
        self.pending_ack = Some(AckDraft {
            height: own_frame.height,
            state_hash: own_frame.state_hash,
            dispute_hash,
        });
        outcome.to_sign.push(own_frame.state_hash);
        outcome.to_sign.push(dispute_hash);
        outcome.committed_height = Some(own_frame.height);
        outcome.events.append(&mut events);

        debug!(height = self.state.height, "frame committed on proposal");
        Ok(())
    }

    /// Roll back our pending frame after losing the simultaneous-proposal
    /// tiebreaker. The frame's transactions return to the front of the
    /// mempool. A second unresolved rollback is a consensus failure.
    fn rollback(&mut self) -> Result<(), XlnError> {
        let pending = self.pending.take().expect("rollback requires a pending frame");
        let hash = pending.frame.state_hash;

        if self.last_rollback_hash == Some(hash) {
            // Re-delivery of the winning frame; already counted.
        } else if self.last_rollback_hash.is_some() {
            return Err(XlnError::DoubleRollback);
        } else {
            self.rollback_count += 1;
            self.last_rollback_hash = Some(hash);
        }

        for tx in pending.frame.account_txs.into_iter().rev() {
            self.mempool.push_front(tx);
        }
        debug!(count = self.rollback_count, "rolled back pending frame");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xln_core::Amount;
    use xln_crypto::{build_single_hanko, keccak256, KeyPair};

    struct Side {
        kp: KeyPair,
        machine: AccountMachine,
    }

    fn ctx() -> AccountCtx {
        AccountCtx { timestamp: 1_000_000, j_height: 1, depository: EvmAddress::from_bytes([9; 20]) }
    }

    /// Returns the canonical (left, right) sides with token 1 funded by a
    /// j-observed deposit credited to the left entity.
    fn setup() -> (Side, Side) {
        let k1 = KeyPair::derive(b"seed", "payer");
        let k2 = KeyPair::derive(b"seed", "payee");
        let (kl, kr) = if k1.entity_id() < k2.entity_id() { (k1, k2) } else { (k2, k1) };
        let (l, r) = (kl.entity_id(), kr.entity_id());
        let mut ml = AccountMachine::new(l, r);
        let mut mr = AccountMachine::new(r, l);
        assert!(ml.is_left());
        assert!(!mr.is_left());

        for m in [&mut ml, &mut mr] {
            let row = m.state.delta_mut(1);
            row.collateral = Amount::from_i64(1000);
            row.ondelta = Amount::from_i64(1000);
        }
        (Side { kp: kl, machine: ml }, Side { kp: kr, machine: mr })
    }

    /// Sign every requested hash with the side's single key.
    fn outgoing(side: &mut Side) -> Option<AccountInput> {
        let kp = &side.kp;
        let entity = side.machine.my_entity;
        side.machine.take_outgoing(&|hash| {
            Some(build_single_hanko(entity, kp.sign_hash(hash).ok()?))
        })
    }

    fn validators(side: &Side) -> Vec<EvmAddress> {
        vec![side.kp.address()]
    }

    #[test]
    fn direct_payment_two_frame_flow() {
        let (mut payer, mut payee) = setup();
        payer
            .machine
            .push_tx(AccountTx::DirectPayment { token_id: 1, amount: Amount::from_i64(100) })
            .unwrap();

        let proposed = payer.machine.propose(&ctx()).unwrap();
        assert!(proposed.staged.is_some());
        let input = outgoing(&mut payer).unwrap();
        assert!(input.proposal.is_some());

        let vals = validators(&payer);
        let outcome = payee.machine.handle_input(&ctx(), &input, Some(&vals)).unwrap();
        assert_eq!(outcome.committed_height, Some(1));
        assert_eq!(payee.machine.state.height, 1);

        let reply = outgoing(&mut payee).unwrap();
        assert!(reply.ack.is_some());
        let vals = validators(&payee);
        let outcome = payer.machine.handle_input(&ctx(), &reply, Some(&vals)).unwrap();
        assert_eq!(outcome.committed_height, Some(1));
        assert_eq!(payer.machine.state.height, 1);

        // Both sides agree on the canonical row: the payment shifted 100
        // away from the left (payer) side of the axis.
        for side in [&payer, &payee] {
            let row = &side.machine.state.deltas[&1];
            assert_eq!(row.offdelta, Amount::from_i64(-100));
            assert_eq!(row.collateral, Amount::from_i64(1000));
        }
        assert_eq!(
            payer.machine.state.deltas[&1].derive(true).out_capacity,
            Amount::from_i64(900)
        );
        assert_eq!(
            payee.machine.state.deltas[&1].derive(false).out_capacity,
            Amount::from_i64(100)
        );
    }

    #[test]
    fn simultaneous_proposals_right_rolls_back() {
        let (mut left, mut right) = setup();
        // Give the right side spendable capacity too: a deposit credited to
        // the right entity on token 2.
        for side in [&mut left, &mut right] {
            let row = side.machine.state.delta_mut(2);
            row.collateral = Amount::from_i64(500);
        }

        left.machine
            .push_tx(AccountTx::DirectPayment { token_id: 1, amount: Amount::from_i64(10) })
            .unwrap();
        right
            .machine
            .push_tx(AccountTx::DirectPayment { token_id: 2, amount: Amount::from_i64(20) })
            .unwrap();

        left.machine.propose(&ctx()).unwrap();
        right.machine.propose(&ctx()).unwrap();
        let left_input = outgoing(&mut left).unwrap();
        let right_input = outgoing(&mut right).unwrap();

        // Left ignores the loser's frame.
        let lv = validators(&right);
        let outcome = left.machine.handle_input(&ctx(), &right_input, Some(&lv)).unwrap();
        assert!(outcome.proposal_ignored);
        assert_eq!(left.machine.state.height, 0);

        // Right rolls back, then commits the left frame.
        let rv = validators(&left);
        let outcome = right.machine.handle_input(&ctx(), &left_input, Some(&rv)).unwrap();
        assert!(outcome.rolled_back);
        assert_eq!(outcome.committed_height, Some(1));
        assert_eq!(right.machine.rollback_count, 1);
        // The rolled-back tx is back in the mempool for height 2.
        assert_eq!(right.machine.mempool.len(), 1);

        // Right's reply acks height 1 and chains its own height-2 frame.
        right.machine.propose(&ctx()).unwrap();
        let reply = outgoing(&mut right).unwrap();
        assert!(reply.ack.is_some());
        assert!(reply.proposal.is_some());
        assert_eq!(reply.proposal.as_ref().unwrap().frame.height, 2);

        let rv = validators(&right);
        let outcome = left.machine.handle_input(&ctx(), &reply, Some(&rv)).unwrap();
        assert!(outcome.ack_failed.is_none());
        assert_eq!(left.machine.state.height, 2);
    }

    #[test]
    fn state_injection_keeps_own_values() {
        let (mut payer, mut payee) = setup();
        payer
            .machine
            .push_tx(AccountTx::DirectPayment { token_id: 1, amount: Amount::from_i64(100) })
            .unwrap();
        payer.machine.propose(&ctx()).unwrap();
        let mut input = outgoing(&mut payer).unwrap();

        // The proposer inflates ondelta/collateral while keeping bilateral
        // fields intact, re-sealing so the hanko matches its tampered frame.
        {
            let part = input.proposal.as_mut().unwrap();
            for row in &mut part.frame.full_delta_states {
                row.ondelta += &Amount::from_i64(1_000_000);
                row.collateral += &Amount::from_i64(1_000_000);
            }
            part.frame = part.frame.clone().seal().unwrap();
            let entity = payer.machine.my_entity;
            part.frame_hanko =
                build_single_hanko(entity, payer.kp.sign_hash(&part.frame.state_hash).unwrap());
        }

        let vals = validators(&payer);
        let outcome = payee.machine.handle_input(&ctx(), &input, Some(&vals)).unwrap();
        assert_eq!(outcome.committed_height, Some(1));

        // The stored frame carries the recipient's own j-driven values.
        let row = &payee.machine.state.deltas[&1];
        assert_eq!(row.collateral, Amount::from_i64(1000));
        assert_eq!(row.offdelta, Amount::from_i64(-100));
        let stored = payee.machine.frames.back().unwrap();
        assert_ne!(stored.state_hash, input.proposal.unwrap().frame.state_hash);
    }

    #[test]
    fn frame_chain_break_rejected() {
        let (mut payer, mut payee) = setup();
        payer
            .machine
            .push_tx(AccountTx::DirectPayment { token_id: 1, amount: Amount::from_i64(1) })
            .unwrap();
        payer.machine.propose(&ctx()).unwrap();
        let mut input = outgoing(&mut payer).unwrap();
        {
            let part = input.proposal.as_mut().unwrap();
            part.frame.prev_frame_hash = keccak256(b"bogus");
            part.frame = part.frame.clone().seal().unwrap();
            let entity = payer.machine.my_entity;
            part.frame_hanko =
                build_single_hanko(entity, payer.kp.sign_hash(&part.frame.state_hash).unwrap());
        }
        let vals = validators(&payer);
        let err = payee.machine.handle_input(&ctx(), &input, Some(&vals)).unwrap_err();
        assert!(matches!(err, XlnError::FrameChainBreak { .. }));
        assert_eq!(payee.machine.state.height, 0);
    }

    #[test]
    fn double_rollback_is_consensus_failure() {
        let (mut left, mut right) = setup();

        right.machine.push_tx(AccountTx::AddDelta { token_id: 7 }).unwrap();
        right.machine.propose(&ctx()).unwrap();

        // A signed left frame at height 1 whose chain link is broken: the
        // tiebreaker still forces right to roll back, but the frame itself
        // never commits, so the rollback stays unresolved.
        left.machine.push_tx(AccountTx::AddDelta { token_id: 3 }).unwrap();
        left.machine.propose(&ctx()).unwrap();
        let mut broken = outgoing(&mut left).unwrap();
        {
            let part = broken.proposal.as_mut().unwrap();
            part.frame.prev_frame_hash = keccak256(b"bogus");
            part.frame = part.frame.clone().seal().unwrap();
            let entity = left.machine.my_entity;
            part.frame_hanko =
                build_single_hanko(entity, left.kp.sign_hash(&part.frame.state_hash).unwrap());
        }

        let lv = validators(&left);
        let err = right.machine.handle_input(&ctx(), &broken, Some(&lv)).unwrap_err();
        assert!(matches!(err, XlnError::FrameChainBreak { .. }));
        assert_eq!(right.machine.rollback_count, 1);

        // Right restages a different frame; a second losing collision while
        // the first rollback is unresolved is a consensus failure.
        right.machine.push_tx(AccountTx::AddDelta { token_id: 8 }).unwrap();
        right.machine.propose(&ctx()).unwrap();
        let err = right.machine.handle_input(&ctx(), &broken, Some(&lv)).unwrap_err();
        assert!(matches!(err, XlnError::DoubleRollback));
    }
}
