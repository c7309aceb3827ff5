//! Per-entity J-batch accumulation and lifecycle.
//!
//! Operations append into the mutable current batch; a broadcast snapshots
//! it into an immutable `sent` record that stays authoritative until the
//! on-chain `HankoBatchProcessed` ack (or failure) reconciles it. The sent
//! snapshot is never mutated and a signed settlement is never silently
//! re-signed.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use xln_core::{
    Amount, EntityId, EvmAddress, Hash32, SettleDiff, TimestampMs, TokenId, XlnError,
    BATCH_AUTO_BROADCAST_MS, BATCH_AUTO_BROADCAST_OPS,
};
use xln_account::ProofBody;

use crate::abi::{batch_hash, encode_batch};

// ── Operations ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flashloan {
    pub token_id: TokenId,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveToReserve {
    pub receiving_entity: EntityId,
    pub token_id: TokenId,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollateralPair {
    pub entity: EntityId,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveToCollateral {
    pub token_id: TokenId,
    pub receiving_entity: EntityId,
    pub pairs: Vec<CollateralPair>,
}

/// Compressed cooperative withdrawal (the C2R path).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollateralToReserve {
    pub counterparty: EntityId,
    pub token_id: TokenId,
    pub amount: Amount,
    pub nonce: u64,
    pub sig: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementOp {
    pub left_entity: EntityId,
    pub right_entity: EntityId,
    pub diffs: Vec<SettleDiff>,
    pub forgive_debts_in_token_ids: Vec<TokenId>,
    /// Counterparty signature over the settlement hash; empty while the
    /// workspace is still being negotiated.
    pub sig: Vec<u8>,
    pub entity_provider: EvmAddress,
    pub hanko_data: Vec<u8>,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeStart {
    pub counterentity: EntityId,
    pub nonce: u64,
    pub proofbody_hash: Hash32,
    pub sig: Vec<u8>,
    pub initial_arguments: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeFinalization {
    pub counterentity: EntityId,
    pub initial_nonce: u64,
    pub proof_body: ProofBody,
    pub sig: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTokenToReserve {
    pub entity: EntityId,
    pub external_token: EvmAddress,
    pub token_id: TokenId,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveToExternalToken {
    pub entity: EntityId,
    pub external_token: EvmAddress,
    pub token_id: TokenId,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevealSecret {
    pub transformer: EvmAddress,
    pub secret: Hash32,
}

/// The exhaustive union of on-chain operations one entity submits in one
/// transaction. Field order mirrors the contract tuple.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Batch {
    pub flashloans: Vec<Flashloan>,
    pub reserve_to_reserve: Vec<ReserveToReserve>,
    pub reserve_to_collateral: Vec<ReserveToCollateral>,
    pub collateral_to_reserve: Vec<CollateralToReserve>,
    pub settlements: Vec<SettlementOp>,
    pub dispute_starts: Vec<DisputeStart>,
    pub dispute_finalizations: Vec<DisputeFinalization>,
    pub external_token_to_reserve: Vec<ExternalTokenToReserve>,
    pub reserve_to_external_token: Vec<ReserveToExternalToken>,
    pub reveal_secrets: Vec<RevealSecret>,
    pub hub_id: u64,
}

impl Batch {
    pub fn op_count(&self) -> usize {
        self.flashloans.len()
            + self.reserve_to_reserve.len()
            + self.reserve_to_collateral.len()
            + self.collateral_to_reserve.len()
            + self.settlements.len()
            + self.dispute_starts.len()
            + self.dispute_finalizations.len()
            + self.external_token_to_reserve.len()
            + self.reserve_to_external_token.len()
            + self.reveal_secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.op_count() == 0
    }
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Empty,
    Accumulating,
    Sent,
    Failed,
}

/// The immutable snapshot broadcast to the jurisdiction, authoritative
/// until acked or failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentBatch {
    pub batch: Batch,
    pub entity_nonce: u64,
    pub batch_hash: Hash32,
}

/// A batch prepared for submission.
#[derive(Debug, Clone)]
pub struct PreparedBroadcast {
    pub batch: Batch,
    pub encoded: Vec<u8>,
    pub batch_hash: Hash32,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JBatchState {
    pub entity: EntityId,
    pub batch: Batch,
    pub sent: Option<SentBatch>,
    pub last_broadcast_ts: TimestampMs,
    pub broadcast_count: u64,
    pub failed_attempts: u64,
    pub status: BatchStatus,
}

impl JBatchState {
    pub fn new(entity: EntityId) -> Self {
        Self {
            entity,
            batch: Batch::default(),
            sent: None,
            last_broadcast_ts: 0,
            broadcast_count: 0,
            failed_attempts: 0,
            status: BatchStatus::Empty,
        }
    }

    fn touch(&mut self) {
        if matches!(self.status, BatchStatus::Empty) {
            self.status = BatchStatus::Accumulating;
        }
    }

    // ── Appenders ────────────────────────────────────────────────────────────

    pub fn add_reserve_to_reserve(
        &mut self,
        receiving_entity: EntityId,
        token_id: TokenId,
        amount: Amount,
    ) -> Result<(), XlnError> {
        if !amount.is_positive() {
            return Err(XlnError::NonPositiveAmount);
        }
        let existing = self
            .batch
            .reserve_to_reserve
            .iter()
            .position(|op| op.receiving_entity == receiving_entity && op.token_id == token_id);
        match existing {
            Some(i) => self.batch.reserve_to_reserve[i].amount += &amount,
            None => self.batch.reserve_to_reserve.push(ReserveToReserve {
                receiving_entity,
                token_id,
                amount,
            }),
        }
        self.touch();
        Ok(())
    }

    /// Duplicate R→C for the same `(receiver, counterparty, token)` merges
    /// amounts instead of producing a second entry.
    pub fn add_reserve_to_collateral(
        &mut self,
        receiving_entity: EntityId,
        counterparty: EntityId,
        token_id: TokenId,
        amount: Amount,
    ) -> Result<(), XlnError> {
        if !amount.is_positive() {
            return Err(XlnError::NonPositiveAmount);
        }
        let idx = match self
            .batch
            .reserve_to_collateral
            .iter()
            .position(|op| op.receiving_entity == receiving_entity && op.token_id == token_id)
        {
            Some(i) => i,
            None => {
                self.batch.reserve_to_collateral.push(ReserveToCollateral {
                    token_id,
                    receiving_entity,
                    pairs: Vec::new(),
                });
                self.batch.reserve_to_collateral.len() - 1
            }
        };
        let op = &mut self.batch.reserve_to_collateral[idx];
        match op.pairs.iter().position(|p| p.entity == counterparty) {
            Some(i) => op.pairs[i].amount += &amount,
            None => op.pairs.push(CollateralPair { entity: counterparty, amount }),
        }
        self.touch();
        Ok(())
    }

    /// Add (or merge) a settlement. A settlement whose shape matches the
    /// cooperative-withdrawal pattern for this entity is emitted as a
    /// compact `collateralToReserve` entry instead — semantically identical,
    /// strictly smaller calldata.
    pub fn add_settlement(&mut self, op: SettlementOp) -> Result<(), XlnError> {
        if op.left_entity >= op.right_entity {
            return Err(XlnError::BatchPreflight("settlement sides not in canonical order".into()));
        }
        for diff in &op.diffs {
            if !diff.conserves_value() {
                return Err(XlnError::SettlementNotConserved { token_id: diff.token_id });
            }
        }

        if let Some(c2r) = self.compress_c2r(&op) {
            debug!(token = c2r.token_id, "settlement compressed to collateralToReserve");
            self.batch.collateral_to_reserve.push(c2r);
            self.touch();
            return Ok(());
        }

        let mergeable = self.batch.settlements.iter().position(|existing| {
            existing.left_entity == op.left_entity
                && existing.right_entity == op.right_entity
                && existing.sig.is_empty()
        });
        match mergeable {
            // A signed settlement must not be silently re-signed; the new
            // entry rides alongside it.
            None => self.batch.settlements.push(op),
            Some(i) => {
                let existing = &mut self.batch.settlements[i];
                for diff in op.diffs {
                    match existing.diffs.iter().position(|d| d.token_id == diff.token_id) {
                        Some(di) => {
                            let d = &mut existing.diffs[di];
                            d.left_diff += &diff.left_diff;
                            d.right_diff += &diff.right_diff;
                            d.collateral_diff += &diff.collateral_diff;
                            d.ondelta_diff += &diff.ondelta_diff;
                        }
                        None => existing.diffs.push(diff),
                    }
                }
                for token in op.forgive_debts_in_token_ids {
                    if !existing.forgive_debts_in_token_ids.contains(&token) {
                        existing.forgive_debts_in_token_ids.push(token);
                    }
                }
                if !op.sig.is_empty() {
                    existing.sig = op.sig;
                    existing.nonce = op.nonce;
                }
            }
        }
        self.touch();
        Ok(())
    }

    /// Recognize the pure cooperative-withdrawal shape: a single diff whose
    /// negative `collateral_diff` lands entirely in this entity's reserve,
    /// with the matching `ondelta_diff` convention and no other payloads.
    fn compress_c2r(&self, op: &SettlementOp) -> Option<CollateralToReserve> {
        if op.diffs.len() != 1
            || !op.forgive_debts_in_token_ids.is_empty()
            || op.sig.is_empty()
        {
            return None;
        }
        let diff = &op.diffs[0];
        if !diff.collateral_diff.is_negative() {
            return None;
        }
        let amount = diff.collateral_diff.abs();

        let by_left = self.entity == op.left_entity;
        let (own_diff, peer_diff, counterparty) = if by_left {
            (&diff.left_diff, &diff.right_diff, op.right_entity)
        } else {
            (&diff.right_diff, &diff.left_diff, op.left_entity)
        };
        if own_diff != &amount || !peer_diff.is_zero() {
            return None;
        }
        let expected_ondelta = if by_left { -amount.clone() } else { Amount::zero() };
        if diff.ondelta_diff != expected_ondelta {
            return None;
        }

        Some(CollateralToReserve {
            counterparty,
            token_id: diff.token_id,
            amount,
            nonce: op.nonce,
            sig: op.sig.clone(),
        })
    }

    pub fn add_dispute_start(&mut self, op: DisputeStart) {
        self.batch.dispute_starts.push(op);
        self.touch();
    }

    pub fn add_dispute_finalization(&mut self, op: DisputeFinalization) {
        self.batch.dispute_finalizations.push(op);
        self.touch();
    }

    pub fn add_external_token_to_reserve(&mut self, op: ExternalTokenToReserve) {
        self.batch.external_token_to_reserve.push(op);
        self.touch();
    }

    pub fn add_reserve_to_external_token(&mut self, op: ReserveToExternalToken) {
        self.batch.reserve_to_external_token.push(op);
        self.touch();
    }

    /// Identical reveals deduplicate.
    pub fn add_reveal_secret(&mut self, transformer: EvmAddress, secret: Hash32) {
        let op = RevealSecret { transformer, secret };
        if !self.batch.reveal_secrets.contains(&op) {
            self.batch.reveal_secrets.push(op);
            self.touch();
        }
    }

    // ── Broadcast ────────────────────────────────────────────────────────────

    /// Automatic broadcast policy: size or age, and only when non-empty and
    /// nothing is in flight.
    pub fn should_auto_broadcast(&self, now: TimestampMs) -> bool {
        if self.batch.is_empty() || self.sent.is_some() {
            return false;
        }
        self.batch.op_count() >= BATCH_AUTO_BROADCAST_OPS
            || now.saturating_sub(self.last_broadcast_ts) >= BATCH_AUTO_BROADCAST_MS
    }

    /// Structural preflight before any bytes leave the entity.
    pub fn preflight(&self) -> Result<(), XlnError> {
        for s in &self.batch.settlements {
            if s.left_entity >= s.right_entity {
                return Err(XlnError::BatchPreflight(
                    "settlement sides not in canonical order".into(),
                ));
            }
            if !s.diffs.is_empty() && s.sig.is_empty() {
                return Err(XlnError::BatchPreflight(
                    "diff-bearing settlement lacks a counterparty signature".into(),
                ));
            }
        }
        let mut last_nonce: std::collections::BTreeMap<EntityId, u64> = Default::default();
        for d in &self.batch.dispute_starts {
            if let Some(prev) = last_nonce.insert(d.counterentity, d.nonce) {
                if d.nonce <= prev {
                    return Err(XlnError::BatchPreflight("dispute nonces out of order".into()));
                }
            }
        }
        for op in &self.batch.external_token_to_reserve {
            if op.entity != self.entity {
                return Err(XlnError::BatchPreflight(
                    "external token deposit names a foreign entity".into(),
                ));
            }
        }
        for op in &self.batch.reserve_to_external_token {
            if op.entity != self.entity {
                return Err(XlnError::BatchPreflight(
                    "external token withdrawal names a foreign entity".into(),
                ));
            }
        }
        for r in &self.batch.reveal_secrets {
            if r.transformer.is_zero() {
                return Err(XlnError::BatchPreflight("secret reveal with zero transformer".into()));
            }
        }
        Ok(())
    }

    /// Encode and hash the current batch for submission under the next
    /// on-chain nonce. The batch stays current until `mark_sent`.
    pub fn prepare_broadcast(
        &self,
        chain_id: u64,
        depository: &EvmAddress,
        current_on_chain_nonce: u64,
    ) -> Result<PreparedBroadcast, XlnError> {
        if let Some(sent) = &self.sent {
            return Err(XlnError::BatchAlreadySent { nonce: sent.entity_nonce });
        }
        if self.batch.is_empty() {
            return Err(XlnError::BatchPreflight("empty batch".into()));
        }
        self.preflight()?;
        let nonce = current_on_chain_nonce + 1;
        let encoded = encode_batch(&self.batch);
        let hash = batch_hash(chain_id, depository, &encoded, nonce);
        Ok(PreparedBroadcast { batch: self.batch.clone(), encoded, batch_hash: hash, nonce })
    }

    /// The submission was accepted by the adapter: snapshot and clear.
    pub fn mark_sent(&mut self, prepared: &PreparedBroadcast, now: TimestampMs) {
        self.sent = Some(SentBatch {
            batch: prepared.batch.clone(),
            entity_nonce: prepared.nonce,
            batch_hash: prepared.batch_hash,
        });
        self.batch = Batch::default();
        self.last_broadcast_ts = now;
        self.broadcast_count += 1;
        self.status = BatchStatus::Sent;
        info!(entity = %self.entity, nonce = prepared.nonce, "batch broadcast");
    }

    /// The adapter refused or reverted before inclusion: the batch remains
    /// current for a later retry.
    pub fn mark_broadcast_failed(&mut self, err: &XlnError) {
        warn!(entity = %self.entity, %err, "batch broadcast failed");
        self.failed_attempts += 1;
        self.status = BatchStatus::Failed;
    }

    // ── Reconciliation ───────────────────────────────────────────────────────

    /// Consume an observed `HankoBatchProcessed{nonce, success}`. Returns
    /// true when the event matched our sent batch.
    pub fn reconcile(&mut self, nonce: u64, success: bool) -> bool {
        let Some(sent) = &self.sent else { return false };
        if sent.entity_nonce != nonce {
            return false;
        }
        let sent = self.sent.take().expect("present above");
        if success {
            self.status =
                if self.batch.is_empty() { BatchStatus::Empty } else { BatchStatus::Accumulating };
            info!(entity = %self.entity, nonce, "batch confirmed on-chain");
        } else {
            // Merge the failed snapshot back ahead of anything queued since,
            // preserving operation order for the retry.
            let queued = std::mem::take(&mut self.batch);
            self.batch = sent.batch;
            self.merge_batch(queued);
            self.failed_attempts += 1;
            self.status = BatchStatus::Failed;
            warn!(entity = %self.entity, nonce, "batch rejected on-chain; operations requeued");
        }
        true
    }

    fn merge_batch(&mut self, other: Batch) {
        self.batch.flashloans.extend(other.flashloans);
        self.batch.reserve_to_reserve.extend(other.reserve_to_reserve);
        self.batch.reserve_to_collateral.extend(other.reserve_to_collateral);
        self.batch.collateral_to_reserve.extend(other.collateral_to_reserve);
        self.batch.settlements.extend(other.settlements);
        self.batch.dispute_starts.extend(other.dispute_starts);
        self.batch.dispute_finalizations.extend(other.dispute_finalizations);
        self.batch.external_token_to_reserve.extend(other.external_token_to_reserve);
        self.batch.reserve_to_external_token.extend(other.reserve_to_external_token);
        self.batch.reveal_secrets.extend(other.reveal_secrets);
    }

    /// Operator abort: discard both the current and any sent batch.
    pub fn clear(&mut self) {
        self.batch = Batch::default();
        self.sent = None;
        self.status = BatchStatus::Empty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn left() -> EntityId {
        EntityId::from_bytes([1; 32])
    }
    fn right() -> EntityId {
        EntityId::from_bytes([2; 32])
    }

    fn withdrawal_by_left(amount: i64) -> SettlementOp {
        SettlementOp {
            left_entity: left(),
            right_entity: right(),
            diffs: vec![SettleDiff {
                token_id: 1,
                left_diff: Amount::from_i64(amount),
                right_diff: Amount::zero(),
                collateral_diff: Amount::from_i64(-amount),
                ondelta_diff: Amount::from_i64(-amount),
            }],
            forgive_debts_in_token_ids: vec![],
            sig: vec![0xAB; 65],
            entity_provider: EvmAddress::default(),
            hanko_data: vec![],
            nonce: 3,
        }
    }

    #[test]
    fn r2c_merges_same_route() {
        let mut st = JBatchState::new(left());
        st.add_reserve_to_collateral(left(), right(), 1, Amount::from_i64(100)).unwrap();
        st.add_reserve_to_collateral(left(), right(), 1, Amount::from_i64(50)).unwrap();
        assert_eq!(st.batch.reserve_to_collateral.len(), 1);
        assert_eq!(st.batch.reserve_to_collateral[0].pairs.len(), 1);
        assert_eq!(st.batch.reserve_to_collateral[0].pairs[0].amount, Amount::from_i64(150));
        assert_eq!(st.status, BatchStatus::Accumulating);
    }

    #[test]
    fn pure_withdrawal_compresses_to_c2r() {
        let mut st = JBatchState::new(left());
        st.add_settlement(withdrawal_by_left(500)).unwrap();
        assert!(st.batch.settlements.is_empty());
        assert_eq!(st.batch.collateral_to_reserve.len(), 1);
        let c2r = &st.batch.collateral_to_reserve[0];
        assert_eq!(c2r.counterparty, right());
        assert_eq!(c2r.amount, Amount::from_i64(500));
        assert_eq!(c2r.nonce, 3);
    }

    #[test]
    fn impure_settlement_stays_expanded() {
        let mut st = JBatchState::new(left());
        let mut op = withdrawal_by_left(500);
        op.forgive_debts_in_token_ids.push(2);
        st.add_settlement(op).unwrap();
        assert_eq!(st.batch.settlements.len(), 1);
        assert!(st.batch.collateral_to_reserve.is_empty());
    }

    #[test]
    fn signed_settlement_not_merged_into() {
        let mut st = JBatchState::new(left());
        let mut signed = withdrawal_by_left(500);
        signed.diffs[0].ondelta_diff = Amount::zero(); // not compressible
        st.add_settlement(signed).unwrap();
        let mut second = withdrawal_by_left(100);
        second.diffs[0].ondelta_diff = Amount::zero();
        second.sig = vec![];
        st.add_settlement(second).unwrap();
        // The signed entry is untouched; the unsigned one rides alongside.
        assert_eq!(st.batch.settlements.len(), 2);
        assert_eq!(st.batch.settlements[0].diffs[0].left_diff, Amount::from_i64(500));
    }

    #[test]
    fn ack_success_clears_sent() {
        let mut st = JBatchState::new(left());
        st.add_reserve_to_reserve(right(), 1, Amount::from_i64(10)).unwrap();
        let prepared = st.prepare_broadcast(31337, &EvmAddress::default(), 6).unwrap();
        assert_eq!(prepared.nonce, 7);
        st.mark_sent(&prepared, 1_000);
        assert_eq!(st.status, BatchStatus::Sent);
        assert!(st.batch.is_empty());

        assert!(st.reconcile(7, true));
        assert!(st.sent.is_none());
        assert_eq!(st.status, BatchStatus::Empty);
    }

    #[test]
    fn ack_success_with_queued_ops_keeps_accumulating() {
        let mut st = JBatchState::new(left());
        st.add_reserve_to_reserve(right(), 1, Amount::from_i64(10)).unwrap();
        let prepared = st.prepare_broadcast(31337, &EvmAddress::default(), 0).unwrap();
        st.mark_sent(&prepared, 1_000);
        st.add_reserve_to_reserve(right(), 2, Amount::from_i64(5)).unwrap();

        assert!(st.reconcile(1, true));
        assert_eq!(st.status, BatchStatus::Accumulating);
        assert_eq!(st.batch.op_count(), 1);
    }

    #[test]
    fn ack_failure_requeues_in_order() {
        let mut st = JBatchState::new(left());
        st.add_reserve_to_reserve(right(), 1, Amount::from_i64(10)).unwrap();
        st.add_reserve_to_reserve(right(), 2, Amount::from_i64(20)).unwrap();
        let prepared = st.prepare_broadcast(31337, &EvmAddress::default(), 0).unwrap();
        st.mark_sent(&prepared, 1_000);

        assert!(st.reconcile(1, false));
        assert_eq!(st.failed_attempts, 1);
        assert_eq!(st.status, BatchStatus::Failed);
        let ops = &st.batch.reserve_to_reserve;
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].token_id, 1);
        assert_eq!(ops[1].token_id, 2);
    }

    #[test]
    fn second_broadcast_blocked_while_sent() {
        let mut st = JBatchState::new(left());
        st.add_reserve_to_reserve(right(), 1, Amount::from_i64(10)).unwrap();
        let prepared = st.prepare_broadcast(31337, &EvmAddress::default(), 0).unwrap();
        st.mark_sent(&prepared, 1_000);
        st.add_reserve_to_reserve(right(), 2, Amount::from_i64(5)).unwrap();
        let err = st.prepare_broadcast(31337, &EvmAddress::default(), 1).unwrap_err();
        assert!(matches!(err, XlnError::BatchAlreadySent { .. }));
    }

    #[test]
    fn preflight_rejects_zero_transformer() {
        let mut st = JBatchState::new(left());
        st.add_reveal_secret(EvmAddress::default(), Hash32::from_bytes([1; 32]));
        let err = st.prepare_broadcast(31337, &EvmAddress::default(), 0).unwrap_err();
        assert!(matches!(err, XlnError::BatchPreflight(_)));
    }

    #[test]
    fn auto_broadcast_policy() {
        let mut st = JBatchState::new(left());
        assert!(!st.should_auto_broadcast(10_000));
        st.add_reserve_to_reserve(right(), 1, Amount::from_i64(1)).unwrap();
        // Age path: last broadcast at 0, now 10s.
        assert!(st.should_auto_broadcast(10_000));
        st.last_broadcast_ts = 9_000;
        assert!(!st.should_auto_broadcast(10_000));
        assert!(st.should_auto_broadcast(14_000));
    }
}
