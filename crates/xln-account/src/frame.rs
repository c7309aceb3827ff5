//! Account frames: the unit of bilateral consensus.

use serde::{Deserialize, Serialize};

use xln_core::{
    canonical_bytes, Amount, EntityId, Hash32, Height, TimestampMs, TokenId, XlnError,
    FRAME_MAX_ENCODED_BYTES,
};
use xln_crypto::{keccak256, Hanko};

use crate::delta::Delta;
use crate::tx::AccountTx;

// ── AccountFrame ─────────────────────────────────────────────────────────────

/// A height-indexed, hash-chained bilateral state update.
///
/// `state_hash` is keccak256 over the canonical encoding of the frame with
/// the `state_hash` field zeroed; it commits to the transactions and the
/// resulting token rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountFrame {
    pub height: Height,
    pub timestamp: TimestampMs,
    /// The proposer's last finalized J-height; HTLC deadlines age against
    /// this shared value.
    pub j_height: Height,
    pub account_txs: Vec<AccountTx>,
    pub prev_frame_hash: Hash32,
    /// Token ids present after application, sorted ascending.
    pub token_ids: Vec<TokenId>,
    /// `offdelta` per token in `token_ids` order (the compact bilateral
    /// summary).
    pub deltas: Vec<Amount>,
    /// Full rows in `token_ids` order; rows with all-zero bilateral fields
    /// are elided together with their id.
    pub full_delta_states: Vec<Delta>,
    /// True when the proposer is the left side.
    pub by_left: bool,
    pub state_hash: Hash32,
}

impl AccountFrame {
    /// Recompute the state hash over this frame's own contents.
    pub fn compute_state_hash(&self) -> Result<Hash32, XlnError> {
        let mut body = self.clone();
        body.state_hash = Hash32::ZERO;
        let bytes = canonical_bytes(&body)?;
        if bytes.len() > FRAME_MAX_ENCODED_BYTES {
            return Err(XlnError::FrameTooLarge { max: FRAME_MAX_ENCODED_BYTES });
        }
        Ok(keccak256(&bytes))
    }

    /// Seal the frame: compute and store its state hash.
    pub fn seal(mut self) -> Result<AccountFrame, XlnError> {
        self.state_hash = self.compute_state_hash()?;
        Ok(self)
    }
}

/// Snapshot the token table of a post-application state into the three
/// parallel frame fields. Rows whose bilateral fields are all zero are
/// skipped.
pub fn snapshot_deltas(
    deltas: &std::collections::BTreeMap<TokenId, Delta>,
) -> (Vec<TokenId>, Vec<Amount>, Vec<Delta>) {
    let mut token_ids = Vec::new();
    let mut offdeltas = Vec::new();
    let mut rows = Vec::new();
    for (token_id, row) in deltas {
        if row.is_bilateral_zero() {
            continue;
        }
        token_ids.push(*token_id);
        offdeltas.push(row.offdelta.clone());
        rows.push(row.clone());
    }
    (token_ids, offdeltas, rows)
}

// ── Wire messages ────────────────────────────────────────────────────────────

/// A new frame offered by one side, with the proposer's hankos over the
/// frame state hash and the companion dispute hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalPart {
    pub frame: AccountFrame,
    pub frame_hanko: Hanko,
    pub dispute_hanko: Hanko,
    pub dispute_hash: Hash32,
}

/// Acceptance of the peer's pending frame. Carries the acker's hanko over
/// the same state hash plus its dispute hanko over the new proof body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPart {
    pub height: Height,
    pub state_hash: Hash32,
    pub ack_hanko: Hanko,
    pub dispute_hanko: Hanko,
    pub dispute_hash: Hash32,
}

/// One bilateral consensus message. The ack and proposal parts are
/// independent: one may fail without discarding the other, and a reply
/// commonly carries both (ack of the peer's frame + a chained frame of our
/// own).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInput {
    pub from_entity: EntityId,
    pub to_entity: EntityId,
    pub ack: Option<AckPart>,
    pub proposal: Option<ProposalPart>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn state_hash_deterministic_and_order_independent() {
        let mut a = BTreeMap::new();
        let mut row1 = Delta::new(1);
        row1.offdelta = Amount::from_i64(-5);
        let mut row9 = Delta::new(9);
        row9.offdelta = Amount::from_i64(3);
        a.insert(9u64, row9.clone());
        a.insert(1u64, row1.clone());

        let mut b = BTreeMap::new();
        b.insert(1u64, row1);
        b.insert(9u64, row9);

        let (ids_a, offs_a, rows_a) = snapshot_deltas(&a);
        let (ids_b, offs_b, rows_b) = snapshot_deltas(&b);
        assert_eq!(ids_a, vec![1, 9]);
        assert_eq!(ids_a, ids_b);

        let frame = |ids: Vec<u64>, offs: Vec<Amount>, rows: Vec<Delta>| AccountFrame {
            height: 1,
            timestamp: 10,
            j_height: 0,
            account_txs: vec![],
            prev_frame_hash: Hash32::ZERO,
            token_ids: ids,
            deltas: offs,
            full_delta_states: rows,
            by_left: true,
            state_hash: Hash32::ZERO,
        };
        let ha = frame(ids_a, offs_a, rows_a).compute_state_hash().unwrap();
        let hb = frame(ids_b, offs_b, rows_b).compute_state_hash().unwrap();
        assert_eq!(ha, hb);
    }

    #[test]
    fn zero_rows_elided() {
        let mut m = BTreeMap::new();
        let mut funded = Delta::new(2);
        funded.collateral = Amount::from_i64(100);
        m.insert(2u64, funded); // bilateral-zero: elided
        let mut active = Delta::new(3);
        active.offdelta = Amount::from_i64(1);
        m.insert(3u64, active);
        let (ids, _, rows) = snapshot_deltas(&m);
        assert_eq!(ids, vec![3]);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn seal_round_trips() {
        let frame = AccountFrame {
            height: 1,
            timestamp: 10,
            j_height: 2,
            account_txs: vec![],
            prev_frame_hash: Hash32::ZERO,
            token_ids: vec![],
            deltas: vec![],
            full_delta_states: vec![],
            by_left: false,
            state_hash: Hash32::ZERO,
        }
        .seal()
        .unwrap();
        assert_eq!(frame.compute_state_hash().unwrap(), frame.state_hash);
    }
}
