//! The Depository ABI surface.
//!
//! This module is the single source of truth for every byte the contracts
//! see: the `Batch` tuple, the batch-hanko domain hash, and the digests
//! counterparties sign for settlements and compressed withdrawals. Field
//! order is fixed by the contract and must not drift.

use ethabi::ethereum_types::U256;
use ethabi::Token;

use xln_core::{Amount, EntityId, EvmAddress, Hash32, SettleDiff, TokenId};
use xln_crypto::{keccak256, keccak256_concat};

use crate::batch::{
    Batch, CollateralToReserve, DisputeFinalization, DisputeStart, ExternalTokenToReserve,
    Flashloan, ReserveToCollateral, ReserveToExternalToken, ReserveToReserve, RevealSecret,
    SettlementOp,
};

fn uint(v: u64) -> Token {
    Token::Uint(v.into())
}

fn amount_uint(a: &Amount) -> Token {
    Token::Uint(U256::from_big_endian(&a.to_be_bytes32()))
}

fn amount_int(a: &Amount) -> Token {
    Token::Int(U256::from_big_endian(&a.to_be_bytes32()))
}

fn b32(h: &Hash32) -> Token {
    Token::FixedBytes(h.as_bytes().to_vec())
}

fn entity(e: &EntityId) -> Token {
    Token::FixedBytes(e.as_bytes().to_vec())
}

fn address(a: &EvmAddress) -> Token {
    Token::Address(ethabi::Address::from_slice(a.as_bytes()))
}

fn diff_token(d: &SettleDiff) -> Token {
    Token::Tuple(vec![
        uint(d.token_id),
        amount_int(&d.left_diff),
        amount_int(&d.right_diff),
        amount_int(&d.collateral_diff),
        amount_int(&d.ondelta_diff),
    ])
}

// ── Batch encoding ───────────────────────────────────────────────────────────

fn flashloan_token(f: &Flashloan) -> Token {
    Token::Tuple(vec![uint(f.token_id), amount_uint(&f.amount)])
}

fn r2r_token(op: &ReserveToReserve) -> Token {
    Token::Tuple(vec![entity(&op.receiving_entity), uint(op.token_id), amount_uint(&op.amount)])
}

fn r2c_token(op: &ReserveToCollateral) -> Token {
    let pairs = op
        .pairs
        .iter()
        .map(|p| Token::Tuple(vec![entity(&p.entity), amount_uint(&p.amount)]))
        .collect();
    Token::Tuple(vec![uint(op.token_id), entity(&op.receiving_entity), Token::Array(pairs)])
}

fn c2r_token(op: &CollateralToReserve) -> Token {
    Token::Tuple(vec![
        entity(&op.counterparty),
        uint(op.token_id),
        amount_uint(&op.amount),
        uint(op.nonce),
        Token::Bytes(op.sig.clone()),
    ])
}

fn settlement_token(op: &SettlementOp) -> Token {
    Token::Tuple(vec![
        entity(&op.left_entity),
        entity(&op.right_entity),
        Token::Array(op.diffs.iter().map(diff_token).collect()),
        Token::Array(op.forgive_debts_in_token_ids.iter().map(|t| uint(*t)).collect()),
        Token::Bytes(op.sig.clone()),
        address(&op.entity_provider),
        Token::Bytes(op.hanko_data.clone()),
        uint(op.nonce),
    ])
}

fn dispute_start_token(op: &DisputeStart) -> Token {
    Token::Tuple(vec![
        entity(&op.counterentity),
        uint(op.nonce),
        b32(&op.proofbody_hash),
        Token::Bytes(op.sig.clone()),
        Token::Bytes(op.initial_arguments.clone()),
    ])
}

fn dispute_finalization_token(op: &DisputeFinalization) -> Token {
    let body = &op.proof_body;
    let locks = body
        .htlc_locks
        .iter()
        .map(|l| {
            Token::Tuple(vec![
                b32(&l.hashlock),
                uint(l.reveal_before_height),
                amount_uint(&l.amount),
                uint(l.token_id),
                Token::Bool(l.by_left),
            ])
        })
        .collect();
    Token::Tuple(vec![
        entity(&op.counterentity),
        uint(op.initial_nonce),
        Token::Tuple(vec![
            Token::Array(body.token_ids.iter().map(|t| uint(*t)).collect()),
            Token::Array(body.deltas.iter().map(amount_int).collect()),
            Token::Array(locks),
        ]),
        Token::Bytes(op.sig.clone()),
    ])
}

fn external_in_token(op: &ExternalTokenToReserve) -> Token {
    Token::Tuple(vec![
        entity(&op.entity),
        address(&op.external_token),
        uint(op.token_id),
        amount_uint(&op.amount),
    ])
}

fn external_out_token(op: &ReserveToExternalToken) -> Token {
    Token::Tuple(vec![
        entity(&op.entity),
        address(&op.external_token),
        uint(op.token_id),
        amount_uint(&op.amount),
    ])
}

fn reveal_token(op: &RevealSecret) -> Token {
    Token::Tuple(vec![address(&op.transformer), b32(&op.secret)])
}

/// ABI-encode the whole batch as the single tuple `processBatch` consumes.
pub fn encode_batch(batch: &Batch) -> Vec<u8> {
    ethabi::encode(&[Token::Tuple(vec![
        Token::Array(batch.flashloans.iter().map(flashloan_token).collect()),
        Token::Array(batch.reserve_to_reserve.iter().map(r2r_token).collect()),
        Token::Array(batch.reserve_to_collateral.iter().map(r2c_token).collect()),
        Token::Array(batch.collateral_to_reserve.iter().map(c2r_token).collect()),
        Token::Array(batch.settlements.iter().map(settlement_token).collect()),
        Token::Array(batch.dispute_starts.iter().map(dispute_start_token).collect()),
        Token::Array(batch.dispute_finalizations.iter().map(dispute_finalization_token).collect()),
        Token::Array(batch.external_token_to_reserve.iter().map(external_in_token).collect()),
        Token::Array(batch.reserve_to_external_token.iter().map(external_out_token).collect()),
        Token::Array(batch.reveal_secrets.iter().map(reveal_token).collect()),
        uint(batch.hub_id),
    ])])
}

// ── Signature domains ────────────────────────────────────────────────────────

fn u256_be(v: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[24..].copy_from_slice(&v.to_be_bytes());
    out
}

/// The digest a batch hanko signs:
/// `keccak256(domainSep ‖ chainId ‖ depository ‖ encodedBatch ‖ nonce)`.
pub fn batch_hash(
    chain_id: u64,
    depository: &EvmAddress,
    encoded_batch: &[u8],
    nonce: u64,
) -> Hash32 {
    let sep = keccak256(xln_core::HANKO_DOMAIN_SEPARATOR.as_bytes());
    keccak256_concat(&[
        sep.as_bytes(),
        &u256_be(chain_id),
        depository.as_bytes(),
        encoded_batch,
        &u256_be(nonce),
    ])
}

/// The digest the counterparty signs to authorize a compressed
/// collateral-to-reserve withdrawal.
pub fn c2r_hash(
    withdrawer: &EntityId,
    counterparty: &EntityId,
    token_id: TokenId,
    amount: &Amount,
    nonce: u64,
    depository: &EvmAddress,
) -> Hash32 {
    keccak256(&ethabi::encode(&[
        entity(withdrawer),
        entity(counterparty),
        uint(token_id),
        amount_uint(amount),
        uint(nonce),
        address(depository),
    ]))
}

/// The digest the counterparty signs to authorize a full settlement entry.
pub fn settlement_hash(
    left: &EntityId,
    right: &EntityId,
    diffs: &[SettleDiff],
    forgive: &[TokenId],
    nonce: u64,
    depository: &EvmAddress,
) -> Hash32 {
    keccak256(&ethabi::encode(&[
        entity(left),
        entity(right),
        Token::Array(diffs.iter().map(diff_token).collect()),
        Token::Array(forgive.iter().map(|t| uint(*t)).collect()),
        uint(nonce),
        address(depository),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Batch;

    #[test]
    fn empty_batch_encodes() {
        let encoded = encode_batch(&Batch::default());
        assert!(!encoded.is_empty());
        // Deterministic.
        assert_eq!(encoded, encode_batch(&Batch::default()));
    }

    #[test]
    fn batch_hash_binds_every_input() {
        let dep = EvmAddress::from_bytes([1; 20]);
        let encoded = encode_batch(&Batch::default());
        let base = batch_hash(31337, &dep, &encoded, 7);
        assert_ne!(base, batch_hash(1, &dep, &encoded, 7));
        assert_ne!(base, batch_hash(31337, &EvmAddress::from_bytes([2; 20]), &encoded, 7));
        assert_ne!(base, batch_hash(31337, &dep, &encoded, 8));
        assert_ne!(base, batch_hash(31337, &dep, b"other", 7));
    }

    #[test]
    fn compressed_form_is_smaller_than_expanded() {
        use xln_core::Amount;
        let left = EntityId::from_bytes([1; 32]);
        let right = EntityId::from_bytes([2; 32]);

        let mut expanded = Batch::default();
        expanded.settlements.push(SettlementOp {
            left_entity: left,
            right_entity: right,
            diffs: vec![SettleDiff {
                token_id: 1,
                left_diff: Amount::from_i64(500),
                right_diff: Amount::zero(),
                collateral_diff: Amount::from_i64(-500),
                ondelta_diff: Amount::from_i64(-500),
            }],
            forgive_debts_in_token_ids: vec![],
            sig: vec![0u8; 200],
            entity_provider: EvmAddress::default(),
            hanko_data: vec![],
            nonce: 1,
        });

        let mut compact = Batch::default();
        compact.collateral_to_reserve.push(CollateralToReserve {
            counterparty: right,
            token_id: 1,
            amount: Amount::from_i64(500),
            nonce: 1,
            sig: vec![0u8; 200],
        });

        assert!(encode_batch(&compact).len() < encode_batch(&expanded).len());
    }
}
