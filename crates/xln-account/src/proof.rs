//! Dispute proof builder.
//!
//! At any committed height either side can assemble the instrument for a
//! unilateral exit: the proof header, the proof body (token rows and open
//! locks in the DeltaTransformer ABI shape), and the counterparty's dispute
//! hanko over the most recent body.

use ethabi::ethereum_types::U256;
use ethabi::Token;
use serde::{Deserialize, Serialize};

use xln_core::{Amount, EntityId, EvmAddress, Hash32, TokenId};
use xln_crypto::{keccak256, Hanko};

use crate::htlc::HtlcLock;
use crate::state::{AccountState, ProofHeader};

// ── ProofBody ────────────────────────────────────────────────────────────────

/// The DeltaTransformer-shaped body: per-token net deltas plus open locks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofBody {
    pub token_ids: Vec<TokenId>,
    /// `ondelta + offdelta` per token, `token_ids` order.
    pub deltas: Vec<Amount>,
    pub htlc_locks: Vec<HtlcLock>,
}

impl ProofBody {
    pub fn from_state(state: &AccountState) -> Self {
        let mut token_ids = Vec::new();
        let mut deltas = Vec::new();
        for (token_id, row) in &state.deltas {
            token_ids.push(*token_id);
            deltas.push(row.total_delta());
        }
        Self {
            token_ids,
            deltas,
            htlc_locks: state.htlc_locks.values().cloned().collect(),
        }
    }

    /// ABI encoding:
    /// `(uint256[] tokenIds, int256[] deltas,
    ///   (bytes32 hashlock, uint256 revealBefore, uint256 amount,
    ///    uint256 tokenId, bool byLeft)[] locks)`
    pub fn encode(&self) -> Vec<u8> {
        let token_tokens = self
            .token_ids
            .iter()
            .map(|t| Token::Uint((*t).into()))
            .collect();
        let delta_tokens = self
            .deltas
            .iter()
            .map(|d| Token::Int(U256::from_big_endian(&d.to_be_bytes32())))
            .collect();
        let lock_tokens = self
            .htlc_locks
            .iter()
            .map(|l| {
                Token::Tuple(vec![
                    Token::FixedBytes(l.hashlock.as_bytes().to_vec()),
                    Token::Uint(l.reveal_before_height.into()),
                    Token::Uint(U256::from_big_endian(&l.amount.to_be_bytes32())),
                    Token::Uint(l.token_id.into()),
                    Token::Bool(l.by_left),
                ])
            })
            .collect();
        ethabi::encode(&[
            Token::Array(token_tokens),
            Token::Array(delta_tokens),
            Token::Array(lock_tokens),
        ])
    }

    pub fn hash(&self) -> Hash32 {
        keccak256(&self.encode())
    }
}

// ── Dispute hash ─────────────────────────────────────────────────────────────

/// The 32-byte digest a dispute hanko signs:
/// `keccak256(abi.encode(header, proofBodyHash, depository, cooperativeNonce))`.
pub fn dispute_hash(
    header: &ProofHeader,
    body_hash: &Hash32,
    depository: &EvmAddress,
    cooperative_nonce: u64,
) -> Hash32 {
    let encoded = ethabi::encode(&[
        Token::FixedBytes(header.from_entity.as_bytes().to_vec()),
        Token::FixedBytes(header.to_entity.as_bytes().to_vec()),
        Token::Uint(header.cooperative_nonce.into()),
        Token::Uint(header.dispute_nonce.into()),
        Token::FixedBytes(body_hash.as_bytes().to_vec()),
        Token::Address(ethabi::Address::from_slice(depository.as_bytes())),
        Token::Uint(cooperative_nonce.into()),
    ]);
    keccak256(&encoded)
}

/// A complete unilateral-exit instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeProof {
    pub header: ProofHeader,
    pub body: ProofBody,
    /// The counterparty's hanko over the dispute hash of `body`.
    pub counterparty_hanko: Hanko,
}

/// Build the proof header + body + dispute hash for the current committed
/// state, from the point of view of `from_entity`.
pub fn build_proof(
    state: &AccountState,
    from_entity: EntityId,
    depository: &EvmAddress,
) -> (ProofHeader, ProofBody, Hash32) {
    let to_entity = if from_entity == state.left { state.right } else { state.left };
    let header = ProofHeader {
        from_entity,
        to_entity,
        cooperative_nonce: state.cooperative_nonce,
        dispute_nonce: state.height,
    };
    let body = ProofBody::from_state(state);
    let hash = dispute_hash(&header, &body.hash(), depository, state.cooperative_nonce);
    (header, body, hash)
}
