//! Hanko: a compact, self-describing multi-signature.
//!
//! A hanko proves that an entity — possibly composed of other entities —
//! authorized a 32-byte hash. It carries an ordered placeholder list
//! (quorum members that did not sign), a packed blob of EOA signatures, and
//! an ordered claim list. Claims may reference earlier claims, which is how
//! nested governance signs: a child entity's accepted claim counts as a
//! signing member of its parent's quorum.
//!
//! Index space for `entity_indexes`, in order:
//!   `[0, P)`          → placeholders
//!   `[P, P + N)`      → recovered EOAs (k-th packed signature)
//!   `[P + N, …)`      → prior claims

use serde::{Deserialize, Serialize};

use xln_core::{EntityId, EvmAddress, Hash32, Signature65, SignerId, XlnError};

use crate::hash::keccak256;
use crate::keypair::recover_signer;

// ── Quorum configuration ─────────────────────────────────────────────────────

/// One quorum member: a 32-byte id (left-padded EOA for signers, entity id
/// for nested entities) and its voting weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumMember {
    pub id: EntityId,
    pub weight: u64,
}

/// An entity's quorum: ordered members and the weight threshold.
/// Member order is consensus-critical — the board hash commits to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumConfig {
    pub threshold: u64,
    pub members: Vec<QuorumMember>,
}

impl QuorumConfig {
    pub fn total_weight(&self) -> u64 {
        self.members.iter().map(|m| m.weight).sum()
    }

    /// The on-chain board hash:
    /// `keccak256(abi.encode(threshold, members, weights, 0, 0, 0))`.
    pub fn board_hash(&self) -> Hash32 {
        let member_tokens: Vec<ethabi::Token> = self
            .members
            .iter()
            .map(|m| ethabi::Token::FixedBytes(m.id.as_bytes().to_vec()))
            .collect();
        let weight_tokens: Vec<ethabi::Token> = self
            .members
            .iter()
            .map(|m| ethabi::Token::Uint(m.weight.into()))
            .collect();
        let encoded = ethabi::encode(&[
            ethabi::Token::Uint(self.threshold.into()),
            ethabi::Token::Array(member_tokens),
            ethabi::Token::Array(weight_tokens),
            ethabi::Token::Uint(0u64.into()),
            ethabi::Token::Uint(0u64.into()),
            ethabi::Token::Uint(0u64.into()),
        ]);
        keccak256(&encoded)
    }
}

// ── Hanko structure ──────────────────────────────────────────────────────────

/// One quorum claim inside a hanko.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HankoClaim {
    pub entity_id: EntityId,
    pub entity_indexes: Vec<u32>,
    pub weights: Vec<u64>,
    pub threshold: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hanko {
    /// 32-byte ids of quorum members that did not sign.
    pub placeholders: Vec<Hash32>,
    /// N packed 65-byte signatures, hex-encoded on the wire.
    #[serde(with = "hex_blob")]
    pub packed_signatures: Vec<u8>,
    pub claims: Vec<HankoClaim>,
}

impl Hanko {
    pub fn signature_count(&self) -> usize {
        self.packed_signatures.len() / Signature65::LEN
    }

    pub fn signature(&self, k: usize) -> Option<Signature65> {
        let start = k * Signature65::LEN;
        self.packed_signatures
            .get(start..start + Signature65::LEN)
            .and_then(Signature65::from_slice)
    }

    fn push_signature(&mut self, sig: &Signature65) {
        self.packed_signatures.extend_from_slice(sig.as_bytes());
    }
}

mod hex_blob {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

// ── Building ─────────────────────────────────────────────────────────────────

/// Hanko for a single-signer entity: one signature, zero placeholders, one
/// claim `{entity_id, [0], [1], 1}`.
pub fn build_single_hanko(entity_id: EntityId, signature: Signature65) -> Hanko {
    let mut hanko = Hanko {
        placeholders: Vec::new(),
        packed_signatures: Vec::new(),
        claims: vec![HankoClaim {
            entity_id,
            entity_indexes: vec![0],
            weights: vec![1],
            threshold: 1,
        }],
    };
    hanko.push_signature(&signature);
    hanko
}

/// Assemble a quorum hanko from collected signer signatures.
///
/// Absent members become placeholders; present members index into the packed
/// signature blob. The original member order is preserved so the board hash
/// reconstructed during verification matches the config.
pub fn build_quorum_hanko(
    entity_id: EntityId,
    config: &QuorumConfig,
    signer_ids: &[SignerId],
    signatures: &std::collections::BTreeMap<SignerId, Signature65>,
) -> Result<Hanko, XlnError> {
    if signer_ids.len() != config.members.len() {
        return Err(XlnError::InvalidHanko(
            "signer list does not match quorum members".into(),
        ));
    }

    let placeholder_count = signer_ids
        .iter()
        .filter(|sid| !signatures.contains_key(*sid))
        .count() as u32;

    let mut hanko = Hanko {
        placeholders: Vec::new(),
        packed_signatures: Vec::new(),
        claims: Vec::new(),
    };
    let mut entity_indexes = Vec::with_capacity(config.members.len());
    let mut signed = 0u32;

    for (member, sid) in config.members.iter().zip(signer_ids) {
        match signatures.get(sid) {
            Some(sig) => {
                hanko.push_signature(sig);
                entity_indexes.push(placeholder_count + signed);
                signed += 1;
            }
            None => {
                entity_indexes.push(hanko.placeholders.len() as u32);
                hanko.placeholders.push(Hash32::from_bytes(member.id.0));
            }
        }
    }

    hanko.claims.push(HankoClaim {
        entity_id,
        entity_indexes,
        weights: config.members.iter().map(|m| m.weight).collect(),
        threshold: config.threshold,
    });
    Ok(hanko)
}

// ── Recovery & verification ──────────────────────────────────────────────────

/// Result of walking a hanko against a hash.
#[derive(Debug, Clone)]
pub struct RecoveredHanko {
    /// EOAs recovered from the packed signatures, in pack order.
    pub recovered_eoas: Vec<EvmAddress>,
    /// Entity ids whose claims matched a board hash and met their
    /// threshold, in claim order.
    pub yes_entities: Vec<EntityId>,
    /// Per-claim detail, in claim order.
    pub claims: Vec<ClaimOutcome>,
}

/// Outcome of evaluating one claim.
#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    pub entity_id: EntityId,
    pub threshold: u64,
    /// Weight contributed by recovered EOAs and accepted prior claims.
    pub signed_weight: u64,
    /// Whether the claimed entity id matched the reconstructed (or known
    /// on-chain) board hash.
    pub board_matches: bool,
    /// The EOAs this claim's indexes resolved to.
    pub used_eoas: Vec<EvmAddress>,
}

/// How a claim member index resolved.
enum ResolvedMember {
    Placeholder(Hash32),
    Eoa(EvmAddress),
    Claim { entity_id: EntityId, accepted: bool },
}

/// Walk every claim of `hanko` against `hash`.
///
/// `known_board` lets the caller supply on-chain board hashes for registered
/// entities; lazy entities verify against the reconstructed board hash alone.
pub fn recover_hanko_entities(
    hanko: &Hanko,
    hash: &Hash32,
    known_board: Option<&dyn Fn(&EntityId) -> Option<Hash32>>,
) -> Result<RecoveredHanko, XlnError> {
    if hanko.packed_signatures.len() % Signature65::LEN != 0 {
        return Err(XlnError::InvalidHanko("ragged signature blob".into()));
    }
    let n = hanko.signature_count();
    let p = hanko.placeholders.len();

    // Pure circular claim structures prove nothing.
    if n == 0 {
        return Err(XlnError::InvalidHanko("no EOA signatures".into()));
    }

    let mut recovered_eoas = Vec::with_capacity(n);
    for k in 0..n {
        let sig = hanko.signature(k).expect("bounds checked above");
        recovered_eoas.push(recover_signer(hash, &sig)?);
    }

    let mut yes_entities: Vec<EntityId> = Vec::new();
    let mut outcomes: Vec<ClaimOutcome> = Vec::with_capacity(hanko.claims.len());
    let mut accepted: Vec<bool> = Vec::with_capacity(hanko.claims.len());

    for (ci, claim) in hanko.claims.iter().enumerate() {
        if claim.entity_indexes.len() != claim.weights.len() {
            return Err(XlnError::InvalidHanko(format!(
                "claim {ci}: index/weight length mismatch"
            )));
        }

        let mut members = Vec::with_capacity(claim.entity_indexes.len());
        for &idx in &claim.entity_indexes {
            let idx = idx as usize;
            let resolved = if idx < p {
                ResolvedMember::Placeholder(hanko.placeholders[idx])
            } else if idx < p + n {
                ResolvedMember::Eoa(recovered_eoas[idx - p])
            } else {
                let claim_idx = idx - p - n;
                if claim_idx >= ci {
                    return Err(XlnError::InvalidHanko(format!(
                        "claim {ci}: forward claim reference {claim_idx}"
                    )));
                }
                ResolvedMember::Claim {
                    entity_id: hanko.claims[claim_idx].entity_id,
                    accepted: accepted[claim_idx],
                }
            };
            members.push(resolved);
        }

        let config = QuorumConfig {
            threshold: claim.threshold,
            members: members
                .iter()
                .zip(&claim.weights)
                .map(|(m, &weight)| QuorumMember {
                    id: match m {
                        ResolvedMember::Placeholder(h) => EntityId::from_bytes(h.0),
                        ResolvedMember::Eoa(a) => EntityId::from_evm_address(a),
                        ResolvedMember::Claim { entity_id, .. } => *entity_id,
                    },
                    weight,
                })
                .collect(),
        };

        let board_matches = config.board_hash() == Hash32::from_bytes(claim.entity_id.0)
            || known_board
                .and_then(|f| f(&claim.entity_id))
                .map(|h| h == config.board_hash())
                .unwrap_or(false);

        let signed_weight: u64 = members
            .iter()
            .zip(&claim.weights)
            .map(|(m, &w)| match m {
                ResolvedMember::Eoa(_) => w,
                ResolvedMember::Claim { accepted: true, .. } => w,
                _ => 0,
            })
            .sum();

        let ok = board_matches && signed_weight >= claim.threshold;
        accepted.push(ok);
        if ok {
            yes_entities.push(claim.entity_id);
        }
        outcomes.push(ClaimOutcome {
            entity_id: claim.entity_id,
            threshold: claim.threshold,
            signed_weight,
            board_matches,
            used_eoas: members
                .iter()
                .filter_map(|m| match m {
                    ResolvedMember::Eoa(a) => Some(*a),
                    _ => None,
                })
                .collect(),
        });
    }

    Ok(RecoveredHanko { recovered_eoas, yes_entities, claims: outcomes })
}

/// Verify that `hanko` authorizes `hash` on behalf of `expected`.
///
/// The claim naming `expected` must meet its threshold through recovered
/// EOAs and accepted nested claims. With a known validator set, the EOAs
/// that claim indexes must all belong to the set; without one the hanko is
/// self-contained and the claim's own declared threshold decides.
pub fn verify_hanko_for_entity(
    hanko: &Hanko,
    hash: &Hash32,
    expected: &EntityId,
    validator_addresses: Option<&[EvmAddress]>,
) -> Result<(), XlnError> {
    let recovered = recover_hanko_entities(hanko, hash, None)?;

    let outcome = recovered
        .claims
        .iter()
        .find(|c| c.entity_id == *expected)
        .ok_or_else(|| XlnError::InvalidHanko(format!("no claim for entity {expected}")))?;

    match validator_addresses {
        Some(allowed) => {
            // Known validator set: the signers themselves are the anchor.
            for eoa in &outcome.used_eoas {
                if !allowed.contains(eoa) {
                    return Err(XlnError::InvalidHanko(format!(
                        "signer {eoa} is not a validator of {expected}"
                    )));
                }
            }
        }
        None => {
            // Self-contained: the reconstructed board hash is the anchor.
            if !outcome.board_matches {
                return Err(XlnError::InvalidHanko(format!(
                    "claim for {expected} does not match any board hash"
                )));
            }
        }
    }

    if outcome.signed_weight >= outcome.threshold {
        Ok(())
    } else {
        Err(XlnError::InvalidHanko(format!(
            "signed weight {} below threshold {} for entity {expected}",
            outcome.signed_weight, outcome.threshold
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::KeyPair;
    use std::collections::BTreeMap;

    fn lazy_entity(config: &QuorumConfig) -> EntityId {
        EntityId::from_bytes(config.board_hash().0)
    }

    fn quorum_of(keys: &[&KeyPair], threshold: u64) -> (QuorumConfig, Vec<SignerId>) {
        let config = QuorumConfig {
            threshold,
            members: keys
                .iter()
                .map(|k| QuorumMember { id: k.entity_id(), weight: 1 })
                .collect(),
        };
        let signers = (0..keys.len()).map(|i| format!("s{i}")).collect();
        (config, signers)
    }

    #[test]
    fn single_hanko_round_trip() {
        let kp = KeyPair::derive(b"seed", "solo");
        let hash = keccak256(b"authorize this");
        let entity = kp.entity_id();
        let hanko = build_single_hanko(entity, kp.sign_hash(&hash).unwrap());

        let recovered = recover_hanko_entities(&hanko, &hash, None).unwrap();
        assert_eq!(recovered.recovered_eoas, vec![kp.address()]);
        verify_hanko_for_entity(&hanko, &hash, &entity, Some(&[kp.address()])).unwrap();

        // A stranger's signature must not pass the validator restriction.
        let stranger = KeyPair::derive(b"seed", "stranger");
        let forged = build_single_hanko(entity, stranger.sign_hash(&hash).unwrap());
        verify_hanko_for_entity(&forged, &hash, &entity, Some(&[kp.address()])).unwrap_err();
    }

    #[test]
    fn quorum_hanko_meets_threshold() {
        let a = KeyPair::derive(b"seed", "a");
        let b = KeyPair::derive(b"seed", "b");
        let c = KeyPair::derive(b"seed", "c");
        let (config, signers) = quorum_of(&[&a, &b, &c], 2);
        let entity = lazy_entity(&config);
        let hash = keccak256(b"frame");

        let mut sigs = BTreeMap::new();
        sigs.insert("s0".to_string(), a.sign_hash(&hash).unwrap());
        sigs.insert("s2".to_string(), c.sign_hash(&hash).unwrap());

        let hanko = build_quorum_hanko(entity, &config, &signers, &sigs).unwrap();
        assert_eq!(hanko.placeholders.len(), 1);
        assert_eq!(hanko.signature_count(), 2);

        let recovered = recover_hanko_entities(&hanko, &hash, None).unwrap();
        assert_eq!(recovered.yes_entities, vec![entity]);
        verify_hanko_for_entity(&hanko, &hash, &entity, None).unwrap();
    }

    #[test]
    fn below_threshold_rejected() {
        let a = KeyPair::derive(b"seed", "a");
        let b = KeyPair::derive(b"seed", "b");
        let c = KeyPair::derive(b"seed", "c");
        let (config, signers) = quorum_of(&[&a, &b, &c], 2);
        let entity = lazy_entity(&config);
        let hash = keccak256(b"frame");

        let mut sigs = BTreeMap::new();
        sigs.insert("s1".to_string(), b.sign_hash(&hash).unwrap());

        let hanko = build_quorum_hanko(entity, &config, &signers, &sigs).unwrap();
        verify_hanko_for_entity(&hanko, &hash, &entity, None).unwrap_err();
    }

    #[test]
    fn wrong_hash_rejected() {
        let a = KeyPair::derive(b"seed", "a");
        let (config, signers) = quorum_of(&[&a], 1);
        let entity = lazy_entity(&config);
        let hash = keccak256(b"frame");

        let mut sigs = BTreeMap::new();
        sigs.insert("s0".to_string(), a.sign_hash(&hash).unwrap());
        let hanko = build_quorum_hanko(entity, &config, &signers, &sigs).unwrap();

        let other = keccak256(b"different");
        // Recovery over a different hash yields different EOAs, so the board
        // hash no longer matches and the claim is rejected.
        verify_hanko_for_entity(&hanko, &other, &entity, None).unwrap_err();
    }

    #[test]
    fn nested_claim_authorizes_parent() {
        let a = KeyPair::derive(b"seed", "a");
        let b = KeyPair::derive(b"seed", "b");
        let (child_config, _) = quorum_of(&[&a, &b], 2);
        let child = lazy_entity(&child_config);

        // Parent quorum: the child entity is its only member.
        let parent_config = QuorumConfig {
            threshold: 1,
            members: vec![QuorumMember { id: child, weight: 1 }],
        };
        let parent = lazy_entity(&parent_config);
        let hash = keccak256(b"nested");

        let mut hanko = Hanko {
            placeholders: Vec::new(),
            packed_signatures: Vec::new(),
            claims: Vec::new(),
        };
        hanko.push_signature(&a.sign_hash(&hash).unwrap());
        hanko.push_signature(&b.sign_hash(&hash).unwrap());
        // Claim 0: child signed by both EOAs (indexes 0, 1 — no placeholders).
        hanko.claims.push(HankoClaim {
            entity_id: child,
            entity_indexes: vec![0, 1],
            weights: vec![1, 1],
            threshold: 2,
        });
        // Claim 1: parent, whose single member is claim 0 (index P + N + 0 = 2).
        hanko.claims.push(HankoClaim {
            entity_id: parent,
            entity_indexes: vec![2],
            weights: vec![1],
            threshold: 1,
        });

        let recovered = recover_hanko_entities(&hanko, &hash, None).unwrap();
        assert_eq!(recovered.yes_entities, vec![child, parent]);
    }

    #[test]
    fn zero_signatures_rejected() {
        let hanko = Hanko {
            placeholders: vec![Hash32::from_bytes([1; 32])],
            packed_signatures: Vec::new(),
            claims: vec![HankoClaim {
                entity_id: EntityId::from_bytes([2; 32]),
                entity_indexes: vec![0],
                weights: vec![1],
                threshold: 0,
            }],
        };
        let hash = keccak256(b"x");
        assert!(recover_hanko_entities(&hanko, &hash, None).is_err());
    }
}
