//! xln-crypto
//!
//! Hash and signature layer: keccak256, canonical-encoding hashes, secp256k1
//! ECDSA with public-key recovery, and the hanko multi-signature format.

pub mod hanko;
pub mod hash;
pub mod keypair;

pub use hanko::{
    build_quorum_hanko, build_single_hanko, recover_hanko_entities, verify_hanko_for_entity,
    ClaimOutcome, Hanko, HankoClaim, QuorumConfig, QuorumMember, RecoveredHanko,
};
pub use hash::{canonical_hash, genesis_frame_hash, keccak256, keccak256_concat};
pub use keypair::{recover_signer, KeyPair};
