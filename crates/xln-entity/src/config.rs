//! Validator configuration for one entity.
//!
//! Validator sets, weights, and thresholds are delivered to the core; the
//! proposer for a height is a deterministic round-robin over the ordered
//! list. Signer addresses derive from the runtime seed, so every replica
//! resolves the same quorum.

use serde::{Deserialize, Serialize};

use xln_core::{EntityId, EvmAddress, Height, SignerId};
use xln_crypto::{QuorumConfig, QuorumMember};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorEntry {
    pub signer_id: SignerId,
    pub weight: u64,
    /// EOA derived from `(seed, signer_id)`; filled at import.
    pub address: EvmAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    pub threshold: u64,
    /// Ordered: the order is consensus-critical (board hash, proposer
    /// rotation).
    pub validators: Vec<ValidatorEntry>,
}

impl ConsensusConfig {
    pub fn total_weight(&self) -> u64 {
        self.validators.iter().map(|v| v.weight).sum()
    }

    /// Round-robin proposer for the frame at `height`.
    pub fn proposer_for(&self, height: Height) -> &SignerId {
        let idx = (height as usize) % self.validators.len().max(1);
        &self.validators[idx].signer_id
    }

    pub fn weight_of(&self, signer_id: &str) -> u64 {
        self.validators
            .iter()
            .find(|v| v.signer_id == signer_id)
            .map(|v| v.weight)
            .unwrap_or(0)
    }

    pub fn is_validator(&self, signer_id: &str) -> bool {
        self.validators.iter().any(|v| v.signer_id == signer_id)
    }

    pub fn signer_ids(&self) -> Vec<SignerId> {
        self.validators.iter().map(|v| v.signer_id.clone()).collect()
    }

    pub fn addresses(&self) -> Vec<EvmAddress> {
        self.validators.iter().map(|v| v.address).collect()
    }

    /// The quorum the hanko layer verifies against: member ids are the
    /// validators' left-padded addresses in list order.
    pub fn quorum(&self) -> QuorumConfig {
        QuorumConfig {
            threshold: self.threshold,
            members: self
                .validators
                .iter()
                .map(|v| QuorumMember {
                    id: EntityId::from_evm_address(&v.address),
                    weight: v.weight,
                })
                .collect(),
        }
    }
}
