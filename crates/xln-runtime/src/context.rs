//! Explicit runtime context: the seed, chain parameters, and the derived
//! signer address cache. Passed into constructors and handlers instead of
//! ambient globals.

use std::collections::BTreeMap;

use xln_core::{EvmAddress, SignerId};
use xln_crypto::KeyPair;

#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub runtime_id: String,
    /// Developer-mode brainvault seed (`RUNTIME_SEED`); key derivation is a
    /// pure function of `(seed, signer_id)`.
    pub seed: Vec<u8>,
    pub chain_id: u64,
    pub depository: EvmAddress,
    pub entity_provider: EvmAddress,
    address_cache: BTreeMap<SignerId, EvmAddress>,
}

impl RuntimeContext {
    pub fn new(
        runtime_id: impl Into<String>,
        seed: impl Into<Vec<u8>>,
        chain_id: u64,
        depository: EvmAddress,
        entity_provider: EvmAddress,
    ) -> Self {
        Self {
            runtime_id: runtime_id.into(),
            seed: seed.into(),
            chain_id,
            depository,
            entity_provider,
            address_cache: BTreeMap::new(),
        }
    }

    /// Derived EOA for a signer, cached per runtime.
    pub fn signer_address(&mut self, signer_id: &str) -> EvmAddress {
        if let Some(addr) = self.address_cache.get(signer_id) {
            return *addr;
        }
        let addr = KeyPair::derive(&self.seed, signer_id).address();
        self.address_cache.insert(signer_id.to_string(), addr);
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_matches_derivation() {
        let mut ctx = RuntimeContext::new(
            "r1",
            b"seed".to_vec(),
            31337,
            EvmAddress::default(),
            EvmAddress::default(),
        );
        let first = ctx.signer_address("alice");
        let second = ctx.signer_address("alice");
        assert_eq!(first, second);
        assert_eq!(first, KeyPair::derive(b"seed", "alice").address());
    }
}
