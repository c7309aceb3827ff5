use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use zeroize::Zeroizing;

use xln_core::{EntityId, EvmAddress, Hash32, Signature65, XlnError};

use crate::hash::{keccak256, keccak256_concat};

/// A secp256k1 signer. The secret key material lives inside `SigningKey`,
/// which zeroizes on drop.
pub struct KeyPair {
    signing_key: SigningKey,
    address: EvmAddress,
}

impl KeyPair {
    /// Build from raw 32-byte secret scalar.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, XlnError> {
        let signing_key = SigningKey::from_bytes(bytes.into())
            .map_err(|_| XlnError::Protocol("invalid secp256k1 secret scalar".into()))?;
        let address = address_of(signing_key.verifying_key());
        Ok(Self { signing_key, address })
    }

    /// Deterministic brainvault derivation: `keccak256(seed ‖ signer_id)`,
    /// re-hashed with a counter suffix in the (astronomically rare) case the
    /// digest is not a valid scalar.
    pub fn derive(seed: &[u8], signer_id: &str) -> Self {
        let mut digest = Zeroizing::new(keccak256_concat(&[seed, signer_id.as_bytes()]).0);
        let mut counter = 0u8;
        loop {
            if let Ok(kp) = Self::from_secret_bytes(&digest) {
                return kp;
            }
            counter = counter.wrapping_add(1);
            *digest = keccak256_concat(&[&digest[..], &[counter]]).0;
        }
    }

    pub fn address(&self) -> EvmAddress {
        self.address
    }

    /// The signer's address left-padded into the 32-byte entity id space.
    pub fn entity_id(&self) -> EntityId {
        EntityId::from_evm_address(&self.address)
    }

    /// Sign a 32-byte prehash, returning `r || s || v` with `v ∈ {27, 28}`.
    /// No EIP-191 wrapping — the internal frame domain signs raw keccak
    /// digests.
    pub fn sign_hash(&self, hash: &Hash32) -> Result<Signature65, XlnError> {
        let (sig, recid) = self
            .signing_key
            .sign_prehash_recoverable(hash.as_bytes())
            .map_err(|e| XlnError::Protocol(format!("signing failed: {e}")))?;
        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&sig.to_bytes());
        out[64] = 27 + recid.to_byte();
        Ok(Signature65::from_bytes(out))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({})", self.address)
    }
}

/// Recover the signing EOA from a 65-byte signature over `hash`.
///
/// Accepts `v ∈ {0, 1, 27, 28}` on input; everything else is malformed.
pub fn recover_signer(hash: &Hash32, signature: &Signature65) -> Result<EvmAddress, XlnError> {
    let v = signature.v();
    let recid_byte = match v {
        0 | 1 => v,
        27 | 28 => v - 27,
        _ => {
            return Err(XlnError::Protocol(format!("invalid recovery id {v}")));
        }
    };
    let recid = RecoveryId::try_from(recid_byte)
        .map_err(|_| XlnError::Protocol(format!("invalid recovery id {v}")))?;
    let sig = Signature::from_slice(&signature.0[..64])
        .map_err(|_| XlnError::Protocol("malformed signature scalars".into()))?;
    let key = VerifyingKey::recover_from_prehash(hash.as_bytes(), &sig, recid)
        .map_err(|_| XlnError::Protocol("signature recovery failed".into()))?;
    Ok(address_of(&key))
}

/// Ethereum address derivation: keccak256 of the uncompressed public key
/// (without the 0x04 prefix), last 20 bytes.
fn address_of(key: &VerifyingKey) -> EvmAddress {
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&digest.as_bytes()[12..]);
    EvmAddress::from_bytes(addr)
}
