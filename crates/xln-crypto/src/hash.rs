use serde::Serialize;
use sha3::{Digest, Keccak256};

use xln_core::{canonical_bytes, Hash32, XlnError};

/// keccak256 of arbitrary bytes.
pub fn keccak256(data: &[u8]) -> Hash32 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    Hash32::from_bytes(hasher.finalize().into())
}

/// keccak256 over the concatenation of several byte slices.
pub fn keccak256_concat(parts: &[&[u8]]) -> Hash32 {
    let mut hasher = Keccak256::new();
    for p in parts {
        hasher.update(p);
    }
    Hash32::from_bytes(hasher.finalize().into())
}

/// keccak256 of the canonical JSON rendering of `value`.
pub fn canonical_hash<T: Serialize>(value: &T) -> Result<Hash32, XlnError> {
    Ok(keccak256(&canonical_bytes(value)?))
}

/// Parent hash for account frame height 1.
pub fn genesis_frame_hash() -> Hash32 {
    keccak256(b"genesis")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak_known_vector() {
        // keccak256("") — the canonical empty-input digest.
        let h = keccak256(b"");
        assert_eq!(
            h.to_hex(),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn concat_matches_single_buffer() {
        let a = keccak256(b"hello world");
        let b = keccak256_concat(&[b"hello", b" ", b"world"]);
        assert_eq!(a, b);
    }
}
