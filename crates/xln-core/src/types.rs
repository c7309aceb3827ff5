use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// Millisecond Unix timestamp (UTC). All protocol time comes from the
/// runtime environment, never from a wall clock inside a handler.
pub type TimestampMs = u64;

/// Frame / block height.
pub type Height = u64;

/// Token identifier assigned by the jurisdiction registry.
pub type TokenId = u64;

/// Opaque signer identifier (key-derivation label within an entity).
pub type SignerId = String;

// ── Hash32 ───────────────────────────────────────────────────────────────────

/// A 32-byte hash (keccak256 output, board hash, frame hash, …).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    pub const ZERO: Hash32 = Hash32([0u8; 32]);

    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({}…)", &self.to_hex()[..8])
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{}", self.to_hex()))
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Hash32::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ── EntityId ─────────────────────────────────────────────────────────────────

/// 32-byte entity identifier. Lazy entities use their board hash; registered
/// entities use the id assigned by the EntityProvider. Single-signer entities
/// left-pad the signer's EOA address.
///
/// Ordering is big-endian lexicographic byte order; the canonical "left"
/// side of an account is the smaller id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EntityId(pub [u8; 32]);

impl EntityId {
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Left-pad a 20-byte EOA address into the 32-byte entity id space.
    pub fn from_evm_address(addr: &EvmAddress) -> Self {
        let mut b = [0u8; 32];
        b[12..].copy_from_slice(&addr.0);
        Self(b)
    }

    /// The trailing 20 bytes, interpreted as an EVM address.
    pub fn to_evm_address(&self) -> EvmAddress {
        let mut a = [0u8; 20];
        a.copy_from_slice(&self.0[12..]);
        EvmAddress(a)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        Hash32::from_hex(s).map(|h| Self(h.0))
    }
}

/// Canonical account tiebreaker: true iff `a` is the left side of the
/// `(a, b)` account. Antisymmetric for all `a != b`.
pub fn is_left(a: &EntityId, b: &EntityId) -> bool {
    a < b
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}…)", &self.to_hex()[..8])
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{}", self.to_hex()))
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        EntityId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ── EvmAddress ───────────────────────────────────────────────────────────────

/// 20-byte EVM address (recovered EOA or deployed contract).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EvmAddress(pub [u8; 20]);

impl EvmAddress {
    pub fn from_bytes(b: [u8; 20]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        if bytes.len() != 20 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl fmt::Debug for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EvmAddress(0x{})", self.to_hex())
    }
}

impl Serialize for EvmAddress {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{}", self.to_hex()))
    }
}

impl<'de> Deserialize<'de> for EvmAddress {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        EvmAddress::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ── Signature65 ──────────────────────────────────────────────────────────────

/// 65-byte ECDSA signature `r || s || v` with `v` normalized to {27, 28}.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature65(pub [u8; 65]);

impl Signature65 {
    pub const LEN: usize = 65;

    pub fn from_bytes(b: [u8; 65]) -> Self {
        Self(b)
    }

    pub fn from_slice(b: &[u8]) -> Option<Self> {
        if b.len() != Self::LEN {
            return None;
        }
        let mut arr = [0u8; 65];
        arr.copy_from_slice(b);
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }

    pub fn r(&self) -> &[u8] {
        &self.0[..32]
    }

    pub fn s(&self) -> &[u8] {
        &self.0[32..64]
    }

    pub fn v(&self) -> u8 {
        self.0[64]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Signature65 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature65({}…)", &self.to_hex()[..8])
    }
}

impl Serialize for Signature65 {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{}", self.to_hex()))
    }
}

impl<'de> Deserialize<'de> for Signature65 {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)?;
        Signature65::from_slice(&bytes)
            .ok_or_else(|| serde::de::Error::custom("signature must be 65 bytes"))
    }
}

// ── Amount ───────────────────────────────────────────────────────────────────

/// Unbounded signed monetary amount. Serializes as a decimal string so the
/// canonical encoding and the replay export carry exact values.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Amount(pub BigInt);

impl Amount {
    pub fn zero() -> Self {
        Self(BigInt::zero())
    }

    pub fn from_i64(v: i64) -> Self {
        Self(BigInt::from(v))
    }

    pub fn from_u64(v: u64) -> Self {
        Self(BigInt::from(v))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_negative()
    }

    pub fn is_positive(&self) -> bool {
        self.0.is_positive()
    }

    pub fn abs(&self) -> Self {
        Self(self.0.abs())
    }

    /// `max(self, 0)`.
    pub fn non_negative(&self) -> Self {
        if self.is_negative() {
            Self::zero()
        } else {
            self.clone()
        }
    }

    /// Clamp into `[lo, hi]`.
    pub fn clamp(&self, lo: &Amount, hi: &Amount) -> Self {
        if self < lo {
            lo.clone()
        } else if self > hi {
            hi.clone()
        } else {
            self.clone()
        }
    }

    pub fn to_decimal(&self) -> String {
        self.0.to_str_radix(10)
    }

    pub fn from_decimal(s: &str) -> Option<Self> {
        BigInt::parse_bytes(s.as_bytes(), 10).map(Self)
    }

    /// Two's-complement 32-byte big-endian representation (int256 range is
    /// the caller's responsibility; values are protocol-bounded in practice).
    pub fn to_be_bytes32(&self) -> [u8; 32] {
        let value = if self.is_negative() {
            (BigInt::from(1u8) << 256) + &self.0
        } else {
            self.0.clone()
        };
        let (_, mag) = value.to_bytes_be();
        let mut out = [0u8; 32];
        let take = mag.len().min(32);
        out[32 - take..].copy_from_slice(&mag[mag.len() - take..]);
        out
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Amount({})", self.to_decimal())
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_decimal())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Amount::from_decimal(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid decimal amount: {s}")))
    }
}

impl Add for Amount {
    type Output = Amount;
    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl<'a> Add<&'a Amount> for &'a Amount {
    type Output = Amount;
    fn add(self, rhs: &'a Amount) -> Amount {
        Amount(&self.0 + &rhs.0)
    }
}

impl Sub for Amount {
    type Output = Amount;
    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl<'a> Sub<&'a Amount> for &'a Amount {
    type Output = Amount;
    fn sub(self, rhs: &'a Amount) -> Amount {
        Amount(&self.0 - &rhs.0)
    }
}

impl Neg for Amount {
    type Output = Amount;
    fn neg(self) -> Amount {
        Amount(-self.0)
    }
}

impl AddAssign<&Amount> for Amount {
    fn add_assign(&mut self, rhs: &Amount) {
        self.0 += &rhs.0;
    }
}

impl SubAssign<&Amount> for Amount {
    fn sub_assign(&mut self, rhs: &Amount) {
        self.0 -= &rhs.0;
    }
}

impl From<i64> for Amount {
    fn from(v: i64) -> Self {
        Amount::from_i64(v)
    }
}

// ── SettleDiff ───────────────────────────────────────────────────────────────

/// One per-token settlement movement between reserves and collateral.
///
/// Conservation: `left_diff + right_diff + collateral_diff = 0` always.
/// `ondelta_diff` repositions the bilateral axis and conserves nothing by
/// itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettleDiff {
    pub token_id: TokenId,
    pub left_diff: Amount,
    pub right_diff: Amount,
    pub collateral_diff: Amount,
    pub ondelta_diff: Amount,
}

impl SettleDiff {
    pub fn conserves_value(&self) -> bool {
        (&(&self.left_diff + &self.right_diff) + &self.collateral_diff).is_zero()
    }
}
