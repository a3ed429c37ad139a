//! 32-byte SHA3-256 digests.
//!
//! Used for commitment preimages and hashlocks, transaction ids, script
//! leaves and output commitments. Memory tree nodes use the 160-bit
//! [`Node`](crate::types::merkle_tree::Node) instead.

use crate::types::bytes::{hex_decode, hex_encode};
use crate::types::encoding::{Encode, EncodeSink};
use bitdispute_derive::BinaryCodec;
use sha3::{Digest, Sha3_256};
use std::fmt;

pub const HASH_LEN: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BinaryCodec)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    pub const fn zero() -> Hash {
        Hash([0u8; HASH_LEN])
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn sha3() -> HashBuilder {
        HashBuilder::new()
    }

    /// SHA3-256 of `data`.
    pub fn digest(data: &[u8]) -> Hash {
        let mut h = Hash::sha3();
        h.update(data);
        h.finalize()
    }

    /// SHA3-256 of `tag || encode(value)`.
    pub fn tagged<T: Encode + ?Sized>(tag: &[u8], value: &T) -> Hash {
        let mut h = Hash::sha3();
        h.update(tag);
        value.encode(&mut h);
        h.finalize()
    }

    pub fn from_hex(text: &str) -> Option<Hash> {
        let raw = hex_decode(text)?;
        Some(Hash(raw.try_into().ok()?))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex_encode(&self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({self})")
    }
}

/// Incremental SHA3-256; an [`EncodeSink`], so values hash without a buffer.
pub struct HashBuilder {
    hasher: Sha3_256,
}

impl HashBuilder {
    pub fn new() -> Self {
        Self {
            hasher: Sha3_256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> Hash {
        Hash(self.hasher.finalize().into())
    }
}

impl Default for HashBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EncodeSink for HashBuilder {
    fn write(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_matches_one_shot_digest() {
        let mut h = Hash::sha3();
        h.update(b"bit");
        h.update(b"dispute");
        assert_eq!(h.finalize(), Hash::digest(b"bitdispute"));
    }

    #[test]
    fn tagged_hash_separates_domains() {
        assert_ne!(Hash::tagged(b"TXID", &1u32), Hash::tagged(b"LEAF", &1u32));
        let mut expected = Hash::sha3();
        expected.update(b"TXID");
        expected.update(&1u32.to_le_bytes());
        assert_eq!(Hash::tagged(b"TXID", &1u32), expected.finalize());
    }

    #[test]
    fn hex_display_roundtrip() {
        let hash = Hash::digest(b"abc");
        assert_eq!(Hash::from_hex(&hash.to_string()), Some(hash));
        assert_eq!(Hash::from_hex("00"), None);
    }
}
