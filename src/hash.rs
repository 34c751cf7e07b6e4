//! The three hash functions selectable via `hidx` and the indirection that
//! dispatches between them.

use crate::error::{Error, Result};
use crate::format::HASH_SLOTS;

/// Which hashing strategy a database was opened with.
///
/// `hidx` values `0` and `1` both select [`HashIndex::Additive`] — this
/// alias is intentional and must be preserved, not normalized away. The
/// raw value a caller passed to
/// [`crate::Kv::open`] is what gets persisted into the `.h` header, so a
/// database created with `hidx=0` stays `0` across a close/reopen rather
/// than silently becoming `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashIndex {
    Additive,
    Xor,
    Fnv,
}

impl HashIndex {
    /// Maps a raw `hidx` value to the hashing strategy it selects.
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 | 1 => Ok(HashIndex::Additive),
            2 => Ok(HashIndex::Xor),
            3 => Ok(HashIndex::Fnv),
            other => Err(Error::InvalidArgument(format!("invalid hash index {other}"))),
        }
    }

    /// Computes the hash of `key`, folded into `[0, HASH_SLOTS)`.
    pub fn hash(self, key: &[u8]) -> u32 {
        match self {
            HashIndex::Additive => hash_additive(key),
            HashIndex::Xor => hash_xor(key),
            HashIndex::Fnv => hash_fnv(key),
        }
    }
}

/// Additive sum of bytes, reduced modulo `HASH_SLOTS` after every byte.
fn hash_additive(key: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &b in key {
        hash = hash.wrapping_add(b as u32);
        hash %= HASH_SLOTS;
    }
    hash
}

/// XOR-and-rotate compression: each byte is shifted by its position modulo
/// the width of a `u32` before being folded in.
fn hash_xor(key: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for (i, &b) in key.iter().enumerate() {
        let shift = (i % 32) as u32;
        hash ^= (b as u32) << shift;
        hash %= HASH_SLOTS;
    }
    hash
}

/// FNV-1a-like mix. The original source XORs in each byte after first
/// reinterpreting it as a signed `char`, which sign-extends bytes `>= 0x80`
/// before folding them in — that quirk is preserved here for bit-exact
/// compatibility with databases created by that source.
fn hash_fnv(key: &[u8]) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for &b in key {
        let signed = (b as i8) as i32 as u32; // sign-extend, then reinterpret bits
        hash ^= signed;
        hash = hash.wrapping_mul(16_777_619);
        hash %= HASH_SLOTS;
    }
    hash
}
