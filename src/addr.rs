//! Content addresses.
//!
//! An [`Addr`] is a fixed-width byte string equal to the hash of a chunk's
//! payload. The engine never computes this hash itself — see [`HashAddr`]
//! for the pluggable hash adapter — it only stores, compares, and shards on
//! the bytes the caller hands it.

use std::fmt;

/// Number of bytes in an [`Addr`].
pub const ADDR_LEN: usize = 20;

/// Number of leading bytes exposed as the shard/sort [`Addr::prefix`].
pub const PREFIX_LEN: usize = 4;

/// An opaque, fixed-width content address.
///
/// Equality is byte equality. Immutable once constructed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr([u8; ADDR_LEN]);

impl Addr {
    /// The all-zero address, used as the initial root before any commit.
    pub const ZERO: Addr = Addr([0u8; ADDR_LEN]);

    /// Wraps a raw byte array as an address.
    pub const fn new(bytes: [u8; ADDR_LEN]) -> Self {
        Addr(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; ADDR_LEN] {
        &self.0
    }

    /// Returns the leading [`PREFIX_LEN`] bytes, used as a sort/shard key
    /// for batch reads (see [`crate::get_record::GetRecord`]).
    pub fn prefix(&self) -> [u8; PREFIX_LEN] {
        let mut p = [0u8; PREFIX_LEN];
        p.copy_from_slice(&self.0[..PREFIX_LEN]);
        p
    }

    /// Returns `true` if this is the zero address (the initial root).
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ADDR_LEN]
    }

    /// Parses an address from its lowercase-hex representation.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != ADDR_LEN * 2 {
            return None;
        }
        let mut bytes = [0u8; ADDR_LEN];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }
        Some(Addr(bytes))
    }

    /// Renders the address as lowercase hex.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(ADDR_LEN * 2);
        for b in &self.0 {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Addr({})", self.to_hex())
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Pluggable hash adapter: computes the [`Addr`] for a chunk's payload.
///
/// The engine itself trusts the caller's declared address and never calls
/// this trait on the write path (see [`crate::chunk::Chunk`]); it exists so
/// higher-level callers can produce addresses consistently without
/// depending on a specific hash crate version.
pub trait HashAddr: Send + Sync {
    /// Computes the address of `payload`.
    fn hash(&self, payload: &[u8]) -> Addr;
}

/// Reference [`HashAddr`] implementation: SHA-256 truncated to [`ADDR_LEN`]
/// bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Addr;

impl HashAddr for Sha256Addr {
    fn hash(&self, payload: &[u8]) -> Addr {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(payload);
        let mut bytes = [0u8; ADDR_LEN];
        bytes.copy_from_slice(&digest[..ADDR_LEN]);
        Addr(bytes)
    }
}
