//! Deterministic seeds and the named random streams derived from them.
//!
//! Every transform draws its randomness from its own stream, derived from the invocation seed,
//! the module name and the stream name. Two runs with the same seed over the same module
//! therefore make the same choices, independent of which other transforms ran before.

use crate::errors::SeedError;
use rand::rngs::StdRng;
use rand::SeedableRng;
use sha3::{Digest, Keccak256};
use std::fmt;

/// 32-byte obfuscation seed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Seed([u8; 32]);

impl Seed {
    /// Expands a numeric seed into a full 32-byte seed.
    pub fn from_u64(value: u64) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(b"phantom-seed");
        hasher.update(value.to_le_bytes());
        Self(hasher.finalize().into())
    }

    /// Parses a 64 character hex string, with or without `0x` prefix.
    pub fn from_hex(input: &str) -> Result<Self, SeedError> {
        let clean = input.trim().trim_start_matches("0x");
        if clean.len() != 64 {
            return Err(SeedError::InvalidLength(clean.len()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(clean, &mut bytes).map_err(|_| SeedError::InvalidHex)?;
        Ok(Self(bytes))
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the random stream `name` for `module`.
    ///
    /// The stream is keyed by Keccak-256 over the seed, the module name and the stream name.
    pub fn stream(&self, module: &str, name: &str) -> StdRng {
        let mut hasher = Keccak256::new();
        hasher.update(self.0);
        hasher.update((module.len() as u64).to_le_bytes());
        hasher.update(module.as_bytes());
        hasher.update(name.as_bytes());
        StdRng::from_seed(hasher.finalize().into())
    }
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seed({self})")
    }
}

impl From<u64> for Seed {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}
