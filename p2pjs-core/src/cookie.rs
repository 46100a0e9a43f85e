//! Job cookies: 32-byte identifiers derived by hashing a random nonce.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Network-wide job identifier (SHA-256 digest). Compared on all 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie([u8; 32]);

impl Cookie {
    /// Derive a fresh cookie from a random 64-bit nonce.
    pub fn generate() -> Self {
        let nonce = rand::thread_rng().next_u64();
        Self::from_nonce(nonce)
    }

    /// Derive the cookie for a given nonce (same as `generate` does).
    pub fn from_nonce(nonce: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(nonce.to_ne_bytes());
        Cookie(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Cookie(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First four bytes as hex, for log lines.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl std::fmt::Display for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cookie({})", self.short())
    }
}
