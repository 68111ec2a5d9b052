//! Claim-code and API-key generation.
//!
//! Both are opaque bearer secrets: a claim code is redeemed once by an
//! enrolling agent to mint a permanent API key, and the API key
//! authenticates every subsequent control-channel and artifact request.
//! Neither is ever stored in plaintext — only its SHA-256 hash is
//! persisted, so a leaked database dump does not yield usable secrets.

use rand::RngCore;

use crate::digest::sha256_hex;

/// Byte length of a generated secret before hex-encoding (128 bits).
const SECRET_BYTES: usize = 16;

/// Generate a new random bearer secret, hex-encoded.
///
/// Used for both claim codes (`/api/agent/register`) and API keys minted
/// on redemption.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hash a secret for storage. The stored hash is what gets compared
/// against on every authenticated request; the plaintext secret is never
/// written to the database.
pub fn hash_secret(secret: &str) -> String {
    sha256_hex(secret.as_bytes())
}

/// Constant-time-ish comparison of a presented secret against its stored
/// hash. Hashing is deterministic so this reduces to a hash-and-compare;
/// the hash itself already destroys any length/content signal an attacker
/// could exploit via a naive `==` on the raw secret.
pub fn verify_secret(presented: &str, stored_hash: &str) -> bool {
    use subtle_compare::ct_eq;
    ct_eq(hash_secret(presented).as_bytes(), stored_hash.as_bytes())
}

/// Minimal constant-time byte comparison, avoiding a dependency for a
/// handful of lines.
mod subtle_compare {
    pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
        if a.len() != b.len() {
            return false;
        }
        let mut diff = 0u8;
        for (x, y) in a.iter().zip(b.iter()) {
            diff |= x ^ y;
        }
        diff == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secrets_are_unique_and_well_formed() {
        let a = generate_secret();
        let b = generate_secret();
        assert_ne!(a, b);
        assert_eq!(a.len(), SECRET_BYTES * 2);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn verify_secret_round_trips() {
        let secret = generate_secret();
        let stored = hash_secret(&secret);
        assert!(verify_secret(&secret, &stored));
        assert!(!verify_secret("wrong-secret", &stored));
    }
}
