//! API key generation for client ingestion.
//!
//! Keys have the form `ca_<userid8>_<h1>_<h2>_<h3>_<ts8>`:
//! a SHA-256 segment over user id, timestamp, and fresh randomness, a
//! BLAKE2b segment over raw random bytes, a URL-safe random segment, and the
//! microsecond timestamp suffix. The embedded user id is informational; the
//! database row is the source of truth.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use blake2::{Blake2b512, Digest as Blake2Digest};
use chrono::Utc;
use rand::RngCore;
use relay_core::db::UserRepository;
use relay_core::{Error, Result};
use sha2::{Digest, Sha256};

/// Prefix tagging every ingestion key.
pub const KEY_PREFIX: &str = "ca_";

/// Attempts before giving up on a collision-free key.
const MAX_KEY_ATTEMPTS: u32 = 5;

/// Generate one candidate key for a user.
pub fn generate_api_key(user_id: i64) -> String {
    let mut rng = rand::thread_rng();
    let micros = Utc::now().timestamp_micros();

    let mut rand_entropy = [0u8; 16];
    rng.fill_bytes(&mut rand_entropy);
    let mut sha = Sha256::new();
    sha.update(user_id.to_string().as_bytes());
    sha.update(micros.to_string().as_bytes());
    sha.update(hex::encode(rand_entropy).as_bytes());
    let h1 = hex::encode(sha.finalize());

    let mut blake_input = [0u8; 32];
    rng.fill_bytes(&mut blake_input);
    let mut blake = Blake2b512::new();
    blake.update(blake_input);
    let h2 = hex::encode(blake.finalize());

    let mut url_entropy = [0u8; 9];
    rng.fill_bytes(&mut url_entropy);
    // Underscore is the key's own separator, so it is remapped out of the
    // URL-safe alphabet here.
    let h3 = URL_SAFE_NO_PAD.encode(url_entropy).replace('_', "-");

    let ts = micros.to_string();
    let ts8 = &ts[ts.len().saturating_sub(8)..];

    format!(
        "{}{:08}_{}_{}_{}_{}",
        KEY_PREFIX,
        user_id,
        &h1[..12],
        &h2[..16],
        &h3[..12],
        ts8
    )
}

/// Cheap shape check before any database lookup.
pub fn has_key_format(key: &str) -> bool {
    let Some(rest) = key.strip_prefix(KEY_PREFIX) else {
        return false;
    };
    let segments: Vec<&str> = rest.split('_').collect();
    segments.len() == 5
        && segments
            .iter()
            .all(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
}

/// Generate a key, verify uniqueness at write time, and retry on collision
/// up to a bounded limit.
pub async fn issue_unique_key(users: &UserRepository, user_id: i64) -> Result<String> {
    for _ in 0..MAX_KEY_ATTEMPTS {
        let key = generate_api_key(user_id);
        if !users.api_key_exists(&key).await? {
            users.set_api_key(user_id, &key).await?;
            return Ok(key);
        }
        tracing::warn!(user_id, "API key collision, regenerating");
    }

    Err(Error::KeyGeneration(format!(
        "exhausted {MAX_KEY_ATTEMPTS} attempts without a unique key"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_has_expected_shape() {
        let key = generate_api_key(42);
        assert!(key.starts_with("ca_00000042_"));
        assert!(has_key_format(&key));

        let segments: Vec<&str> = key.trim_start_matches(KEY_PREFIX).split('_').collect();
        assert_eq!(segments.len(), 5);
        assert_eq!(segments[0], "00000042");
        assert_eq!(segments[1].len(), 12);
        assert_eq!(segments[2].len(), 16);
        assert_eq!(segments[3].len(), 12);
        assert_eq!(segments[4].len(), 8);
    }

    #[test]
    fn test_hash_segments_are_hex() {
        let key = generate_api_key(9);
        let segments: Vec<&str> = key.trim_start_matches(KEY_PREFIX).split('_').collect();
        assert!(segments[1].chars().all(|c| c.is_ascii_hexdigit()));
        assert!(segments[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_keys_are_unguessable_per_call() {
        let a = generate_api_key(7);
        let b = generate_api_key(7);
        assert_ne!(a, b);
    }

    #[test]
    fn test_format_rejects_foreign_tokens() {
        assert!(!has_key_format("session_4"));
        assert!(!has_key_format("ca_"));
        assert!(!has_key_format("ca_only_three_parts"));
        assert!(!has_key_format(""));
        assert!(!has_key_format("ca_1_2_3_4_5_6"));
    }
}
