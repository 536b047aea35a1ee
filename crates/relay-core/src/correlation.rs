//! Copy-trade correlation hashing.
//!
//! Every replication instance is identified by a SHA-256 digest over the
//! master's username, ticket, and open time. The follower's client embeds a
//! truncated form of the digest in the broker "comment" field, so a mirrored
//! position can still be found after the broker re-tickets it.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Number of hash characters that fit in a broker comment.
pub const COMMENT_HASH_LEN: usize = 16;

/// Prefix the client writes in front of the truncated hash in the comment.
pub const COMMENT_TAG: &str = "CA:";

/// Compute the durable correlation hash for a master position.
///
/// The open time is rendered at seconds precision in UTC without a zone
/// suffix, matching what clients compute on their side.
pub fn copy_hash(master_username: &str, master_ticket: &str, open_time: &DateTime<Utc>) -> String {
    let input = format!(
        "{}_{}_{}",
        master_username,
        master_ticket,
        open_time.format("%Y-%m-%dT%H:%M:%S")
    );
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// The truncated form of a copy hash as it appears in a broker comment.
pub fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(COMMENT_HASH_LEN)]
}

/// The full comment string the client writes on a mirrored position.
pub fn comment_tag(hash: &str) -> String {
    format!("{}{}", COMMENT_TAG, short_hash(hash))
}

/// Whether a broker comment refers to the given copy hash.
pub fn comment_matches(comment: &str, hash: &str) -> bool {
    let short = short_hash(hash);
    !short.is_empty() && comment.contains(short)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_hash_is_hex_sha256() {
        let open_time = Utc.with_ymd_and_hms(2025, 1, 9, 11, 11, 48).unwrap();
        let hash = copy_hash("mariosat2", "11046500", &open_time);
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_is_deterministic() {
        let open_time = Utc.with_ymd_and_hms(2025, 1, 9, 11, 11, 48).unwrap();
        let a = copy_hash("mariosat2", "11046500", &open_time);
        let b = copy_hash("mariosat2", "11046500", &open_time);
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_varies_with_inputs() {
        let open_time = Utc.with_ymd_and_hms(2025, 1, 9, 11, 11, 48).unwrap();
        let base = copy_hash("mariosat2", "11046500", &open_time);
        assert_ne!(base, copy_hash("mariosat2", "11046501", &open_time));
        assert_ne!(base, copy_hash("mariosat", "11046500", &open_time));
        let later = Utc.with_ymd_and_hms(2025, 1, 9, 11, 11, 49).unwrap();
        assert_ne!(base, copy_hash("mariosat2", "11046500", &later));
    }

    #[test]
    fn test_comment_tag_truncates_to_sixteen() {
        let open_time = Utc.with_ymd_and_hms(2025, 1, 9, 11, 11, 48).unwrap();
        let hash = copy_hash("mariosat2", "11046500", &open_time);
        let tag = comment_tag(&hash);
        assert!(tag.starts_with("CA:"));
        assert_eq!(tag.len(), 3 + COMMENT_HASH_LEN);
        assert!(comment_matches(&tag, &hash));
    }

    #[test]
    fn test_comment_matches_without_tag_prefix() {
        let open_time = Utc.with_ymd_and_hms(2025, 1, 9, 11, 11, 48).unwrap();
        let hash = copy_hash("mariosat2", "11046500", &open_time);
        assert!(comment_matches(short_hash(&hash), &hash));
        assert!(!comment_matches("manual trade", &hash));
    }
}
