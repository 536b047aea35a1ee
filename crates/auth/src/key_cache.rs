//! Process-local positive cache for api_key → user_id resolution.
//!
//! Each user carries a generation counter; a cached entry records the
//! generation it was read at, and any mismatch on access forces a database
//! re-read. Rotation and admin flush bump the generation instead of chasing
//! individual entries.

use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
struct CachedKey {
    user_id: i64,
    generation: u64,
}

/// Positive api_key → user_id cache with per-user generations.
#[derive(Default)]
pub struct ApiKeyCache {
    entries: DashMap<String, CachedKey>,
    generations: DashMap<i64, u64>,
}

impl ApiKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn generation_of(&self, user_id: i64) -> u64 {
        self.generations.get(&user_id).map(|g| *g).unwrap_or(0)
    }

    /// Resolve a key. A stale-generation entry is evicted and treated as a
    /// miss.
    pub fn get(&self, api_key: &str) -> Option<i64> {
        let cached = self.entries.get(api_key).map(|e| *e)?;
        if cached.generation != self.generation_of(cached.user_id) {
            drop(self.entries.remove(api_key));
            return None;
        }
        Some(cached.user_id)
    }

    pub fn insert(&self, api_key: &str, user_id: i64) {
        let generation = self.generation_of(user_id);
        self.entries
            .insert(api_key.to_string(), CachedKey { user_id, generation });
    }

    /// Invalidate every cached key of one user (rotation path).
    pub fn invalidate_user(&self, user_id: i64) {
        *self.generations.entry(user_id).or_insert(0) += 1;
        self.entries.retain(|_, v| v.user_id != user_id);
    }

    /// Drop everything (admin cache-flush action).
    pub fn flush(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let cache = ApiKeyCache::new();
        cache.insert("ca_key_a", 4);
        assert_eq!(cache.get("ca_key_a"), Some(4));
        assert_eq!(cache.get("ca_key_b"), None);
    }

    #[test]
    fn test_rotation_invalidates_within_one_access() {
        let cache = ApiKeyCache::new();
        cache.insert("ca_old_key", 4);
        cache.invalidate_user(4);
        assert_eq!(cache.get("ca_old_key"), None);

        // A key cached after rotation carries the new generation.
        cache.insert("ca_new_key", 4);
        assert_eq!(cache.get("ca_new_key"), Some(4));
    }

    #[test]
    fn test_invalidation_is_scoped_to_the_user() {
        let cache = ApiKeyCache::new();
        cache.insert("ca_key_four", 4);
        cache.insert("ca_key_nine", 9);
        cache.invalidate_user(4);
        assert_eq!(cache.get("ca_key_four"), None);
        assert_eq!(cache.get("ca_key_nine"), Some(9));
    }

    #[test]
    fn test_flush_clears_all_entries() {
        let cache = ApiKeyCache::new();
        cache.insert("ca_key_four", 4);
        cache.insert("ca_key_nine", 9);
        cache.flush();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stale_generation_entry_is_evicted_lazily() {
        let cache = ApiKeyCache::new();
        cache.insert("ca_key", 4);
        // Bump the generation without touching entries directly.
        *cache.generations.entry(4).or_insert(0) += 1;
        assert_eq!(cache.get("ca_key"), None);
        assert!(cache.is_empty());
    }
}
