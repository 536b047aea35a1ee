//! Bearer session tokens for the web API.
//!
//! Tokens have the shape `session_<userid>`: opaque but not cryptographic,
//! acceptable only because the web session is transport-protected and scoped
//! to read/profile endpoints. The store tracks which tokens are currently
//! live so logout actually revokes access.

use dashmap::DashMap;

const SESSION_PREFIX: &str = "session_";

/// Process-local store of active web sessions.
#[derive(Default)]
pub struct SessionStore {
    active: DashMap<String, i64>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue (or re-issue) the session token for a user.
    pub fn issue(&self, user_id: i64) -> String {
        let token = format!("{SESSION_PREFIX}{user_id}");
        self.active.insert(token.clone(), user_id);
        token
    }

    /// Resolve a bearer token to a user id, if the session is live.
    pub fn resolve(&self, token: &str) -> Option<i64> {
        self.active.get(token).map(|id| *id)
    }

    /// Revoke one token. Returns the user it belonged to.
    pub fn revoke(&self, token: &str) -> Option<i64> {
        self.active.remove(token).map(|(_, id)| id)
    }

    /// Revoke every session of one user (admin path).
    pub fn revoke_user(&self, user_id: i64) {
        self.active.retain(|_, v| *v != user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_resolve_revoke() {
        let store = SessionStore::new();
        let token = store.issue(4);
        assert_eq!(token, "session_4");
        assert_eq!(store.resolve(&token), Some(4));

        assert_eq!(store.revoke(&token), Some(4));
        assert_eq!(store.resolve(&token), None);
    }

    #[test]
    fn test_reissue_after_logout_yields_same_token() {
        let store = SessionStore::new();
        let first = store.issue(9);
        store.revoke(&first);
        let second = store.issue(9);
        assert_eq!(first, second);
        assert_eq!(store.resolve(&second), Some(9));
    }

    #[test]
    fn test_unknown_token_does_not_resolve() {
        let store = SessionStore::new();
        store.issue(4);
        assert_eq!(store.resolve("session_999"), None);
        assert_eq!(store.resolve("garbage"), None);
    }
}
