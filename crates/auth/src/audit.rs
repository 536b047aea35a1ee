//! Audit logging for authentication and identity events.
//!
//! Events are handed to a bounded channel and drained to the `audit` tracing
//! target by a background task, so callers never block on the sink.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;
use tokio::sync::mpsc;

/// Types of auditable actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Login,
    LoginFailed,
    Logout,
    Registered,
    ApiKeyRotated,
    ApiKeyRejected,
    IdentityMismatch,
    IngestionIpChanged,
}

/// An audit event record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<i64>,
    pub action: AuditAction,
    pub detail: String,
    pub ip: Option<IpAddr>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            user_id: None,
            action,
            detail: detail.into(),
            ip: None,
        }
    }

    pub fn user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }
}

/// Non-blocking audit logger.
pub struct AuditLogger {
    tx: mpsc::Sender<AuditEvent>,
}

impl AuditLogger {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(10_000);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                tracing::info!(
                    target: "audit",
                    action = ?event.action,
                    user_id = event.user_id,
                    ip = event.ip.map(|ip| ip.to_string()),
                    detail = %event.detail,
                    "audit event"
                );
            }
        });

        Self { tx }
    }

    /// Log an audit event (non-blocking; drops on overflow).
    pub fn log(&self, event: AuditEvent) {
        if self.tx.try_send(event).is_err() {
            tracing::warn!("Audit log channel full, event dropped");
        }
    }

    pub fn log_login(&self, user_id: i64, ip: Option<IpAddr>, success: bool) {
        let action = if success {
            AuditAction::Login
        } else {
            AuditAction::LoginFailed
        };
        let mut event = AuditEvent::new(action, "login attempt").user(user_id);
        if let Some(ip) = ip {
            event = event.ip(ip);
        }
        self.log(event);
    }

    pub fn log_key_rejected(&self, detail: impl Into<String>, ip: Option<IpAddr>) {
        let mut event = AuditEvent::new(AuditAction::ApiKeyRejected, detail);
        if let Some(ip) = ip {
            event = event.ip(ip);
        }
        self.log(event);
    }

    pub fn log_identity_mismatch(&self, key_owner: i64, detail: impl Into<String>) {
        self.log(AuditEvent::new(AuditAction::IdentityMismatch, detail).user(key_owner));
    }

    pub fn log_ip_changed(&self, user_id: i64, bound: &str, seen: IpAddr) {
        self.log(
            AuditEvent::new(
                AuditAction::IngestionIpChanged,
                format!("bound ip {bound}, traffic from {seen}"),
            )
            .user(user_id)
            .ip(seen),
        );
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_are_accepted_without_blocking() {
        let logger = AuditLogger::new();
        logger.log_login(4, None, true);
        logger.log_login(4, Some("10.0.0.1".parse().unwrap()), false);
        logger.log_key_rejected("missing key", None);
        logger.log_identity_mismatch(9, "payload user_id 4 does not match key owner");
    }

    #[test]
    fn test_event_builder_sets_fields() {
        let event = AuditEvent::new(AuditAction::ApiKeyRotated, "rotated")
            .user(4)
            .ip("10.0.0.1".parse().unwrap());
        assert_eq!(event.user_id, Some(4));
        assert!(event.ip.is_some());
        assert_eq!(event.action, AuditAction::ApiKeyRotated);
    }
}
