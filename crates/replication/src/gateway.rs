//! Wire frames for the duplex client channel and the UI push bus, plus the
//! gateway trait the engine dispatches through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::types::{deserialize_opt_ticket, TradeSide};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Server→client command envelope: `{type, data, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFrame {
    #[serde(flatten)]
    pub command: ClientCommand,
    pub timestamp: DateTime<Utc>,
}

impl CommandFrame {
    pub fn new(command: ClientCommand) -> Self {
        Self {
            command,
            timestamp: Utc::now(),
        }
    }
}

/// Commands a client executes against its broker terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    ExecuteTrade(ExecuteTradePayload),
    CloseTrade(CloseTradePayload),
    ModifyTrade(ModifyTradePayload),
}

/// Payload for `execute_trade`. The client embeds `CA:<copy_hash[:16]>` into
/// the broker comment for hash-based correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteTradePayload {
    pub symbol: String,
    #[serde(rename = "type")]
    pub side: TradeSide,
    pub volume: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sl: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tp: Option<Decimal>,
    pub master_trader: String,
    pub master_ticket: String,
    pub copy_trade_id: i64,
    pub copy_hash: String,
}

/// Payload for `close_trade`. Both correlation keys ride along: the ticket
/// may be stale after a broker re-ticket, the hash survives it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseTradePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
    pub symbol: String,
    pub master_trader: String,
    pub reason: String,
    pub copy_trade_id: i64,
    pub copy_hash: String,
    pub master_ticket: String,
}

/// Payload for `modify_trade` (stop-loss / take-profit adjustment).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyTradePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sl: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tp: Option<Decimal>,
    pub copy_trade_id: i64,
    pub copy_hash: String,
}

/// Client→server execution confirmations.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Confirmation {
    TradeExecuted(ExecutionResult),
    TradeClosed(ExecutionResult),
}

/// Result body of a confirmation frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, deserialize_with = "deserialize_opt_ticket")]
    pub ticket: Option<String>,
    #[serde(default)]
    pub copy_hash: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub original_command: Option<serde_json::Value>,
}

impl ExecutionResult {
    /// Master ticket echoed back inside the original command, if any.
    pub fn original_master_ticket(&self) -> Option<String> {
        let command = self.original_command.as_ref()?;
        match command.get("master_ticket")? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Kinds of UI push messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiMessageKind {
    PositionsUpdate,
    PositionsUpdated,
    AccountUpdate,
    MarginWarning,
    TradesSynced,
    TradeNew,
    TradeUpdated,
    TradeClosed,
    CopyTradeExecuted,
    MasterStatusChange,
    OrdersUpdate,
    Ping,
}

/// UI push envelope: `{type, data, timestamp}`.
#[derive(Debug, Clone, Serialize)]
pub struct UiMessage {
    #[serde(rename = "type")]
    pub kind: UiMessageKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl UiMessage {
    pub fn new(kind: UiMessageKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn ping() -> Self {
        Self::new(UiMessageKind::Ping, serde_json::Value::Null)
    }
}

/// Seam between the replication runtime and the session hub.
///
/// Command dispatch is best-effort and must never block the emitter; a false
/// return means no authoritative channel took the frame.
#[async_trait]
pub trait ClientGateway: Send + Sync {
    /// Whether the user's authoritative command channel is attached right
    /// now. Gates closure inference.
    fn is_client_connected(&self, user_id: i64) -> bool;

    /// Dispatch a command envelope to the user's client, if any.
    async fn send_command(&self, user_id: i64, frame: CommandFrame) -> bool;

    /// Fan a message out to every UI connection of the user.
    async fn push_to_ui(&self, user_id: i64, message: UiMessage);

    /// Push to every connected user except the excluded one.
    async fn broadcast(&self, message: UiMessage, exclude: Option<i64>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_frame_wire_shape() {
        let frame = CommandFrame::new(ClientCommand::ExecuteTrade(ExecuteTradePayload {
            symbol: "EURUSD".to_string(),
            side: TradeSide::Buy,
            volume: Decimal::new(10, 2),
            sl: None,
            tp: None,
            master_trader: "mariosat2".to_string(),
            master_ticket: "11046500".to_string(),
            copy_trade_id: 1,
            copy_hash: "abc123".to_string(),
        }));

        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "execute_trade");
        assert_eq!(json["data"]["symbol"], "EURUSD");
        assert_eq!(json["data"]["type"], "buy");
        assert_eq!(json["data"]["master_ticket"], "11046500");
        assert!(json["data"].get("sl").is_none());
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn test_close_frame_wire_shape() {
        let frame = CommandFrame::new(ClientCommand::CloseTrade(CloseTradePayload {
            ticket: Some("22003300".to_string()),
            symbol: "EURUSD".to_string(),
            master_trader: "mariosat2".to_string(),
            reason: "master_closed".to_string(),
            copy_trade_id: 1,
            copy_hash: "abc123".to_string(),
            master_ticket: "11046500".to_string(),
        }));

        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "close_trade");
        assert_eq!(json["data"]["ticket"], "22003300");
        assert_eq!(json["data"]["reason"], "master_closed");
    }

    #[test]
    fn test_confirmation_parses_numeric_ticket() {
        let raw = r#"{
            "type": "trade_executed",
            "data": {
                "success": true,
                "ticket": 22003300,
                "copy_hash": "deadbeef",
                "original_command": {"master_ticket": "11046500"}
            }
        }"#;

        let confirmation: Confirmation = serde_json::from_str(raw).unwrap();
        match confirmation {
            Confirmation::TradeExecuted(result) => {
                assert!(result.success);
                assert_eq!(result.ticket.as_deref(), Some("22003300"));
                assert_eq!(
                    result.original_master_ticket().as_deref(),
                    Some("11046500")
                );
            }
            other => panic!("unexpected confirmation: {other:?}"),
        }
    }

    #[test]
    fn test_confirmation_failure_carries_error() {
        let raw = r#"{
            "type": "trade_closed",
            "data": {"success": false, "error": "no matching position"}
        }"#;

        let confirmation: Confirmation = serde_json::from_str(raw).unwrap();
        match confirmation {
            Confirmation::TradeClosed(result) => {
                assert!(!result.success);
                assert_eq!(result.error.as_deref(), Some("no matching position"));
                assert!(result.ticket.is_none());
            }
            other => panic!("unexpected confirmation: {other:?}"),
        }
    }

    #[test]
    fn test_ui_message_envelope_shape() {
        let message = UiMessage::new(
            UiMessageKind::CopyTradeExecuted,
            serde_json::json!({"copy_trade_id": 1}),
        );
        let json: serde_json::Value = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "copy_trade_executed");
        assert_eq!(json["data"]["copy_trade_id"], 1);
        assert!(json.get("timestamp").is_some());
    }
}
