//! Domain types shared across the copyrelay platform.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

/// Margin level stored when margin is zero (no open exposure).
pub fn margin_level_cap() -> Decimal {
    Decimal::new(999_999, 0)
}

/// Upper bound above which a client-reported margin level is considered
/// non-physical and gets recomputed from equity and margin.
pub fn margin_level_sanity_bound() -> Decimal {
    Decimal::new(100_000, 0)
}

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Some(TradeSide::Buy),
            "sell" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TradeSide {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// Clients send either the MT5 numeric position type (0=buy, 1=sell) or the
// string form, depending on client version.
impl<'de> Deserialize<'de> for TradeSide {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Num(0) => Ok(TradeSide::Buy),
            Raw::Num(1) => Ok(TradeSide::Sell),
            Raw::Num(other) => Err(de::Error::custom(format!(
                "invalid position type {other}, expected 0 or 1"
            ))),
            Raw::Text(s) => TradeSide::parse(&s)
                .ok_or_else(|| de::Error::custom(format!("invalid position type {s:?}"))),
        }
    }
}

/// Lifecycle status of a trade record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "open",
            TradeStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(TradeStatus::Open),
            "closed" => Some(TradeStatus::Closed),
            _ => None,
        }
    }
}

/// Lifecycle status of a copy-trade ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyTradeStatus {
    Pending,
    Executed,
    Closed,
    Failed,
}

impl CopyTradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyTradeStatus::Pending => "pending",
            CopyTradeStatus::Executed => "executed",
            CopyTradeStatus::Closed => "closed",
            CopyTradeStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CopyTradeStatus::Pending),
            "executed" => Some(CopyTradeStatus::Executed),
            "closed" => Some(CopyTradeStatus::Closed),
            "failed" => Some(CopyTradeStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CopyTradeStatus::Closed | CopyTradeStatus::Failed)
    }

    /// Ledger monotonicity: pending→executed→closed, or pending→failed.
    pub fn can_transition_to(&self, next: CopyTradeStatus) -> bool {
        matches!(
            (self, next),
            (CopyTradeStatus::Pending, CopyTradeStatus::Executed)
                | (CopyTradeStatus::Pending, CopyTradeStatus::Failed)
                | (CopyTradeStatus::Pending, CopyTradeStatus::Closed)
                | (CopyTradeStatus::Executed, CopyTradeStatus::Closed)
        )
    }
}

/// A platform user.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub api_key: Option<String>,
    pub is_active: bool,
    pub is_online: bool,
    pub is_master_trader: bool,
    pub last_login_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
}

/// A master or follower position, addressed by (user_id, ticket).
#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub id: i64,
    pub user_id: i64,
    pub ticket: String,
    pub symbol: String,
    pub side: TradeSide,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub current_price: Decimal,
    pub close_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Option<Decimal>,
    pub swap: Decimal,
    pub commission: Decimal,
    pub open_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    pub status: TradeStatus,
    pub created_at: DateTime<Utc>,
}

impl Trade {
    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }
}

/// Cached per-user terminal connection and account summary.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Mt5Connection {
    pub id: i64,
    pub user_id: i64,
    pub login: Option<i64>,
    pub server: Option<String>,
    pub is_connected: bool,
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    pub free_margin: Decimal,
    pub margin_level: Decimal,
    pub currency: String,
    pub last_sync: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Normalize a client-reported margin level.
///
/// margin=0 means no exposure and is stored as the capped sentinel. A stored
/// level outside the physical range is recomputed as equity/margin·100.
pub fn normalize_margin_level(reported: Decimal, equity: Decimal, margin: Decimal) -> Decimal {
    if margin <= Decimal::ZERO {
        return margin_level_cap();
    }
    if reported < Decimal::ZERO || reported > margin_level_sanity_bound() {
        return (equity / margin * Decimal::new(100, 0)).min(margin_level_cap());
    }
    reported
}

/// An active copy relationship from a follower to a master.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Follow {
    pub id: i64,
    pub follower_id: i64,
    pub following_id: i64,
    pub copy_percentage: Decimal,
    pub max_risk_per_trade: Decimal,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_copied_trade: Option<DateTime<Utc>>,
    pub total_copied_trades: i64,
}

/// One replication attempt of a master trade toward one follower.
#[derive(Debug, Clone, Serialize)]
pub struct CopyTrade {
    pub id: i64,
    pub follow_id: i64,
    pub master_trade_id: i64,
    pub follower_trade_id: Option<i64>,
    pub master_ticket: String,
    pub follower_ticket: Option<String>,
    pub symbol: String,
    pub side: TradeSide,
    pub master_volume: Decimal,
    pub follower_volume: Decimal,
    pub copy_ratio: Decimal,
    pub copy_hash: String,
    pub status: CopyTradeStatus,
    pub error: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Brokers report tickets as large integers; clients forward them either as
/// JSON numbers or strings.
pub fn deserialize_ticket<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Text(String),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Num(n) => n.to_string(),
        Raw::Text(s) => s,
    })
}

/// Optional-ticket variant for confirmation frames.
pub fn deserialize_opt_ticket<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Text(String),
    }

    let raw: Option<Raw> = Option::deserialize(deserializer)?;
    Ok(raw.map(|r| match r {
        Raw::Num(n) => n.to_string(),
        Raw::Text(s) => s,
    }))
}

/// One open position as reported in a client snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionSnapshot {
    #[serde(deserialize_with = "deserialize_ticket")]
    pub ticket: String,
    pub symbol: String,
    #[serde(rename = "type")]
    pub side: TradeSide,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub current_price: Decimal,
    #[serde(default)]
    pub sl: Option<Decimal>,
    #[serde(default)]
    pub tp: Option<Decimal>,
    pub profit: Decimal,
    #[serde(default)]
    pub swap: Option<Decimal>,
    #[serde(default)]
    pub commission: Option<Decimal>,
    /// Broker comment; mirrored positions carry the copy-hash tag here.
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(alias = "time")]
    pub open_time: i64,
}

impl PositionSnapshot {
    pub fn open_time_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.open_time, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Brokers report absent stop-loss/take-profit as zero.
    pub fn stop_loss(&self) -> Option<Decimal> {
        non_zero(self.sl)
    }

    pub fn take_profit(&self) -> Option<Decimal> {
        non_zero(self.tp)
    }
}

fn non_zero(value: Option<Decimal>) -> Option<Decimal> {
    value.filter(|v| *v > Decimal::ZERO)
}

/// Positions payload: either a legacy bare list or an envelope with the
/// market-open flag.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PositionsPayload {
    Envelope {
        positions: Vec<PositionSnapshot>,
        #[serde(default = "default_market_open")]
        market_open: bool,
    },
    Bare(Vec<PositionSnapshot>),
}

fn default_market_open() -> bool {
    true
}

impl PositionsPayload {
    /// Snapshot list plus the market-open claim; a legacy bare list is
    /// treated as market_open=true.
    pub fn into_parts(self) -> (Vec<PositionSnapshot>, bool) {
        match self {
            PositionsPayload::Envelope {
                positions,
                market_open,
            } => (positions, market_open),
            PositionsPayload::Bare(positions) => (positions, true),
        }
    }
}

/// A closed trade imported through a history update.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryTradeSnapshot {
    #[serde(deserialize_with = "deserialize_ticket")]
    pub ticket: String,
    pub symbol: String,
    #[serde(rename = "type")]
    pub side: TradeSide,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub close_price: Decimal,
    pub profit: Decimal,
    #[serde(default)]
    pub swap: Option<Decimal>,
    #[serde(default)]
    pub commission: Option<Decimal>,
    #[serde(alias = "time")]
    pub open_time: i64,
    pub close_time: i64,
}

impl HistoryTradeSnapshot {
    pub fn open_time_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.open_time, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn close_time_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.close_time, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Account summary as reported in an account_update payload.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountInfoPayload {
    #[serde(default)]
    pub login: Option<i64>,
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    pub free_margin: Decimal,
    pub margin_level: Decimal,
    #[serde(default)]
    pub profit: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
}

/// Connection status as reported in a connection_status payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionStatusPayload {
    pub connected: bool,
    #[serde(default)]
    pub login: Option<i64>,
    #[serde(default)]
    pub server: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_accepts_numeric_and_string_forms() {
        let buy: TradeSide = serde_json::from_str("0").unwrap();
        assert_eq!(buy, TradeSide::Buy);
        let sell: TradeSide = serde_json::from_str("1").unwrap();
        assert_eq!(sell, TradeSide::Sell);
        let buy: TradeSide = serde_json::from_str("\"buy\"").unwrap();
        assert_eq!(buy, TradeSide::Buy);
        let sell: TradeSide = serde_json::from_str("\"SELL\"").unwrap();
        assert_eq!(sell, TradeSide::Sell);
        assert!(serde_json::from_str::<TradeSide>("2").is_err());
        assert!(serde_json::from_str::<TradeSide>("\"hold\"").is_err());
    }

    #[test]
    fn test_position_snapshot_parses_spec_shape() {
        let json = r#"{
            "ticket": "11046500",
            "symbol": "EURUSD",
            "type": 0,
            "volume": 0.10,
            "open_price": 1.10000,
            "current_price": 1.10010,
            "profit": 1.0,
            "open_time": 1736420708
        }"#;
        let snapshot: PositionSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.ticket, "11046500");
        assert_eq!(snapshot.side, TradeSide::Buy);
        assert_eq!(snapshot.stop_loss(), None);
    }

    #[test]
    fn test_position_snapshot_accepts_numeric_ticket_and_time_alias() {
        let json = r#"{
            "ticket": 11046500,
            "symbol": "EURUSD",
            "type": "sell",
            "volume": 0.5,
            "open_price": 1.1,
            "current_price": 1.2,
            "sl": 0.0,
            "tp": 1.3,
            "profit": -2.5,
            "time": 1736420708
        }"#;
        let snapshot: PositionSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.ticket, "11046500");
        assert_eq!(snapshot.open_time, 1736420708);
        assert_eq!(snapshot.stop_loss(), None);
        assert!(snapshot.take_profit().is_some());
    }

    #[test]
    fn test_positions_payload_bare_list_means_market_open() {
        let json = r#"[{
            "ticket": 1, "symbol": "EURUSD", "type": 0, "volume": 0.1,
            "open_price": 1.0, "current_price": 1.0, "profit": 0.0,
            "open_time": 1736420708
        }]"#;
        let payload: PositionsPayload = serde_json::from_str(json).unwrap();
        let (positions, market_open) = payload.into_parts();
        assert_eq!(positions.len(), 1);
        assert!(market_open);
    }

    #[test]
    fn test_positions_payload_envelope_carries_flag() {
        let json = r#"{"positions": [], "market_open": false}"#;
        let payload: PositionsPayload = serde_json::from_str(json).unwrap();
        let (positions, market_open) = payload.into_parts();
        assert!(positions.is_empty());
        assert!(!market_open);
    }

    #[test]
    fn test_copy_status_transitions_are_monotonic() {
        use CopyTradeStatus::*;
        assert!(Pending.can_transition_to(Executed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Closed));
        assert!(Executed.can_transition_to(Closed));
        assert!(!Executed.can_transition_to(Pending));
        assert!(!Closed.can_transition_to(Executed));
        assert!(!Failed.can_transition_to(Executed));
        assert!(!Closed.can_transition_to(Pending));
    }

    #[test]
    fn test_margin_level_normalization() {
        let cap = margin_level_cap();
        // No exposure: sentinel.
        assert_eq!(
            normalize_margin_level(Decimal::ZERO, Decimal::new(1000, 0), Decimal::ZERO),
            cap
        );
        // Physical value passes through.
        assert_eq!(
            normalize_margin_level(
                Decimal::new(2500, 1),
                Decimal::new(1000, 0),
                Decimal::new(400, 0)
            ),
            Decimal::new(2500, 1)
        );
        // Out-of-range value recomputed as equity/margin*100.
        assert_eq!(
            normalize_margin_level(
                Decimal::new(5_000_000, 0),
                Decimal::new(1000, 0),
                Decimal::new(400, 0)
            ),
            Decimal::new(250, 0)
        );
        // Negative value recomputed too.
        assert_eq!(
            normalize_margin_level(
                Decimal::new(-1, 0),
                Decimal::new(1000, 0),
                Decimal::new(500, 0)
            ),
            Decimal::new(200, 0)
        );
    }
}
