//! Ingestion reconciler.
//!
//! Consumes typed client payloads, reconciles them into the trade store
//! inside a single transaction per snapshot, and emits domain events after
//! commit. All ingestion for one owner is serialized through a per-owner
//! lock; cross-owner ingestion runs in parallel.

use crate::events::{DomainEvent, EventBus, MasterRef};
use crate::gateway::{ClientGateway, UiMessage, UiMessageKind};
use dashmap::DashMap;
use relay_core::correlation::comment_matches;
use relay_core::db::{ConnectionRepository, CopyTradeLedger, FollowRepository, TradeStore};
use relay_core::types::{
    AccountInfoPayload, ConnectionStatusPayload, CopyTrade, HistoryTradeSnapshot,
    PositionSnapshot, PositionsPayload, Trade, User,
};
use relay_core::{Error, Result};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Margin level below which a margin_warning push goes out.
fn margin_warning_level() -> Decimal {
    Decimal::new(150, 0)
}

/// A typed ingestion payload, parsed from the envelope's `type` and `data`.
#[derive(Debug, Clone)]
pub enum EaPayload {
    ConnectionStatus(ConnectionStatusPayload),
    AccountUpdate(AccountInfoPayload),
    PositionsUpdate(PositionsPayload),
    HistoryUpdate(Vec<HistoryTradeSnapshot>),
    OrdersUpdate(serde_json::Value),
}

impl EaPayload {
    pub fn parse(message_type: &str, data: serde_json::Value) -> Result<Self> {
        match message_type {
            "connection_status" => Ok(Self::ConnectionStatus(serde_json::from_value(data)?)),
            "account_update" => Ok(Self::AccountUpdate(serde_json::from_value(data)?)),
            "positions_update" => Ok(Self::PositionsUpdate(serde_json::from_value(data)?)),
            "history_update" => Ok(Self::HistoryUpdate(serde_json::from_value(data)?)),
            "orders_update" => Ok(Self::OrdersUpdate(data)),
            other => Err(Error::Validation(format!("unknown message type: {other}"))),
        }
    }
}

/// Closure inference gate: a master absence is authoritative only when the
/// market is open and the master's command channel is presently attached.
pub(crate) fn should_infer_closures(
    is_master: bool,
    market_open: bool,
    client_connected: bool,
) -> bool {
    is_master && market_open && client_connected
}

/// Open tickets no longer present in the snapshot.
pub(crate) fn closed_tickets(
    open: &HashSet<String>,
    snapshot: &HashSet<String>,
) -> Vec<String> {
    let mut closed: Vec<String> = open.difference(snapshot).cloned().collect();
    closed.sort();
    closed
}

/// Does a ledger record correspond to this follower position? The recorded
/// follower ticket is the fast match; the copy-hash tag in the broker
/// comment survives re-ticketing and lost confirmations.
fn record_matches_position(record: &CopyTrade, snapshot: &PositionSnapshot) -> bool {
    if record.follower_ticket.as_deref() == Some(snapshot.ticket.as_str()) {
        return true;
    }
    snapshot
        .comment
        .as_deref()
        .map(|comment| comment_matches(comment, &record.copy_hash))
        .unwrap_or(false)
}

/// Reconciles client snapshots into the canonical trade store.
pub struct IngestionReconciler {
    pool: PgPool,
    trades: TradeStore,
    ledger: CopyTradeLedger,
    connections: ConnectionRepository,
    follows: FollowRepository,
    gateway: Arc<dyn ClientGateway>,
    events: EventBus,
    owner_locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl IngestionReconciler {
    pub fn new(pool: PgPool, gateway: Arc<dyn ClientGateway>, events: EventBus) -> Self {
        Self {
            trades: TradeStore::new(pool.clone()),
            ledger: CopyTradeLedger::new(pool.clone()),
            connections: ConnectionRepository::new(pool.clone()),
            follows: FollowRepository::new(pool.clone()),
            pool,
            gateway,
            events,
            owner_locks: DashMap::new(),
        }
    }

    /// Apply one payload for one owner. Serialized per owner so upserts
    /// always precede closure diffing within a batch and a close can never
    /// overtake the open it depends on.
    pub async fn process(&self, owner: &User, payload: EaPayload) -> Result<()> {
        let lock = self
            .owner_locks
            .entry(owner.id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        match payload {
            EaPayload::ConnectionStatus(status) => self.apply_connection_status(owner, status).await,
            EaPayload::AccountUpdate(account) => self.apply_account(owner, &account).await,
            EaPayload::PositionsUpdate(positions) => self.apply_positions(owner, positions).await,
            EaPayload::HistoryUpdate(items) => self.apply_history(owner, &items).await,
            EaPayload::OrdersUpdate(orders) => self.apply_orders(owner, orders).await,
        }
    }

    /// The positions state machine. Upserts run first, then closure diffing,
    /// all inside one transaction; domain events go out after commit.
    async fn apply_positions(&self, owner: &User, payload: PositionsPayload) -> Result<()> {
        let (positions, market_open) = payload.into_parts();
        let client_connected = self.gateway.is_client_connected(owner.id);

        let mut tx = self.pool.begin().await?;

        let open_before = self.trades.open_trades_in(&mut *tx, owner.id).await?;
        let open_tickets: HashSet<String> =
            open_before.iter().map(|t| t.ticket.clone()).collect();
        let active_records = self
            .ledger
            .find_active_for_follower_in(&mut *tx, owner.id)
            .await?;

        let mut opened: Vec<Trade> = Vec::new();
        let mut promoted: Vec<CopyTrade> = Vec::new();

        for snapshot in &positions {
            let (trade, created) = self.trades.upsert_open(&mut *tx, owner.id, snapshot).await?;

            for record in &active_records {
                if !record_matches_position(record, snapshot) {
                    continue;
                }
                match record.status {
                    relay_core::types::CopyTradeStatus::Pending => {
                        if let Some(updated) = self
                            .ledger
                            .link_execution_in(&mut *tx, record.id, &snapshot.ticket, Some(trade.id))
                            .await?
                        {
                            info!(
                                copy_trade_id = updated.id,
                                follower_id = owner.id,
                                ticket = %snapshot.ticket,
                                "Promoted pending copy trade from snapshot"
                            );
                            promoted.push(updated);
                        }
                    }
                    relay_core::types::CopyTradeStatus::Executed
                        if record.follower_trade_id.is_none() =>
                    {
                        self.ledger
                            .attach_follower_trade_in(&mut *tx, record.id, trade.id)
                            .await?;
                    }
                    _ => {}
                }
            }

            if created {
                opened.push(trade);
            }
        }

        let snapshot_tickets: HashSet<String> =
            positions.iter().map(|p| p.ticket.clone()).collect();

        let mut closed: Vec<String> = Vec::new();
        let mut mass_clear = false;

        if should_infer_closures(owner.is_master_trader, market_open, client_connected) {
            if positions.is_empty() {
                // Mass-close path: an authoritative empty snapshot.
                mass_clear = !open_before.is_empty();
                let now = chrono::Utc::now();
                for trade in &open_before {
                    self.trades
                        .close(&mut *tx, owner.id, &trade.ticket, None, now)
                        .await?;
                }
            } else {
                let now = chrono::Utc::now();
                for ticket in closed_tickets(&open_tickets, &snapshot_tickets) {
                    self.trades
                        .close(&mut *tx, owner.id, &ticket, None, now)
                        .await?;
                    closed.push(ticket);
                }
            }
        } else if !market_open {
            debug!(
                owner_id = owner.id,
                "Market closed, snapshot absences ignored"
            );
        } else if owner.is_master_trader && !client_connected {
            // A snapshot arriving while the command channel is detached is
            // not authoritative; the open set stays frozen.
            warn!(
                owner_id = owner.id,
                "Master snapshot without live command channel, closure inference skipped"
            );
        }

        tx.commit().await?;

        let master = MasterRef {
            id: owner.id,
            username: owner.username.clone(),
        };

        if owner.is_master_trader {
            for trade in &opened {
                self.events.publish(DomainEvent::MasterPositionOpened {
                    master: master.clone(),
                    trade: trade.clone(),
                    restrict_to_follower: None,
                });
            }
            if mass_clear {
                self.events.publish(DomainEvent::MasterPositionsCleared {
                    master: master.clone(),
                });
            } else {
                for ticket in &closed {
                    self.events.publish(DomainEvent::MasterPositionClosed {
                        master: master.clone(),
                        ticket: ticket.clone(),
                    });
                }
            }
        }

        for record in &promoted {
            self.gateway
                .push_to_ui(
                    owner.id,
                    UiMessage::new(
                        UiMessageKind::CopyTradeExecuted,
                        serde_json::json!({
                            "copy_trade_id": record.id,
                            "symbol": record.symbol,
                            "follower_ticket": record.follower_ticket,
                            "copy_hash": record.copy_hash,
                        }),
                    ),
                )
                .await;
        }

        let open_now = self.trades.list_open(owner.id).await?;
        self.gateway
            .push_to_ui(
                owner.id,
                UiMessage::new(
                    UiMessageKind::PositionsUpdate,
                    serde_json::json!({
                        "positions": open_now,
                        "market_open": market_open,
                    }),
                ),
            )
            .await;

        debug!(
            owner_id = owner.id,
            received = positions.len(),
            opened = opened.len(),
            closed = closed.len(),
            mass_clear,
            "Positions snapshot reconciled"
        );

        Ok(())
    }

    async fn apply_account(&self, owner: &User, account: &AccountInfoPayload) -> Result<()> {
        let connection = self.connections.upsert_account(owner.id, account).await?;

        self.gateway
            .push_to_ui(
                owner.id,
                UiMessage::new(
                    UiMessageKind::AccountUpdate,
                    serde_json::json!({
                        "balance": connection.balance,
                        "equity": connection.equity,
                        "margin": connection.margin,
                        "free_margin": connection.free_margin,
                        "margin_level": connection.margin_level,
                        "currency": connection.currency,
                        "connected": connection.is_connected,
                    }),
                ),
            )
            .await;

        if connection.margin > Decimal::ZERO && connection.margin_level < margin_warning_level() {
            self.gateway
                .push_to_ui(
                    owner.id,
                    UiMessage::new(
                        UiMessageKind::MarginWarning,
                        serde_json::json!({
                            "margin_level": connection.margin_level,
                            "threshold": margin_warning_level(),
                        }),
                    ),
                )
                .await;
        }

        Ok(())
    }

    /// Append-only history import: closed trades for unseen tickets are
    /// inserted, duplicates skipped, existing rows never mutated.
    async fn apply_history(&self, owner: &User, items: &[HistoryTradeSnapshot]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut imported = 0usize;
        for item in items {
            if self
                .trades
                .insert_closed_history(&mut *tx, owner.id, item)
                .await?
            {
                imported += 1;
            }
        }
        tx.commit().await?;

        self.gateway
            .push_to_ui(
                owner.id,
                UiMessage::new(
                    UiMessageKind::TradesSynced,
                    serde_json::json!({
                        "trades_count": imported,
                        "received": items.len(),
                    }),
                ),
            )
            .await;

        info!(
            owner_id = owner.id,
            imported,
            received = items.len(),
            "History update applied"
        );

        Ok(())
    }

    async fn apply_connection_status(
        &self,
        owner: &User,
        status: ConnectionStatusPayload,
    ) -> Result<()> {
        self.connections
            .set_connected(
                owner.id,
                status.connected,
                status.login,
                status.server.as_deref(),
            )
            .await?;

        if owner.is_master_trader {
            self.notify_followers_of_status(owner, status.connected).await?;
        }

        info!(
            owner_id = owner.id,
            connected = status.connected,
            "Terminal connection status updated"
        );

        Ok(())
    }

    /// Tell every active follower that their master's terminal flipped.
    pub async fn notify_followers_of_status(&self, master: &User, online: bool) -> Result<()> {
        let follows = self.follows.active_followers_of(master.id).await?;
        for follow in follows {
            self.gateway
                .push_to_ui(
                    follow.follower_id,
                    UiMessage::new(
                        UiMessageKind::MasterStatusChange,
                        serde_json::json!({
                            "master_id": master.id,
                            "master_username": master.username,
                            "online": online,
                        }),
                    ),
                )
                .await;
        }
        Ok(())
    }

    /// Pending-order tracking is out of scope; the payload is logged and
    /// echoed to the owner's UI.
    async fn apply_orders(&self, owner: &User, orders: serde_json::Value) -> Result<()> {
        let count = orders
            .as_array()
            .map(|a| a.len())
            .or_else(|| orders.get("orders").and_then(|o| o.as_array()).map(|a| a.len()))
            .unwrap_or(0);
        debug!(owner_id = owner.id, count, "Orders update received");

        self.gateway
            .push_to_ui(
                owner.id,
                UiMessage::new(
                    UiMessageKind::OrdersUpdate,
                    serde_json::json!({
                        "orders": orders,
                        "count": count,
                    }),
                ),
            )
            .await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_gate_truth_table() {
        // Only a connected master with an open market infers closures.
        assert!(should_infer_closures(true, true, true));
        assert!(!should_infer_closures(true, true, false));
        assert!(!should_infer_closures(true, false, true));
        assert!(!should_infer_closures(false, true, true));
        assert!(!should_infer_closures(false, false, false));
    }

    #[test]
    fn test_closed_tickets_is_set_difference() {
        let open: HashSet<String> = ["1", "2", "3"].iter().map(|s| s.to_string()).collect();
        let snapshot: HashSet<String> = ["2"].iter().map(|s| s.to_string()).collect();
        assert_eq!(closed_tickets(&open, &snapshot), vec!["1", "3"]);

        let all_present: HashSet<String> = open.clone();
        assert!(closed_tickets(&open, &all_present).is_empty());

        let empty = HashSet::new();
        assert_eq!(closed_tickets(&open, &empty).len(), 3);
    }

    #[test]
    fn test_unknown_message_type_is_a_validation_error() {
        let result = EaPayload::parse("leaderboard_update", serde_json::json!({}));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_parse_accepts_bare_position_list() {
        let data = serde_json::json!([{
            "ticket": "11046500",
            "symbol": "EURUSD",
            "type": 0,
            "volume": 0.10,
            "open_price": 1.10,
            "current_price": 1.1001,
            "profit": 1.0,
            "open_time": 1736420708
        }]);
        let payload = EaPayload::parse("positions_update", data).unwrap();
        match payload {
            EaPayload::PositionsUpdate(p) => {
                let (positions, market_open) = p.into_parts();
                assert_eq!(positions.len(), 1);
                assert!(market_open);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_record_matches_by_ticket_and_by_comment_hash() {
        use chrono::Utc;
        use relay_core::correlation::{comment_tag, copy_hash};
        use relay_core::types::{CopyTradeStatus, TradeSide};

        let open_time = Utc::now();
        let hash = copy_hash("mariosat2", "11046500", &open_time);
        let record = CopyTrade {
            id: 1,
            follow_id: 1,
            master_trade_id: 1,
            follower_trade_id: None,
            master_ticket: "11046500".to_string(),
            follower_ticket: Some("22003300".to_string()),
            symbol: "EURUSD".to_string(),
            side: TradeSide::Buy,
            master_volume: Decimal::new(10, 2),
            follower_volume: Decimal::new(10, 2),
            copy_ratio: Decimal::ONE,
            copy_hash: hash.clone(),
            status: CopyTradeStatus::Pending,
            error: None,
            retry_count: 0,
            created_at: open_time,
            executed_at: None,
            closed_at: None,
        };

        let base = serde_json::json!({
            "ticket": "22003300",
            "symbol": "EURUSD",
            "type": 0,
            "volume": 0.10,
            "open_price": 1.10,
            "current_price": 1.10,
            "profit": 0.0,
            "open_time": 1736420708
        });
        let by_ticket: PositionSnapshot = serde_json::from_value(base.clone()).unwrap();
        assert!(record_matches_position(&record, &by_ticket));

        // Re-ticketed position: only the broker comment still links it.
        let mut reticketed = base.clone();
        reticketed["ticket"] = serde_json::json!("99999999");
        reticketed["comment"] = serde_json::json!(comment_tag(&hash));
        let by_comment: PositionSnapshot = serde_json::from_value(reticketed).unwrap();
        assert!(record_matches_position(&record, &by_comment));

        let mut unrelated = base;
        unrelated["ticket"] = serde_json::json!("88888888");
        unrelated["comment"] = serde_json::json!("manual trade");
        let no_match: PositionSnapshot = serde_json::from_value(unrelated).unwrap();
        assert!(!record_matches_position(&record, &no_match));
    }
}
