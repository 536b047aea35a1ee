//! Replication engine.
//!
//! Subscribes to domain events from masters and, for each active follower,
//! constructs and dispatches idempotent execute/close commands over the
//! command channel, then correlates the asynchronous confirmations back to
//! the ledger. One follower failing never aborts the fan-out to the rest;
//! execute commands are deliberately not retried (broker side-effects forbid
//! blind retry).

use crate::events::{DomainEvent, EventBus, MasterRef};
use crate::gateway::{
    ClientCommand, ClientGateway, CloseTradePayload, CommandFrame, Confirmation,
    ExecuteTradePayload, ExecutionResult, UiMessage, UiMessageKind,
};
use crate::sizing::{compute_follower_volume, copy_ratio};
use chrono::Utc;
use relay_core::correlation;
use relay_core::db::{ConnectionRepository, CopyTradeLedger, FollowRepository, TradeStore};
use relay_core::types::{CopyTrade, Follow, Trade};
use relay_core::Result;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Fans master events out to followers and applies their confirmations.
pub struct ReplicationEngine {
    trades: TradeStore,
    ledger: CopyTradeLedger,
    follows: FollowRepository,
    connections: ConnectionRepository,
    gateway: Arc<dyn ClientGateway>,
    events: EventBus,
}

impl ReplicationEngine {
    pub fn new(pool: PgPool, gateway: Arc<dyn ClientGateway>, events: EventBus) -> Self {
        Self {
            trades: TradeStore::new(pool.clone()),
            ledger: CopyTradeLedger::new(pool.clone()),
            follows: FollowRepository::new(pool.clone()),
            connections: ConnectionRepository::new(pool),
            gateway,
            events,
        }
    }

    /// Consume domain events until the bus closes.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        info!("Starting replication engine");
        let mut rx = self.events.subscribe();

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = self.handle_event(event).await {
                        error!(error = %e, "Failed to process domain event");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Replication engine lagged, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event bus closed, stopping replication engine");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_event(&self, event: DomainEvent) -> Result<()> {
        match event {
            DomainEvent::MasterPositionOpened {
                master,
                trade,
                restrict_to_follower,
            } => {
                self.replicate_open(&master, &trade, restrict_to_follower)
                    .await
            }
            DomainEvent::MasterPositionClosed { master, ticket } => {
                let records = self
                    .ledger
                    .executed_for_master_ticket(master.id, &ticket)
                    .await?;
                self.dispatch_closes(&master, records).await;
                Ok(())
            }
            DomainEvent::MasterPositionsCleared { master } => {
                let records = self.ledger.executed_under_master(master.id).await?;
                self.dispatch_closes(&master, records).await;
                Ok(())
            }
        }
    }

    /// Fan one opened master position out to its followers.
    async fn replicate_open(
        &self,
        master: &MasterRef,
        trade: &Trade,
        restrict_to_follower: Option<i64>,
    ) -> Result<()> {
        let follows = self.follows.active_followers_of(master.id).await?;
        for follow in follows {
            if let Some(only) = restrict_to_follower {
                if follow.follower_id != only {
                    continue;
                }
            }
            // Failures are local to the follower; the fan-out continues.
            if let Err(e) = self.replicate_open_for(master, trade, &follow).await {
                error!(
                    master_id = master.id,
                    follower_id = follow.follower_id,
                    ticket = %trade.ticket,
                    error = %e,
                    "Failed to replicate position to follower"
                );
            }
        }
        Ok(())
    }

    async fn replicate_open_for(
        &self,
        master: &MasterRef,
        trade: &Trade,
        follow: &Follow,
    ) -> Result<()> {
        let equity = self.connections.equity_of(follow.follower_id).await?;
        let follower_volume = compute_follower_volume(
            trade.volume,
            follow.copy_percentage,
            follow.max_risk_per_trade,
            equity,
            trade.open_price,
        );
        let ratio = copy_ratio(follower_volume, trade.volume);
        let hash = correlation::copy_hash(&master.username, &trade.ticket, &trade.open_time);

        let Some(record) = self
            .ledger
            .create_pending(follow, trade, follower_volume, ratio, &hash)
            .await?
        else {
            debug!(
                follow_id = follow.id,
                master_ticket = %trade.ticket,
                "Replication already recorded, skipping"
            );
            return Ok(());
        };

        if !self.gateway.is_client_connected(follow.follower_id) {
            self.ledger
                .note_pending_reason(record.id, "client offline")
                .await?;
            info!(
                follower_id = follow.follower_id,
                copy_trade_id = record.id,
                "Follower client offline, copy pending for backfill"
            );
            return Ok(());
        }

        let frame = CommandFrame::new(ClientCommand::ExecuteTrade(ExecuteTradePayload {
            symbol: trade.symbol.clone(),
            side: trade.side,
            volume: follower_volume,
            sl: trade.stop_loss,
            tp: trade.take_profit,
            master_trader: master.username.clone(),
            master_ticket: trade.ticket.clone(),
            copy_trade_id: record.id,
            copy_hash: hash.clone(),
        }));

        if self.gateway.send_command(follow.follower_id, frame).await {
            info!(
                follower_id = follow.follower_id,
                copy_trade_id = record.id,
                symbol = %trade.symbol,
                volume = %follower_volume,
                "Dispatched execute_trade to follower"
            );
        } else {
            self.ledger
                .note_pending_reason(record.id, "command channel unavailable")
                .await?;
            warn!(
                follower_id = follow.follower_id,
                copy_trade_id = record.id,
                "Command channel refused execute_trade, copy stays pending"
            );
        }

        Ok(())
    }

    /// Dispatch close commands for a batch of executed ledger records. The
    /// ledger is not touched here; closure is recorded only on the
    /// trade_closed confirmation.
    async fn dispatch_closes(&self, master: &MasterRef, records: Vec<(CopyTrade, i64)>) {
        for (record, follower_id) in records {
            if let Err(e) = self.dispatch_close_for(master, &record, follower_id).await {
                error!(
                    copy_trade_id = record.id,
                    follower_id,
                    error = %e,
                    "Failed to dispatch close to follower"
                );
            }
        }
    }

    async fn dispatch_close_for(
        &self,
        master: &MasterRef,
        record: &CopyTrade,
        follower_id: i64,
    ) -> Result<()> {
        // Only pass the ticket if the mirrored trade is still open on our
        // books; a stale ticket would make the client close the wrong thing.
        let ticket = match &record.follower_ticket {
            Some(ticket) => self
                .trades
                .find_by_ticket(follower_id, ticket)
                .await?
                .filter(|t| t.is_open())
                .map(|t| t.ticket),
            None => None,
        };

        if !self.gateway.is_client_connected(follower_id) {
            info!(
                copy_trade_id = record.id,
                follower_id,
                "Follower offline, close remains outstanding in ledger"
            );
            return Ok(());
        }

        let frame = CommandFrame::new(ClientCommand::CloseTrade(CloseTradePayload {
            ticket,
            symbol: record.symbol.clone(),
            master_trader: master.username.clone(),
            reason: "master_closed".to_string(),
            copy_trade_id: record.id,
            copy_hash: record.copy_hash.clone(),
            master_ticket: record.master_ticket.clone(),
        }));

        if self.gateway.send_command(follower_id, frame).await {
            info!(
                copy_trade_id = record.id,
                follower_id,
                master_ticket = %record.master_ticket,
                "Dispatched close_trade to follower"
            );
        } else {
            warn!(
                copy_trade_id = record.id,
                follower_id,
                "Command channel refused close_trade, will resolve on next reconciliation"
            );
        }

        Ok(())
    }

    /// Apply a confirmation frame read from a follower's command channel.
    pub async fn handle_confirmation(
        &self,
        follower_id: i64,
        confirmation: Confirmation,
    ) -> Result<()> {
        match confirmation {
            Confirmation::TradeExecuted(result) => {
                self.apply_execute_confirmation(follower_id, result).await
            }
            Confirmation::TradeClosed(result) => {
                self.apply_close_confirmation(follower_id, result).await
            }
        }
    }

    async fn apply_execute_confirmation(
        &self,
        follower_id: i64,
        result: ExecutionResult,
    ) -> Result<()> {
        let Some(record) = self.correlate(follower_id, &result).await? else {
            warn!(
                follower_id,
                copy_hash = result.copy_hash.as_deref(),
                ticket = result.ticket.as_deref(),
                "trade_executed confirmation matched no ledger record"
            );
            return Ok(());
        };

        if !result.success {
            let reason = result
                .error
                .clone()
                .unwrap_or_else(|| "follower client rejected execute".to_string());
            if self.ledger.mark_failed(record.id, &reason).await?.is_some() {
                warn!(
                    copy_trade_id = record.id,
                    follower_id,
                    reason = %reason,
                    "Copy trade failed on follower"
                );
            }
            return Ok(());
        }

        let Some(ticket) = result.ticket.clone() else {
            warn!(
                copy_trade_id = record.id,
                follower_id, "trade_executed success without a ticket, ignoring"
            );
            return Ok(());
        };

        let follower_trade_id = self
            .trades
            .find_by_ticket(follower_id, &ticket)
            .await?
            .map(|t| t.id);

        if let Some(updated) = self
            .ledger
            .link_execution(record.id, &ticket, follower_trade_id)
            .await?
        {
            self.follows.record_copied_trade(updated.follow_id).await?;
            info!(
                copy_trade_id = updated.id,
                follower_id,
                follower_ticket = %ticket,
                "Copy trade executed and linked"
            );
            self.gateway
                .push_to_ui(
                    follower_id,
                    UiMessage::new(
                        UiMessageKind::CopyTradeExecuted,
                        serde_json::json!({
                            "copy_trade_id": updated.id,
                            "symbol": updated.symbol,
                            "side": updated.side,
                            "volume": updated.follower_volume,
                            "follower_ticket": ticket,
                            "copy_hash": updated.copy_hash,
                        }),
                    ),
                )
                .await;
        }

        Ok(())
    }

    async fn apply_close_confirmation(
        &self,
        follower_id: i64,
        result: ExecutionResult,
    ) -> Result<()> {
        let Some(record) = self.correlate(follower_id, &result).await? else {
            warn!(
                follower_id,
                copy_hash = result.copy_hash.as_deref(),
                "trade_closed confirmation matched no ledger record"
            );
            return Ok(());
        };

        if !result.success {
            warn!(
                copy_trade_id = record.id,
                follower_id,
                error = result.error.as_deref(),
                "Follower failed to close copy trade, record stays executed"
            );
            return Ok(());
        }

        let now = Utc::now();
        if let Some(updated) = self.ledger.mark_closed(record.id, now).await? {
            // The client reports the ticket it actually closed, which may
            // differ from the recorded one after a broker re-ticket.
            let closed_ticket = result.ticket.clone().or(updated.follower_ticket.clone());
            if let Some(ticket) = &closed_ticket {
                self.trades.close_confirmed(follower_id, ticket, now).await?;
            }

            info!(
                copy_trade_id = updated.id,
                follower_id,
                ticket = closed_ticket.as_deref(),
                "Copy trade closed"
            );

            self.gateway
                .push_to_ui(
                    follower_id,
                    UiMessage::new(
                        UiMessageKind::TradeClosed,
                        serde_json::json!({
                            "copy_trade_id": updated.id,
                            "symbol": updated.symbol,
                            "ticket": closed_ticket,
                        }),
                    ),
                )
                .await;
        }

        Ok(())
    }

    /// Correlation preference: durable copy hash, then follower ticket, then
    /// the pending record for the echoed master ticket.
    async fn correlate(
        &self,
        follower_id: i64,
        result: &ExecutionResult,
    ) -> Result<Option<CopyTrade>> {
        if let Some(hash) = &result.copy_hash {
            if !hash.is_empty() {
                if let Some(record) = self.ledger.find_active_by_hash(follower_id, hash).await? {
                    return Ok(Some(record));
                }
            }
        }

        if let Some(ticket) = &result.ticket {
            if let Some(record) = self
                .ledger
                .find_active_by_follower_ticket(follower_id, ticket)
                .await?
            {
                return Ok(Some(record));
            }
        }

        if let Some(master_ticket) = result.original_master_ticket() {
            if let Some(record) = self
                .ledger
                .find_pending_by_master_ticket(follower_id, &master_ticket)
                .await?
            {
                return Ok(Some(record));
            }
        }

        Ok(None)
    }
}
