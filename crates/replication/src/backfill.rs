//! Backfill on follower connect.
//!
//! When a follower's client attaches, every open master trade not yet
//! represented in the ledger for that follow edge is replayed as a
//! restricted open event. The ledger's non-terminal uniqueness check is the
//! debounce: a rapid reconnect finds the pending record and emits nothing.

use crate::events::{DomainEvent, EventBus, MasterRef};
use relay_core::db::{CopyTradeLedger, FollowRepository, TradeStore, UserRepository};
use relay_core::types::User;
use relay_core::Result;
use sqlx::PgPool;
use tracing::{debug, info};

pub struct Backfill {
    trades: TradeStore,
    follows: FollowRepository,
    ledger: CopyTradeLedger,
    users: UserRepository,
    events: EventBus,
}

impl Backfill {
    pub fn new(pool: PgPool, events: EventBus) -> Self {
        Self {
            trades: TradeStore::new(pool.clone()),
            follows: FollowRepository::new(pool.clone()),
            ledger: CopyTradeLedger::new(pool.clone()),
            users: UserRepository::new(pool),
            events,
        }
    }

    /// Emit restricted open events for the connecting follower's unmirrored
    /// master positions. Returns how many events went out.
    pub async fn on_client_attach(&self, follower: &User) -> Result<usize> {
        let mut emitted = 0usize;

        for follow in self.follows.active_follows_for(follower.id).await? {
            let Some(master) = self.users.find_by_id(follow.following_id).await? else {
                continue;
            };
            if !master.is_master_trader || !master.is_active {
                continue;
            }

            for trade in self.trades.list_open(master.id).await? {
                if self.ledger.has_active_record(follow.id, trade.id).await? {
                    debug!(
                        follow_id = follow.id,
                        master_ticket = %trade.ticket,
                        "Master trade already mirrored, backfill skipped"
                    );
                    continue;
                }

                self.events.publish(DomainEvent::MasterPositionOpened {
                    master: MasterRef {
                        id: master.id,
                        username: master.username.clone(),
                    },
                    trade,
                    restrict_to_follower: Some(follower.id),
                });
                emitted += 1;
            }
        }

        if emitted > 0 {
            info!(
                follower_id = follower.id,
                emitted, "Backfill events emitted on follower connect"
            );
        }

        Ok(emitted)
    }
}
