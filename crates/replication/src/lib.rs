//! Replication runtime for copyrelay.
//!
//! The ingestion reconciler turns client snapshots into canonical trade
//! state and domain events; the replication engine fans those events out as
//! idempotent execute/close commands to follower clients and correlates the
//! asynchronous confirmations back into the copy-trade ledger.

pub mod backfill;
pub mod engine;
pub mod events;
pub mod gateway;
pub mod reconciler;
pub mod sizing;

pub use backfill::Backfill;
pub use engine::ReplicationEngine;
pub use events::{DomainEvent, EventBus, MasterRef};
pub use gateway::{
    ClientCommand, ClientGateway, CloseTradePayload, CommandFrame, Confirmation, ExecutionResult,
    ExecuteTradePayload, ModifyTradePayload, UiMessage, UiMessageKind,
};
pub use reconciler::{EaPayload, IngestionReconciler};
