//! Client session hub and WebSocket endpoints.
//!
//! Two channel tables are kept per user: any number of UI connections, and
//! at most one authoritative command channel (a new client attach evicts the
//! previous one). Every socket gets a bounded outbound queue drained by its
//! own writer task; a full or dead queue detaches the channel immediately so
//! emitters never block.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use relay_core::types::User;
use replication::{ClientGateway, CommandFrame, Confirmation, UiMessage};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Outbound queue depth per channel. Overflow force-detaches the channel.
const CHANNEL_QUEUE_CAPACITY: usize = 64;

#[derive(Debug)]
struct ChannelHandle {
    id: u64,
    tx: mpsc::Sender<Message>,
}

/// Owner of the per-user channel tables. All mutation funnels through here.
pub struct SessionHub {
    ui_channels: DashMap<i64, Vec<ChannelHandle>>,
    client_channels: DashMap<i64, ChannelHandle>,
    next_channel_id: AtomicU64,
}

impl SessionHub {
    pub fn new() -> Self {
        Self {
            ui_channels: DashMap::new(),
            client_channels: DashMap::new(),
            next_channel_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_channel_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a UI connection for a user.
    pub fn attach_ui(&self, user_id: i64) -> (u64, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(CHANNEL_QUEUE_CAPACITY);
        let id = self.next_id();
        self.ui_channels
            .entry(user_id)
            .or_default()
            .push(ChannelHandle { id, tx });
        debug!(user_id, channel_id = id, "UI channel attached");
        (id, rx)
    }

    pub fn detach_ui(&self, user_id: i64, channel_id: u64) {
        if let Some(mut channels) = self.ui_channels.get_mut(&user_id) {
            channels.retain(|c| c.id != channel_id);
        }
        self.ui_channels
            .remove_if(&user_id, |_, channels| channels.is_empty());
        debug!(user_id, channel_id, "UI channel detached");
    }

    /// Register the authoritative command channel for a user, evicting any
    /// previous one. Returns whether the user was connected before.
    pub fn attach_client(&self, user_id: i64) -> (u64, mpsc::Receiver<Message>, bool) {
        let (tx, rx) = mpsc::channel(CHANNEL_QUEUE_CAPACITY);
        let id = self.next_id();
        let evicted = self
            .client_channels
            .insert(user_id, ChannelHandle { id, tx });
        if evicted.is_some() {
            info!(user_id, "Previous command channel evicted by new attach");
        }
        (id, rx, evicted.is_some())
    }

    /// Detach a command channel if it is still the authoritative one.
    /// Returns true when it was.
    pub fn detach_client(&self, user_id: i64, channel_id: u64) -> bool {
        self.client_channels
            .remove_if(&user_id, |_, handle| handle.id == channel_id)
            .is_some()
    }

    /// Whether the user currently holds a live command channel.
    pub fn client_connected(&self, user_id: i64) -> bool {
        self.client_channels.contains_key(&user_id)
    }

    /// Queue a text frame on the command channel. Never blocks; a refused
    /// send detaches the channel and reports false.
    fn try_send_client(&self, user_id: i64, message: Message) -> bool {
        let Some(handle) = self.client_channels.get(&user_id) else {
            return false;
        };
        if handle.tx.try_send(message).is_err() {
            let id = handle.id;
            drop(handle);
            warn!(user_id, "Command channel queue refused frame, detaching");
            self.detach_client(user_id, id);
            return false;
        }
        true
    }

    /// Fan a text frame out to every UI channel of the user, detaching any
    /// channel that refuses it.
    fn try_send_ui(&self, user_id: i64, message: &Message) {
        let mut dead: Vec<u64> = Vec::new();
        if let Some(channels) = self.ui_channels.get(&user_id) {
            for handle in channels.iter() {
                if handle.tx.try_send(message.clone()).is_err() {
                    dead.push(handle.id);
                }
            }
        }
        for id in dead {
            self.detach_ui(user_id, id);
        }
    }

    fn ui_user_ids(&self) -> Vec<i64> {
        self.ui_channels.iter().map(|e| *e.key()).collect()
    }

    /// Server-sent heartbeat. Dead channels are detached on the spot.
    pub fn heartbeat(&self) {
        let ping = match serde_json::to_string(&UiMessage::ping()) {
            Ok(json) => json,
            Err(_) => return,
        };
        for user_id in self.ui_user_ids() {
            self.try_send_ui(user_id, &Message::Text(ping.clone().into()));
        }

        let client_ids: Vec<i64> = self.client_channels.iter().map(|e| *e.key()).collect();
        for user_id in client_ids {
            self.try_send_client(user_id, Message::Ping(Default::default()));
        }
    }
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientGateway for SessionHub {
    fn is_client_connected(&self, user_id: i64) -> bool {
        self.client_connected(user_id)
    }

    async fn send_command(&self, user_id: i64, frame: CommandFrame) -> bool {
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                warn!(user_id, error = %e, "Failed to serialize command frame");
                return false;
            }
        };
        self.try_send_client(user_id, Message::Text(json.into()))
    }

    async fn push_to_ui(&self, user_id: i64, message: UiMessage) {
        if let Ok(json) = serde_json::to_string(&message) {
            self.try_send_ui(user_id, &Message::Text(json.into()));
        }
    }

    async fn broadcast(&self, message: UiMessage, exclude: Option<i64>) {
        let Ok(json) = serde_json::to_string(&message) else {
            return;
        };
        for user_id in self.ui_user_ids() {
            if exclude == Some(user_id) {
                continue;
            }
            self.try_send_ui(user_id, &Message::Text(json.clone().into()));
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ClientWsQuery {
    pub api_key: Option<String>,
}

/// Upgrade handler for the per-user command channel.
pub async fn ws_client_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<i64>,
    Query(query): Query<ClientWsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    // The authoritative channel is only granted to the holder of the user's
    // api key.
    let Some(api_key) = query.api_key else {
        return (StatusCode::UNAUTHORIZED, "api_key query parameter required").into_response();
    };
    let user = match state.users.find_by_api_key(&api_key).await {
        Ok(Some(user)) if user.id == user_id && user.is_active => user,
        Ok(_) => {
            state.audit.log_key_rejected(
                format!("command channel rejected for user {user_id}"),
                None,
            );
            return (StatusCode::UNAUTHORIZED, "invalid api key").into_response();
        }
        Err(e) => {
            warn!(error = %e, "Command channel auth lookup failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_client_socket(socket, state, user))
}

async fn handle_client_socket(socket: WebSocket, state: Arc<AppState>, user: User) {
    let (sink, mut receiver) = socket.split();
    let (channel_id, rx, was_connected) = state.hub.attach_client(user.id);
    let writer = tokio::spawn(run_writer(rx, sink));

    info!(user_id = user.id, channel_id, "Command channel connected");

    if user.is_master_trader && !was_connected {
        if let Err(e) = state
            .reconciler
            .notify_followers_of_status(&user, true)
            .await
        {
            warn!(error = %e, "Failed to notify followers of master online");
        }
    }

    // Replay any unmirrored master positions toward this follower.
    match state.backfill.on_client_attach(&user).await {
        Ok(emitted) if emitted > 0 => {
            info!(user_id = user.id, emitted, "Backfill triggered on connect");
        }
        Ok(_) => {}
        Err(e) => warn!(user_id = user.id, error = %e, "Backfill failed on connect"),
    }

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<Confirmation>(&text) {
                Ok(confirmation) => {
                    if let Err(e) = state.engine.handle_confirmation(user.id, confirmation).await {
                        warn!(user_id = user.id, error = %e, "Failed to apply confirmation");
                    }
                }
                Err(e) => {
                    debug!(user_id = user.id, error = %e, "Unrecognized client frame ignored");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(user_id = user.id, error = %e, "Command channel read error");
                break;
            }
        }
    }

    let was_authoritative = state.hub.detach_client(user.id, channel_id);
    writer.abort();
    info!(user_id = user.id, channel_id, "Command channel disconnected");

    if was_authoritative && user.is_master_trader {
        if let Err(e) = state
            .reconciler
            .notify_followers_of_status(&user, false)
            .await
        {
            warn!(error = %e, "Failed to notify followers of master offline");
        }
    }
}

/// Upgrade handler for the per-user UI push channel.
pub async fn ws_user_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<i64>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_ui_socket(socket, state, user_id))
}

async fn handle_ui_socket(socket: WebSocket, state: Arc<AppState>, user_id: i64) {
    let (sink, mut receiver) = socket.split();
    let (channel_id, rx) = state.hub.attach_ui(user_id);
    let writer = tokio::spawn(run_writer(rx, sink));

    info!(user_id, channel_id, "UI channel connected");

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                // The UI channel carries no authoritative commands; only a
                // keepalive request is answered.
                if text.contains("\"ping\"") {
                    state
                        .hub
                        .push_to_ui(user_id, UiMessage::ping())
                        .await;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }

    state.hub.detach_ui(user_id, channel_id);
    writer.abort();
    info!(user_id, channel_id, "UI channel disconnected");
}

/// Forward queued frames to the socket until either side goes away.
async fn run_writer(mut rx: mpsc::Receiver<Message>, mut sink: SplitSink<WebSocket, Message>) {
    while let Some(message) = rx.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use replication::{ClientCommand, ModifyTradePayload};

    #[tokio::test]
    async fn test_client_attach_evicts_previous_channel() {
        let hub = SessionHub::new();
        let (first_id, _rx1, was_connected) = hub.attach_client(4);
        assert!(!was_connected);
        assert!(hub.client_connected(4));

        let (second_id, _rx2, was_connected) = hub.attach_client(4);
        assert!(was_connected);
        assert_ne!(first_id, second_id);

        // The evicted channel can no longer detach the live one.
        assert!(!hub.detach_client(4, first_id));
        assert!(hub.client_connected(4));
        assert!(hub.detach_client(4, second_id));
        assert!(!hub.client_connected(4));
    }

    #[tokio::test]
    async fn test_send_command_without_channel_reports_false() {
        let hub = SessionHub::new();
        let frame = CommandFrame::new(ClientCommand::ModifyTrade(ModifyTradePayload {
            ticket: None,
            sl: None,
            tp: None,
            copy_trade_id: 1,
            copy_hash: "hash".to_string(),
        }));
        assert!(!hub.send_command(4, frame).await);
    }

    #[tokio::test]
    async fn test_send_command_queues_on_live_channel() {
        let hub = SessionHub::new();
        let (_id, mut rx, _) = hub.attach_client(4);
        let frame = CommandFrame::new(ClientCommand::ModifyTrade(ModifyTradePayload {
            ticket: Some("22003300".to_string()),
            sl: None,
            tp: None,
            copy_trade_id: 1,
            copy_hash: "hash".to_string(),
        }));
        assert!(hub.send_command(4, frame).await);

        let queued = rx.recv().await.unwrap();
        match queued {
            Message::Text(text) => assert!(text.contains("modify_trade")),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_queue_overflow_detaches_channel() {
        let hub = SessionHub::new();
        // Keep rx alive but never drain it.
        let (_id, _rx, _) = hub.attach_client(4);

        let mut refused = false;
        for i in 0..=CHANNEL_QUEUE_CAPACITY {
            let frame = CommandFrame::new(ClientCommand::ModifyTrade(ModifyTradePayload {
                ticket: None,
                sl: None,
                tp: None,
                copy_trade_id: i as i64,
                copy_hash: "hash".to_string(),
            }));
            if !hub.send_command(4, frame).await {
                refused = true;
                break;
            }
        }

        assert!(refused);
        assert!(!hub.client_connected(4));
    }

    #[tokio::test]
    async fn test_ui_fanout_reaches_every_tab() {
        let hub = SessionHub::new();
        let (_a, mut rx_a) = hub.attach_ui(4);
        let (_b, mut rx_b) = hub.attach_ui(4);

        hub.push_to_ui(4, UiMessage::ping()).await;

        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_broadcast_respects_exclusion() {
        let hub = SessionHub::new();
        let (_a, mut rx_a) = hub.attach_ui(4);
        let (_b, mut rx_b) = hub.attach_ui(9);

        hub.broadcast(UiMessage::ping(), Some(4)).await;

        assert!(rx_b.recv().await.is_some());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_detached_ui_channel_is_forgotten() {
        let hub = SessionHub::new();
        let (id, _rx) = hub.attach_ui(4);
        hub.detach_ui(4, id);
        assert!(hub.ui_user_ids().is_empty());
    }
}
