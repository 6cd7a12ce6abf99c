use std::{sync::Arc, time::Duration};

use corridor_core::{
    ClientMessage, ClipboardItem, STALE_CONNECTION_MS, STALE_SWEEP_INTERVAL_MS, ServerMessage,
    Token, decode_client_message, encode, now_unix_ms, preview_text,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    registry::{ConnectionRegistry, Outbound},
    room::Room,
    store::RoomStore,
};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    /// Connections without a ping for longer than this are closed.
    pub stale_after: Duration,
    pub sweep_interval: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_millis(STALE_CONNECTION_MS),
            sweep_interval: Duration::from_millis(STALE_SWEEP_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Error)]
#[error("room actor for {0} is no longer running")]
pub struct RoomUnavailable(pub Token);

#[derive(Debug)]
enum RoomCommand {
    Connect {
        connection_id: String,
        tx: mpsc::UnboundedSender<Outbound>,
    },
    Disconnect {
        connection_id: String,
    },
    Message {
        connection_id: String,
        raw: String,
    },
    Update {
        content: String,
        reply: oneshot::Sender<ClipboardItem>,
    },
    History {
        reply: oneshot::Sender<Vec<ClipboardItem>>,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
}

/// Mailbox of a running [`RoomActor`]. Cheap to clone; every clone feeds the
/// same single consumer, so commands for one token are applied one at a time
/// in arrival order.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    token: Token,
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    /// Starts the actor for `token`. Stored state is loaded inside the task
    /// before the first command is processed.
    pub fn spawn(token: Token, store: Arc<dyn RoomStore>, settings: RelaySettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor_token = token.clone();
        tokio::spawn(async move {
            let actor = RoomActor::load(actor_token, store, settings).await;
            actor.run(rx).await;
        });
        Self { token, tx }
    }

    #[must_use]
    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn connect(
        &self,
        connection_id: String,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Result<(), RoomUnavailable> {
        self.send(RoomCommand::Connect { connection_id, tx })
    }

    pub fn disconnect(&self, connection_id: String) {
        let _ = self.send(RoomCommand::Disconnect { connection_id });
    }

    pub fn message(&self, connection_id: String, raw: String) -> Result<(), RoomUnavailable> {
        self.send(RoomCommand::Message { connection_id, raw })
    }

    pub async fn update(&self, content: String) -> Result<ClipboardItem, RoomUnavailable> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Update { content, reply })?;
        rx.await.map_err(|_| self.unavailable())
    }

    pub async fn history(&self) -> Result<Vec<ClipboardItem>, RoomUnavailable> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::History { reply })?;
        rx.await.map_err(|_| self.unavailable())
    }

    pub async fn clear(&self) -> Result<(), RoomUnavailable> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Clear { reply })?;
        rx.await.map_err(|_| self.unavailable())
    }

    fn send(&self, command: RoomCommand) -> Result<(), RoomUnavailable> {
        self.tx.send(command).map_err(|_| self.unavailable())
    }

    fn unavailable(&self) -> RoomUnavailable {
        RoomUnavailable(self.token.clone())
    }
}

/// Sole owner of one room and its connections.
#[derive(Debug)]
pub struct RoomActor {
    room: Room,
    registry: ConnectionRegistry,
    store: Arc<dyn RoomStore>,
    settings: RelaySettings,
}

impl RoomActor {
    #[must_use]
    pub fn new(room: Room, store: Arc<dyn RoomStore>, settings: RelaySettings) -> Self {
        Self {
            room,
            registry: ConnectionRegistry::new(),
            store,
            settings,
        }
    }

    /// Reconstructs the room from storage, or starts empty when there is
    /// nothing stored or the stored copy is unreadable.
    pub async fn load(token: Token, store: Arc<dyn RoomStore>, settings: RelaySettings) -> Self {
        let room = match store.load(&token).await {
            Ok(Some(stored)) => {
                info!(token = %token, items = stored.history.len(), "room restored");
                Room::restore(token, stored)
            }
            Ok(None) => Room::new(token, now_unix_ms()),
            Err(err) => {
                error!(token = %token, "failed to load room, starting empty: {}", err);
                Room::new(token, now_unix_ms())
            }
        };
        Self::new(room, store, settings)
    }

    #[must_use]
    pub fn room(&self) -> &Room {
        &self.room
    }

    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<RoomCommand>) {
        let period = self.settings.sweep_interval.max(MIN_SWEEP_INTERVAL);
        let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                _ = sweep.tick() => self.sweep_stale(now_unix_ms()),
            }
        }

        debug!(token = %self.room.token(), "room actor stopped");
    }

    async fn handle_command(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Connect { connection_id, tx } => self.on_connect(connection_id, tx),
            RoomCommand::Disconnect { connection_id } => self.on_disconnect(&connection_id),
            RoomCommand::Message { connection_id, raw } => {
                self.handle_message(&connection_id, &raw).await;
            }
            RoomCommand::Update { content, reply } => {
                let item = self.accept_update(content).await;
                let _ = reply.send(item);
            }
            RoomCommand::History { reply } => {
                let _ = reply.send(self.room.history().to_vec());
            }
            RoomCommand::Clear { reply } => {
                self.clear_history().await;
                let _ = reply.send(());
            }
        }
    }

    /// Registers a connection and sends it the current history straight away.
    pub fn on_connect(&mut self, connection_id: String, tx: mpsc::UnboundedSender<Outbound>) {
        self.registry
            .register(connection_id.clone(), tx, now_unix_ms());
        info!(
            token = %self.room.token(),
            connection_id = %connection_id,
            connections = self.registry.len(),
            "device connected"
        );
        self.send_history(&connection_id);
    }

    pub fn on_disconnect(&mut self, connection_id: &str) {
        if self.registry.remove(connection_id) {
            info!(
                token = %self.room.token(),
                connection_id = %connection_id,
                connections = self.registry.len(),
                "device disconnected"
            );
        }
    }

    /// Applies one raw socket message. Protocol errors go back to the sender
    /// only and leave the room untouched.
    pub async fn handle_message(&mut self, connection_id: &str, raw: &str) {
        let message = match decode_client_message(raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(connection_id = %connection_id, "rejected message: {}", err);
                self.send_error(connection_id, err.to_string());
                return;
            }
        };

        match message {
            ClientMessage::Ping => {
                self.registry.touch(connection_id, now_unix_ms());
                self.send_to(connection_id, &ServerMessage::Pong);
            }
            ClientMessage::ClipboardUpdate { data } => {
                self.accept_update(data.content).await;
            }
            ClientMessage::ClipboardHistory => self.send_history(connection_id),
            ClientMessage::ClearHistory => self.clear_history().await,
        }
    }

    /// Prepends a new item, persists, then broadcasts it to every connection
    /// including the sender.
    pub async fn accept_update(&mut self, content: String) -> ClipboardItem {
        let item = self.room.push(content, now_unix_ms());
        debug!(
            token = %self.room.token(),
            id = %item.id,
            preview = %preview_text(&item.content, 40),
            "clipboard update accepted"
        );
        self.persist().await;
        self.broadcast(&ServerMessage::ClipboardUpdate {
            token: self.room.token().to_string(),
            data: item.clone(),
        });
        item
    }

    pub async fn clear_history(&mut self) {
        self.room.clear(now_unix_ms());
        info!(token = %self.room.token(), "history cleared");
        self.persist().await;
        self.broadcast(&ServerMessage::ClipboardHistory {
            token: self.room.token().to_string(),
            history: Vec::new(),
        });
    }

    pub fn sweep_stale(&mut self, now: u64) {
        let threshold = self.settings.stale_after.as_millis() as u64;
        let removed = self.registry.sweep_stale(now, threshold);
        if !removed.is_empty() {
            info!(
                token = %self.room.token(),
                removed = removed.len(),
                connections = self.registry.len(),
                "closed stale connections"
            );
        }
    }

    async fn persist(&self) {
        if let Err(err) = self.store.save(&self.room.snapshot()).await {
            warn!(token = %self.room.token(), "failed to persist room: {}", err);
        }
    }

    fn send_history(&mut self, connection_id: &str) {
        let message = ServerMessage::ClipboardHistory {
            token: self.room.token().to_string(),
            history: self.room.history().to_vec(),
        };
        self.send_to(connection_id, &message);
    }

    fn send_error(&mut self, connection_id: &str, error: String) {
        let message = ServerMessage::Error {
            token: self.room.token().to_string(),
            error,
        };
        self.send_to(connection_id, &message);
    }

    fn send_to(&mut self, connection_id: &str, message: &ServerMessage) {
        match encode(message) {
            Ok(text) => {
                self.registry.send_to(connection_id, &text);
            }
            Err(err) => error!("failed to serialize server message: {}", err),
        }
    }

    fn broadcast(&mut self, message: &ServerMessage) {
        match encode(message) {
            Ok(text) => {
                self.registry.broadcast(&text);
            }
            Err(err) => error!("failed to serialize server message: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use corridor_core::MAX_HISTORY_ITEMS;

    use super::*;
    use crate::store::{MemoryRoomStore, StoreError, StoredRoom};

    #[derive(Debug)]
    struct FailingStore;

    #[async_trait]
    impl RoomStore for FailingStore {
        async fn load(&self, _token: &Token) -> Result<Option<StoredRoom>, StoreError> {
            Ok(None)
        }

        async fn save(&self, _room: &StoredRoom) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }
    }

    fn token() -> Token {
        Token::parse("abc123").unwrap()
    }

    fn actor_with(store: Arc<dyn RoomStore>) -> RoomActor {
        RoomActor::new(
            Room::new(token(), now_unix_ms()),
            store,
            RelaySettings::default(),
        )
    }

    fn recv_server(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> ServerMessage {
        match rx.try_recv().expect("expected a queued frame") {
            Outbound::Text(text) => serde_json::from_str(&text).expect("server message json"),
            Outbound::Close => panic!("unexpected close"),
        }
    }

    #[tokio::test]
    async fn new_connection_receives_history() {
        let mut actor = actor_with(Arc::new(MemoryRoomStore::new()));
        actor.accept_update("earlier".to_owned()).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        actor.on_connect("c1".to_owned(), tx);

        match recv_server(&mut rx) {
            ServerMessage::ClipboardHistory { token, history } => {
                assert_eq!(token, "abc123");
                assert_eq!(history.len(), 1);
                assert_eq!(history[0].content, "earlier");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_is_persisted_and_broadcast_to_sender_too() {
        let store = Arc::new(MemoryRoomStore::new());
        let mut actor = actor_with(store.clone());
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        actor.on_connect("a".to_owned(), tx_a);
        actor.on_connect("b".to_owned(), tx_b);
        recv_server(&mut rx_a);
        recv_server(&mut rx_b);

        actor
            .handle_message("a", r#"{"type":"clipboard_update","data":{"content":"hello"}}"#)
            .await;

        for rx in [&mut rx_a, &mut rx_b] {
            match recv_server(rx) {
                ServerMessage::ClipboardUpdate { data, .. } => assert_eq!(data.content, "hello"),
                other => panic!("unexpected message: {other:?}"),
            }
        }

        let stored = store.load(&token()).await.unwrap().unwrap();
        assert_eq!(stored.history.len(), 1);
        assert_eq!(stored.history[0].content, "hello");
    }

    #[tokio::test]
    async fn protocol_errors_go_to_sender_only() {
        let mut actor = actor_with(Arc::new(MemoryRoomStore::new()));
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        actor.on_connect("a".to_owned(), tx_a);
        actor.on_connect("b".to_owned(), tx_b);
        recv_server(&mut rx_a);
        recv_server(&mut rx_b);

        actor.handle_message("a", "{broken").await;
        actor.handle_message("a", r#"{"type":"teleport"}"#).await;
        actor
            .handle_message("a", r#"{"type":"clipboard_update","data":{}}"#)
            .await;

        for _ in 0..3 {
            assert!(matches!(recv_server(&mut rx_a), ServerMessage::Error { .. }));
        }
        assert!(rx_b.try_recv().is_err());
        assert!(actor.room().history().is_empty());
    }

    #[tokio::test]
    async fn unknown_type_error_names_type() {
        let mut actor = actor_with(Arc::new(MemoryRoomStore::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        actor.on_connect("a".to_owned(), tx);
        recv_server(&mut rx);

        actor.handle_message("a", r#"{"type":"teleport"}"#).await;
        match recv_server(&mut rx) {
            ServerMessage::Error { error, .. } => assert!(error.contains("teleport")),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_replies_pong_and_refreshes_keepalive() {
        let mut actor = actor_with(Arc::new(MemoryRoomStore::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        actor.on_connect("a".to_owned(), tx);
        recv_server(&mut rx);

        actor.handle_message("a", r#"{"type":"ping"}"#).await;
        assert_eq!(recv_server(&mut rx), ServerMessage::Pong);

        actor.sweep_stale(now_unix_ms() + 1_000);
        assert!(actor.registry().contains("a"));
        actor.sweep_stale(now_unix_ms() + STALE_CONNECTION_MS + 5_000);
        assert!(!actor.registry().contains("a"));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
    }

    #[tokio::test]
    async fn clear_broadcasts_empty_history() {
        let mut actor = actor_with(Arc::new(MemoryRoomStore::new()));
        actor.accept_update("x".to_owned()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        actor.on_connect("a".to_owned(), tx);
        recv_server(&mut rx);

        actor.handle_message("a", r#"{"type":"clear_history"}"#).await;
        match recv_server(&mut rx) {
            ServerMessage::ClipboardHistory { history, .. } => assert!(history.is_empty()),
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(actor.room().history().is_empty());
    }

    #[tokio::test]
    async fn store_failure_does_not_block_update() {
        let mut actor = actor_with(Arc::new(FailingStore));
        let (tx, mut rx) = mpsc::unbounded_channel();
        actor.on_connect("a".to_owned(), tx);
        recv_server(&mut rx);

        let item = actor.accept_update("still here".to_owned()).await;
        assert_eq!(actor.room().history()[0], item);
        assert!(matches!(
            recv_server(&mut rx),
            ServerMessage::ClipboardUpdate { .. }
        ));
    }

    #[tokio::test]
    async fn history_read_is_stable_without_mutation() {
        let mut actor = actor_with(Arc::new(MemoryRoomStore::new()));
        actor.accept_update("one".to_owned()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        actor.on_connect("a".to_owned(), tx);
        recv_server(&mut rx);

        actor.handle_message("a", r#"{"type":"clipboard_history"}"#).await;
        let first = recv_server(&mut rx);
        actor.handle_message("a", r#"{"type":"clipboard_history"}"#).await;
        let second = recv_server(&mut rx);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn handle_serializes_concurrent_updates() {
        let store: Arc<dyn RoomStore> = Arc::new(MemoryRoomStore::new());
        let handle = RoomHandle::spawn(token(), store.clone(), RelaySettings::default());

        let mut tasks = Vec::new();
        for n in 0..40 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle.update(format!("c{n}")).await.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let history = handle.history().await.unwrap();
        assert_eq!(history.len(), 40);
        let mut contents: Vec<_> = history.iter().map(|i| i.content.clone()).collect();
        contents.sort();
        contents.dedup();
        assert_eq!(contents.len(), 40);

        let stored = store.load(&token()).await.unwrap().unwrap();
        assert_eq!(stored.history, history);
    }

    #[tokio::test]
    async fn handle_restores_from_store() {
        let store: Arc<dyn RoomStore> = Arc::new(MemoryRoomStore::new());
        let first = RoomHandle::spawn(token(), store.clone(), RelaySettings::default());
        for n in 0..=MAX_HISTORY_ITEMS {
            first.update(n.to_string()).await.unwrap();
        }

        let second = RoomHandle::spawn(token(), store, RelaySettings::default());
        let history = second.history().await.unwrap();
        assert_eq!(history.len(), MAX_HISTORY_ITEMS);
        assert_eq!(history[0].content, MAX_HISTORY_ITEMS.to_string());
    }

    #[tokio::test]
    async fn zero_sweep_interval_keeps_the_actor_alive() {
        let settings = RelaySettings {
            sweep_interval: Duration::ZERO,
            ..RelaySettings::default()
        };
        let handle = RoomHandle::spawn(token(), Arc::new(MemoryRoomStore::new()), settings);
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.update("still here".to_owned()).await.unwrap();
        let history = handle.history().await.unwrap();
        assert_eq!(history[0].content, "still here");
    }

    #[tokio::test]
    async fn sweep_timer_closes_silent_connections() {
        let settings = RelaySettings {
            stale_after: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(20),
        };
        let handle = RoomHandle::spawn(token(), Arc::new(MemoryRoomStore::new()), settings);
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.connect("quiet".to_owned(), tx).unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(frame) = rx.recv().await {
                if frame == Outbound::Close {
                    return true;
                }
            }
            false
        })
        .await
        .expect("sweep should close the connection");
        assert!(closed);
    }
}
