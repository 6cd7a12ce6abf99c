use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use corridor_core::{
    ClientMessage, ContentError, ServerMessage, apply_content_limit, preview_text,
};
use futures::StreamExt;
use thiserror::Error;
use tokio::{
    sync::{Notify, mpsc},
    time::{Instant, MissedTickBehavior, timeout},
};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    backoff::ReconnectBackoff,
    clipboard::ClipboardIo,
    config::{ClientConfig, ConfigValidationError},
    queue::MessageQueue,
    transport::{HttpFallbackClient, TransportClient, TransportError, WsLink, WsSender},
};

/// How long inbound writes to the OS clipboard are hidden from the monitor.
pub const REMOTE_WRITE_GRACE: Duration = Duration::from_millis(200);
pub const RESUME_SETTLE_DELAY: Duration = Duration::from_millis(3_000);
pub const NETWORK_SETTLE_DELAY: Duration = Duration::from_millis(2_000);

const PREVIEW_CHARS: usize = 48;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    HttpFallback,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::HttpFallback => "http fallback",
        };
        f.write_str(label)
    }
}

/// What the host application hears about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    /// Content from another device, already written to the local clipboard.
    ClipboardReceived { content: String },
    /// Local content over the size limit with truncation disabled; nothing was sent.
    ContentRejected { length: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigValidationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Default)]
struct SyncState {
    is_updating_from_remote: bool,
    remote_writes: u64,
    last_sent_content: Option<String>,
    last_local_clipboard: Option<String>,
}

enum Wake {
    Cancelled,
    Elapsed,
    Reconnect,
}

enum SessionEnd {
    Cancelled,
    Reconnect,
    Lost(String),
}

struct Inner {
    config: ClientConfig,
    clipboard: Arc<dyn ClipboardIo>,
    queue: Arc<MessageQueue>,
    http: HttpFallbackClient,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: Mutex<ConnectionState>,
    sync: Mutex<SyncState>,
    /// Set only while a WebSocket session is live.
    ws: Mutex<Option<WsSender>>,
    queued: Notify,
    reconnect: Notify,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// Keeps one device in sync with its relay room.
///
/// Runs three loops until [`ConnectionManager::stop`]: the connection state
/// machine, the clipboard monitor, and the keepalive pinger.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Validates `config` and spawns the manager's loops on the current runtime.
    pub fn start(
        config: ClientConfig,
        clipboard: Arc<dyn ClipboardIo>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), StartError> {
        config.validate()?;
        let token = config.token()?;
        let transport =
            TransportClient::new(&config.websocket_url, &token, config.connect_timeout())?;
        let http = HttpFallbackClient::new(&config.http_url, &token, config.connect_timeout())?;
        let (events, event_rx) = mpsc::unbounded_channel();

        info!(
            websocket_url = %config.websocket_url,
            http_url = %config.http_url,
            "connection manager starting"
        );

        let inner = Arc::new(Inner {
            config,
            clipboard,
            queue: Arc::new(MessageQueue::new()),
            http,
            events,
            state: Mutex::new(ConnectionState::Disconnected),
            sync: Mutex::new(SyncState::default()),
            ws: Mutex::new(None),
            queued: Notify::new(),
            reconnect: Notify::new(),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        inner
            .tasks
            .spawn(connection_loop(Arc::clone(&inner), transport));
        inner.tasks.spawn(monitor_loop(Arc::clone(&inner)));
        inner.tasks.spawn(keepalive_loop(Arc::clone(&inner)));

        Ok((Self { inner }, event_rx))
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Updates waiting for a transport.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    /// Publishes `text` through the same size policy and queue as clipboard changes.
    pub fn send_text(&self, text: &str) -> Result<(), ContentError> {
        self.inner.publish(text)
    }

    /// The host woke from sleep: drop the link and reconnect once things settle.
    pub fn notify_resumed(&self) {
        self.schedule_reconnect(RESUME_SETTLE_DELAY, "resumed from sleep");
    }

    pub fn notify_network_available(&self) {
        self.schedule_reconnect(NETWORK_SETTLE_DELAY, "network available");
    }

    /// Stops every loop and closes the transport. All tasks have exited when
    /// this returns.
    pub async fn stop(self) {
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("connection manager stopped");
    }

    fn schedule_reconnect(&self, settle: Duration, reason: &'static str) {
        let inner = Arc::clone(&self.inner);
        self.inner.tasks.spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => {}
                _ = tokio::time::sleep(settle) => {
                    info!(reason, "forcing reconnect");
                    inner.reconnect.notify_one();
                }
            }
        });
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    fn sync(&self) -> MutexGuard<'_, SyncState> {
        self.sync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ws(&self) -> MutexGuard<'_, Option<WsSender>> {
        self.ws.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == next {
            return;
        }
        info!(from = %*state, to = %next, "connection state changed");
        *state = next;
        drop(state);
        self.emit(ClientEvent::StateChanged(next));
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Applies the size policy, then sends over the live socket or queues.
    fn publish(&self, content: &str) -> Result<(), ContentError> {
        let max = self.config.max_content_length;
        let outbound = match apply_content_limit(content, max, self.config.truncate_on_oversize) {
            Ok(outbound) => outbound.into_owned(),
            Err(err @ ContentError::TooLarge { length, max }) => {
                warn!(length, max, "clipboard content too large; not sending");
                self.emit(ClientEvent::ContentRejected { length, max });
                return Err(err);
            }
        };
        if outbound.len() != content.len() {
            info!(max, "clipboard content truncated to size limit");
        }

        self.sync().last_sent_content = Some(outbound.clone());

        // Holding the slot while queueing keeps a concurrent flush from
        // overtaking this update.
        let ws = self.ws();
        if let Some(sender) = ws.as_ref() {
            if sender.send(ClientMessage::update(outbound.clone())).is_ok() {
                debug!(preview = %preview_text(&outbound, PREVIEW_CHARS), "sent clipboard update");
                return Ok(());
            }
        }
        let queued = self.queue.enqueue(outbound);
        drop(ws);

        debug!(
            id = %queued.id,
            pending = self.queue.len(),
            "queued clipboard update"
        );
        self.queued.notify_one();
        Ok(())
    }

    async fn read_clipboard(&self) -> Option<String> {
        let clipboard = Arc::clone(&self.clipboard);
        match tokio::task::spawn_blocking(move || clipboard.read_text()).await {
            Ok(Ok(text)) => text,
            Ok(Err(err)) => {
                debug!("{}", err);
                None
            }
            Err(err) => {
                warn!("clipboard read task failed: {}", err);
                None
            }
        }
    }

    async fn pause(&self, delay: Duration) -> Wake {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Wake::Cancelled,
            _ = self.reconnect.notified() => Wake::Reconnect,
            _ = tokio::time::sleep(delay) => Wake::Elapsed,
        }
    }

    async fn run_session(self: &Arc<Self>, link: WsLink) -> SessionEnd {
        let WsLink {
            sender,
            mut read,
            mut writer,
        } = link;

        {
            let mut ws = self.ws();
            self.flush_over_websocket(&sender);
            *ws = Some(sender);
        }

        let mut writer_done = false;
        let end = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break SessionEnd::Cancelled,
                _ = self.reconnect.notified() => break SessionEnd::Reconnect,
                _ = &mut writer => {
                    writer_done = true;
                    break SessionEnd::Lost("socket writer stopped".to_owned());
                }
                next = read.next() => match next {
                    Some(Ok(Message::Text(text))) => self.handle_server_text(text.as_str()).await,
                    Some(Ok(Message::Close(frame))) => {
                        break SessionEnd::Lost(format!("closed by relay: {frame:?}"));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break SessionEnd::Lost(err.to_string()),
                    None => break SessionEnd::Lost("stream ended".to_owned()),
                },
            }
        };

        // Dropping the last sender lets the writer flush and close the socket.
        self.ws().take();
        if !writer_done && timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
            writer.abort();
        }
        end
    }

    fn flush_over_websocket(&self, sender: &WsSender) {
        let pending = self.queue.drain_all();
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "flushing queued updates over websocket");

        let mut remaining = pending.into_iter();
        while let Some(message) = remaining.next() {
            if sender
                .send(ClientMessage::update(message.content.clone()))
                .is_err()
            {
                let mut undelivered = vec![message];
                undelivered.extend(remaining);
                self.queue.restore(undelivered);
                return;
            }
        }
    }

    async fn run_http_fallback(&self) -> Wake {
        warn!(
            retry_in_ms = self.config.http_retry_interval_ms,
            "websocket unavailable; using http fallback"
        );
        let retry_at = Instant::now() + self.config.http_retry_interval();

        loop {
            if self.flush_over_http().await.is_err() {
                return Wake::Cancelled;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Wake::Cancelled,
                _ = self.reconnect.notified() => return Wake::Reconnect,
                _ = tokio::time::sleep_until(retry_at) => return Wake::Elapsed,
                _ = self.queued.notified() => {}
            }
        }
    }

    /// Sends queued updates one by one. Stops at the first failure and puts
    /// the rest back. `Err` means the manager is shutting down.
    async fn flush_over_http(&self) -> Result<(), ()> {
        let pending = self.queue.drain_all();
        if pending.is_empty() {
            return Ok(());
        }
        info!(count = pending.len(), "flushing queued updates over http");

        let mut remaining = pending.into_iter();
        while let Some(message) = remaining.next() {
            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = self.http.send_clipboard(&message.content) => Some(result),
            };
            match sent {
                Some(Ok(item)) => debug!(id = %item.id, "update delivered over http"),
                Some(Err(err)) => {
                    warn!("http send failed: {}", err);
                    let mut undelivered = vec![message];
                    undelivered.extend(remaining);
                    self.queue.restore(undelivered);
                    return Ok(());
                }
                None => {
                    let mut undelivered = vec![message];
                    undelivered.extend(remaining);
                    self.queue.restore(undelivered);
                    return Err(());
                }
            }
        }
        Ok(())
    }

    async fn handle_server_text(self: &Arc<Self>, text: &str) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(ServerMessage::ClipboardUpdate { data, .. }) => self.apply_remote(data.content).await,
            Ok(ServerMessage::ClipboardHistory { history, .. }) => {
                debug!(items = history.len(), "history received");
            }
            Ok(ServerMessage::Pong) => debug!("pong"),
            Ok(ServerMessage::Error { error, .. }) => warn!("relay reported an error: {}", error),
            Err(err) => warn!("undecodable relay message: {}", err),
        }
    }

    /// Writes an inbound update to the OS clipboard unless it is this
    /// device's own echo.
    async fn apply_remote(self: &Arc<Self>, content: String) {
        let generation = {
            let mut sync = self.sync();
            if sync.last_sent_content.as_deref() == Some(content.as_str()) {
                debug!("ignoring echo of our own update");
                sync.last_local_clipboard = Some(content);
                return;
            }
            sync.is_updating_from_remote = true;
            sync.remote_writes = sync.remote_writes.wrapping_add(1);
            sync.last_local_clipboard = Some(content.clone());
            sync.remote_writes
        };

        let clipboard = Arc::clone(&self.clipboard);
        let to_write = content.clone();
        match tokio::task::spawn_blocking(move || clipboard.write_text(&to_write)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("{}", err),
            Err(err) => warn!("clipboard write task failed: {}", err),
        }

        info!(preview = %preview_text(&content, PREVIEW_CHARS), "clipboard received");
        self.emit(ClientEvent::ClipboardReceived { content });

        let inner = Arc::clone(self);
        self.tasks.spawn(async move {
            tokio::time::sleep(REMOTE_WRITE_GRACE).await;
            let mut sync = inner.sync();
            if sync.remote_writes == generation {
                sync.is_updating_from_remote = false;
            }
        });
    }
}

async fn connection_loop(inner: Arc<Inner>, transport: TransportClient) {
    let mut backoff = ReconnectBackoff::default();
    let mut failed_attempts: u32 = 0;
    // Once the WebSocket has been given up on, a failed retry goes straight
    // back to HTTP instead of through the backoff.
    let mut in_fallback = false;

    loop {
        inner.set_state(ConnectionState::Connecting);

        let attempt = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            result = transport.connect(Arc::clone(&inner.queue)) => result,
        };

        let wake = match attempt {
            Ok(link) => {
                backoff.reset();
                failed_attempts = 0;
                in_fallback = false;
                inner.set_state(ConnectionState::Connected);

                match inner.run_session(link).await {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Reconnect => Wake::Reconnect,
                    SessionEnd::Lost(reason) => {
                        warn!("relay connection lost: {}", reason);
                        inner.set_state(ConnectionState::Disconnected);
                        let delay = backoff.next_delay();
                        info!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
                        inner.pause(delay).await
                    }
                }
            }
            Err(err) => {
                failed_attempts += 1;
                warn!(attempt = failed_attempts, "websocket connect failed: {}", err);

                if in_fallback || failed_attempts >= inner.config.connect_attempts {
                    failed_attempts = 0;
                    in_fallback = true;
                    inner.set_state(ConnectionState::HttpFallback);
                    inner.run_http_fallback().await
                } else {
                    let delay = backoff.next_delay();
                    inner.set_state(ConnectionState::Disconnected);
                    debug!(delay_ms = delay.as_millis() as u64, "retrying after backoff");
                    inner.pause(delay).await
                }
            }
        };

        match wake {
            Wake::Cancelled => break,
            Wake::Reconnect => {
                backoff.reset();
                failed_attempts = 0;
                in_fallback = false;
            }
            Wake::Elapsed => {}
        }
    }

    inner.ws().take();
    inner.set_state(ConnectionState::Disconnected);
}

async fn monitor_loop(inner: Arc<Inner>) {
    // Whatever is on the clipboard at launch is not a new copy.
    let initial = inner
        .read_clipboard()
        .await
        .filter(|text| !text.trim().is_empty());
    inner.sync().last_local_clipboard = initial;

    let mut ticker = tokio::time::interval(inner.config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if inner.sync().is_updating_from_remote {
            continue;
        }
        let Some(text) = inner.read_clipboard().await else {
            continue;
        };
        if text.trim().is_empty() {
            continue;
        }

        {
            let mut sync = inner.sync();
            if sync.is_updating_from_remote
                || sync.last_local_clipboard.as_deref() == Some(text.as_str())
            {
                continue;
            }
            sync.last_local_clipboard = Some(text.clone());
        }

        debug!(preview = %preview_text(&text, PREVIEW_CHARS), "local clipboard changed");
        let _ = inner.publish(&text);
    }
}

async fn keepalive_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.keepalive_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let sender = inner.ws().clone();
        if let Some(sender) = sender {
            if sender.send(ClientMessage::Ping).is_err() {
                debug!("keepalive skipped; socket writer stopped");
            }
        }
    }
}
