pub mod actor;
pub mod registry;
pub mod room;
pub mod store;

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Path, Query, State, WebSocketUpgrade,
        rejection::JsonRejection,
        ws::{Message, WebSocket, rejection::WebSocketUpgradeRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{any, get},
};
use corridor_core::{
    ClearResponse, ErrorBody, MAX_RELAY_MESSAGE_BYTES, ServerMessage, Token, TokenError,
    UpdateResponse, now_unix_ms, update_content,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use actor::{RelaySettings, RoomActor, RoomHandle, RoomUnavailable};
pub use registry::{ConnectionRegistry, Outbound};
pub use room::Room;
pub use store::{FileRoomStore, MemoryRoomStore, RoomStore, StoreError, StoredRoom};

#[derive(Debug)]
struct RelayState {
    rooms: RwLock<HashMap<Token, RoomHandle>>,
    store: Arc<dyn RoomStore>,
    settings: RelaySettings,
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RelayState>,
}

impl AppState {
    /// In-memory rooms with default sweep settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryRoomStore::new()), RelaySettings::default())
    }

    #[must_use]
    pub fn with_store(store: Arc<dyn RoomStore>, settings: RelaySettings) -> Self {
        Self {
            inner: Arc::new(RelayState {
                rooms: RwLock::new(HashMap::new()),
                store,
                settings,
            }),
        }
    }

    /// Returns the actor for `token`, starting it on first use.
    pub async fn room(&self, token: &Token) -> RoomHandle {
        if let Some(handle) = self.inner.rooms.read().await.get(token) {
            return handle.clone();
        }

        let mut rooms = self.inner.rooms.write().await;
        rooms
            .entry(token.clone())
            .or_insert_with(|| {
                debug!(token = %token, "starting room actor");
                RoomHandle::spawn(
                    token.clone(),
                    self.inner.store.clone(),
                    self.inner.settings,
                )
            })
            .clone()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.rooms.read().await.len()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/clipboard", any(missing_token_handler))
        .route("/api/clipboard/", any(missing_token_handler))
        .route(
            "/api/clipboard/{token}",
            get(history_handler)
                .post(update_handler)
                .delete(clear_handler),
        )
        .fallback(not_found_handler)
        .layer(DefaultBodyLimit::max(MAX_RELAY_MESSAGE_BYTES))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "relay listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "timestamp": now_unix_ms()}))
}

async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}

async fn missing_token_handler() -> Response {
    json_error(StatusCode::BAD_REQUEST, TokenError::Missing.to_string())
}

#[derive(Debug, Deserialize)]
struct WsParams {
    token: Option<String>,
}

async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let token = match Token::parse(params.token.as_deref().unwrap_or_default()) {
        Ok(token) => token,
        Err(err) => return (token_status(&err), err.to_string()).into_response(),
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let room = state.room(&token).await;
    ws.max_message_size(MAX_RELAY_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_socket(room, socket))
}

async fn handle_socket(room: RoomHandle, socket: WebSocket) {
    let connection_id = Uuid::new_v4().simple().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

    // Transport-level pings keep idle reverse proxies from dropping the
    // socket; pongs queued by the read half only flush when this half writes.
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let mut send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(Outbound::Text(text)) => {
                            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(Outbound::Close) => {
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    if room.connect(connection_id.clone(), outbound_tx).is_err() {
        error!(token = %room.token(), "room actor unavailable; dropping socket");
        send_task.abort();
        return;
    }

    loop {
        tokio::select! {
            next = ws_receiver.next() => {
                let message = match next {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        warn!(connection_id = %connection_id, "websocket receive error: {}", err);
                        break;
                    }
                    None => break,
                };

                let raw = match message {
                    Message::Text(text) => text.as_str().to_owned(),
                    Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!(connection_id = %connection_id, "dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                if room.message(connection_id.clone(), raw).is_err() {
                    break;
                }
            }
            _ = &mut send_task => break,
        }
    }

    room.disconnect(connection_id);
    send_task.abort();
}

async fn history_handler(State(state): State<AppState>, Path(raw): Path<String>) -> Response {
    let room = match resolve_room(&state, &raw).await {
        Ok(room) => room,
        Err(response) => return response,
    };

    match room.history().await {
        Ok(history) => Json(ServerMessage::ClipboardHistory {
            token: room.token().to_string(),
            history,
        })
        .into_response(),
        Err(err) => unavailable(err),
    }
}

async fn update_handler(
    State(state): State<AppState>,
    Path(raw): Path<String>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let room = match resolve_room(&state, &raw).await {
        Ok(room) => room,
        Err(response) => return response,
    };

    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            debug!(token = %room.token(), "rejected update body: {}", rejection);
            return json_error(StatusCode::BAD_REQUEST, "Invalid JSON or request format");
        }
    };

    let Some(content) = update_content(&body) else {
        return json_error(StatusCode::BAD_REQUEST, "Content required");
    };

    match room.update(content.to_owned()).await {
        Ok(item) => Json(UpdateResponse {
            success: true,
            message: Some("Clipboard updated successfully".to_owned()),
            data: item,
        })
        .into_response(),
        Err(err) => unavailable(err),
    }
}

async fn clear_handler(State(state): State<AppState>, Path(raw): Path<String>) -> Response {
    let room = match resolve_room(&state, &raw).await {
        Ok(room) => room,
        Err(response) => return response,
    };

    match room.clear().await {
        Ok(()) => Json(ClearResponse {
            success: true,
            message: Some("History cleared successfully".to_owned()),
        })
        .into_response(),
        Err(err) => unavailable(err),
    }
}

async fn resolve_room(state: &AppState, raw: &str) -> Result<RoomHandle, Response> {
    match Token::parse(raw) {
        Ok(token) => Ok(state.room(&token).await),
        Err(err) => Err(json_error(token_status(&err), err.to_string())),
    }
}

fn token_status(err: &TokenError) -> StatusCode {
    match err {
        TokenError::Missing => StatusCode::BAD_REQUEST,
        TokenError::Invalid => StatusCode::UNAUTHORIZED,
    }
}

fn json_error(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: error.into(),
        }),
    )
        .into_response()
}

fn unavailable(err: RoomUnavailable) -> Response {
    error!("{}", err);
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "Room unavailable")
}
