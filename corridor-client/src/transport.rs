use std::{sync::Arc, time::Duration};

use corridor_core::{
    ClientMessage, ClipboardItem, ServerMessage, Token, UpdateResponse, encode,
};
use futures::{
    SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use thiserror::Error;
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle, time::timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tracing::{debug, warn};
use url::Url;

use crate::queue::{MessageQueue, QueuedMessage};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsRead = SplitStream<WsStream>;
type WsWrite = SplitSink<WsStream, Message>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected relay response: {0}")]
    UnexpectedResponse(String),
}

/// Appends the token query parameter to the relay's WebSocket endpoint.
pub fn websocket_url(base: &str, token: &Token) -> Result<Url, TransportError> {
    let mut url = Url::parse(base.trim())?;
    url.query_pairs_mut().append_pair("token", token.as_str());
    Ok(url)
}

/// Cloneable handle for queuing frames on an open socket.
#[derive(Debug, Clone)]
pub struct WsSender {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl WsSender {
    /// Hands the message back when the socket's writer has already stopped.
    pub fn send(&self, message: ClientMessage) -> Result<(), ClientMessage> {
        self.tx.send(message).map_err(|err| err.0)
    }
}

/// An open relay session. Dropping every [`WsSender`] closes the socket.
#[derive(Debug)]
pub struct WsLink {
    pub sender: WsSender,
    pub read: WsRead,
    pub writer: JoinHandle<()>,
}

#[derive(Debug, Clone)]
pub struct TransportClient {
    url: Url,
    connect_timeout: Duration,
}

impl TransportClient {
    pub fn new(base_url: &str, token: &Token, connect_timeout: Duration) -> Result<Self, TransportError> {
        Ok(Self {
            url: websocket_url(base_url, token)?,
            connect_timeout,
        })
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Opens the socket and starts its writer task. Updates the writer fails
    /// to deliver are pushed back onto `queue`.
    pub async fn connect(&self, queue: Arc<MessageQueue>) -> Result<WsLink, TransportError> {
        let (ws_stream, _) = timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))??;

        let (write_half, read_half) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel::<ClientMessage>();
        let writer = tokio::spawn(network_send_task(write_half, rx, queue));

        Ok(WsLink {
            sender: WsSender { tx },
            read: read_half,
            writer,
        })
    }
}

async fn network_send_task(
    mut ws_write: WsWrite,
    mut outgoing_rx: mpsc::UnboundedReceiver<ClientMessage>,
    queue: Arc<MessageQueue>,
) {
    while let Some(message) = outgoing_rx.recv().await {
        let frame = match encode(&message) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("failed to encode outgoing message: {}", err);
                continue;
            }
        };

        if let Err(err) = ws_write.send(Message::Text(frame.into())).await {
            warn!("websocket write failed: {}", err);
            requeue_undelivered(&queue, message, &mut outgoing_rx).await;
            return;
        }
    }

    let _ = ws_write.close().await;
}

/// Closes the channel and puts `failed` plus every update still buffered
/// behind it back at the front of `queue`, in send order. Anything queued
/// after the close is newer and stays behind them.
async fn requeue_undelivered(
    queue: &MessageQueue,
    failed: ClientMessage,
    outgoing_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
) {
    outgoing_rx.close();
    let mut undelivered = Vec::new();
    let mut next = Some(failed);
    while let Some(message) = next {
        if let ClientMessage::ClipboardUpdate { data } = message {
            undelivered.push(QueuedMessage::new(data.content));
        }
        next = outgoing_rx.recv().await;
    }
    if !undelivered.is_empty() {
        debug!(count = undelivered.len(), "re-queuing undelivered updates");
        queue.restore(undelivered);
    }
}

/// Request/response access to the relay's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpFallbackClient {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpFallbackClient {
    pub fn new(base_url: &str, token: &Token, request_timeout: Duration) -> Result<Self, TransportError> {
        let base = base_url.trim().trim_end_matches('/');
        let endpoint = Url::parse(&format!("{base}/clipboard/{token}"))?;
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client, endpoint })
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Publishes one update; returns the item the relay created.
    pub async fn send_clipboard(&self, content: &str) -> Result<ClipboardItem, TransportError> {
        let body = serde_json::json!({ "data": { "content": content } });
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;
        let parsed: UpdateResponse = response.json().await?;
        Ok(parsed.data)
    }

    pub async fn fetch_history(&self) -> Result<Vec<ClipboardItem>, TransportError> {
        let response = self.client.get(self.endpoint.clone()).send().await?;
        let response = check_status(response).await?;
        match response.json::<ServerMessage>().await? {
            ServerMessage::ClipboardHistory { history, .. } => Ok(history),
            other => Err(TransportError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    pub async fn clear_history(&self) -> Result<(), TransportError> {
        let response = self.client.delete(self.endpoint.clone()).send().await?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Status {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> Token {
        Token::parse("abc123").unwrap()
    }

    #[test]
    fn websocket_url_carries_token() {
        let url = websocket_url("ws://relay.local:8080/ws", &token()).unwrap();
        assert_eq!(url.as_str(), "ws://relay.local:8080/ws?token=abc123");
    }

    #[test]
    fn websocket_url_keeps_existing_query() {
        let url = websocket_url("wss://relay.local/ws?v=2", &token()).unwrap();
        assert_eq!(url.as_str(), "wss://relay.local/ws?v=2&token=abc123");
    }

    #[test]
    fn websocket_url_rejects_garbage() {
        assert!(matches!(
            websocket_url("not a url", &token()),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[test]
    fn http_endpoint_joins_base_and_token() {
        for base in ["http://relay.local/api", "http://relay.local/api/"] {
            let client = HttpFallbackClient::new(base, &token(), Duration::from_secs(5)).unwrap();
            assert_eq!(
                client.endpoint().as_str(),
                "http://relay.local/api/clipboard/abc123"
            );
        }
    }

    #[tokio::test]
    async fn undelivered_updates_go_back_ahead_of_newer_ones() {
        let queue = MessageQueue::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(ClientMessage::update("b")).unwrap();
        tx.send(ClientMessage::Ping).unwrap();
        tx.send(ClientMessage::update("c")).unwrap();
        queue.enqueue("published after close");

        requeue_undelivered(&queue, ClientMessage::update("a"), &mut rx).await;

        let contents: Vec<_> = queue.drain_all().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, ["a", "b", "c", "published after close"]);
        assert!(tx.send(ClientMessage::update("late")).is_err());
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = TransportClient::new(
            &format!("ws://{addr}/ws"),
            &token(),
            Duration::from_secs(2),
        )
        .unwrap();
        let err = client
            .connect(Arc::new(MessageQueue::new()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::WebSocket(_) | TransportError::Timeout(_)
        ));
    }

    #[tokio::test]
    async fn http_connect_failure_is_reported() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client =
            HttpFallbackClient::new(&format!("http://{addr}/api"), &token(), Duration::from_secs(2))
                .unwrap();
        assert!(matches!(
            client.send_clipboard("x").await,
            Err(TransportError::Http(_))
        ));
    }
}
