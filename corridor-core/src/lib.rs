use std::{
    borrow::Cow,
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const MAX_HISTORY_ITEMS: usize = 50;
pub const MIN_TOKEN_LEN: usize = 3;
pub const MAX_RELAY_MESSAGE_BYTES: usize = 4 * 1024 * 1024;
pub const STALE_CONNECTION_MS: u64 = 60_000;
pub const STALE_SWEEP_INTERVAL_MS: u64 = 30_000;
pub const KEEPALIVE_INTERVAL_MS: u64 = 30_000;
pub const HTTP_RETRY_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 1024 * 1024;
pub const TRUNCATION_MARKER: &str = "\n\n[Content truncated due to size limit]";

/// Opaque room credential. Only `[A-Za-z0-9_-]`, at least three characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Token(String);

impl Token {
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        if raw.is_empty() {
            return Err(TokenError::Missing);
        }
        if raw.len() < MIN_TOKEN_LEN {
            return Err(TokenError::Invalid);
        }
        let allowed = raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !allowed {
            return Err(TokenError::Invalid);
        }
        Ok(Self(raw.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Token {
    type Error = TokenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Token::parse(&value)
    }
}

impl From<Token> for String {
    fn from(token: Token) -> Self {
        token.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClipboardItem {
    pub id: String,
    pub content: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateData {
    pub content: String,
}

/// Messages a device sends to the relay.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    ClipboardUpdate { data: UpdateData },
    ClipboardHistory,
    ClearHistory,
}

impl ClientMessage {
    #[must_use]
    pub fn update(content: impl Into<String>) -> Self {
        ClientMessage::ClipboardUpdate {
            data: UpdateData {
                content: content.into(),
            },
        }
    }
}

/// Messages the relay sends to devices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Pong,
    ClipboardUpdate {
        token: String,
        data: ClipboardItem,
    },
    ClipboardHistory {
        token: String,
        history: Vec<ClipboardItem>,
    },
    Error {
        token: String,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub data: ClipboardItem,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClearResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("Token required")]
    Missing,
    #[error("Invalid token")]
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("JSON parse error: {0}")]
    Malformed(String),
    #[error("message type is missing")]
    MissingType,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("clipboard_update requires non-empty data.content")]
    MissingContent,
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentError {
    #[error("content too large: {length} chars (max: {max})")]
    TooLarge { length: usize, max: usize },
}

pub fn decode_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?;

    match kind {
        "ping" => Ok(ClientMessage::Ping),
        "clipboard_history" => Ok(ClientMessage::ClipboardHistory),
        "clear_history" => Ok(ClientMessage::ClearHistory),
        "clipboard_update" => {
            let content = update_content(&value).ok_or(ProtocolError::MissingContent)?;
            Ok(ClientMessage::update(content))
        }
        other => Err(ProtocolError::UnknownType(other.to_owned())),
    }
}

/// Extracts a non-empty `data.content` string from an update body.
#[must_use]
pub fn update_content(value: &Value) -> Option<&str> {
    value
        .pointer("/data/content")
        .and_then(Value::as_str)
        .filter(|content| !content.is_empty())
}

pub fn encode<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(|err| ProtocolError::Serialization(err.to_string()))
}

/// Applies the outbound size policy. Length is measured in characters.
///
/// Oversized content is either cut to exactly `max_chars` characters followed
/// by [`TRUNCATION_MARKER`], or rejected.
pub fn apply_content_limit(
    content: &str,
    max_chars: usize,
    truncate: bool,
) -> Result<Cow<'_, str>, ContentError> {
    let Some((cut, _)) = content.char_indices().nth(max_chars) else {
        return Ok(Cow::Borrowed(content));
    };

    if !truncate {
        return Err(ContentError::TooLarge {
            length: content.chars().count(),
            max: max_chars,
        });
    }

    let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
    out.push_str(&content[..cut]);
    out.push_str(TRUNCATION_MARKER);
    Ok(Cow::Owned(out))
}

/// Short single-line preview for log lines.
#[must_use]
pub fn preview_text(text: &str, max_chars: usize) -> String {
    let mut out = String::new();
    for (index, ch) in text.chars().enumerate() {
        if index >= max_chars {
            out.push_str("...");
            break;
        }
        out.push(if ch.is_control() { ' ' } else { ch });
    }
    out
}

#[must_use]
pub fn now_unix_ms() -> u64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    duration.as_millis() as u64
}
