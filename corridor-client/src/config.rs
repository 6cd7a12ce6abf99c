use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use corridor_core::{
    DEFAULT_MAX_CONTENT_LENGTH, HTTP_RETRY_INTERVAL_MS, KEEPALIVE_INTERVAL_MS, Token,
};
use serde::{Deserialize, Serialize};
use url::Url;

/// `config.json` is expected to be tiny; anything larger is treated as corrupt.
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;

const APP_DIR_NAME: &str = "Corridor";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub token: String,
    pub websocket_url: String,
    /// Base of the HTTP API; the clipboard endpoint is `{http_url}/clipboard/{token}`.
    pub http_url: String,
    /// Measured in characters.
    pub max_content_length: usize,
    pub truncate_on_oversize: bool,
    pub poll_interval_ms: u64,
    pub keepalive_interval_ms: u64,
    pub http_retry_interval_ms: u64,
    pub connect_timeout_ms: u64,
    /// Consecutive failed WebSocket attempts before switching to HTTP.
    pub connect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            websocket_url: "ws://127.0.0.1:8080/ws".to_owned(),
            http_url: "http://127.0.0.1:8080/api".to_owned(),
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            truncate_on_oversize: true,
            poll_interval_ms: 1_000,
            keepalive_interval_ms: KEEPALIVE_INTERVAL_MS,
            http_retry_interval_ms: HTTP_RETRY_INTERVAL_MS,
            connect_timeout_ms: 10_000,
            connect_attempts: 3,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let mut problems: Vec<String> = Vec::new();

        if let Err(err) = Token::parse(self.token.trim()) {
            problems.push(format!("token: {err}"));
        }

        check_url(&self.websocket_url, "websocket_url", &["ws", "wss"], &mut problems);
        check_url(&self.http_url, "http_url", &["http", "https"], &mut problems);

        for (name, value) in [
            ("max_content_length", self.max_content_length as u64),
            ("poll_interval_ms", self.poll_interval_ms),
            ("keepalive_interval_ms", self.keepalive_interval_ms),
            ("http_retry_interval_ms", self.http_retry_interval_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("connect_attempts", u64::from(self.connect_attempts)),
        ] {
            if value == 0 {
                problems.push(format!("{name} must be greater than zero"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigValidationError { problems })
        }
    }

    /// The validated room token.
    pub fn token(&self) -> Result<Token, ConfigValidationError> {
        Token::parse(self.token.trim()).map_err(|err| ConfigValidationError {
            problems: vec![format!("token: {err}")],
        })
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    #[must_use]
    pub fn http_retry_interval(&self) -> Duration {
        Duration::from_millis(self.http_retry_interval_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn check_url(raw: &str, field: &str, schemes: &[&str], problems: &mut Vec<String>) {
    let raw = raw.trim();
    if raw.is_empty() {
        problems.push(format!("{field} is required"));
        return;
    }
    match Url::parse(raw) {
        Ok(url) if schemes.contains(&url.scheme()) => {}
        Ok(url) => problems.push(format!(
            "{field} must use {} (got {})",
            schemes.join(" or "),
            url.scheme()
        )),
        Err(err) => problems.push(format!("{field} is invalid: {err}")),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigValidationError {
    pub problems: Vec<String>,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid config: {}", self.problems.join("; "))
    }
}

impl std::error::Error for ConfigValidationError {}

#[derive(Debug)]
pub enum ConfigLoadError {
    Metadata(io::Error),
    TooLarge { size: u64, max: u64 },
    Read(io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for ConfigLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigLoadError::Metadata(e) => write!(f, "metadata read failed: {e}"),
            ConfigLoadError::TooLarge { size, max } => {
                write!(f, "file too large: {size} bytes (max {max})")
            }
            ConfigLoadError::Read(e) => write!(f, "read failed: {e}"),
            ConfigLoadError::Parse(e) => write!(f, "parse failed: {e}"),
        }
    }
}

impl std::error::Error for ConfigLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigLoadError::Metadata(e) => Some(e),
            ConfigLoadError::Read(e) => Some(e),
            ConfigLoadError::Parse(e) => Some(e),
            ConfigLoadError::TooLarge { .. } => None,
        }
    }
}

#[derive(Debug)]
pub enum ConfigSaveError {
    Invalid(ConfigValidationError),
    Serialize(serde_json::Error),
    WriteTmp(io::Error),
    Rename(io::Error),
}

impl std::fmt::Display for ConfigSaveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSaveError::Invalid(e) => write!(f, "{e}"),
            ConfigSaveError::Serialize(e) => write!(f, "serialize failed: {e}"),
            ConfigSaveError::WriteTmp(e) => write!(f, "tmp write failed: {e}"),
            ConfigSaveError::Rename(e) => write!(f, "rename failed: {e}"),
        }
    }
}

impl std::error::Error for ConfigSaveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigSaveError::Invalid(e) => Some(e),
            ConfigSaveError::Serialize(e) => Some(e),
            ConfigSaveError::WriteTmp(e) => Some(e),
            ConfigSaveError::Rename(e) => Some(e),
        }
    }
}

/// Directory holding `config.json` and `logs/`.
///
/// `CORRIDOR_CONFIG_DIR` wins; otherwise the platform's per-user config base.
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("CORRIDOR_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }

    let base = std::env::var_os("APPDATA")
        .or_else(|| std::env::var_os("XDG_CONFIG_HOME"))
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(APP_DIR_NAME)
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

pub fn log_path() -> PathBuf {
    let dir = config_dir().join("logs");
    let _ = fs::create_dir_all(&dir);
    dir.join("corridor-client.log")
}

pub fn parse_config_json(data: &str) -> Result<ClientConfig, serde_json::Error> {
    serde_json::from_str::<ClientConfig>(data)
}

/// `Ok(None)` when no config has been saved yet. The result is not validated.
pub fn load_config_from_path(path: &Path) -> Result<Option<ClientConfig>, ConfigLoadError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(ConfigLoadError::Metadata(err)),
    };
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(ConfigLoadError::TooLarge {
            size: meta.len(),
            max: MAX_CONFIG_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(ConfigLoadError::Read)?;
    parse_config_json(&data)
        .map(Some)
        .map_err(ConfigLoadError::Parse)
}

pub fn save_config_to_path(path: &Path, config: &ClientConfig) -> Result<(), ConfigSaveError> {
    config.validate().map_err(ConfigSaveError::Invalid)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(ConfigSaveError::WriteTmp)?;
    }

    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(config).map_err(ConfigSaveError::Serialize)?;
    fs::write(&tmp, payload.as_bytes()).map_err(ConfigSaveError::WriteTmp)?;

    fs::rename(&tmp, path).map_err(ConfigSaveError::Rename)?;
    Ok(())
}

pub fn save_config_with_retry(path: &Path, config: &ClientConfig) -> Result<(), ConfigSaveError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let mut attempt: u32 = 1;
    loop {
        match save_config_to_path(path, config) {
            Ok(()) => return Ok(()),
            // Retrying cannot fix an invalid config.
            Err(err @ ConfigSaveError::Invalid(_)) => return Err(err),
            Err(err) => {
                if attempt >= MAX_ATTEMPTS {
                    return Err(err);
                }
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}
