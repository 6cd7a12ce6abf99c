use std::sync::{Mutex, PoisonError};

use arboard::Clipboard;
use thiserror::Error;

/// Blocking access to a text clipboard.
///
/// Implementations may block on the OS; async callers go through
/// `spawn_blocking`.
pub trait ClipboardIo: Send + Sync + 'static {
    /// `Ok(None)` when the clipboard holds no text.
    fn read_text(&self) -> Result<Option<String>, ClipboardError>;
    fn write_text(&self, text: &str) -> Result<(), ClipboardError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClipboardError {
    #[error("clipboard unavailable: {0}")]
    Unavailable(String),
    #[error("clipboard read failed: {0}")]
    Read(String),
    #[error("clipboard write failed: {0}")]
    Write(String),
}

/// The OS clipboard. A fresh handle is opened per call so a clipboard owned
/// by another process only fails that one poll.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClipboard;

impl ClipboardIo for SystemClipboard {
    fn read_text(&self) -> Result<Option<String>, ClipboardError> {
        let mut clipboard =
            Clipboard::new().map_err(|err| ClipboardError::Unavailable(err.to_string()))?;
        match clipboard.get_text() {
            Ok(text) => Ok(Some(text)),
            Err(arboard::Error::ContentNotAvailable) => Ok(None),
            Err(err) => Err(ClipboardError::Read(err.to_string())),
        }
    }

    fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        let mut clipboard =
            Clipboard::new().map_err(|err| ClipboardError::Unavailable(err.to_string()))?;
        clipboard
            .set_text(text.to_owned())
            .map_err(|err| ClipboardError::Write(err.to_string()))
    }
}

/// In-process clipboard for headless hosts and tests.
#[derive(Debug, Default)]
pub struct MemoryClipboard {
    text: Mutex<Option<String>>,
}

impl MemoryClipboard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            text: Mutex::new(Some(text.into())),
        }
    }

    /// Simulates a local copy.
    pub fn set(&self, text: impl Into<String>) {
        *self.text.lock().unwrap_or_else(PoisonError::into_inner) = Some(text.into());
    }

    #[must_use]
    pub fn get(&self) -> Option<String> {
        self.text
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ClipboardIo for MemoryClipboard {
    fn read_text(&self) -> Result<Option<String>, ClipboardError> {
        Ok(self.get())
    }

    fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        self.set(text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_clipboard_reads_back_writes() {
        let clipboard = MemoryClipboard::new();
        assert_eq!(clipboard.read_text().unwrap(), None);

        clipboard.write_text("copied").unwrap();
        assert_eq!(clipboard.read_text().unwrap().as_deref(), Some("copied"));

        clipboard.set("replaced");
        assert_eq!(clipboard.get().as_deref(), Some("replaced"));
    }

    #[test]
    fn clipboard_errors_render_their_cause() {
        let err = ClipboardError::Write("locked".to_owned());
        assert_eq!(err.to_string(), "clipboard write failed: locked");
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(err);
        assert_eq!(boxed.to_string(), "clipboard write failed: locked");
        assert_eq!(
            ClipboardError::Unavailable("no display".to_owned()).to_string(),
            "clipboard unavailable: no display"
        );
    }
}
