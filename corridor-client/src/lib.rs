pub mod backoff;
pub mod clipboard;
pub mod config;
pub mod manager;
pub mod queue;
pub mod transport;

pub use backoff::ReconnectBackoff;
pub use clipboard::{ClipboardError, ClipboardIo, MemoryClipboard, SystemClipboard};
pub use config::{ClientConfig, ConfigLoadError, ConfigSaveError, ConfigValidationError};
pub use manager::{ClientEvent, ConnectionManager, ConnectionState, StartError};
pub use queue::{MessageQueue, QueuedMessage};
pub use transport::{HttpFallbackClient, TransportClient, TransportError};
