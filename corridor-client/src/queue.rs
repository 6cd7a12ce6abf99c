use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use corridor_core::{MAX_HISTORY_ITEMS, now_unix_ms, preview_text};
use tracing::warn;
use uuid::Uuid;

/// Matches the relay's history bound: anything older would be evicted there anyway.
pub const MAX_QUEUED_MESSAGES: usize = MAX_HISTORY_ITEMS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub id: String,
    pub content: String,
    pub timestamp: u64,
}

impl QueuedMessage {
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            content: content.into(),
            timestamp: now_unix_ms(),
        }
    }
}

/// FIFO of updates produced while no transport is available.
#[derive(Debug)]
pub struct MessageQueue {
    items: Mutex<VecDeque<QueuedMessage>>,
    capacity: usize,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::with_capacity(MAX_QUEUED_MESSAGES)
    }
}

impl MessageQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn enqueue(&self, content: impl Into<String>) -> QueuedMessage {
        let message = QueuedMessage::new(content);

        let mut items = self.lock();
        items.push_back(message.clone());
        self.enforce_capacity(&mut items);
        message
    }

    /// Removes and returns everything, oldest first.
    pub fn drain_all(&self) -> Vec<QueuedMessage> {
        self.lock().drain(..).collect()
    }

    /// Puts undelivered messages back at the front, keeping their order ahead
    /// of anything queued since they were drained.
    pub fn restore(&self, messages: Vec<QueuedMessage>) {
        if messages.is_empty() {
            return;
        }
        let mut items = self.lock();
        for message in messages.into_iter().rev() {
            items.push_front(message);
        }
        self.enforce_capacity(&mut items);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn enforce_capacity(&self, items: &mut VecDeque<QueuedMessage>) {
        while items.len() > self.capacity {
            if let Some(dropped) = items.pop_front() {
                warn!(
                    id = %dropped.id,
                    preview = %preview_text(&dropped.content, 32),
                    "message queue full; dropping oldest update"
                );
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueuedMessage>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
