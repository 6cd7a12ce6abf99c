use corridor_core::{ClipboardItem, MAX_HISTORY_ITEMS, Token};
use uuid::Uuid;

use crate::store::StoredRoom;

/// Clipboard history for one token, newest item first.
#[derive(Debug, Clone)]
pub struct Room {
    token: Token,
    history: Vec<ClipboardItem>,
    last_activity: u64,
}

impl Room {
    #[must_use]
    pub fn new(token: Token, now: u64) -> Self {
        Self {
            token,
            history: Vec::new(),
            last_activity: now,
        }
    }

    /// Rebuilds a room from persisted state. Anything past the history bound
    /// is dropped.
    #[must_use]
    pub fn restore(token: Token, stored: StoredRoom) -> Self {
        let mut history = stored.history;
        history.truncate(MAX_HISTORY_ITEMS);
        Self {
            token,
            history,
            last_activity: stored.last_activity,
        }
    }

    #[must_use]
    pub fn token(&self) -> &Token {
        &self.token
    }

    #[must_use]
    pub fn history(&self) -> &[ClipboardItem] {
        &self.history
    }

    #[must_use]
    pub fn last_activity(&self) -> u64 {
        self.last_activity
    }

    /// Records an accepted update at the front of the history.
    ///
    /// Timestamps never go backwards within a room even if the wall clock does.
    pub fn push(&mut self, content: String, now: u64) -> ClipboardItem {
        let newest = self.history.first().map_or(0, |item| item.timestamp);
        let item = ClipboardItem {
            id: Uuid::new_v4().simple().to_string(),
            content,
            timestamp: now.max(newest),
        };

        self.history.insert(0, item.clone());
        self.history.truncate(MAX_HISTORY_ITEMS);
        self.last_activity = now;
        item
    }

    pub fn clear(&mut self, now: u64) {
        self.history.clear();
        self.last_activity = now;
    }

    #[must_use]
    pub fn snapshot(&self) -> StoredRoom {
        StoredRoom {
            token: self.token.clone(),
            history: self.history.clone(),
            last_activity: self.last_activity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> Token {
        Token::parse("abc123").unwrap()
    }

    #[test]
    fn history_is_newest_first_and_bounded() {
        let mut room = Room::new(token(), 1);
        for n in 0..=50 {
            room.push(n.to_string(), 100 + n);
        }

        let history = room.history();
        assert_eq!(history.len(), MAX_HISTORY_ITEMS);
        assert_eq!(history.first().unwrap().content, "50");
        assert_eq!(history.last().unwrap().content, "1");
        assert!(history.iter().all(|item| item.content != "0"));
        assert_eq!(room.last_activity(), 150);
    }

    #[test]
    fn short_sequences_keep_every_update() {
        let mut room = Room::new(token(), 1);
        for n in 0..7 {
            room.push(format!("item-{n}"), 10);
        }
        let contents: Vec<_> = room.history().iter().map(|i| i.content.as_str()).collect();
        assert_eq!(
            contents,
            ["item-6", "item-5", "item-4", "item-3", "item-2", "item-1", "item-0"]
        );
    }

    #[test]
    fn ids_are_unique() {
        let mut room = Room::new(token(), 1);
        let a = room.push("same".to_owned(), 5);
        let b = room.push("same".to_owned(), 5);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn timestamps_do_not_go_backwards() {
        let mut room = Room::new(token(), 1);
        let first = room.push("a".to_owned(), 1_000);
        let second = room.push("b".to_owned(), 900);
        assert_eq!(first.timestamp, 1_000);
        assert_eq!(second.timestamp, 1_000);
    }

    #[test]
    fn clear_empties_history() {
        let mut room = Room::new(token(), 1);
        room.push("a".to_owned(), 2);
        room.clear(3);
        assert!(room.history().is_empty());
        assert_eq!(room.last_activity(), 3);
    }

    #[test]
    fn restore_truncates_oversized_history() {
        let mut source = Room::new(token(), 1);
        for n in 0..50 {
            source.push(n.to_string(), 10);
        }
        let mut stored = source.snapshot();
        stored.history.push(ClipboardItem {
            id: "extra".to_owned(),
            content: "extra".to_owned(),
            timestamp: 0,
        });

        let restored = Room::restore(token(), stored);
        assert_eq!(restored.history().len(), MAX_HISTORY_ITEMS);
        assert_eq!(restored.history()[0].content, "49");
    }
}
