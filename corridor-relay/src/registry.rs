use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::debug;

/// Frames queued for a connection's socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

#[derive(Debug)]
struct Connection {
    tx: mpsc::UnboundedSender<Outbound>,
    last_ping: u64,
}

/// Live connections of one room.
///
/// A connection whose writer is gone is dropped on the first failed send, so
/// a dead socket never holds up later deliveries.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<String, Connection>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: String, tx: mpsc::UnboundedSender<Outbound>, now: u64) {
        self.connections.insert(id, Connection { tx, last_ping: now });
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.connections.remove(id).is_some()
    }

    /// Refreshes the keepalive timestamp. Returns false for unknown ids.
    pub fn touch(&mut self, id: &str, now: u64) -> bool {
        match self.connections.get_mut(id) {
            Some(connection) => {
                connection.last_ping = now;
                true
            }
            None => false,
        }
    }

    pub fn send_to(&mut self, id: &str, text: &str) -> bool {
        let delivered = match self.connections.get(id) {
            Some(connection) => connection.tx.send(Outbound::Text(text.to_owned())).is_ok(),
            None => return false,
        };
        if !delivered {
            debug!(connection_id = %id, "evicting connection after failed send");
            self.connections.remove(id);
        }
        delivered
    }

    /// Sends to every connection and returns how many accepted the frame.
    pub fn broadcast(&mut self, text: &str) -> usize {
        let mut dead = Vec::new();
        let mut delivered = 0;
        for (id, connection) in &self.connections {
            if connection.tx.send(Outbound::Text(text.to_owned())).is_ok() {
                delivered += 1;
            } else {
                dead.push(id.clone());
            }
        }
        for id in dead {
            debug!(connection_id = %id, "evicting connection after failed broadcast");
            self.connections.remove(&id);
        }
        delivered
    }

    /// Closes and removes connections with no keepalive for longer than
    /// `threshold_ms`. Returns the removed ids.
    pub fn sweep_stale(&mut self, now: u64, threshold_ms: u64) -> Vec<String> {
        let stale: Vec<String> = self
            .connections
            .iter()
            .filter(|(_, connection)| now.saturating_sub(connection.last_ping) > threshold_ms)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            if let Some(connection) = self.connections.remove(id) {
                let _ = connection.tx.send(Outbound::Close);
            }
        }
        stale
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_reaches_everyone_and_evicts_dead_connections() {
        let mut registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let (tx_c, mut rx_c) = mpsc::unbounded_channel();
        registry.register("a".to_owned(), tx_a, 0);
        registry.register("b".to_owned(), tx_b, 0);
        registry.register("c".to_owned(), tx_c, 0);
        drop(rx_b);

        assert_eq!(registry.broadcast("hello"), 2);
        assert_eq!(rx_a.try_recv().unwrap(), Outbound::Text("hello".to_owned()));
        assert_eq!(rx_c.try_recv().unwrap(), Outbound::Text("hello".to_owned()));
        assert!(!registry.contains("b"));
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.broadcast("again"), 2);
    }

    #[test]
    fn send_to_targets_one_connection() {
        let mut registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        registry.register("a".to_owned(), tx_a, 0);
        registry.register("b".to_owned(), tx_b, 0);

        assert!(registry.send_to("a", "only-a"));
        assert_eq!(rx_a.try_recv().unwrap(), Outbound::Text("only-a".to_owned()));
        assert!(rx_b.try_recv().is_err());
        assert!(!registry.send_to("missing", "x"));
    }

    #[test]
    fn failed_direct_send_evicts() {
        let mut registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register("a".to_owned(), tx, 0);
        drop(rx);
        assert!(!registry.send_to("a", "x"));
        assert!(registry.is_empty());
    }

    #[test]
    fn sweep_closes_only_stale_connections() {
        let mut registry = ConnectionRegistry::new();
        let (tx_old, mut rx_old) = mpsc::unbounded_channel();
        let (tx_fresh, mut rx_fresh) = mpsc::unbounded_channel();
        registry.register("old".to_owned(), tx_old, 1_000);
        registry.register("fresh".to_owned(), tx_fresh, 1_000);
        assert!(registry.touch("fresh", 50_000));

        let removed = registry.sweep_stale(70_000, 60_000);
        assert_eq!(removed, vec!["old".to_owned()]);
        assert_eq!(rx_old.try_recv().unwrap(), Outbound::Close);
        assert!(rx_fresh.try_recv().is_err());
        assert!(registry.contains("fresh"));
    }

    #[test]
    fn sweep_threshold_is_exclusive() {
        let mut registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register("a".to_owned(), tx, 0);
        assert!(registry.sweep_stale(60_000, 60_000).is_empty());
        assert_eq!(registry.sweep_stale(60_001, 60_000), vec!["a".to_owned()]);
    }
}
