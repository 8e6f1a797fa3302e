//! Observable relay connectivity.

use std::sync::Arc;
use tokio::sync::watch;

/// Receives relay availability and the connected-clients list.
pub trait ConnectionStateSink: Send + Sync {
    fn set_connection_state(&self, connected: bool);

    fn set_connected_clients(&self, clients: &[String]);
}

/// Snapshot published to watchers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Connectivity {
    pub connected: bool,
    pub clients: Vec<String>,
}

/// In-process [`ConnectionStateSink`] backed by a watch channel.
#[derive(Debug, Clone)]
pub struct ConnectivityState {
    tx: Arc<watch::Sender<Connectivity>>,
}

impl ConnectivityState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Connectivity::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.tx.borrow().connected
    }

    pub fn connected_clients(&self) -> Vec<String> {
        self.tx.borrow().clients.clone()
    }
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateSink for ConnectivityState {
    fn set_connection_state(&self, connected: bool) {
        self.tx.send_if_modified(|state| {
            let changed = state.connected != connected;
            state.connected = connected;
            changed
        });
    }

    fn set_connected_clients(&self, clients: &[String]) {
        self.tx.send_if_modified(|state| {
            if state.clients == clients {
                return false;
            }
            state.clients = clients.to_vec();
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watchers_see_changes() {
        let state = ConnectivityState::new();
        let mut rx = state.subscribe();
        assert!(!state.is_connected());

        state.set_connection_state(true);
        rx.changed().await.unwrap();
        assert!(rx.borrow().connected);

        state.set_connected_clients(&["admin".to_string()]);
        rx.changed().await.unwrap();
        assert_eq!(state.connected_clients(), vec!["admin".to_string()]);
    }

    #[test]
    fn test_unchanged_value_does_not_notify() {
        let state = ConnectivityState::new();
        let rx = state.subscribe();
        state.set_connection_state(false);
        state.set_connected_clients(&[]);
        assert!(!rx.has_changed().unwrap());
    }
}
