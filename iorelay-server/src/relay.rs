//! Event relay: forwards store events to the current transport hub.

use crate::hub::TransportHub;
use crate::metrics::Metrics;
use iorelay_protocol::RelayEvent;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared slot holding the hub of the running server, if any.
#[derive(Clone, Default)]
pub struct HubSlot(Arc<RwLock<Option<Arc<dyn TransportHub>>>>);

impl HubSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, hub: Arc<dyn TransportHub>) {
        *self.0.write() = Some(hub);
    }

    pub fn take(&self) -> Option<Arc<dyn TransportHub>> {
        self.0.write().take()
    }

    pub fn current(&self) -> Option<Arc<dyn TransportHub>> {
        self.0.read().clone()
    }
}

/// Dispatches [`RelayEvent`]s to the hub in arrival order.
///
/// Events arriving while no hub is ready are dropped. There is no buffering
/// and no replay.
#[derive(Clone)]
pub struct EventRelay {
    slot: HubSlot,
    metrics: Option<Arc<Metrics>>,
}

impl EventRelay {
    pub fn new(slot: HubSlot) -> Self {
        Self {
            slot,
            metrics: None,
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Hands one event to the hub. Returns false if it was dropped.
    pub fn dispatch(&self, event: &RelayEvent) -> bool {
        let kind = event.kind().as_str();
        let hub = match self.slot.current() {
            Some(hub) if hub.is_ready() => hub,
            _ => {
                tracing::trace!("No transport hub ready, dropping {} event", kind);
                if let Some(ref metrics) = self.metrics {
                    metrics.events_dropped_total.with_label_values(&[kind]).inc();
                }
                return false;
            }
        };

        match event {
            RelayEvent::ObjectChanged { id, object } => hub.publish_object_change(id, object),
            RelayEvent::StateChanged { id, state } => hub.publish_state_change(id, state),
            RelayEvent::FileChanged {
                id,
                file_name,
                size,
            } => hub.publish_file_change(id, file_name, *size),
            RelayEvent::InstanceMessage {
                from_id,
                message_type,
                socket_id,
                data,
            } => hub.publish_instance_message(from_id, message_type, socket_id.as_deref(), data),
            RelayEvent::LogEntry { payload } => hub.publish_log(payload),
        }

        if let Some(ref metrics) = self.metrics {
            metrics.events_relayed_total.with_label_values(&[kind]).inc();
        }
        true
    }

    /// Dispatches events from the source until it is closed.
    pub async fn run(self, mut events: mpsc::Receiver<RelayEvent>) {
        tracing::debug!("Event relay started");
        while let Some(event) = events.recv().await {
            self.dispatch(&event);
        }
        tracing::debug!("Event source closed, relay stopped");
    }
}
