//! Change events emitted by the backing store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A change notification on its way from the store to connected clients.
///
/// Events are never persisted. They exist only while being dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayEvent {
    /// An object definition was created, changed or deleted (`object` is null).
    ObjectChanged {
        id: String,
        #[serde(default)]
        object: Value,
    },
    /// A state value changed or was deleted (`state` is null).
    StateChanged {
        id: String,
        #[serde(default)]
        state: Value,
    },
    /// A file was written or removed (`size` is absent on removal).
    FileChanged {
        id: String,
        file_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
    },
    /// A message addressed from one instance to clients.
    InstanceMessage {
        from_id: String,
        message_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        socket_id: Option<String>,
        #[serde(default)]
        data: Value,
    },
    /// A log line forwarded to clients.
    LogEntry { payload: Value },
}

/// Discriminant of a [`RelayEvent`], used for metrics labels and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ObjectChanged,
    StateChanged,
    FileChanged,
    InstanceMessage,
    LogEntry,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ObjectChanged => "object_changed",
            EventKind::StateChanged => "state_changed",
            EventKind::FileChanged => "file_changed",
            EventKind::InstanceMessage => "instance_message",
            EventKind::LogEntry => "log_entry",
        }
    }
}

impl RelayEvent {
    /// Returns the kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            RelayEvent::ObjectChanged { .. } => EventKind::ObjectChanged,
            RelayEvent::StateChanged { .. } => EventKind::StateChanged,
            RelayEvent::FileChanged { .. } => EventKind::FileChanged,
            RelayEvent::InstanceMessage { .. } => EventKind::InstanceMessage,
            RelayEvent::LogEntry { .. } => EventKind::LogEntry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_state_changed() {
        let event: RelayEvent = serde_json::from_value(json!({
            "kind": "state_changed",
            "id": "hm-rpc.0.door.STATE",
            "state": {"val": true, "ack": true}
        }))
        .unwrap();

        assert_eq!(event.kind(), EventKind::StateChanged);
        match event {
            RelayEvent::StateChanged { id, state } => {
                assert_eq!(id, "hm-rpc.0.door.STATE");
                assert_eq!(state["val"], json!(true));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_deleted_object_has_null_payload() {
        let event: RelayEvent =
            serde_json::from_value(json!({"kind": "object_changed", "id": "system.adapter.x"}))
                .unwrap();
        assert_eq!(
            event,
            RelayEvent::ObjectChanged {
                id: "system.adapter.x".to_string(),
                object: Value::Null,
            }
        );
    }

    #[test]
    fn test_file_removed_omits_size() {
        let event = RelayEvent::FileChanged {
            id: "vis.0".to_string(),
            file_name: "main/vis-views.json".to_string(),
            size: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("size").is_none());
        assert_eq!(value["kind"], "file_changed");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result: Result<RelayEvent, _> =
            serde_json::from_value(json!({"kind": "history_changed", "id": "x"}));
        assert!(result.is_err());
    }
}
