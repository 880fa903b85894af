//! Notification dispatcher: fans structured events out to group rooms and to
//! the default channel so that members who have not joined a room yet still
//! hear about state changes.

use actix::prelude::*;
use serde::Serialize;

use crate::group_server::GroupServer;

/// Outbound real-time event, serialized as `{"event": ..., ...fields}`.
#[derive(Debug, Clone, Serialize, Message)]
#[rtype(result = "()")]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    JoinedGroup {
        group_id: String,
        message: String,
    },
    LeftGroup {
        group_id: String,
        message: String,
    },
    Error {
        message: String,
    },
    MessageReceived {
        message_id: String,
        user_id: String,
        user_name: String,
        message: String,
        timestamp: String,
    },
    TaskStatusChanged {
        group_id: String,
        task_id: String,
    },
    SubtaskStatusChanged {
        group_id: String,
        task_id: Option<String>,
    },
}

/// Where a published event is delivered. `Default` reaches every connected
/// session, so a `Room` + `Default` pair delivers twice to room members;
/// clients treat events as re-fetch hints, so the duplicate is harmless.
#[derive(Debug, Clone)]
pub enum FanoutTarget {
    Room(String),
    Default,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Publish {
    pub event: ServerEvent,
    pub targets: Vec<FanoutTarget>,
}

/// Fire-and-forget handle used by HTTP handlers to announce state changes.
/// Delivery is best-effort: with no subscribers the event is dropped, and a
/// dispatch failure never fails the originating mutation.
#[derive(Clone)]
pub struct Notifier {
    server: Addr<GroupServer>,
}

impl Notifier {
    pub fn new(server: Addr<GroupServer>) -> Self {
        Notifier { server }
    }

    pub fn task_status_changed(&self, group_id: &str, task_id: &str) {
        self.server.do_send(Publish {
            event: ServerEvent::TaskStatusChanged {
                group_id: group_id.to_string(),
                task_id: task_id.to_string(),
            },
            targets: vec![
                FanoutTarget::Room(group_id.to_string()),
                FanoutTarget::Default,
            ],
        });
    }

    pub fn progress_changed(&self, group_id: &str, task_id: Option<&str>) {
        self.server.do_send(Publish {
            event: ServerEvent::SubtaskStatusChanged {
                group_id: group_id.to_string(),
                task_id: task_id.map(|t| t.to_string()),
            },
            targets: vec![
                FanoutTarget::Room(group_id.to_string()),
                FanoutTarget::Default,
            ],
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_inline_event_tag() {
        let ev = ServerEvent::TaskStatusChanged {
            group_id: "g1".into(),
            task_id: "t1".into(),
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({ "event": "task_status_changed", "group_id": "g1", "task_id": "t1" })
        );
    }

    #[test]
    fn progress_event_carries_nullable_task_id() {
        let ev = ServerEvent::SubtaskStatusChanged {
            group_id: "g1".into(),
            task_id: None,
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({ "event": "subtask_status_changed", "group_id": "g1", "task_id": null })
        );
    }

    #[test]
    fn error_event_shape() {
        let ev = ServerEvent::Error {
            message: "Group not found".into(),
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({ "event": "error", "message": "Group not found" })
        );
    }
}
