//! Types for queued mutating actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of queued action, used as the conflict-resolver registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Favorite,
    SetTags,
    Delete,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Favorite => "favorite",
            ActionType::SetTags => "set_tags",
            ActionType::Delete => "delete",
        }
    }
}

/// What an action does. Every variant is a total overwrite of its target,
/// so replaying it any number of times lands on the same remote state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionPayload {
    Favorite {
        dir: String,
        path: String,
        favorite: bool,
    },
    SetTags {
        dir: String,
        path: String,
        tags: Vec<String>,
    },
    Delete {
        dir: String,
        paths: Vec<String>,
    },
}

impl ActionPayload {
    pub fn action_type(&self) -> ActionType {
        match self {
            ActionPayload::Favorite { .. } => ActionType::Favorite,
            ActionPayload::SetTags { .. } => ActionType::SetTags,
            ActionPayload::Delete { .. } => ActionType::Delete,
        }
    }

    /// Key identifying the resource an action overwrites. Actions of the
    /// same type with the same key are candidates for coalescing.
    pub fn resource_key(&self) -> String {
        match self {
            ActionPayload::Favorite { dir, path, .. }
            | ActionPayload::SetTags { dir, path, .. } => format!("{}\u{0}{}", dir, path),
            ActionPayload::Delete { dir, paths } => {
                let mut sorted = paths.clone();
                sorted.sort();
                sorted.dedup();
                format!("{}\u{0}{}", dir, sorted.join("\u{0}"))
            }
        }
    }

    /// Photo paths touched by this action.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            ActionPayload::Favorite { path, .. } | ActionPayload::SetTags { path, .. } => {
                vec![path.as_str()]
            }
            ActionPayload::Delete { paths, .. } => paths.iter().map(String::as_str).collect(),
        }
    }
}

/// Replay status of a queued action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    InFlight,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::InFlight => "in_flight",
            ActionStatus::Failed => "failed",
        }
    }
}

/// A mutating operation waiting to be replayed against the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: Uuid,
    pub payload: ActionPayload,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub status: ActionStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Position in the queue; FIFO order is ascending `seq`.
    pub seq: u64,
}

impl QueuedAction {
    pub fn new(payload: ActionPayload, seq: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            created_at: Utc::now(),
            attempts: 0,
            status: ActionStatus::Pending,
            last_error: None,
            seq,
        }
    }

    pub fn action_type(&self) -> ActionType {
        self.payload.action_type()
    }

    pub fn is_pending(&self) -> bool {
        self.status != ActionStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_serializes_with_type_tag() {
        let payload = ActionPayload::Favorite {
            dir: "/photos".into(),
            path: "/photos/a.jpg".into(),
            favorite: true,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "favorite");
        assert_eq!(json["favorite"], true);
        assert_eq!(payload.action_type().as_str(), "favorite");
    }

    #[test]
    fn test_delete_key_ignores_path_order() {
        let a = ActionPayload::Delete {
            dir: "/p".into(),
            paths: vec!["b".into(), "a".into()],
        };
        let b = ActionPayload::Delete {
            dir: "/p".into(),
            paths: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(a.resource_key(), b.resource_key());
    }

    #[test]
    fn test_favorite_and_tags_keys_are_per_path() {
        let a = ActionPayload::SetTags {
            dir: "/p".into(),
            path: "x.jpg".into(),
            tags: vec![],
        };
        let b = ActionPayload::SetTags {
            dir: "/p".into(),
            path: "y.jpg".into(),
            tags: vec![],
        };
        assert_ne!(a.resource_key(), b.resource_key());
    }
}
