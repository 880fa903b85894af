use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a task, derived from its subtasks whenever any exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    NotStarted,
    InProgress,
    Done,
}

impl SubtaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubtaskStatus::NotStarted => "not_started",
            SubtaskStatus::InProgress => "in_progress",
            SubtaskStatus::Done => "done",
        }
    }
}

impl FromStr for SubtaskStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(SubtaskStatus::NotStarted),
            "in_progress" => Ok(SubtaskStatus::InProgress),
            "done" => Ok(SubtaskStatus::Done),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a registered user.
#[derive(Debug, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub user_id: String,
    pub firstname: String,
    pub lastname: String,
    pub email: String,
    pub password_hash: String,
    /// group_ids of groups the user belongs to.
    #[serde(default)]
    pub groups: Vec<String>,
    /// group_ids of pending invitations.
    #[serde(default)]
    pub invites: Vec<String>,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.firstname, self.lastname)
    }
}

/// Represents a group of users working together.
#[derive(Debug, Serialize, Deserialize)]
pub struct Group {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    /// Opaque stable identifier, distinct from the storage id.
    pub group_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// user_ids of the members. The creator is always present.
    pub members: Vec<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// A task assigned to a single group member.
#[derive(Debug, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub task_id: String,
    pub group_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub assigned_to: String,
    pub created_by: String,
    pub status: TaskStatus,
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A subtask under a task. Always assigned to the task's assignee.
#[derive(Debug, Serialize, Deserialize)]
pub struct Subtask {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub subtask_id: String,
    pub task_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub assigned_to: String,
    pub status: SubtaskStatus,
    pub created_at: DateTime<Utc>,
}

/// A chat message posted to a group. Immutable once created.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub message_id: String,
    pub group_id: String,
    pub user_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_enums_use_snake_case_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::from_str::<SubtaskStatus>("\"not_started\"").unwrap(),
            SubtaskStatus::NotStarted
        );
    }

    #[test]
    fn subtask_status_parses_only_valid_values() {
        assert_eq!("done".parse(), Ok(SubtaskStatus::Done));
        assert_eq!("in_progress".parse(), Ok(SubtaskStatus::InProgress));
        assert!("finished".parse::<SubtaskStatus>().is_err());
        assert!("".parse::<SubtaskStatus>().is_err());
    }

    #[test]
    fn as_str_round_trips_with_serde() {
        for s in [
            SubtaskStatus::NotStarted,
            SubtaskStatus::InProgress,
            SubtaskStatus::Done,
        ] {
            let json = serde_json::to_string(&s).unwrap();
            assert_eq!(json, format!("\"{}\"", s.as_str()));
        }
    }
}
