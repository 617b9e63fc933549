//! Row and change-event types shared by the REST and realtime layers.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A database row as returned by the REST layer.
pub type Row = serde_json::Map<String, Value>;

/// Kind of change carried by a realtime event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    /// Wire name used in channel join configs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

/// A table/event pair a channel listens for.
///
/// `kind: None` listens for every kind of change on the table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub table: String,
    pub kind: Option<ChangeKind>,
}

impl Binding {
    /// Listen for one kind of change on a table.
    pub fn new(table: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            table: table.into(),
            kind: Some(kind),
        }
    }

    /// Listen for every change on a table.
    pub fn all(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            kind: None,
        }
    }

    /// Check whether an event falls under this binding.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.table == event.table && self.kind.is_none_or(|kind| kind == event.kind)
    }
}

/// A change event from the realtime feed.
///
/// Delete events usually carry only the primary key in `old` unless the
/// table replicates full rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub new: Option<Row>,
    pub old: Option<Row>,
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, row: Row) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Insert,
            new: Some(row),
            old: None,
            commit_timestamp: Some(Utc::now()),
        }
    }

    pub fn update(table: impl Into<String>, new: Row, old: Option<Row>) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Update,
            new: Some(new),
            old,
            commit_timestamp: Some(Utc::now()),
        }
    }

    pub fn delete(table: impl Into<String>, old: Row) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Delete,
            new: None,
            old: Some(old),
            commit_timestamp: Some(Utc::now()),
        }
    }

    /// The row the event is about: `new` for inserts/updates, `old` for deletes.
    pub fn record(&self) -> Option<&Row> {
        match self.kind {
            ChangeKind::Insert | ChangeKind::Update => self.new.as_ref(),
            ChangeKind::Delete => self.old.as_ref(),
        }
    }

    /// Read a string column from the event's record.
    ///
    /// Numeric ids are rendered to strings so callers can compare uniformly.
    pub fn field(&self, column: &str) -> Option<String> {
        self.record()
            .and_then(|row| row.get(column))
            .and_then(value_as_id)
    }

    /// Decode the event's record into a typed row.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let row = self.record().cloned().unwrap_or_default();
        serde_json::from_value(Value::Object(row))
    }
}

/// Render an id-like JSON value as a string.
pub fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A comment row (shout and event comments share this shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRow {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Author of the comment.
    pub user_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A notification row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRow {
    pub id: String,
    /// Recipient of the notification.
    pub user_id: String,
    #[serde(default)]
    pub trigger_user_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Public profile fields returned by the bulk profile lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicProfile {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}
