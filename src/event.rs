//! # Change-Feed Events
//!
//! Per-document mutation events emitted by a watched collection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Document identifier within a collection
pub type DocumentId = String;

/// Kind of document mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// New document inserted
    Insert,
    /// Existing document partially updated
    Update,
    /// Existing document replaced wholesale
    Replace,
    /// Document deleted
    Delete,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "insert"),
            ChangeKind::Update => write!(f, "update"),
            ChangeKind::Replace => write!(f, "replace"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

/// Which field paths an update touched.
///
/// Paths use dot notation (`"meta.title"`). Present only on
/// [`ChangeKind::Update`] events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateDescription {
    /// Dot-paths that were set or modified
    pub updated_fields: Vec<String>,

    /// Dot-paths that were removed
    pub removed_fields: Vec<String>,
}

impl UpdateDescription {
    /// All touched paths, updated and removed
    pub fn touched_paths(&self) -> impl Iterator<Item = &str> {
        self.updated_fields
            .iter()
            .chain(self.removed_fields.iter())
            .map(String::as_str)
    }
}

/// One change-feed event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Identifier of the affected document
    pub id: DocumentId,

    /// Kind of mutation
    pub kind: ChangeKind,

    /// Field-level description, for update events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<UpdateDescription>,

    /// Full post-change document body, when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Value>,

    /// Timestamp of the event
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// Create an insert event
    pub fn insert(id: impl Into<DocumentId>, document: Value) -> Self {
        Self {
            id: id.into(),
            kind: ChangeKind::Insert,
            update: None,
            full_document: Some(document),
            timestamp: Utc::now(),
        }
    }

    /// Create an update event carrying the post-change document
    pub fn update(
        id: impl Into<DocumentId>,
        update: UpdateDescription,
        full_document: Option<Value>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: ChangeKind::Update,
            update: Some(update),
            full_document,
            timestamp: Utc::now(),
        }
    }

    /// Create a replace event
    pub fn replace(id: impl Into<DocumentId>, document: Value) -> Self {
        Self {
            id: id.into(),
            kind: ChangeKind::Replace,
            update: None,
            full_document: Some(document),
            timestamp: Utc::now(),
        }
    }

    /// Create a delete event. Deletes carry no document body.
    pub fn delete(id: impl Into<DocumentId>) -> Self {
        Self {
            id: id.into(),
            kind: ChangeKind::Delete,
            update: None,
            full_document: None,
            timestamp: Utc::now(),
        }
    }
}
