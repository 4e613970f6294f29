//! # Watched Collection
//!
//! In-memory document store with a live change feed. This is the surface
//! the engine consumes from the data-store collaborator: query execution
//! (`find`, `get`) plus a broadcast stream of per-document change events.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::event::{ChangeEvent, DocumentId, UpdateDescription};
use crate::query::{set_path, unset_path, Query, Sort};

/// Capacity of the change-feed channel
const FEED_CAPACITY: usize = 256;

/// A collection of JSON documents with a change feed
#[derive(Debug)]
pub struct WatchedCollection {
    /// Collection name
    name: String,

    /// Documents by id
    docs: RwLock<HashMap<DocumentId, Value>>,

    /// Change feed
    feed: broadcast::Sender<ChangeEvent>,
}

impl WatchedCollection {
    /// Create an empty collection
    pub fn new(name: impl Into<String>) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            name: name.into(),
            docs: RwLock::new(HashMap::new()),
            feed,
        }
    }

    /// Collection name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to the change feed
    pub fn watch(&self) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe()
    }

    /// Number of live change-feed listeners
    pub fn listener_count(&self) -> usize {
        self.feed.receiver_count()
    }

    /// Insert a document. The stored body always carries `_id`.
    pub fn insert(&self, id: impl Into<DocumentId>, mut doc: Value) {
        let id = id.into();
        set_path(&mut doc, "_id", Value::String(id.clone()));

        if let Ok(mut docs) = self.docs.write() {
            docs.insert(id.clone(), doc.clone());
        }
        self.emit(ChangeEvent::insert(id, doc));
    }

    /// Apply a partial update: set the given dot-paths, unset the removed
    /// ones. Returns false if the document does not exist.
    pub fn update(&self, id: &str, set: &[(&str, Value)], unset: &[&str]) -> bool {
        let updated = {
            let Ok(mut docs) = self.docs.write() else {
                return false;
            };
            let Some(doc) = docs.get_mut(id) else {
                return false;
            };

            let mut description = UpdateDescription::default();
            for (path, value) in set {
                set_path(doc, path, value.clone());
                description.updated_fields.push((*path).to_string());
            }
            for path in unset {
                if unset_path(doc, path) {
                    description.removed_fields.push((*path).to_string());
                }
            }
            ChangeEvent::update(id, description, Some(doc.clone()))
        };

        self.emit(updated);
        true
    }

    /// Replace a document wholesale. Returns false if it does not exist.
    pub fn replace(&self, id: &str, mut doc: Value) -> bool {
        set_path(&mut doc, "_id", Value::String(id.to_string()));

        {
            let Ok(mut docs) = self.docs.write() else {
                return false;
            };
            if !docs.contains_key(id) {
                return false;
            }
            docs.insert(id.to_string(), doc.clone());
        }

        self.emit(ChangeEvent::replace(id, doc));
        true
    }

    /// Delete a document. Returns false if it does not exist.
    pub fn delete(&self, id: &str) -> bool {
        let removed = self
            .docs
            .write()
            .map(|mut docs| docs.remove(id).is_some())
            .unwrap_or(false);

        if removed {
            self.emit(ChangeEvent::delete(id));
        }
        removed
    }

    /// Fetch a single document by id
    pub fn get(&self, id: &str) -> Option<Value> {
        self.docs.read().ok()?.get(id).cloned()
    }

    /// Run a query, optionally ordered
    pub fn find(&self, query: &Query, sort: Option<&Sort>) -> Vec<(DocumentId, Value)> {
        let Ok(docs) = self.docs.read() else {
            return Vec::new();
        };

        let mut matching: Vec<(DocumentId, Value)> = docs
            .iter()
            .filter(|(_, doc)| query.matches(doc))
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect();

        match sort {
            Some(sort) => matching.sort_by(|(_, a), (_, b)| sort.compare(a, b)),
            // Deterministic iteration when no sort is given
            None => matching.sort_by(|(a, _), (b, _)| a.cmp(b)),
        }
        matching
    }

    /// Number of documents
    pub fn len(&self) -> usize {
        self.docs.read().map(|docs| docs.len()).unwrap_or(0)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn emit(&self, event: ChangeEvent) {
        // No listeners is fine
        let _ = self.feed.send(event);
    }
}
