//! # Per-Connection Subscriptions
//!
//! A connection's active handles, keyed by a client-chosen identifier.
//! Keys are unique per connection only, not globally.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::handle::SubscriptionHandle;

/// Client-chosen subscription key: a number or a string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubscriptionKey {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionKey::Number(n) => write!(f, "{}", n),
            SubscriptionKey::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for SubscriptionKey {
    fn from(n: i64) -> Self {
        SubscriptionKey::Number(n)
    }
}

impl From<&str> for SubscriptionKey {
    fn from(s: &str) -> Self {
        SubscriptionKey::Text(s.to_string())
    }
}

impl From<String> for SubscriptionKey {
    fn from(s: String) -> Self {
        SubscriptionKey::Text(s)
    }
}

/// The active subscriptions of one connection
#[derive(Default)]
pub struct Subscriptions {
    handles: HashMap<SubscriptionKey, Arc<SubscriptionHandle>>,
}

impl Subscriptions {
    /// Create an empty container
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a handle under a key. Last write wins; a displaced handle
    /// is cancelled so its listeners do not leak.
    pub fn subscribe(&mut self, key: SubscriptionKey, handle: Arc<SubscriptionHandle>) {
        if let Some(displaced) = self.handles.insert(key.clone(), handle) {
            warn!(key = %key, "subscription key reused, cancelling displaced handle");
            displaced.cancel();
        }
    }

    /// Concurrently renew every handle. One handle's failure does not
    /// abort the others.
    pub async fn renew_all(&self) {
        let renewals = self.handles.iter().map(|(key, handle)| async move {
            (key, handle.renew().await)
        });

        for (key, result) in join_all(renewals).await {
            if let Err(e) = result {
                warn!(key = %key, error = %e, "subscription renewal failed");
            }
        }
    }

    /// Cancel and remove the handle at `key`. Absent key is a no-op.
    pub fn cancel(&mut self, key: &SubscriptionKey) {
        if let Some(handle) = self.handles.remove(key) {
            handle.cancel();
        }
    }

    /// Cancel every handle (connection-close path)
    pub fn cancel_all(&mut self) {
        for handle in self.handles.values() {
            handle.cancel();
        }
        self.handles.clear();
    }

    /// Look up a handle
    pub fn get(&self, key: &SubscriptionKey) -> Option<&Arc<SubscriptionHandle>> {
        self.handles.get(key)
    }

    /// Number of active subscriptions
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
