//! # Publications & Registry
//!
//! A publication is a named, server-declared data feed: single-value
//! (`object`) or keyed-by-document (`map`). The registry is an explicit
//! process-scoped service object mapping names to publications.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::collection::WatchedCollection;
use crate::errors::{EngineError, EngineResult};
use crate::handle::{HandleId, SubscriptionArgs, SubscriptionHandle};
use crate::query::{Query, Sort};

/// Kind of publication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicationKind {
    /// Single value fetched on demand
    Object,
    /// Keyed-by-document map backed by a watched collection
    Map,
}

impl std::fmt::Display for PublicationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublicationKind::Object => write!(f, "object"),
            PublicationKind::Map => write!(f, "map"),
        }
    }
}

/// Future returned by a fetch function
pub type FetchFuture = Pin<Box<dyn Future<Output = EngineResult<Option<Value>>> + Send>>;

/// Fetch function for object publications. Returning `Ok(None)` is the
/// "declared but not materialized" state, not an error.
pub type FetchFn = Arc<dyn Fn(SubscriptionArgs) -> FetchFuture + Send + Sync>;

/// Subscribe/unsubscribe side-effect hook
pub type HookFn = Arc<dyn Fn(&SubscriptionArgs) + Send + Sync>;

/// Per-subscriber query configuration for a map publication.
///
/// Derived from the subscriber's args at subscribe time; returning `None`
/// refuses the subscription for those args.
pub type QueryPropsFn = Arc<dyn Fn(&SubscriptionArgs) -> Option<QueryProps> + Send + Sync>;

/// Query, projection, and ordering for one map subscription
#[derive(Clone, Default)]
pub struct QueryProps {
    /// Membership filter
    pub query: Query,
    /// Dot-paths the subscription's output depends on; `None` means the
    /// whole document is relevant
    pub fields: Option<HashSet<String>>,
    /// Snapshot ordering
    pub sort: Option<Sort>,
}

impl QueryProps {
    /// Wrap a fixed configuration as a [`QueryPropsFn`], ignoring args
    pub fn constant(self) -> QueryPropsFn {
        Arc::new(move |_| Some(self.clone()))
    }
}

/// Backing source of a map publication
#[derive(Clone)]
pub struct MapSource {
    /// The watched collection driving the feed
    pub collection: Arc<WatchedCollection>,
    /// Per-subscriber query configuration
    pub query_props: QueryPropsFn,
}

/// A named data feed with its active subscriber set
pub struct Publication {
    name: String,
    kind: PublicationKind,
    fetch: Option<FetchFn>,
    map: Option<MapSource>,
    on_subscribe: Option<HookFn>,
    on_unsubscribe: Option<HookFn>,

    /// Live subscribers. Weak: a publication never keeps a cancelled
    /// handle alive.
    subscribers: RwLock<HashMap<HandleId, Weak<SubscriptionHandle>>>,
}

impl Publication {
    /// Declare an object publication
    pub fn object(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PublicationKind::Object,
            fetch: None,
            map: None,
            on_subscribe: None,
            on_unsubscribe: None,
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Declare a map publication over a watched collection
    pub fn map(
        name: impl Into<String>,
        collection: Arc<WatchedCollection>,
        query_props: QueryPropsFn,
    ) -> Self {
        Self {
            name: name.into(),
            kind: PublicationKind::Map,
            fetch: None,
            map: Some(MapSource {
                collection,
                query_props,
            }),
            on_subscribe: None,
            on_unsubscribe: None,
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Set the fetch function
    pub fn with_fetch(mut self, fetch: FetchFn) -> Self {
        self.fetch = Some(fetch);
        self
    }

    /// Set the subscribe hook
    pub fn with_on_subscribe(mut self, hook: HookFn) -> Self {
        self.on_subscribe = Some(hook);
        self
    }

    /// Set the unsubscribe hook
    pub fn with_on_unsubscribe(mut self, hook: HookFn) -> Self {
        self.on_unsubscribe = Some(hook);
        self
    }

    /// Publication name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publication kind
    pub fn kind(&self) -> PublicationKind {
        self.kind
    }

    /// Backing source, for map publications
    pub fn map_source(&self) -> Option<&MapSource> {
        self.map.as_ref()
    }

    /// Invoke the fetch function with a subscriber's args.
    ///
    /// A publication without a fetch function resolves to `Ok(None)`:
    /// declared but not materialized, useful for pure side-effect
    /// publications.
    pub async fn fetch_for(&self, args: &SubscriptionArgs) -> EngineResult<Option<Value>> {
        match &self.fetch {
            Some(fetch) => fetch(args.clone()).await,
            None => Ok(None),
        }
    }

    /// Add a handle to the subscriber set, then run the subscribe hook
    pub fn subscribe(&self, handle: &Arc<SubscriptionHandle>) {
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.insert(handle.id(), Arc::downgrade(handle));
        }
        if let Some(hook) = &self.on_subscribe {
            hook(handle.args());
        }
    }

    /// Run the unsubscribe hook, then remove the handle.
    ///
    /// Hook first: it can still observe the handle as a member.
    pub fn unsubscribe(&self, id: HandleId, args: &SubscriptionArgs) {
        if let Some(hook) = &self.on_unsubscribe {
            hook(args);
        }
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.remove(&id);
        }
    }

    /// Asynchronously trigger every live subscriber's change handling.
    ///
    /// Object publications use this when the publisher itself knows the
    /// underlying value changed; no change feed is involved.
    pub fn broadcast_changed(&self) {
        let live = {
            let Ok(mut subscribers) = self.subscribers.write() else {
                return;
            };
            // Prune dropped handles while we are here
            subscribers.retain(|_, weak| weak.strong_count() > 0);
            subscribers
                .values()
                .filter_map(Weak::upgrade)
                .collect::<Vec<_>>()
        };

        for handle in live {
            let name = self.name.clone();
            tokio::spawn(async move {
                if let Err(e) = handle.changed(None).await {
                    warn!(publication = %name, error = %e, "broadcast refetch failed");
                }
            });
        }
    }

    /// Number of registered subscribers (including not-yet-pruned dead ones)
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for Publication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publication")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Process-scoped mapping from publication name to publication
#[derive(Debug, Default)]
pub struct PublicationRegistry {
    by_name: RwLock<HashMap<String, Arc<Publication>>>,
}

impl PublicationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a publication under its name.
    ///
    /// Re-registration under an existing name is an explicit replace.
    /// Changing the kind of an existing name is a configuration error.
    pub fn register(&self, publication: Publication) -> EngineResult<Arc<Publication>> {
        let mut by_name = self
            .by_name
            .write()
            .map_err(|_| EngineError::Internal("registry lock poisoned".into()))?;

        if let Some(existing) = by_name.get(publication.name()) {
            if existing.kind() != publication.kind() {
                return Err(EngineError::KindMismatch {
                    name: publication.name().to_string(),
                    requested: publication.kind().to_string(),
                    registered: existing.kind().to_string(),
                });
            }
            info!(publication = %publication.name(), "replacing registered publication");
        } else {
            debug!(publication = %publication.name(), kind = %publication.kind(), "registering publication");
        }

        let publication = Arc::new(publication);
        by_name.insert(publication.name().to_string(), Arc::clone(&publication));
        Ok(publication)
    }

    /// Look up a publication by name
    pub fn lookup(&self, name: &str) -> Option<Arc<Publication>> {
        self.by_name.read().ok()?.get(name).cloned()
    }

    /// Number of registered publications
    pub fn len(&self) -> usize {
        self.by_name.read().map(|by_name| by_name.len()).unwrap_or(0)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
