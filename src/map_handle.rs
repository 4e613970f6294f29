//! # Collection-Map Subscription Handle
//!
//! The core of the engine. Tracks which documents in a watched collection
//! currently satisfy a subscriber's query, decides per change-feed event
//! whether the subscription is affected (membership × field relevance),
//! and debounces the resulting refetches into batched deliveries.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::collection::WatchedCollection;
use crate::config::EngineConfig;
use crate::debounce::FlushTimer;
use crate::errors::EngineResult;
use crate::event::{ChangeEvent, ChangeKind, DocumentId, UpdateDescription};
use crate::handle::{DeliverFn, HandleId, SubscriptionArgs, SubscriptionHandle};
use crate::publication::{Publication, QueryProps};
use crate::query::{project, Query, Sort};

/// Mutable handle state. Guarded by a plain mutex, never held across an
/// await: every await boundary re-reads rather than assuming.
struct MapState {
    /// Documents currently believed to satisfy the query. Authoritative
    /// local membership cache, mutated only by this handle.
    ids: HashSet<DocumentId>,

    /// Fetch results awaiting flush, in event-arrival order
    pending: Vec<Value>,
}

/// Handle for a map publication backed by a watched collection
pub struct CollectionMapHandle {
    id: HandleId,
    publication: Arc<Publication>,
    collection: Arc<WatchedCollection>,
    args: SubscriptionArgs,
    deliver: DeliverFn,

    query: Query,
    fields: Option<HashSet<String>>,
    sort: Option<Sort>,

    cancelled: AtomicBool,
    state: Mutex<MapState>,
    timer: FlushTimer,
    listener: Mutex<Option<JoinHandle<()>>>,

    /// Back-reference to the owning enum, for the timer's fire closure
    /// and the listener task
    self_ref: Mutex<Weak<SubscriptionHandle>>,
}

impl CollectionMapHandle {
    pub(crate) fn new(
        publication: Arc<Publication>,
        collection: Arc<WatchedCollection>,
        args: SubscriptionArgs,
        deliver: DeliverFn,
        props: QueryProps,
        config: &EngineConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            publication,
            collection,
            args,
            deliver,
            query: props.query,
            fields: props.fields,
            sort: props.sort,
            cancelled: AtomicBool::new(false),
            state: Mutex::new(MapState {
                ids: HashSet::new(),
                pending: Vec::new(),
            }),
            timer: FlushTimer::new(config.flush_delay()),
            listener: Mutex::new(None),
            self_ref: Mutex::new(Weak::new()),
        }
    }

    /// Spawn the change-feed listener for a freshly built handle.
    ///
    /// One task per handle, consuming events in arrival order and fully
    /// processing each before taking the next, so buffer appends are
    /// serialized in event order.
    pub(crate) fn attach_listener(handle: &Arc<SubscriptionHandle>) {
        let SubscriptionHandle::CollectionMap(map) = handle.as_ref() else {
            return;
        };

        if let Ok(mut self_ref) = map.self_ref.lock() {
            *self_ref = Arc::downgrade(handle);
        }

        let mut feed = map.collection.watch();
        let weak = Arc::downgrade(handle);
        let task = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(event) => {
                        let Some(handle) = weak.upgrade() else { break };
                        if let SubscriptionHandle::CollectionMap(map) = handle.as_ref() {
                            map.on_change(&event).await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Membership may have diverged; resync from a
                        // full snapshot.
                        let Some(handle) = weak.upgrade() else { break };
                        warn!(skipped, "change feed lagged, resyncing subscription");
                        if let Err(e) = handle.changed(None).await {
                            warn!(error = %e, "resync after lag failed");
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        if let Ok(mut listener) = map.listener.lock() {
            *listener = Some(task);
        }
    }

    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    pub(crate) fn args(&self) -> &SubscriptionArgs {
        &self.args
    }

    pub(crate) fn publication(&self) -> &Arc<Publication> {
        &self.publication
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Snapshot of the membership cache
    pub fn member_ids(&self) -> HashSet<DocumentId> {
        self.state
            .lock()
            .map(|state| state.ids.clone())
            .unwrap_or_default()
    }

    /// Process one change-feed event: decide relevance, fetch the
    /// incremental update, buffer it, and (re)arm the flush timer.
    pub(crate) async fn on_change(&self, event: &ChangeEvent) {
        if self.is_cancelled() || !self.is_relevant(event) {
            return;
        }

        let Some(payload) = self.fetch_update(Some(event)) else {
            return;
        };

        // Cancelled while fetching: discard, never buffer
        if self.is_cancelled() {
            return;
        }
        match self.state.lock() {
            Ok(mut state) => state.pending.push(payload),
            Err(_) => return,
        }

        let weak = match self.self_ref.lock() {
            Ok(self_ref) => self_ref.clone(),
            Err(_) => return,
        };
        self.timer.arm(move || {
            if let Some(handle) = weak.upgrade() {
                if let SubscriptionHandle::CollectionMap(map) = handle.as_ref() {
                    map.flush();
                }
            }
        });
    }

    /// Relevance decision for one event
    fn is_relevant(&self, event: &ChangeEvent) -> bool {
        let member = self
            .state
            .lock()
            .map(|state| state.ids.contains(&event.id))
            .unwrap_or(false);

        if member {
            // Deletes, replaces, and re-inserts always force a membership
            // recompute. Updates are filtered by the tracked field set,
            // which implicitly includes the query's own filter fields:
            // touching those can move the document out of the result set.
            match (event.kind, &self.fields, &event.update) {
                (ChangeKind::Update, Some(fields), Some(update)) => {
                    update_touches(update, fields)
                        || update
                            .touched_paths()
                            .any(|path| query_touched(&self.query, path))
                }
                _ => true,
            }
        } else {
            // Not a member: only a document body that now matches the
            // query can make this event relevant.
            event
                .full_document
                .as_ref()
                .is_some_and(|doc| self.query.matches(doc))
        }
    }

    /// Fetch the projection update for this subscription.
    ///
    /// With no event (`reason = None`) this is a full snapshot: the query
    /// is re-run, membership is rebuilt, and the whole id → document map
    /// is returned. With an event, membership is recomputed for the
    /// affected document only: id → projected document for a document
    /// entering or changing inside the result set, id → null for one
    /// leaving it, `None` when nothing client-visible changed.
    fn fetch_update(&self, reason: Option<&ChangeEvent>) -> Option<Value> {
        let Some(event) = reason else {
            let docs = self.collection.find(&self.query, self.sort.as_ref());

            let mut ids = HashSet::with_capacity(docs.len());
            let mut snapshot = Map::new();
            for (id, doc) in docs {
                ids.insert(id.clone());
                snapshot.insert(id, project(&doc, self.fields.as_ref()));
            }
            if let Ok(mut state) = self.state.lock() {
                state.ids = ids;
            }
            return Some(Value::Object(snapshot));
        };

        if event.kind == ChangeKind::Delete {
            return self.remove_member(&event.id);
        }

        let doc = event
            .full_document
            .clone()
            .or_else(|| self.collection.get(&event.id));

        match doc {
            Some(doc) if self.query.matches(&doc) => {
                if let Ok(mut state) = self.state.lock() {
                    state.ids.insert(event.id.clone());
                }
                Some(map_entry(&event.id, project(&doc, self.fields.as_ref())))
            }
            // No longer (or never) matching: emit a removal if the
            // document was a member
            _ => self.remove_member(&event.id),
        }
    }

    fn remove_member(&self, id: &str) -> Option<Value> {
        let removed = self
            .state
            .lock()
            .map(|mut state| state.ids.remove(id))
            .unwrap_or(false);
        removed.then(|| map_entry(id, Value::Null))
    }

    /// Full fetch-and-deliver cycle (initial snapshot, renew, broadcast)
    pub(crate) async fn changed(&self, reason: Option<&ChangeEvent>) -> EngineResult<()> {
        if self.is_cancelled() {
            return Ok(());
        }
        let Some(payload) = self.fetch_update(reason) else {
            return Ok(());
        };
        if self.is_cancelled() {
            return Ok(());
        }
        (self.deliver)(vec![payload]);
        Ok(())
    }

    /// Deliver the pending buffer as one batch
    pub(crate) fn flush(&self) {
        if self.is_cancelled() {
            return;
        }
        let batch = self
            .state
            .lock()
            .map(|mut state| std::mem::take(&mut state.pending))
            .unwrap_or_default();

        if !batch.is_empty() {
            (self.deliver)(batch);
        }
    }

    pub(crate) fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(publication = %self.publication.name(), "cancelling map subscription");
        self.publication.unsubscribe(self.id, &self.args);
        self.timer.cancel();

        if let Ok(mut listener) = self.listener.lock() {
            if let Some(task) = listener.take() {
                task.abort();
            }
        }
        if let Ok(mut state) = self.state.lock() {
            state.pending.clear();
        }
    }
}

/// `{id: value}` as a one-entry JSON object
fn map_entry(id: &str, value: Value) -> Value {
    let mut entry = Map::new();
    entry.insert(id.to_string(), value);
    Value::Object(entry)
}

/// Whether an update touching `path` is relevant to a subscription
/// tracking `field`: exact match, or one is a dot-path prefix of the
/// other. An update to `"a"` rewrites everything under it; an update to
/// `"a.x"` changes the tracked value of `"a"`.
fn path_touches(path: &str, field: &str) -> bool {
    path == field || dot_prefixed(path, field) || dot_prefixed(field, path)
}

fn dot_prefixed(longer: &str, shorter: &str) -> bool {
    longer.starts_with(shorter) && longer.as_bytes().get(shorter.len()) == Some(&b'.')
}

fn update_touches(update: &UpdateDescription, fields: &HashSet<String>) -> bool {
    update
        .touched_paths()
        .any(|path| fields.iter().any(|field| path_touches(path, field)))
}

/// Whether an updated path can affect the query's own verdict
fn query_touched(query: &Query, path: &str) -> bool {
    query
        .filters
        .iter()
        .any(|filter| path_touches(path, &filter.field))
}
