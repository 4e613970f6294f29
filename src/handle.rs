//! # Subscription Handles
//!
//! A handle binds one client's call arguments to one publication and
//! performs fetch-and-deliver on demand. The two shapes, simple for
//! object publications and collection-map for map publications over a
//! change feed, sit behind one tagged variant dispatched by kind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::event::ChangeEvent;
use crate::map_handle::CollectionMapHandle;
use crate::publication::{Publication, PublicationKind};

/// Identifier of one transport connection
pub type ConnectionId = Uuid;

/// Identifier of one subscription handle
pub type HandleId = Uuid;

/// The call arguments binding a subscription: the requesting connection
/// plus the client's opaque rest-args, passed through to fetch functions
/// and query configuration.
#[derive(Debug, Clone)]
pub struct SubscriptionArgs {
    /// The requesting connection
    pub connection: ConnectionId,
    /// Remaining call arguments, opaque to the engine
    pub rest: Vec<Value>,
}

impl SubscriptionArgs {
    /// Bind a connection with rest-args
    pub fn new(connection: ConnectionId, rest: Vec<Value>) -> Self {
        Self { connection, rest }
    }
}

/// Delivery callback: called with an ordered batch of fetch results.
/// Callers must not assume call frequency, only that each payload is
/// valid at time of send.
pub type DeliverFn = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Handle for an object publication: fetch on demand, deliver a
/// single-element batch.
pub struct SimpleHandle {
    id: HandleId,
    publication: Arc<Publication>,
    args: SubscriptionArgs,
    deliver: DeliverFn,
    cancelled: AtomicBool,
}

impl SimpleHandle {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn changed(&self) -> EngineResult<()> {
        if self.is_cancelled() {
            return Ok(());
        }

        let value = self.publication.fetch_for(&self.args).await?;

        // The handle may have been cancelled while the fetch was pending
        if self.is_cancelled() {
            return Ok(());
        }
        (self.deliver)(vec![value.unwrap_or(Value::Null)]);
        Ok(())
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.publication.unsubscribe(self.id, &self.args);
    }
}

/// One client subscription, dispatched by publication kind
pub enum SubscriptionHandle {
    /// Object publication handle
    Simple(SimpleHandle),
    /// Map publication handle over a watched collection
    CollectionMap(CollectionMapHandle),
}

impl SubscriptionHandle {
    /// Construct a handle for a publication and register it.
    ///
    /// For map publications this resolves the per-subscriber query
    /// configuration (a `None` result refuses the subscription) and
    /// attaches the change-feed listener. If `immediate` is set, one
    /// initial fetch-and-deliver cycle is scheduled before returning.
    pub fn create(
        publication: Arc<Publication>,
        args: SubscriptionArgs,
        deliver: DeliverFn,
        immediate: bool,
        config: &EngineConfig,
    ) -> EngineResult<Arc<Self>> {
        let handle = match publication.kind() {
            PublicationKind::Object => {
                let simple = SimpleHandle {
                    id: Uuid::new_v4(),
                    publication: Arc::clone(&publication),
                    args,
                    deliver,
                    cancelled: AtomicBool::new(false),
                };
                let handle = Arc::new(SubscriptionHandle::Simple(simple));
                publication.subscribe(&handle);
                handle
            }
            PublicationKind::Map => {
                let source = publication.map_source().ok_or_else(|| {
                    EngineError::Internal(format!(
                        "map publication '{}' has no collection source",
                        publication.name()
                    ))
                })?;
                let props = (source.query_props)(&args)
                    .ok_or_else(|| EngineError::Refused(publication.name().to_string()))?;

                let map = CollectionMapHandle::new(
                    Arc::clone(&publication),
                    Arc::clone(&source.collection),
                    args,
                    deliver,
                    props,
                    config,
                );
                let handle = Arc::new(SubscriptionHandle::CollectionMap(map));
                publication.subscribe(&handle);
                CollectionMapHandle::attach_listener(&handle);
                handle
            }
        };

        if immediate {
            let initial = Arc::clone(&handle);
            tokio::spawn(async move {
                if let Err(e) = initial.changed(None).await {
                    warn!(
                        publication = %initial.publication().name(),
                        error = %e,
                        "initial fetch failed"
                    );
                }
            });
        }

        Ok(handle)
    }

    /// Handle identifier
    pub fn id(&self) -> HandleId {
        match self {
            SubscriptionHandle::Simple(handle) => handle.id,
            SubscriptionHandle::CollectionMap(handle) => handle.id(),
        }
    }

    /// The bound call arguments
    pub fn args(&self) -> &SubscriptionArgs {
        match self {
            SubscriptionHandle::Simple(handle) => &handle.args,
            SubscriptionHandle::CollectionMap(handle) => handle.args(),
        }
    }

    /// The owning publication
    pub fn publication(&self) -> &Arc<Publication> {
        match self {
            SubscriptionHandle::Simple(handle) => &handle.publication,
            SubscriptionHandle::CollectionMap(handle) => handle.publication(),
        }
    }

    /// Whether this handle has been cancelled
    pub fn is_cancelled(&self) -> bool {
        match self {
            SubscriptionHandle::Simple(handle) => handle.is_cancelled(),
            SubscriptionHandle::CollectionMap(handle) => handle.is_cancelled(),
        }
    }

    /// Fetch the current value and deliver it.
    ///
    /// `reason = None` means a full refetch (for map handles, a full
    /// snapshot rebuilding membership).
    pub async fn changed(&self, reason: Option<&ChangeEvent>) -> EngineResult<()> {
        match self {
            SubscriptionHandle::Simple(handle) => handle.changed().await,
            SubscriptionHandle::CollectionMap(handle) => handle.changed(reason).await,
        }
    }

    /// Unconditionally refetch and redeliver. Used after a connection's
    /// session context changes: the same args may now resolve to
    /// different, access-controlled data.
    pub async fn renew(&self) -> EngineResult<()> {
        self.changed(None).await
    }

    /// Cancel the subscription: unsubscribe from the publication and,
    /// for map handles, detach the change-feed listener and clear the
    /// flush timer. Idempotent.
    pub fn cancel(&self) {
        match self {
            SubscriptionHandle::Simple(handle) => handle.cancel(),
            SubscriptionHandle::CollectionMap(handle) => handle.cancel(),
        }
    }
}
