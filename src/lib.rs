//! livesub - real-time publish/subscribe engine with incremental
//! live-query invalidation
//!
//! Keeps remote clients' views of server-side data synchronized without
//! re-sending unrelated data or re-running expensive queries on every
//! write:
//!
//! - **Publications**: named data feeds, single-value (`object`) or
//!   keyed-by-document (`map`), held in an explicit process-scoped
//!   registry.
//! - **Subscription handles**: one per (connection, publication, args)
//!   binding, performing fetch-and-deliver on demand.
//! - **Collection-map handles**: consume a watched collection's change
//!   feed, track query membership incrementally, filter events by
//!   field-level relevance, and debounce refetches into batched
//!   deliveries.
//! - **Subscription handler**: wires transport events (connect, session
//!   change, subscribe/unsubscribe, close) to the above.
//!
//! The transport itself, sessions, and the production data store are
//! external collaborators; the engine consumes them through the
//! [`handler::DeliverySink`] trait, the [`protocol`] message types, and
//! the [`collection::WatchedCollection`] surface.

pub mod collection;
pub mod config;
pub mod debounce;
pub mod errors;
pub mod event;
pub mod handle;
pub mod handler;
pub mod map_handle;
pub mod protocol;
pub mod publication;
pub mod query;
pub mod subscriptions;

pub use collection::WatchedCollection;
pub use config::EngineConfig;
pub use debounce::FlushTimer;
pub use errors::{EngineError, EngineResult};
pub use event::{ChangeEvent, ChangeKind, DocumentId, UpdateDescription};
pub use handle::{ConnectionId, DeliverFn, HandleId, SubscriptionArgs, SubscriptionHandle};
pub use handler::{DeliverySink, SubscribeRequest, SubscriptionHandler};
pub use map_handle::CollectionMapHandle;
pub use protocol::{ClientMessage, ServerMessage};
pub use publication::{
    FetchFn, FetchFuture, HookFn, MapSource, Publication, PublicationKind, PublicationRegistry,
    QueryProps, QueryPropsFn,
};
pub use query::{FieldFilter, FilterOp, Query, Sort, SortOrder};
pub use subscriptions::{SubscriptionKey, Subscriptions};
