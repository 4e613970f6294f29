//! # Subscription Handler
//!
//! Wires transport-level events (connect, session change, subscribe and
//! unsubscribe messages, close) to the publication registry and the
//! per-connection subscription containers. Configuration errors at the
//! wire (unknown publication, kind mismatch) are silently ignored: no
//! subscription is created and the connection is left untouched.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::collection::WatchedCollection;
use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::handle::{ConnectionId, DeliverFn, SubscriptionArgs, SubscriptionHandle};
use crate::protocol::ClientMessage;
use crate::publication::{
    FetchFn, Publication, PublicationKind, PublicationRegistry, QueryPropsFn,
};
use crate::subscriptions::{SubscriptionKey, Subscriptions};

/// Outbound delivery surface of the transport collaborator.
///
/// `send_changed` must not block: it hands a batch to the transport's
/// per-connection send path.
pub trait DeliverySink: Send + Sync {
    /// Deliver a batched subscription update to a connection
    fn send_changed(&self, connection: ConnectionId, key: &SubscriptionKey, updates: Vec<Value>);
}

/// A parsed subscribe request
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    /// Requested publication kind; must match the registered one
    pub kind: PublicationKind,
    /// Publication name
    pub publication: String,
    /// Client-chosen key, unique per connection
    pub key: SubscriptionKey,
    /// Opaque extra args, appended after the connection
    pub args: Vec<Value>,
    /// Perform an initial fetch-and-deliver
    pub immediate: bool,
}

/// Top-level wiring between the transport and the engine
pub struct SubscriptionHandler {
    registry: Arc<PublicationRegistry>,
    config: EngineConfig,
    sink: Arc<dyn DeliverySink>,

    /// Per-connection containers, keyed by connection id with mandatory
    /// removal on close
    connections: RwLock<HashMap<ConnectionId, Subscriptions>>,
}

impl SubscriptionHandler {
    /// Create a handler over a registry and a transport sink
    pub fn new(
        registry: Arc<PublicationRegistry>,
        config: EngineConfig,
        sink: Arc<dyn DeliverySink>,
    ) -> Self {
        Self {
            registry,
            config,
            sink,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// The publication registry
    pub fn registry(&self) -> &Arc<PublicationRegistry> {
        &self.registry
    }

    /// Declare and register an object publication
    pub fn publish_object(
        &self,
        name: &str,
        fetch: Option<FetchFn>,
    ) -> EngineResult<Arc<Publication>> {
        let mut publication = Publication::object(name);
        if let Some(fetch) = fetch {
            publication = publication.with_fetch(fetch);
        }
        self.registry.register(publication)
    }

    /// Declare and register a map publication over a watched collection
    pub fn publish_map(
        &self,
        name: &str,
        collection: Arc<WatchedCollection>,
        query_props: QueryPropsFn,
    ) -> EngineResult<Arc<Publication>> {
        self.registry
            .register(Publication::map(name, collection, query_props))
    }

    /// Transport event: connection established
    pub async fn handle_connect(&self, connection: ConnectionId) {
        debug!(%connection, "connection established");
        self.connections
            .write()
            .await
            .insert(connection, Subscriptions::new());
    }

    /// Transport event: the connection's session/auth context changed.
    /// Every subscription is renewed: the same args may now resolve to
    /// different, access-controlled data.
    pub async fn handle_session_changed(&self, connection: ConnectionId) {
        let connections = self.connections.read().await;
        if let Some(subscriptions) = connections.get(&connection) {
            subscriptions.renew_all().await;
        }
    }

    /// Bulk renewal for a set of connections
    pub async fn renew_for(&self, targets: &[ConnectionId]) {
        let connections = self.connections.read().await;
        for connection in targets {
            if let Some(subscriptions) = connections.get(connection) {
                subscriptions.renew_all().await;
            }
        }
    }

    /// Transport event: subscribe message.
    ///
    /// Configuration errors are wire-silent: logged, no subscription
    /// created, connection untouched.
    pub async fn handle_subscribe(&self, connection: ConnectionId, request: SubscribeRequest) {
        if let Err(e) = self.try_subscribe(connection, request).await {
            debug!(%connection, error = %e, "subscribe refused");
        }
    }

    /// Fallible subscribe path
    pub async fn try_subscribe(
        &self,
        connection: ConnectionId,
        request: SubscribeRequest,
    ) -> EngineResult<()> {
        let publication = self
            .registry
            .lookup(&request.publication)
            .ok_or_else(|| EngineError::UnknownPublication(request.publication.clone()))?;
        if publication.kind() != request.kind {
            return Err(EngineError::KindMismatch {
                name: request.publication.clone(),
                requested: request.kind.to_string(),
                registered: publication.kind().to_string(),
            });
        }

        let mut connections = self.connections.write().await;
        let subscriptions = connections
            .get_mut(&connection)
            .ok_or_else(|| EngineError::Internal(format!("unknown connection {connection}")))?;

        // Reusing an occupied key replaces, so it does not grow the map
        // and is exempt from the cap.
        let max = self.config.max_subscriptions_per_connection;
        if subscriptions.get(&request.key).is_none() && subscriptions.len() >= max {
            warn!(%connection, max, "subscription limit reached");
            return Err(EngineError::TooManySubscriptions(max));
        }

        let sink = Arc::clone(&self.sink);
        let delivery_key = request.key.clone();
        let deliver: DeliverFn = Arc::new(move |updates| {
            sink.send_changed(connection, &delivery_key, updates);
        });

        let args = SubscriptionArgs::new(connection, request.args);
        let handle = SubscriptionHandle::create(
            publication,
            args,
            deliver,
            request.immediate,
            &self.config,
        )?;
        subscriptions.subscribe(request.key, handle);
        Ok(())
    }

    /// Transport event: unsubscribe message
    pub async fn handle_unsubscribe(&self, connection: ConnectionId, key: &SubscriptionKey) {
        let mut connections = self.connections.write().await;
        if let Some(subscriptions) = connections.get_mut(&connection) {
            subscriptions.cancel(key);
        }
    }

    /// Transport event: connection closed. Cancels every subscription
    /// and releases the container.
    pub async fn handle_close(&self, connection: ConnectionId) {
        let container = self.connections.write().await.remove(&connection);
        if let Some(mut subscriptions) = container {
            info!(%connection, count = subscriptions.len(), "connection closed, tearing down");
            subscriptions.cancel_all();
        }
    }

    /// Dispatch a parsed wire message
    pub async fn handle_message(&self, connection: ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::Subscribe {
                kind,
                publication,
                key,
                args,
                immediate,
            } => {
                self.handle_subscribe(
                    connection,
                    SubscribeRequest {
                        kind,
                        publication,
                        key,
                        args,
                        immediate,
                    },
                )
                .await;
            }
            ClientMessage::Unsubscribe { key } => {
                self.handle_unsubscribe(connection, &key).await;
            }
        }
    }

    /// Number of tracked connections
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Number of active subscriptions for a connection
    pub async fn subscription_count(&self, connection: ConnectionId) -> usize {
        self.connections
            .read()
            .await
            .get(&connection)
            .map(Subscriptions::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    /// Sink that drops everything
    struct NullSink;

    impl DeliverySink for NullSink {
        fn send_changed(&self, _: ConnectionId, _: &SubscriptionKey, _: Vec<Value>) {}
    }

    fn handler() -> SubscriptionHandler {
        SubscriptionHandler::new(
            Arc::new(PublicationRegistry::new()),
            EngineConfig::default(),
            Arc::new(NullSink),
        )
    }

    #[tokio::test]
    async fn test_connect_and_close() {
        let handler = handler();
        let connection = Uuid::new_v4();

        handler.handle_connect(connection).await;
        assert_eq!(handler.connection_count().await, 1);

        handler.handle_close(connection).await;
        assert_eq!(handler.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_publication_is_ignored() {
        let handler = handler();
        let connection = Uuid::new_v4();
        handler.handle_connect(connection).await;

        handler
            .handle_subscribe(
                connection,
                SubscribeRequest {
                    kind: PublicationKind::Object,
                    publication: "nope".to_string(),
                    key: 1.into(),
                    args: vec![],
                    immediate: false,
                },
            )
            .await;

        assert_eq!(handler.subscription_count(connection).await, 0);
    }

    #[tokio::test]
    async fn test_subscribe_kind_mismatch_is_ignored() {
        let handler = handler();
        let connection = Uuid::new_v4();
        handler.handle_connect(connection).await;
        handler.publish_object("stats", None).unwrap();

        handler
            .handle_subscribe(
                connection,
                SubscribeRequest {
                    kind: PublicationKind::Map,
                    publication: "stats".to_string(),
                    key: 1.into(),
                    args: vec![],
                    immediate: false,
                },
            )
            .await;

        assert_eq!(handler.subscription_count(connection).await, 0);
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let handler = handler();
        let connection = Uuid::new_v4();
        handler.handle_connect(connection).await;
        handler.publish_object("stats", None).unwrap();

        handler
            .handle_subscribe(
                connection,
                SubscribeRequest {
                    kind: PublicationKind::Object,
                    publication: "stats".to_string(),
                    key: 1.into(),
                    args: vec![],
                    immediate: false,
                },
            )
            .await;
        assert_eq!(handler.subscription_count(connection).await, 1);

        handler.handle_unsubscribe(connection, &1.into()).await;
        assert_eq!(handler.subscription_count(connection).await, 0);
    }

    #[tokio::test]
    async fn test_subscription_limit() {
        let config = EngineConfig {
            max_subscriptions_per_connection: 2,
            ..EngineConfig::default()
        };
        let handler = SubscriptionHandler::new(
            Arc::new(PublicationRegistry::new()),
            config,
            Arc::new(NullSink),
        );
        let connection = Uuid::new_v4();
        handler.handle_connect(connection).await;
        handler.publish_object("stats", None).unwrap();

        for key in 0i64..4 {
            handler
                .handle_subscribe(
                    connection,
                    SubscribeRequest {
                        kind: PublicationKind::Object,
                        publication: "stats".to_string(),
                        key: key.into(),
                        args: vec![],
                        immediate: false,
                    },
                )
                .await;
        }

        assert_eq!(handler.subscription_count(connection).await, 2);
    }

    #[tokio::test]
    async fn test_try_subscribe_reports_configuration_errors() {
        let config = EngineConfig {
            max_subscriptions_per_connection: 1,
            ..EngineConfig::default()
        };
        let handler = SubscriptionHandler::new(
            Arc::new(PublicationRegistry::new()),
            config,
            Arc::new(NullSink),
        );
        let connection = Uuid::new_v4();
        handler.handle_connect(connection).await;
        handler.publish_object("stats", None).unwrap();

        let request = |key: i64, name: &str| SubscribeRequest {
            kind: PublicationKind::Object,
            publication: name.to_string(),
            key: key.into(),
            args: vec![],
            immediate: false,
        };

        let err = handler
            .try_subscribe(connection, request(1, "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownPublication(_)));

        handler
            .try_subscribe(connection, request(1, "stats"))
            .await
            .unwrap();
        let err = handler
            .try_subscribe(connection, request(2, "stats"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TooManySubscriptions(1)));
    }

    #[tokio::test]
    async fn test_key_reuse_is_exempt_from_limit() {
        let config = EngineConfig {
            max_subscriptions_per_connection: 1,
            ..EngineConfig::default()
        };
        let handler = SubscriptionHandler::new(
            Arc::new(PublicationRegistry::new()),
            config,
            Arc::new(NullSink),
        );
        let connection = Uuid::new_v4();
        handler.handle_connect(connection).await;
        handler.publish_object("stats", None).unwrap();

        let request = || SubscribeRequest {
            kind: PublicationKind::Object,
            publication: "stats".to_string(),
            key: 1.into(),
            args: vec![],
            immediate: false,
        };

        handler.try_subscribe(connection, request()).await.unwrap();
        // At the cap, but the key is occupied: replacement does not grow
        // the map.
        handler.try_subscribe(connection, request()).await.unwrap();
        assert_eq!(handler.subscription_count(connection).await, 1);
    }

    #[tokio::test]
    async fn test_handle_message_dispatch() {
        let handler = handler();
        let connection = Uuid::new_v4();
        handler.handle_connect(connection).await;
        handler.publish_object("stats", None).unwrap();

        let subscribe: ClientMessage = serde_json::from_str(
            r#"{"type": "subscribe", "kind": "object", "publication": "stats", "key": 9}"#,
        )
        .unwrap();
        handler.handle_message(connection, subscribe).await;
        assert_eq!(handler.subscription_count(connection).await, 1);

        let unsubscribe: ClientMessage =
            serde_json::from_str(r#"{"type": "unsubscribe", "key": 9}"#).unwrap();
        handler.handle_message(connection, unsubscribe).await;
        assert_eq!(handler.subscription_count(connection).await, 0);
    }
}
