//! # Wire Messages
//!
//! The subscribe/unsubscribe/changed contract between the engine and the
//! transport collaborator. Framing and delivery belong to the transport;
//! these types are the only remotely visible surface of the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::publication::PublicationKind;
use crate::subscriptions::SubscriptionKey;

/// Inbound message from a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to a publication
    Subscribe {
        kind: PublicationKind,
        publication: String,
        key: SubscriptionKey,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        immediate: bool,
    },

    /// Cancel the subscription at `key`
    Unsubscribe { key: SubscriptionKey },
}

/// Outbound message to a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Batched subscription update
    Changed {
        key: SubscriptionKey,
        updates: Vec<Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscribe_message_parse() {
        let json = r#"{
            "type": "subscribe",
            "kind": "map",
            "publication": "todos",
            "key": 1,
            "immediate": true
        }"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();

        match msg {
            ClientMessage::Subscribe {
                kind,
                publication,
                key,
                args,
                immediate,
            } => {
                assert_eq!(kind, PublicationKind::Map);
                assert_eq!(publication, "todos");
                assert_eq!(key, SubscriptionKey::Number(1));
                assert!(args.is_empty());
                assert!(immediate);
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_unsubscribe_message_parse() {
        let json = r#"{"type": "unsubscribe", "key": "todos-main"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();

        assert!(matches!(
            msg,
            ClientMessage::Unsubscribe {
                key: SubscriptionKey::Text(_)
            }
        ));
    }

    #[test]
    fn test_changed_message_serialize() {
        let msg = ServerMessage::Changed {
            key: SubscriptionKey::Number(1),
            updates: vec![json!({"1": {"title": "x"}})],
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "changed");
        assert_eq!(json["key"], 1);
        assert_eq!(json["updates"][0]["1"]["title"], "x");
    }
}
