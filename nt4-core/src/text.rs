use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::props::{PropertiesUpdate, SubscriptionOptions, TopicProperties};

/// Methods a server can receive. `announce`/`unannounce`/`properties` are
/// client-directed and parsed here only so a server can ignore them (and a
/// client can reuse the same reader).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "lowercase")]
pub enum ClientMessage {
    Publish {
        name: String,
        pubuid: i32,
        #[serde(rename = "type")]
        data_type: String,
        #[serde(default)]
        properties: PropertiesUpdate,
    },
    Unpublish {
        pubuid: i32,
    },
    SetProperties {
        name: String,
        update: PropertiesUpdate,
    },
    Subscribe {
        topics: Vec<String>,
        subuid: i32,
        #[serde(default)]
        options: SubscriptionOptions,
    },
    Unsubscribe {
        subuid: i32,
    },
    Announce {
        name: String,
        id: i64,
        #[serde(rename = "type")]
        data_type: String,
        #[serde(default)]
        pubuid: Option<i32>,
        #[serde(default)]
        properties: TopicProperties,
    },
    Unannounce {
        name: String,
        id: i64,
    },
    Properties {
        name: String,
        #[serde(default)]
        ack: bool,
        #[serde(default)]
        update: PropertiesUpdate,
    },
}

const KNOWN_METHODS: &[&str] = &[
    "publish",
    "unpublish",
    "setproperties",
    "subscribe",
    "unsubscribe",
    "announce",
    "unannounce",
    "properties",
];

/// Server-to-client text messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "lowercase")]
pub enum ServerMessage {
    Announce {
        name: String,
        id: i64,
        #[serde(rename = "type")]
        data_type: String,
        /// Present only on the announce sent to the publishing client.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pubuid: Option<i32>,
        properties: TopicProperties,
    },
    Unannounce {
        name: String,
        id: i64,
    },
    Properties {
        name: String,
        #[serde(default, skip_serializing_if = "is_false")]
        ack: bool,
        update: PropertiesUpdate,
    },
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ServerMessage {
    /// Serializes one message object for the per-client text cache. The
    /// batch flush wraps the comma-joined objects in `[...]`.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Parses a text frame: a JSON array of `{"method", "params"}` objects.
///
/// Unknown methods are skipped. A malformed element with a recognized
/// method truncates the batch at that point; everything parsed before it
/// still takes effect. A malformed document parses as no messages. Never
/// an error: the session stays open regardless.
pub fn parse_client_messages(data: &[u8]) -> Vec<ClientMessage> {
    let document: JsonValue = match serde_json::from_slice(data) {
        Ok(value) => value,
        Err(err) => {
            debug!("discarding unparseable text frame: {}", err);
            return Vec::new();
        }
    };

    let elements = match document {
        JsonValue::Array(elements) => elements,
        _ => {
            debug!("text frame is not a message array");
            return Vec::new();
        }
    };

    let mut messages = Vec::with_capacity(elements.len());
    for element in elements {
        let method = element
            .get("method")
            .and_then(JsonValue::as_str)
            .map(str::to_owned);

        match serde_json::from_value::<ClientMessage>(element) {
            Ok(message) => messages.push(message),
            Err(err) => match method {
                Some(ref m) if KNOWN_METHODS.contains(&m.as_str()) => {
                    debug!("truncating message batch at malformed `{}`: {}", m, err);
                    break;
                }
                other => {
                    debug!("skipping message with unknown method {:?}", other);
                    continue;
                }
            },
        }
    }

    messages
}
