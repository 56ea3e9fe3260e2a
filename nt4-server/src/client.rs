use std::collections::HashMap;

use nt4_core::{subscription_matches, SubscriptionOptions};
use nt4_ws::Guid;

/// A standing request for announces and/or value updates.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub uid: i32,
    pub topics: Vec<String>,
    pub options: SubscriptionOptions,
}

impl Subscription {
    pub fn matches(&self, topic_name: &str) -> bool {
        subscription_matches(&self.topics, self.options.prefix, topic_name)
    }
}

/// A client's declaration that it emits updates for a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Publisher {
    pub uid: i32,
    pub topic: String,
}

/// Per-(client, topic) bookkeeping: the id this client knows the topic
/// under, and whether its first value went out (updates only flow after).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientTopicData {
    pub id: i64,
    pub initial_publish: bool,
}

/// One connected participant, including the synthetic *self* entry the
/// server itself uses (nil GUID, callbacks in place of frames).
pub struct ClientData {
    pub guid: Guid,
    /// Disambiguated display name (`<request-name>@<n>`); used in
    /// `$clientsub$`/`$clientpub$` meta-topic names.
    pub name: String,
    /// `host:port` of the peer as reported in `$clients`.
    pub conn: String,
    pub subscriptions: HashMap<i32, Subscription>,
    pub publishers: HashMap<i32, Publisher>,
    pub topic_data: HashMap<String, ClientTopicData>,
    next_topic_id: i64,
    pub text_cache: String,
    pub binary_cache: Vec<u8>,
}

impl ClientData {
    pub fn new(guid: Guid, name: String, conn: String) -> Self {
        ClientData {
            guid,
            name,
            conn,
            subscriptions: HashMap::new(),
            publishers: HashMap::new(),
            topic_data: HashMap::new(),
            next_topic_id: 0,
            text_cache: String::new(),
            binary_cache: Vec::new(),
        }
    }

    pub fn is_self(&self) -> bool {
        self.guid.is_nil()
    }

    /// True when any subscription matches; with `require_values` only
    /// subscriptions that deliver values (not `topicsonly`) count.
    pub fn is_subscribed(&self, topic_name: &str, require_values: bool) -> bool {
        self.subscriptions
            .values()
            .any(|sub| (!require_values || !sub.options.topicsonly) && sub.matches(topic_name))
    }

    /// The id assigned to `topic_name` for this client, allocating the
    /// next one on first use. Ids are stable for the client's lifetime.
    pub fn assign_topic_id(&mut self, topic_name: &str) -> ClientTopicData {
        let next_topic_id = &mut self.next_topic_id;
        *self
            .topic_data
            .entry(topic_name.to_owned())
            .or_insert_with(|| {
                let id = *next_topic_id;
                *next_topic_id += 1;
                ClientTopicData {
                    id,
                    initial_publish: false,
                }
            })
    }
}
