use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use log::{debug, info, trace};
use parking_lot::{Mutex, RwLock};

use nt4_core::{
    parse_client_messages, ClientMessage, DataType, DataValue, PropertiesUpdate, ServerMessage,
    SubscriptionOptions, TopicProperties, ValueFrame, RTT_ID,
};
use nt4_ws::{
    ClientEntry, Guid, MessageFrame, MessageKind, Opcode, WsServer, WsServerConfig,
    WsServerHandler,
};

use crate::client::{ClientData, Publisher, Subscription};
use crate::clock::Clock;
use crate::meta;
use crate::topic::{AnnouncedTopic, Topic};

/// The NT4 default server port.
pub const NT4_SERVER_PORT: u16 = 5810;
/// The single subprotocol the server accepts.
pub const NT_PROTOCOL: &str = "v4.1.networktables.first.wpi.edu";

pub const MAX_CLIENT_TEXT_CACHE_LENGTH: usize = 512;
pub const MAX_CLIENT_BINARY_CACHE_LENGTH: usize = 512;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ws: WsServerConfig,
    /// Text cache flush threshold, bracket bytes included.
    pub text_cache_limit: usize,
    pub binary_cache_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            ws: WsServerConfig {
                port: NT4_SERVER_PORT,
                ..Default::default()
            },
            text_cache_limit: MAX_CLIENT_TEXT_CACHE_LENGTH,
            binary_cache_limit: MAX_CLIENT_BINARY_CACHE_LENGTH,
        }
    }
}

/// Callbacks through which the local participant observes the table, the
/// counterpart of the wire messages a remote subscriber would receive.
pub trait InstanceHandler: Send + Sync {
    fn topic_announced(&self, _topic: &AnnouncedTopic) {}
    fn topic_unannounced(&self, _name: &str, _id: i64) {}
    fn topic_update(&self, _id: i64, _timestamp: u64, _value: &DataValue) {}
    fn topic_properties_update(&self, _name: &str, _properties: TopicProperties) {}
}

/// Deferred handler invocations, collected while the state lock is held
/// and dispatched after it is released.
enum Event {
    Announced(AnnouncedTopic),
    Unannounced { name: String, id: i64 },
    Update {
        id: i64,
        timestamp: u64,
        value: DataValue,
    },
    Properties {
        name: String,
        properties: TopicProperties,
    },
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Topic>,
    clients: HashMap<Guid, ClientData>,
}

struct Inner {
    ws: WsServer,
    clock: Clock,
    config: ServerConfig,
    state: Mutex<State>,
    handler: RwLock<Option<Arc<dyn InstanceHandler>>>,
}

/// A NetworkTables 4.1 server.
///
/// The instance owns the topic registry and every client's subscription
/// and publication state. Local code participates through the same
/// operations remote clients invoke over the wire, acting as the
/// synthetic *self* client whose "frames" are [`InstanceHandler`]
/// callbacks.
pub struct Instance {
    inner: Arc<Inner>,
}

impl Instance {
    pub fn new(config: ServerConfig) -> Self {
        let ws = WsServer::new(config.ws.clone());
        let inner = Arc::new(Inner {
            ws,
            clock: Clock::new(),
            config,
            state: Mutex::new(State::default()),
            handler: RwLock::new(None),
        });
        inner.state.lock().clients.insert(
            Guid::nil(),
            ClientData::new(Guid::nil(), "server".to_owned(), String::new()),
        );
        Instance { inner }
    }

    /// Binds the listener and starts serving.
    pub fn start(&self) -> io::Result<()> {
        let inner_dyn: Arc<dyn WsServerHandler> = self.inner.clone();
        let weak: Weak<dyn WsServerHandler> = Arc::downgrade(&inner_dyn);
        self.inner.ws.start(weak)
    }

    pub fn stop(&self) {
        self.inner.ws.stop();
    }

    pub fn is_listening(&self) -> bool {
        self.inner.ws.is_listening()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.ws.local_addr()
    }

    pub fn set_handler(&self, handler: Arc<dyn InstanceHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    /// Microseconds of server time. On the server this is the raw
    /// monotonic clock; the offset only ever moves on a client.
    pub fn server_time(&self) -> u64 {
        self.inner.clock.server_time()
    }

    pub fn server_time_offset(&self) -> i64 {
        self.inner.clock.offset()
    }

    /// Inserts or replaces a local subscription.
    pub fn subscribe(&self, topics: Vec<String>, subuid: i32, options: SubscriptionOptions) {
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            self.inner
                .op_subscribe(&mut state, Guid::nil(), topics, subuid, options, &mut events);
            self.inner.flush_text_all(&mut state);
        }
        self.inner.dispatch(events);
    }

    pub fn unsubscribe(&self, subuid: i32) {
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            self.inner
                .op_unsubscribe(&mut state, Guid::nil(), subuid, &mut events);
            self.inner.flush_text_all(&mut state);
        }
        self.inner.dispatch(events);
    }

    /// Declares a local publisher, creating the topic if needed. Returns
    /// what was announced back to the local participant.
    pub fn publish(
        &self,
        name: &str,
        pubuid: i32,
        data_type: DataType,
        properties: PropertiesUpdate,
    ) -> Option<AnnouncedTopic> {
        let mut events = Vec::new();
        let announced;
        {
            let mut state = self.inner.state.lock();
            announced = self.inner.op_publish(
                &mut state,
                Guid::nil(),
                name.to_owned(),
                pubuid,
                data_type,
                properties,
                &mut events,
            );
            self.inner.flush_text_all(&mut state);
        }
        self.inner.dispatch(events);
        announced
    }

    pub fn unpublish(&self, pubuid: i32) {
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            self.inner
                .op_unpublish(&mut state, Guid::nil(), pubuid, &mut events);
            self.inner.flush_text_all(&mut state);
        }
        self.inner.dispatch(events);
    }

    /// Applies a partial properties update; absent fields stay unchanged.
    /// Returns the resulting properties, or None for an unknown topic.
    pub fn set_properties(&self, name: &str, update: PropertiesUpdate) -> Option<TopicProperties> {
        let mut events = Vec::new();
        let properties;
        {
            let mut state = self.inner.state.lock();
            properties =
                self.inner
                    .op_set_properties(&mut state, Guid::nil(), name, update, &mut events);
            self.inner.flush_text_all(&mut state);
        }
        self.inner.dispatch(events);
        properties
    }

    /// Assigns a value through a local publisher. False on a type
    /// mismatch or unknown publisher. Outbound updates stage in the
    /// per-client binary caches until a threshold or [`Instance::flush`].
    pub fn update_topic(&self, pubuid: i32, value: DataValue) -> bool {
        self.update_inner(pubuid, value, None)
    }

    /// Like [`Instance::update_topic`] with an explicit microsecond
    /// server-time stamp.
    pub fn update_topic_with_time(&self, pubuid: i32, value: DataValue, time: u64) -> bool {
        self.update_inner(pubuid, value, Some(time))
    }

    fn update_inner(&self, pubuid: i32, value: DataValue, time: Option<u64>) -> bool {
        let mut events = Vec::new();
        let updated;
        {
            let mut state = self.inner.state.lock();
            updated = self.inner.op_update_topic(
                &mut state,
                Guid::nil(),
                pubuid,
                value,
                time,
                &mut events,
            );
        }
        self.inner.dispatch(events);
        updated
    }

    /// Immediately drains the binary cache of every client.
    pub fn flush(&self) {
        let mut state = self.inner.state.lock();
        self.inner.flush_binary_all(&mut state);
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.stop();
    }
}

impl WsServerHandler for Inner {
    fn select_protocol(&self, requested: &[String]) -> Option<String> {
        requested.iter().find(|p| p.as_str() == NT_PROTOCOL).cloned()
    }

    fn client_connected(&self, entry: &ClientEntry) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            self.register_client(&mut state, entry.guid, &entry.path, entry.conn(), &mut events);
            self.flush_all(&mut state);
        }
        self.dispatch(events);
    }

    fn client_disconnected(&self, guid: &Guid, code: u16, reason: &str) {
        trace!("client {} left ({}: {:?})", guid, code, reason);
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            self.remove_client(&mut state, *guid, &mut events);
            self.flush_all(&mut state);
        }
        self.dispatch(events);
    }

    fn message_received(&self, guid: &Guid, frame: &MessageFrame) {
        // Fragments are delivered again, whole, with the final piece.
        if frame.is_fragment {
            return;
        }
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            match frame.opcode {
                Opcode::Text => self.handle_text(&mut state, *guid, &frame.payload, &mut events),
                Opcode::Binary => {
                    self.handle_binary(&mut state, *guid, &frame.payload, &mut events)
                }
                _ => {}
            }
            self.flush_all(&mut state);
        }
        self.dispatch(events);
    }
}

impl Inner {
    fn dispatch(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let handler = match self.handler.read().clone() {
            Some(handler) => handler,
            None => return,
        };
        for event in events {
            match event {
                Event::Announced(topic) => handler.topic_announced(&topic),
                Event::Unannounced { name, id } => handler.topic_unannounced(&name, id),
                Event::Update {
                    id,
                    timestamp,
                    value,
                } => handler.topic_update(id, timestamp, &value),
                Event::Properties { name, properties } => {
                    handler.topic_properties_update(&name, properties)
                }
            }
        }
    }

    /* ------------------------- client lifecycle ------------------------- */

    fn register_client(
        &self,
        state: &mut State,
        guid: Guid,
        path: &str,
        conn: String,
        events: &mut Vec<Event>,
    ) {
        let base = client_name_from_path(path);
        let name = disambiguate_name(state, base);
        info!("nt client {} registered as {}", guid, name);
        state
            .clients
            .insert(guid, ClientData::new(guid, name, conn));
        self.update_clients_meta(state, events);
    }

    fn remove_client(&self, state: &mut State, guid: Guid, events: &mut Vec<Event>) {
        let client = match state.clients.remove(&guid) {
            Some(client) => client,
            None => return,
        };
        info!("nt client {} ({}) removed", guid, client.name);

        let mut published: Vec<String> = Vec::new();
        for publisher in client.publishers.values() {
            if let Some(topic) = state.topics.get_mut(&publisher.topic) {
                topic.publisher_count = topic.publisher_count.saturating_sub(1);
                published.push(publisher.topic.clone());
            }
        }
        let subscribed: Vec<String> = state
            .topics
            .keys()
            .filter(|name| !name.starts_with('$') && client.is_subscribed(name, false))
            .cloned()
            .collect();

        self.update_clients_meta(state, events);
        for name in &published {
            if !name.starts_with('$') {
                self.update_topic_pub_meta(state, name, events);
            }
        }
        for name in &subscribed {
            self.update_topic_sub_meta(state, name, events);
        }
        for name in published {
            self.maybe_reap(state, &name, events);
        }
    }

    /* --------------------------- frame intake --------------------------- */

    fn handle_text(&self, state: &mut State, guid: Guid, payload: &[u8], events: &mut Vec<Event>) {
        for message in parse_client_messages(payload) {
            match message {
                ClientMessage::Publish {
                    name,
                    pubuid,
                    data_type,
                    properties,
                } => match data_type.parse::<DataType>() {
                    Ok(data_type) => {
                        self.op_publish(state, guid, name, pubuid, data_type, properties, events);
                    }
                    Err(err) => debug!("dropping publish: {}", err),
                },
                ClientMessage::Unpublish { pubuid } => {
                    self.op_unpublish(state, guid, pubuid, events)
                }
                ClientMessage::SetProperties { name, update } => {
                    self.op_set_properties(state, guid, &name, update, events);
                }
                ClientMessage::Subscribe {
                    topics,
                    subuid,
                    options,
                } => self.op_subscribe(state, guid, topics, subuid, options, events),
                ClientMessage::Unsubscribe { subuid } => {
                    self.op_unsubscribe(state, guid, subuid, events)
                }
                ClientMessage::Announce { .. }
                | ClientMessage::Unannounce { .. }
                | ClientMessage::Properties { .. } => {
                    trace!("ignoring client-directed message from {}", guid)
                }
            }
        }
    }

    fn handle_binary(
        &self,
        state: &mut State,
        guid: Guid,
        payload: &[u8],
        events: &mut Vec<Event>,
    ) {
        for frame in ValueFrame::decode_all(payload) {
            if frame.is_rtt() {
                // Answered immediately, never batched.
                let reply =
                    ValueFrame::new(RTT_ID, self.clock.server_time(), frame.value).encoded();
                self.ws.send(&guid, &reply, MessageKind::Binary);
            } else {
                let pubuid = frame.id as i32;
                let time = if frame.timestamp != 0 {
                    Some(frame.timestamp)
                } else {
                    None
                };
                self.op_update_topic(state, guid, pubuid, frame.value, time, events);
            }
        }
    }

    /* ---------------------------- operations ---------------------------- */

    fn op_subscribe(
        &self,
        state: &mut State,
        guid: Guid,
        topic_entries: Vec<String>,
        subuid: i32,
        options: SubscriptionOptions,
        events: &mut Vec<Event>,
    ) {
        let matched_names;
        {
            let State { topics, clients } = &mut *state;
            let client = match clients.get_mut(&guid) {
                Some(client) => client,
                None => return,
            };
            trace!("{} subscribes {:?} (uid {})", client.name, topic_entries, subuid);
            client.subscriptions.insert(
                subuid,
                Subscription {
                    uid: subuid,
                    topics: topic_entries,
                    options,
                },
            );

            let matched: Vec<&Topic> = topics
                .values()
                .filter(|topic| client.is_subscribed(&topic.name, false))
                .collect();

            for &topic in &matched {
                if topic.properties.cached {
                    self.announce_to(client, topic, None, events);
                }
            }
            for &topic in &matched {
                if !topic.properties.cached || !client.is_subscribed(&topic.name, true) {
                    continue;
                }
                let pending = client
                    .topic_data
                    .get(&topic.name)
                    .map_or(false, |td| !td.initial_publish);
                if pending {
                    self.send_value(client, topic, events);
                }
            }

            matched_names = matched
                .iter()
                .filter(|topic| !topic.is_meta())
                .map(|topic| topic.name.clone())
                .collect::<Vec<_>>();
        }

        self.update_client_sub_meta(state, guid, events);
        for name in matched_names {
            self.update_topic_sub_meta(state, &name, events);
        }
    }

    fn op_unsubscribe(&self, state: &mut State, guid: Guid, subuid: i32, events: &mut Vec<Event>) {
        let affected;
        {
            let State { topics, clients } = &mut *state;
            let client = match clients.get_mut(&guid) {
                Some(client) => client,
                None => return,
            };
            let removed = match client.subscriptions.remove(&subuid) {
                Some(removed) => removed,
                None => return,
            };
            affected = topics
                .keys()
                .filter(|name| !name.starts_with('$') && removed.matches(name))
                .cloned()
                .collect::<Vec<_>>();
        }

        self.update_client_sub_meta(state, guid, events);
        for name in affected {
            self.update_topic_sub_meta(state, &name, events);
        }
    }

    fn op_publish(
        &self,
        state: &mut State,
        guid: Guid,
        name: String,
        pubuid: i32,
        data_type: DataType,
        properties: PropertiesUpdate,
        events: &mut Vec<Event>,
    ) -> Option<AnnouncedTopic> {
        if !state.topics.contains_key(&name) {
            let mut topic_properties = TopicProperties::default();
            properties.apply(&mut topic_properties);
            state.topics.insert(
                name.clone(),
                Topic::new(
                    name.clone(),
                    DataValue::default_of(data_type),
                    topic_properties,
                ),
            );
            debug!("created topic {} ({:?})", name, data_type);
        }

        let announced;
        {
            let State { topics, clients } = &mut *state;
            let topic = topics.get_mut(&name).expect("topic just ensured");
            topic.publisher_count += 1;
            let topic = &*topic;

            let publisher = match clients.get_mut(&guid) {
                Some(client) => client,
                None => return None,
            };
            publisher.publishers.insert(
                pubuid,
                Publisher {
                    uid: pubuid,
                    topic: name.clone(),
                },
            );

            // The publisher always gets an announce carrying its pubuid so
            // it can correlate; everyone else only if subscribed, and
            // without the pubuid.
            let id = self.announce_to(publisher, topic, Some(pubuid), events);
            announced = AnnouncedTopic {
                name: name.clone(),
                id,
                data_type: topic.value.data_type(),
                properties: topic.properties,
            };

            for (client_guid, client) in clients.iter_mut() {
                if *client_guid == guid {
                    continue;
                }
                if client.is_subscribed(&name, false) {
                    self.announce_to(client, topic, None, events);
                    if client.is_subscribed(&name, true) {
                        if let Some(td) = client.topic_data.get_mut(&name) {
                            td.initial_publish = true;
                        }
                    }
                }
            }
        }

        if !name.starts_with('$') {
            self.update_client_pub_meta(state, guid, events);
            self.update_topic_pub_meta(state, &name, events);
        }
        Some(announced)
    }

    fn op_unpublish(&self, state: &mut State, guid: Guid, pubuid: i32, events: &mut Vec<Event>) {
        let name;
        {
            let client = match state.clients.get_mut(&guid) {
                Some(client) => client,
                None => return,
            };
            let publisher = match client.publishers.remove(&pubuid) {
                Some(publisher) => publisher,
                None => return,
            };
            name = publisher.topic;
        }
        if let Some(topic) = state.topics.get_mut(&name) {
            topic.publisher_count = topic.publisher_count.saturating_sub(1);
        }

        if !name.starts_with('$') {
            self.update_client_pub_meta(state, guid, events);
            self.update_topic_pub_meta(state, &name, events);
        }
        self.maybe_reap(state, &name, events);
    }

    fn op_set_properties(
        &self,
        state: &mut State,
        guid: Guid,
        name: &str,
        update: PropertiesUpdate,
        events: &mut Vec<Event>,
    ) -> Option<TopicProperties> {
        let State { topics, clients } = &mut *state;
        let topic = match topics.get_mut(name) {
            Some(topic) => topic,
            None => {
                debug!("setproperties for unknown topic {}", name);
                return None;
            }
        };
        update.apply(&mut topic.properties);
        let properties = topic.properties;

        for (client_guid, client) in clients.iter_mut() {
            let is_initiator = *client_guid == guid;
            if !is_initiator && !client.is_subscribed(name, false) {
                continue;
            }
            if client.is_self() {
                events.push(Event::Properties {
                    name: name.to_owned(),
                    properties,
                });
            } else {
                let message = ServerMessage::Properties {
                    name: name.to_owned(),
                    ack: is_initiator,
                    update,
                };
                self.queue_text(client, &message);
            }
        }
        Some(properties)
    }

    fn op_update_topic(
        &self,
        state: &mut State,
        guid: Guid,
        pubuid: i32,
        value: DataValue,
        time: Option<u64>,
        events: &mut Vec<Event>,
    ) -> bool {
        let State { topics, clients } = &mut *state;

        let name = match clients
            .get(&guid)
            .and_then(|client| client.publishers.get(&pubuid))
        {
            Some(publisher) => publisher.topic.clone(),
            None => {
                debug!("update through unknown pubuid {}", pubuid);
                return false;
            }
        };
        let topic = match topics.get_mut(&name) {
            Some(topic) => topic,
            None => return false,
        };
        if value.api_type() != topic.api_type() {
            debug!(
                "type mismatch on {}: {:?} into {:?}",
                name,
                value.api_type(),
                topic.api_type()
            );
            return false;
        }

        topic.value = value;
        topic.timestamp = time.unwrap_or_else(|| self.clock.server_time());
        let topic = &*topic;

        for client in clients.values_mut() {
            let ready = client
                .topic_data
                .get(&name)
                .map_or(false, |td| td.initial_publish);
            if ready && client.is_subscribed(&name, true) {
                self.send_value(client, topic, events);
            }
        }
        true
    }

    /* --------------------------- fan-out seams --------------------------- */

    /// Announces a topic to one participant and returns the id assigned
    /// for it. Re-announcement returns the prior id without re-emitting,
    /// except the pubuid-correlation announce which is always sent.
    fn announce_to(
        &self,
        client: &mut ClientData,
        topic: &Topic,
        pubuid: Option<i32>,
        events: &mut Vec<Event>,
    ) -> i64 {
        let already_known = client.topic_data.contains_key(&topic.name);
        let td = client.assign_topic_id(&topic.name);
        if already_known && pubuid.is_none() {
            return td.id;
        }

        if client.is_self() {
            events.push(Event::Announced(AnnouncedTopic {
                name: topic.name.clone(),
                id: td.id,
                data_type: topic.value.data_type(),
                properties: topic.properties,
            }));
        } else {
            let message = ServerMessage::Announce {
                name: topic.name.clone(),
                id: td.id,
                data_type: topic.value.data_type().as_str().to_owned(),
                pubuid,
                properties: topic.properties,
            };
            self.queue_text(client, &message);
        }
        td.id
    }

    fn unannounce_to(&self, client: &mut ClientData, name: &str, events: &mut Vec<Event>) {
        if let Some(td) = client.topic_data.remove(name) {
            if client.is_self() {
                events.push(Event::Unannounced {
                    name: name.to_owned(),
                    id: td.id,
                });
            } else {
                let message = ServerMessage::Unannounce {
                    name: name.to_owned(),
                    id: td.id,
                };
                self.queue_text(client, &message);
            }
        }
    }

    /// Delivers the topic's current value and marks the initial publish
    /// done; updates only flow to participants with that mark.
    fn send_value(&self, client: &mut ClientData, topic: &Topic, events: &mut Vec<Event>) {
        let td = match client.topic_data.get_mut(&topic.name) {
            Some(td) => td,
            None => return,
        };
        td.initial_publish = true;
        let id = td.id;
        let timestamp = if topic.timestamp != 0 {
            topic.timestamp
        } else {
            self.clock.server_time()
        };

        if client.is_self() {
            events.push(Event::Update {
                id,
                timestamp,
                value: topic.value.clone(),
            });
        } else {
            let frame = ValueFrame::new(id, timestamp, topic.value.clone());
            self.queue_binary(client, &frame);
        }
    }

    /// Drops a topic that has no publishers left and is not retained,
    /// unannouncing it to everyone who saw it first.
    fn maybe_reap(&self, state: &mut State, name: &str, events: &mut Vec<Event>) {
        let reap = state.topics.get(name).map_or(false, |topic| {
            topic.publisher_count == 0 && !topic.properties.retained && !topic.is_meta()
        });
        if !reap {
            return;
        }
        debug!("reaping topic {}", name);
        state.topics.remove(name);
        for client in state.clients.values_mut() {
            self.unannounce_to(client, name, events);
        }
    }

    /* ------------------------------ caches ------------------------------ */

    fn queue_text(&self, client: &mut ClientData, message: &ServerMessage) {
        let encoded = message.encode();
        let separator = if client.text_cache.is_empty() { 0 } else { 1 };
        // +2 for the wrapping brackets of the eventual batch
        let projected = client.text_cache.len() + separator + encoded.len() + 2;
        if !client.text_cache.is_empty() && projected > self.config.text_cache_limit {
            self.flush_text(client);
        }
        if !client.text_cache.is_empty() {
            client.text_cache.push(',');
        }
        client.text_cache.push_str(&encoded);
    }

    fn queue_binary(&self, client: &mut ClientData, frame: &ValueFrame) {
        let encoded = frame.encoded();
        if !client.binary_cache.is_empty()
            && client.binary_cache.len() + encoded.len() > self.config.binary_cache_limit
        {
            self.flush_binary(client);
        }
        client.binary_cache.extend_from_slice(&encoded);
    }

    fn flush_text(&self, client: &mut ClientData) {
        if client.is_self() || client.text_cache.is_empty() {
            return;
        }
        let batch = format!("[{}]", client.text_cache);
        client.text_cache.clear();
        if !self.ws.send(&client.guid, batch.as_bytes(), MessageKind::Text) {
            debug!("text send to {} failed", client.name);
        }
    }

    fn flush_binary(&self, client: &mut ClientData) {
        if client.is_self() || client.binary_cache.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut client.binary_cache, Vec::new());
        if !self.ws.send(&client.guid, &batch, MessageKind::Binary) {
            debug!("binary send to {} failed", client.name);
        }
    }

    fn flush_text_all(&self, state: &mut State) {
        for client in state.clients.values_mut() {
            self.flush_text(client);
        }
    }

    fn flush_binary_all(&self, state: &mut State) {
        for client in state.clients.values_mut() {
            self.flush_binary(client);
        }
    }

    fn flush_all(&self, state: &mut State) {
        for client in state.clients.values_mut() {
            self.flush_text(client);
            self.flush_binary(client);
        }
    }

    /* ---------------------------- meta topics ---------------------------- */

    /// Creates or refreshes a meta topic and fans its value out. Meta
    /// topics never register publishers, so their upkeep cannot recurse
    /// into more meta upkeep.
    fn set_meta_topic(
        &self,
        state: &mut State,
        name: String,
        payload: Vec<u8>,
        events: &mut Vec<Event>,
    ) {
        let State { topics, clients } = &mut *state;
        let timestamp = self.clock.server_time();
        let topic = topics.entry(name.clone()).or_insert_with(|| {
            Topic::new(
                name.clone(),
                DataValue::Msgpack(Vec::new()),
                TopicProperties {
                    persistent: false,
                    retained: true,
                    cached: true,
                },
            )
        });
        topic.value = DataValue::Msgpack(payload);
        topic.timestamp = timestamp;
        let topic = &*topic;

        for client in clients.values_mut() {
            if !client.is_subscribed(&name, false) {
                continue;
            }
            self.announce_to(client, topic, None, events);
            if client.is_subscribed(&name, true) {
                self.send_value(client, topic, events);
            }
        }
    }

    fn update_clients_meta(&self, state: &mut State, events: &mut Vec<Event>) {
        let payload = meta::clients_payload(
            state
                .clients
                .values()
                .filter(|client| !client.is_self())
                .map(|client| (client.name.as_str(), client.conn.as_str())),
        );
        self.set_meta_topic(state, "$clients".to_owned(), payload, events);
    }

    fn update_client_sub_meta(&self, state: &mut State, guid: Guid, events: &mut Vec<Event>) {
        let (name, payload) = match state.clients.get(&guid) {
            Some(client) => {
                let name = if client.is_self() {
                    "$serversub".to_owned()
                } else {
                    format!("$clientsub${}", client.name)
                };
                (name, meta::subscriptions_payload(client.subscriptions.values()))
            }
            None => return,
        };
        self.set_meta_topic(state, name, payload, events);
    }

    fn update_client_pub_meta(&self, state: &mut State, guid: Guid, events: &mut Vec<Event>) {
        let (name, payload) = match state.clients.get(&guid) {
            Some(client) => {
                let name = if client.is_self() {
                    "$serverpub".to_owned()
                } else {
                    format!("$clientpub${}", client.name)
                };
                (name, meta::publishers_payload(client.publishers.values()))
            }
            None => return,
        };
        self.set_meta_topic(state, name, payload, events);
    }

    fn update_topic_sub_meta(&self, state: &mut State, topic_name: &str, events: &mut Vec<Event>) {
        let payload = {
            let entries = state.clients.values().flat_map(|client| {
                client
                    .subscriptions
                    .values()
                    .filter(|sub| sub.matches(topic_name))
                    .map(move |sub| (client.name.as_str(), sub.uid, &sub.options))
            });
            meta::topic_subscribers_payload(entries)
        };
        self.set_meta_topic(state, format!("$sub${}", topic_name), payload, events);
    }

    fn update_topic_pub_meta(&self, state: &mut State, topic_name: &str, events: &mut Vec<Event>) {
        let payload = {
            let entries = state.clients.values().flat_map(|client| {
                client
                    .publishers
                    .values()
                    .filter(|publisher| publisher.topic == topic_name)
                    .map(move |publisher| (client.name.as_str(), publisher.uid))
            });
            meta::topic_publishers_payload(entries)
        };
        self.set_meta_topic(state, format!("$pub${}", topic_name), payload, events);
    }
}

/// Everything after the `/nt/` marker; the whole path (sans leading
/// slashes) when the marker is absent.
fn client_name_from_path(path: &str) -> &str {
    match path.find("/nt/") {
        Some(index) => &path[index + 4..],
        None => path.trim_start_matches('/'),
    }
}

/// `<base>@<n>` with the smallest positive `n` not in use.
fn disambiguate_name(state: &State, base: &str) -> String {
    let mut n = 1usize;
    loop {
        let candidate = format!("{}@{}", base, n);
        if !state.clients.values().any(|client| client.name == candidate) {
            return candidate;
        }
        n += 1;
    }
}
