//! MessagePack payload builders for the reflective `$`-topics. Each
//! payload is an array of maps, matching what NT4 dashboards expect.

use rmpv::Value;

use nt4_core::SubscriptionOptions;

use crate::client::{Publisher, Subscription};

fn pack(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    // writing into a Vec cannot fail
    let _ = rmpv::encode::write_value(&mut buf, value);
    buf
}

fn options_map(options: &SubscriptionOptions) -> Value {
    Value::Map(vec![
        (Value::from("periodic"), Value::from(options.periodic)),
        (Value::from("all"), Value::from(options.all)),
        (Value::from("topicsonly"), Value::from(options.topicsonly)),
        (Value::from("prefix"), Value::from(options.prefix)),
    ])
}

/// `$clients`: `[{id, conn}]` for each remote client.
pub fn clients_payload<'a>(clients: impl Iterator<Item = (&'a str, &'a str)>) -> Vec<u8> {
    let entries = clients
        .map(|(name, conn)| {
            Value::Map(vec![
                (Value::from("id"), Value::from(name)),
                (Value::from("conn"), Value::from(conn)),
            ])
        })
        .collect();
    pack(&Value::Array(entries))
}

/// `$serversub` / `$clientsub$<name>`: `[{uid, topics, options}]`.
pub fn subscriptions_payload<'a>(subscriptions: impl Iterator<Item = &'a Subscription>) -> Vec<u8> {
    let entries = subscriptions
        .map(|sub| {
            Value::Map(vec![
                (Value::from("uid"), Value::from(sub.uid)),
                (
                    Value::from("topics"),
                    Value::Array(sub.topics.iter().map(|t| Value::from(t.as_str())).collect()),
                ),
                (Value::from("options"), options_map(&sub.options)),
            ])
        })
        .collect();
    pack(&Value::Array(entries))
}

/// `$serverpub` / `$clientpub$<name>`: `[{uid, topic}]`.
pub fn publishers_payload<'a>(publishers: impl Iterator<Item = &'a Publisher>) -> Vec<u8> {
    let entries = publishers
        .map(|publisher| {
            Value::Map(vec![
                (Value::from("uid"), Value::from(publisher.uid)),
                (Value::from("topic"), Value::from(publisher.topic.as_str())),
            ])
        })
        .collect();
    pack(&Value::Array(entries))
}

/// `$sub$<topic>`: `[{client, subuid, options}]` across all clients.
pub fn topic_subscribers_payload<'a>(
    entries: impl Iterator<Item = (&'a str, i32, &'a SubscriptionOptions)>,
) -> Vec<u8> {
    let entries = entries
        .map(|(client, subuid, options)| {
            Value::Map(vec![
                (Value::from("client"), Value::from(client)),
                (Value::from("subuid"), Value::from(subuid)),
                (Value::from("options"), options_map(options)),
            ])
        })
        .collect();
    pack(&Value::Array(entries))
}

/// `$pub$<topic>`: `[{client, pubuid}]` across all clients.
pub fn topic_publishers_payload<'a>(
    entries: impl Iterator<Item = (&'a str, i32)>,
) -> Vec<u8> {
    let entries = entries
        .map(|(client, pubuid)| {
            Value::Map(vec![
                (Value::from("client"), Value::from(client)),
                (Value::from("pubuid"), Value::from(pubuid)),
            ])
        })
        .collect();
    pack(&Value::Array(entries))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn unpack(bytes: &[u8]) -> Value {
        rmpv::decode::read_value(&mut Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn clients_payload_shape() {
        let payload = clients_payload(vec![("glass@1", "10.67.31.16:51823")].into_iter());
        let value = unpack(&payload);

        let entries = value.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        let map = entries[0].as_map().unwrap();
        assert_eq!(map[0].0.as_str(), Some("id"));
        assert_eq!(map[0].1.as_str(), Some("glass@1"));
        assert_eq!(map[1].0.as_str(), Some("conn"));
        assert_eq!(map[1].1.as_str(), Some("10.67.31.16:51823"));
    }

    #[test]
    fn subscription_payload_includes_options() {
        let sub = Subscription {
            uid: 7,
            topics: vec!["".to_owned(), "$".to_owned()],
            options: SubscriptionOptions {
                prefix: true,
                ..Default::default()
            },
        };
        let payload = subscriptions_payload(vec![&sub].into_iter());
        let value = unpack(&payload);

        let map = value.as_array().unwrap()[0].as_map().unwrap();
        assert_eq!(map[0].1.as_i64(), Some(7));
        assert_eq!(map[1].1.as_array().unwrap().len(), 2);
        let options = map[2].1.as_map().unwrap();
        assert_eq!(options[0].0.as_str(), Some("periodic"));
        assert_eq!(options[0].1.as_i64(), Some(100));
        assert_eq!(options[3].0.as_str(), Some("prefix"));
        assert_eq!(options[3].1.as_bool(), Some(true));
    }

    #[test]
    fn empty_payloads_are_empty_arrays() {
        assert_eq!(clients_payload(std::iter::empty()), vec![0x90]);
        assert_eq!(publishers_payload(std::iter::empty()), vec![0x90]);
    }
}
