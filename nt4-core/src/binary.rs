use core::convert::TryFrom;
use std::io::Cursor;

use log::debug;
use rmpv::Value;

use crate::value::{DataType, DataValue};

/// The reserved topic id for round-trip-time measurement frames.
pub const RTT_ID: i64 = -1;

/// One binary value update: a MessagePack array of exactly four elements,
/// `[id, timestamp, type, value]`. Timestamps are microseconds of server
/// time.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueFrame {
    pub id: i64,
    pub timestamp: u64,
    pub value: DataValue,
}

impl ValueFrame {
    pub fn new(id: i64, timestamp: u64, value: DataValue) -> Self {
        ValueFrame {
            id,
            timestamp,
            value,
        }
    }

    pub fn is_rtt(&self) -> bool {
        self.id == RTT_ID
    }

    /// Appends the encoded frame to `buf`. The type tag is the value's API
    /// type; internal codes never reach the wire.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let array = Value::Array(vec![
            Value::from(self.id),
            Value::from(self.timestamp),
            Value::from(self.value.api_type() as u8),
            self.value.to_msgpack(),
        ]);
        // writing into a Vec cannot fail
        let _ = rmpv::encode::write_value(buf, &array);
    }

    pub fn encoded(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    /// Decodes every frame in a binary message. One WebSocket message may
    /// carry any number of concatenated arrays; a malformed tail is dropped
    /// and whatever decoded before it is returned.
    pub fn decode_all(data: &[u8]) -> Vec<ValueFrame> {
        let mut cursor = Cursor::new(data);
        let mut frames = Vec::new();

        while (cursor.position() as usize) < data.len() {
            match rmpv::decode::read_value(&mut cursor) {
                Ok(Value::Array(items)) => match Self::from_items(items) {
                    Some(frame) => frames.push(frame),
                    None => {
                        debug!("dropping malformed value frame");
                        break;
                    }
                },
                Ok(other) => {
                    debug!("unexpected value in binary message: {:?}", other);
                    break;
                }
                Err(err) => {
                    debug!("truncated binary message: {}", err);
                    break;
                }
            }
        }

        frames
    }

    fn from_items(items: Vec<Value>) -> Option<ValueFrame> {
        if items.len() != 4 {
            return None;
        }
        let mut items = items.into_iter();

        let id = items.next()?.as_i64()?;
        let timestamp = items.next()?.as_u64()?;
        let type_code = items.next()?.as_u64()?;
        let declared = DataType::try_from(u8::try_from(type_code).ok()?).ok()?;
        let value = DataValue::from_msgpack(declared, items.next()?).ok()?;

        Some(ValueFrame {
            id,
            timestamp,
            value,
        })
    }
}
