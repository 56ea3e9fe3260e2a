use nt4_core::{DataType, DataValue, TopicProperties};

/// An authoritative named value. Names starting with `$` are reflective
/// meta-topics maintained by the server itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Topic {
    pub name: String,
    pub value: DataValue,
    /// Server time of the last value assignment, in microseconds.
    pub timestamp: u64,
    pub properties: TopicProperties,
    pub publisher_count: u32,
}

impl Topic {
    pub fn new(name: String, value: DataValue, properties: TopicProperties) -> Self {
        Topic {
            name,
            value,
            timestamp: 0,
            properties,
            publisher_count: 0,
        }
    }

    pub fn is_meta(&self) -> bool {
        self.name.starts_with('$')
    }

    /// The wire-visible type. Fixed at first publish; updates with a
    /// different API type are rejected.
    pub fn api_type(&self) -> DataType {
        self.value.api_type()
    }
}

/// What an announce told one participant about a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnouncedTopic {
    pub name: String,
    /// The id the server assigned for the announced-to participant.
    pub id: i64,
    pub data_type: DataType,
    pub properties: TopicProperties,
}
