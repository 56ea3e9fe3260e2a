use serde::{Deserialize, Serialize};

/// Per-topic flags.
///
/// `cached` topics are re-announced (with their current value) to late
/// subscribers; `retained` topics survive the loss of all publishers;
/// `persistent` is reserved for storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicProperties {
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub retained: bool,
    #[serde(default = "default_cached")]
    pub cached: bool,
}

fn default_cached() -> bool {
    true
}

impl Default for TopicProperties {
    fn default() -> Self {
        TopicProperties {
            persistent: false,
            retained: false,
            cached: true,
        }
    }
}

/// A partial properties update; `None` (absent or JSON `null`) leaves the
/// flag unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertiesUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retained: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
}

impl PropertiesUpdate {
    pub fn apply(&self, properties: &mut TopicProperties) {
        if let Some(persistent) = self.persistent {
            properties.persistent = persistent;
        }
        if let Some(retained) = self.retained {
            properties.retained = retained;
        }
        if let Some(cached) = self.cached {
            properties.cached = cached;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.persistent.is_none() && self.retained.is_none() && self.cached.is_none()
    }
}

/// Subscription options. `periodic` is in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    #[serde(default = "default_periodic")]
    pub periodic: i32,
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub topicsonly: bool,
    #[serde(default)]
    pub prefix: bool,
}

fn default_periodic() -> i32 {
    100
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        SubscriptionOptions {
            periodic: 100,
            all: false,
            topicsonly: false,
            prefix: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_leaves_flags_unchanged() {
        let update: PropertiesUpdate =
            serde_json::from_str(r#"{"retained":true,"cached":null}"#).unwrap();
        assert_eq!(update.retained, Some(true));
        assert_eq!(update.cached, None);

        let mut properties = TopicProperties::default();
        update.apply(&mut properties);
        assert!(properties.retained);
        assert!(properties.cached);
        assert!(!properties.persistent);
    }

    #[test]
    fn options_defaults() {
        let options: SubscriptionOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, SubscriptionOptions::default());
        assert_eq!(options.periodic, 100);

        let options: SubscriptionOptions =
            serde_json::from_str(r#"{"prefix":true,"topicsonly":true}"#).unwrap();
        assert!(options.prefix);
        assert!(options.topicsonly);
        assert_eq!(options.periodic, 100);
    }

    #[test]
    fn update_serializes_without_absent_fields() {
        let update = PropertiesUpdate {
            retained: Some(true),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_string(&update).unwrap(),
            r#"{"retained":true}"#
        );
    }
}
