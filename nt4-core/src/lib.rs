mod binary;
mod errors;
mod props;
mod subscription;
mod text;
mod value;

pub use crate::binary::{ValueFrame, RTT_ID};
pub use crate::errors::Error;
pub use crate::props::{PropertiesUpdate, SubscriptionOptions, TopicProperties};
pub use crate::subscription::subscription_matches;
pub use crate::text::{parse_client_messages, ClientMessage, ServerMessage};
pub use crate::value::{DataType, DataValue};
