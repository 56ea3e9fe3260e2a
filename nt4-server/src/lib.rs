mod client;
mod clock;
mod instance;
mod meta;
mod topic;

pub use crate::client::{ClientData, ClientTopicData, Publisher, Subscription};
pub use crate::clock::{compute_offset, Clock};
pub use crate::instance::{
    Instance, InstanceHandler, ServerConfig, MAX_CLIENT_BINARY_CACHE_LENGTH,
    MAX_CLIENT_TEXT_CACHE_LENGTH, NT4_SERVER_PORT, NT_PROTOCOL,
};
pub use crate::topic::{AnnouncedTopic, Topic};
