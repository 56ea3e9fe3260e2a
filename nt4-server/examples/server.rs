use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use log::info;
use structopt::StructOpt;

use nt4_core::{DataType, DataValue, PropertiesUpdate, SubscriptionOptions, TopicProperties};
use nt4_server::{AnnouncedTopic, Instance, InstanceHandler, ServerConfig};

#[derive(Debug, StructOpt)]
#[structopt(name = "server", about = "A NetworkTables 4.1 server")]
struct Opt {
    /// Port to listen on
    #[structopt(short, long, default_value = "5810")]
    port: u16,
}

struct LogHandler;

impl InstanceHandler for LogHandler {
    fn topic_announced(&self, topic: &AnnouncedTopic) {
        info!("announced {} (id {})", topic.name, topic.id);
    }

    fn topic_update(&self, id: i64, timestamp: u64, value: &DataValue) {
        info!("update id {} at {}us: {:?}", id, timestamp, value);
    }

    fn topic_properties_update(&self, name: &str, properties: TopicProperties) {
        info!("properties of {}: {:?}", name, properties);
    }
}

fn main() -> Result<()> {
    pretty_env_logger::init();
    let opt = Opt::from_args();

    let mut config = ServerConfig::default();
    config.ws.port = opt.port;

    let instance = Instance::new(config);
    instance.set_handler(Arc::new(LogHandler));
    instance.start()?;
    info!("serving on {:?}", instance.local_addr());

    // Watch everything clients publish.
    instance.subscribe(
        vec![String::new()],
        1,
        SubscriptionOptions {
            prefix: true,
            ..Default::default()
        },
    );

    // Publish a heartbeat topic and bump it once a second.
    instance.publish(
        "/server/uptime",
        1,
        DataType::Int,
        PropertiesUpdate {
            retained: Some(true),
            ..Default::default()
        },
    );

    let mut seconds: i64 = 0;
    loop {
        thread::sleep(Duration::from_secs(1));
        seconds += 1;
        instance.update_topic(1, DataValue::Int(seconds));
        instance.flush();
    }
}
