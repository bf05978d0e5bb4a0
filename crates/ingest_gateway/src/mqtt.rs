mod pusher;
pub(crate) mod subscriber;
mod topic;

pub use pusher::{MqttCommandPusher, MqttHandle};
pub use subscriber::{open_session, run_mqtt_ingest, MqttSettings};
pub use topic::{
    command_topic, data_topic, parse_topic, DeviceTopic, TopicChannel, COMMAND_ACK_FILTER,
};
