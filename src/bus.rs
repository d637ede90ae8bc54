//! MQTT consumer: keeps one broker session alive, (re)subscribes on every CONNACK and
//! hands each publish to the [`Router`].

use log::{debug, error, info, warn};
use rand::Rng;
use rumqttc::{Client, ConnectReturnCode, Event, MqttOptions, Packet, RecvTimeoutError};
use std::time::Duration;

use crate::config::{MqttConfig, Subscription};
use crate::router::Router;
use crate::utils::StopSignal;

const POLL_TIMEOUT: Duration = Duration::from_millis(200);
const RETRY_DELAY: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 10;

pub fn client_id(cfg: &MqttConfig) -> String {
    match &cfg.client_id {
        Some(id) => id.clone(),
        None => format!("ess-ingestor-{:08x}", rand::rng().random::<u32>()),
    }
}

pub fn mqtt_options(cfg: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(client_id(cfg), cfg.host.clone(), cfg.port);
    options.set_keep_alive(cfg.keep_alive);
    if let Some(user) = &cfg.username {
        options.set_credentials(user.clone(), cfg.password.clone().unwrap_or_default());
    }
    options
}

fn subscribe_all(client: &Client, subscriptions: &[Subscription]) {
    for sub in subscriptions {
        match client.try_subscribe(sub.topic.clone(), sub.qos) {
            Ok(()) => info!("Subscribed to {} (qos={:?})", sub.topic, sub.qos),
            Err(e) => error!("Subscribing to {} failed: {}", sub.topic, e),
        }
    }
}

/// Blocks until `stop` is raised or the client's event loop goes away.
pub fn run(cfg: &MqttConfig, router: &Router, stop: &StopSignal) {
    let options = mqtt_options(cfg);
    info!(
        "Connecting to MQTT broker {}:{} as {}",
        cfg.host,
        cfg.port,
        options.client_id()
    );
    let (client, mut connection) = Client::new(options, REQUEST_CAPACITY);

    while !stop.is_stopped() {
        match connection.recv_timeout(POLL_TIMEOUT) {
            Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("Connected to MQTT broker");
                    subscribe_all(&client, &cfg.subscriptions);
                } else {
                    error!("MQTT broker refused connection: {:?}", ack.code);
                }
            }
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                router.handle(&publish.topic, &publish.payload);
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!("MQTT connection error: {}; retrying in {}s", e, RETRY_DELAY.as_secs());
                stop.sleep(RETRY_DELAY);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                error!("MQTT event loop closed");
                break;
            }
        }
    }

    if let Err(e) = client.try_disconnect() {
        debug!("MQTT disconnect: {}", e);
    }
    info!("MQTT consumer stopped");
}
