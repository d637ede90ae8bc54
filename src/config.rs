//! Runtime configuration from environment variables.
//! Defaults match a local broker and a local PostgreSQL started by docker-compose.

use rumqttc::QoS;
use std::time::Duration;

use crate::router::MessageClass;

pub const DEFAULT_SHARE_GROUP: &str = "ess-ingestor";
pub const DEFAULT_BATCH_SIZE: usize = 200;
pub const DEFAULT_FLUSH_MS: u64 = 1000;
pub const DEFAULT_QUEUE_MAXSIZE: usize = 10_000;
pub const DEFAULT_RECONNECT_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub class: MessageClass,
    pub topic: String,
    pub qos: QoS,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Random suffix added when not configured, so several ingestors can share a group.
    pub client_id: Option<String>,
    pub keep_alive: Duration,
    pub subscriptions: Vec<Subscription>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub database_url: String,
    /// Apply embedded migrations on startup.
    pub migrate: bool,
    pub batch_size: usize,
    /// Wall-clock budget for collecting one batch.
    pub flush_interval: Duration,
    pub queue_capacity: usize,
    /// Fixed delay before a worker reconnects to the database.
    pub reconnect_backoff: Duration,
    /// History samples are truncated to this many seconds.
    pub history_bucket_secs: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let subscriptions = MessageClass::ALL
            .iter()
            .map(|&class| {
                let (topic_key, qos_key, default_qos) = subscription_keys(class);
                let topic = get(topic_key)
                    .unwrap_or_else(|| format!("$share/{}/devices/+/{}", DEFAULT_SHARE_GROUP, class.suffix()));
                let qos = match get(qos_key) {
                    Some(v) => parse_qos(qos_key, &v)?,
                    None => default_qos,
                };
                Ok(Subscription { class, topic, qos })
            })
            .collect::<Result<Vec<_>, String>>()?;

        let mqtt = MqttConfig {
            host: get("MQTT_HOST").unwrap_or_else(|| "localhost".to_string()),
            port: parse_or("MQTT_PORT", get("MQTT_PORT"), 1883)?,
            username: get("MQTT_USERNAME"),
            password: get("MQTT_PASSWORD"),
            client_id: get("MQTT_CLIENT_ID"),
            keep_alive: Duration::from_secs(parse_or("MQTT_KEEPALIVE_SECS", get("MQTT_KEEPALIVE_SECS"), 60)?),
            subscriptions,
        };

        let database_url = get("DATABASE_URL").unwrap_or_else(|| {
            format!(
                "postgres://{}:{}@{}:{}/{}",
                get("POSTGRES_USER").unwrap_or_else(|| "admin".to_string()),
                get("POSTGRES_PASSWORD").unwrap_or_else(|| "123456".to_string()),
                get("PG_HOST").unwrap_or_else(|| "localhost".to_string()),
                get("PG_PORT").unwrap_or_else(|| "5432".to_string()),
                get("POSTGRES_DB").unwrap_or_else(|| "energy".to_string()),
            )
        });

        let migrate = get("DB_MIGRATE")
            .map(|s| matches!(s.as_str(), "1" | "true" | "TRUE"))
            .unwrap_or(false);

        let batch_size: usize = parse_or("BATCH_SIZE", get("BATCH_SIZE"), DEFAULT_BATCH_SIZE)?;
        let queue_capacity: usize = parse_or("QUEUE_MAXSIZE", get("QUEUE_MAXSIZE"), DEFAULT_QUEUE_MAXSIZE)?;
        if batch_size == 0 {
            return Err("BATCH_SIZE must be greater than zero".to_string());
        }
        if queue_capacity == 0 {
            return Err("QUEUE_MAXSIZE must be greater than zero".to_string());
        }

        Ok(Config {
            mqtt,
            database_url,
            migrate,
            batch_size,
            flush_interval: Duration::from_millis(parse_or("BATCH_FLUSH_MS", get("BATCH_FLUSH_MS"), DEFAULT_FLUSH_MS)?),
            queue_capacity,
            reconnect_backoff: Duration::from_secs(parse_or(
                "DB_RECONNECT_SECS",
                get("DB_RECONNECT_SECS"),
                DEFAULT_RECONNECT_SECS,
            )?),
            history_bucket_secs: parse_or("HISTORY_BUCKET_SECS", get("HISTORY_BUCKET_SECS"), 1)?,
        })
    }
}

fn subscription_keys(class: MessageClass) -> (&'static str, &'static str, QoS) {
    match class {
        MessageClass::Realtime => ("MQTT_TOPIC", "MQTT_QOS", QoS::AtMostOnce),
        MessageClass::History => ("MQTT_HISTORY_TOPIC", "MQTT_HISTORY_QOS", QoS::AtMostOnce),
        MessageClass::Alarm => ("MQTT_ALARM_TOPIC", "MQTT_ALARM_QOS", QoS::AtLeastOnce),
        MessageClass::Para => ("MQTT_PARA_TOPIC", "MQTT_PARA_QOS", QoS::AtMostOnce),
        MessageClass::RpcAck => ("MQTT_RPC_ACK_TOPIC", "MQTT_RPC_ACK_QOS", QoS::AtLeastOnce),
    }
}

fn parse_qos(key: &str, raw: &str) -> Result<QoS, String> {
    match raw {
        "0" => Ok(QoS::AtMostOnce),
        "1" => Ok(QoS::AtLeastOnce),
        "2" => Ok(QoS::ExactlyOnce),
        _ => Err(format!("{} must be 0, 1 or 2 (got {:?})", key, raw)),
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T, String> {
    match raw {
        Some(v) => v
            .parse::<T>()
            .map_err(|_| format!("{} must be a non-negative integer (got {:?})", key, v)),
        None => Ok(default),
    }
}
