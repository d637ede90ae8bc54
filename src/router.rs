//! Topic Router: classifies bus messages, normalizes them and hands them to the queues.
//!
//! Runs on the bus thread, so it never touches storage and never blocks.

use chrono::{DateTime, Utc};
use core::fmt;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::db::models::{NewAlarm, NewDevicePara, NewHistoryEnergy, NewRealtimeData, RpcAck};
use crate::models::message::{
    AckStatus, AlarmLevel, AlarmPayload, AlarmStatus, HistoryPayload, ParaPayload, RealtimePayload, RpcAckPayload,
    Stamp,
};
use crate::queue::{Offer, QueueSender};
use crate::services::archiver::is_archivable;
use crate::utils::truncate_to_bucket;

const DEFAULT_SOH: i64 = 100;
const DEFAULT_ALARM_TYPE: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Realtime,
    History,
    Alarm,
    Para,
    RpcAck,
}

impl MessageClass {
    pub const ALL: [MessageClass; 5] = [
        MessageClass::Realtime,
        MessageClass::History,
        MessageClass::Alarm,
        MessageClass::Para,
        MessageClass::RpcAck,
    ];

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "realtime" => Some(MessageClass::Realtime),
            "history" => Some(MessageClass::History),
            "alarm" => Some(MessageClass::Alarm),
            "para" => Some(MessageClass::Para),
            "rpc_ack" => Some(MessageClass::RpcAck),
            _ => None,
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            MessageClass::Realtime => "realtime",
            MessageClass::History => "history",
            MessageClass::Alarm => "alarm",
            MessageClass::Para => "para",
            MessageClass::RpcAck => "rpc_ack",
        }
    }
}

/// Parse `devices/{id}/{class}`, optionally prefixed by `$share/{group}/`.
pub fn parse_topic(topic: &str) -> Option<(&str, MessageClass)> {
    let mut parts: Vec<&str> = topic.split('/').collect();
    if parts.first().is_some_and(|p| p.starts_with("$share")) {
        if parts.len() < 3 {
            return None;
        }
        parts.drain(..2);
    }
    match parts.as_slice() {
        ["devices", device, class] if !device.is_empty() => Some((*device, MessageClass::from_suffix(class)?)),
        _ => None,
    }
}

#[derive(Debug)]
pub enum RouteError {
    UnknownTopic(String),
    BadDeviceId(String),
    Decode {
        class: MessageClass,
        error: serde_path_to_error::Error<serde_json::Error>,
    },
    MissingField {
        class: MessageClass,
        field: &'static str,
    },
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::UnknownTopic(t) => write!(f, "unrecognised topic {}", t),
            RouteError::BadDeviceId(d) => write!(f, "device id {:?} is not numeric", d),
            RouteError::Decode { class, error } => {
                write!(f, "{} payload decode failed at {}: {}", class.suffix(), error.path(), error.inner())
            }
            RouteError::MissingField { class, field } => {
                write!(f, "{} payload missing required field {}", class.suffix(), field)
            }
        }
    }
}

impl std::error::Error for RouteError {}

/// Where a routed message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Queued(MessageClass),
    Archival,
    Dropped(MessageClass),
}

/// Producer handles for every Stream Queue.
#[derive(Debug, Clone)]
pub struct Router {
    pub realtime: QueueSender<NewRealtimeData>,
    pub history: QueueSender<NewHistoryEnergy>,
    pub alarm: QueueSender<NewAlarm>,
    pub archive: QueueSender<NewAlarm>,
    pub para: QueueSender<NewDevicePara>,
    pub rpc_ack: QueueSender<RpcAck>,
    pub history_bucket_secs: u32,
}

impl Router {
    /// Bus callback entry point: every failure is logged and swallowed.
    pub fn handle(&self, topic: &str, payload: &[u8]) {
        if let Err(e) = self.route(topic, payload, Utc::now()) {
            warn!("Router: dropping message on {}: {}", topic, e);
        }
    }

    pub fn route(&self, topic: &str, payload: &[u8], received_at: DateTime<Utc>) -> Result<Routed, RouteError> {
        let (device, class) = parse_topic(topic).ok_or_else(|| RouteError::UnknownTopic(topic.to_string()))?;

        let routed = match class {
            MessageClass::Realtime => {
                let p: RealtimePayload = decode(class, payload)?;
                let row = normalize_realtime(device_id(device)?, &p, received_at);
                offer(&self.realtime, row, class)
            }
            MessageClass::History => {
                let p: HistoryPayload = decode(class, payload)?;
                let row = normalize_history(device_id(device)?, &p, received_at, self.history_bucket_secs);
                offer(&self.history, row, class)
            }
            MessageClass::Alarm => {
                let p: AlarmPayload = decode(class, payload)?;
                let (row, archivable) = normalize_alarm(device_id(device)?, p, received_at);
                if archivable {
                    match self.archive.offer(row) {
                        Offer::Queued => Routed::Archival,
                        Offer::Dropped => Routed::Dropped(class),
                    }
                } else {
                    offer(&self.alarm, row, class)
                }
            }
            MessageClass::Para => {
                let p: ParaPayload = decode(class, payload)?;
                let row = NewDevicePara {
                    device_id: device_id(device)?,
                    updated_at: p.updated_at.resolve(received_at).unwrap_or(received_at),
                    para: Value::Object(p.para),
                };
                offer(&self.para, row, class)
            }
            MessageClass::RpcAck => {
                let p: RpcAckPayload = decode(class, payload)?;
                let ack = normalize_ack(device, p)?;
                debug!("Router: ack from {} for {} -> {}", ack.device_sn, ack.request_id, ack.status.as_str());
                offer(&self.rpc_ack, ack, class)
            }
        };
        Ok(routed)
    }
}

fn offer<T>(queue: &QueueSender<T>, item: T, class: MessageClass) -> Routed {
    match queue.offer(item) {
        Offer::Queued => Routed::Queued(class),
        Offer::Dropped => Routed::Dropped(class),
    }
}

fn decode<T: DeserializeOwned>(class: MessageClass, payload: &[u8]) -> Result<T, RouteError> {
    let de = &mut serde_json::Deserializer::from_slice(payload);
    serde_path_to_error::deserialize(de).map_err(|error| RouteError::Decode { class, error })
}

fn device_id(raw: &str) -> Result<i64, RouteError> {
    raw.parse::<i64>().map_err(|_| RouteError::BadDeviceId(raw.to_string()))
}

pub fn normalize_realtime(device_id: i64, p: &RealtimePayload, received_at: DateTime<Utc>) -> NewRealtimeData {
    let n = |v: Option<i64>| v.unwrap_or(0);
    NewRealtimeData {
        device_id,
        updated_at: received_at,
        soc: n(p.soc),
        soh: p.soh.unwrap_or(DEFAULT_SOH),
        pv: n(p.pv),
        load: n(p.load),
        grid: n(p.grid),
        grid_q: n(p.grid_q),
        batt: n(p.batt),
        ac_v: n(p.ac_v),
        ac_f: n(p.ac_f),
        v_a: n(p.v_a),
        v_b: n(p.v_b),
        v_c: n(p.v_c),
        i_a: n(p.i_a),
        i_b: n(p.i_b),
        i_c: n(p.i_c),
        p_a: n(p.p_a),
        p_b: n(p.p_b),
        p_c: n(p.p_c),
        q_a: n(p.q_a),
        q_b: n(p.q_b),
        q_c: n(p.q_c),
        e_pv_today: n(p.e_pv_today),
        e_load_today: n(p.e_load_today),
        e_charge_today: n(p.e_charge_today),
        e_discharge_today: n(p.e_discharge_today),
    }
}

pub fn normalize_history(
    device_id: i64,
    p: &HistoryPayload,
    received_at: DateTime<Utc>,
    bucket_secs: u32,
) -> NewHistoryEnergy {
    let ts = match p.ts {
        Stamp::At(ts) => ts,
        Stamp::Absent | Stamp::Unreadable => received_at,
    };
    NewHistoryEnergy {
        device_id,
        ts: truncate_to_bucket(ts, bucket_secs),
        charge_wh_total: p.charge_wh_total.unwrap_or(0),
        discharge_wh_total: p.discharge_wh_total.unwrap_or(0),
        pv_wh_total: p.pv_wh_total.unwrap_or(0),
        grid_wh_total: p.grid_wh_total.unwrap_or(0),
        load_wh_total: p.load_wh_total.unwrap_or(0),
    }
}

/// Normalize an alarm and decide whether it is a terminal, archivable transition.
pub fn normalize_alarm(device_id: i64, p: AlarmPayload, received_at: DateTime<Utc>) -> (NewAlarm, bool) {
    let level = p.level.as_deref().map(AlarmLevel::parse).unwrap_or(AlarmLevel::Info);
    let status = p.status.as_deref().map(AlarmStatus::parse).unwrap_or(AlarmStatus::Active);
    let archivable = is_archivable(level, status, p.confirmed_at.is_present());

    // a transition without its own timestamp happened when we received it
    let mut confirmed_at = p.confirmed_at.resolve(received_at);
    let mut cleared_at = p.cleared_at.resolve(received_at);
    match status {
        AlarmStatus::Confirmed => confirmed_at = confirmed_at.or(Some(received_at)),
        AlarmStatus::Cleared => cleared_at = cleared_at.or(Some(received_at)),
        AlarmStatus::Active => {}
    }

    let row = NewAlarm {
        device_id,
        alarm_type: p.alarm_type.unwrap_or_else(|| DEFAULT_ALARM_TYPE.to_string()),
        code: p.code.unwrap_or_default(),
        level: level.as_str().to_string(),
        extra: p.extra.filter(|v| !v.is_null()).unwrap_or_else(|| Value::Object(Default::default())),
        status: status.as_str().to_string(),
        first_triggered_at: received_at,
        last_triggered_at: received_at,
        repeat_count: 1,
        remark: p.remark,
        confirmed_at,
        confirmed_by: p.confirmed_by,
        cleared_at,
        cleared_by: p.cleared_by,
    };
    (row, archivable)
}

pub fn normalize_ack(device_sn: &str, p: RpcAckPayload) -> Result<RpcAck, RouteError> {
    let request_id = p
        .response_id
        .or(p.request_id)
        .filter(|id| !id.is_empty())
        .ok_or(RouteError::MissingField {
            class: MessageClass::RpcAck,
            field: "response_id",
        })?;
    let status = p.status.as_deref().map(AckStatus::parse).unwrap_or(AckStatus::Error);
    Ok(RpcAck {
        device_sn: device_sn.to_string(),
        request_id,
        status,
    })
}
