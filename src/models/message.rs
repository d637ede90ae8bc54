//! Payload shapes published by the storage devices, one struct per message class.
//!
//! Firmware versions disagree on field types, so numeric and timestamp fields are
//! decoded leniently: anything that does not look like a value becomes `None` and the
//! router applies the documented default. Unknown fields are ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::utils::parse_timestamp;

/// A timestamp field as delivered: absent, parseable, or present but unreadable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stamp {
    #[default]
    Absent,
    At(DateTime<Utc>),
    Unreadable,
}

impl Stamp {
    pub fn is_present(&self) -> bool {
        !matches!(self, Stamp::Absent)
    }

    /// Resolve to a concrete instant, treating an unreadable value as `fallback`.
    pub fn resolve(&self, fallback: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Stamp::Absent => None,
            Stamp::At(ts) => Some(*ts),
            Stamp::Unreadable => Some(fallback),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RealtimePayload {
    #[serde(deserialize_with = "lenient_i64")]
    pub soc: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub soh: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub pv: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub load: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub grid: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub grid_q: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub batt: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub ac_v: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub ac_f: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub v_a: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub v_b: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub v_c: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub i_a: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub i_b: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub i_c: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub p_a: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub p_b: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub p_c: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub q_a: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub q_b: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub q_c: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub e_pv_today: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub e_load_today: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub e_charge_today: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub e_discharge_today: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HistoryPayload {
    #[serde(deserialize_with = "lenient_stamp")]
    pub ts: Stamp,
    #[serde(deserialize_with = "lenient_i64")]
    pub charge_wh_total: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub discharge_wh_total: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub pv_wh_total: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub grid_wh_total: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub load_wh_total: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AlarmPayload {
    #[serde(deserialize_with = "lenient_string")]
    pub alarm_type: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub code: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub level: Option<String>,
    pub extra: Option<Value>,
    #[serde(deserialize_with = "lenient_string")]
    pub status: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub remark: Option<String>,
    #[serde(deserialize_with = "lenient_stamp")]
    pub confirmed_at: Stamp,
    #[serde(deserialize_with = "lenient_string")]
    pub confirmed_by: Option<String>,
    #[serde(deserialize_with = "lenient_stamp")]
    pub cleared_at: Stamp,
    #[serde(deserialize_with = "lenient_string")]
    pub cleared_by: Option<String>,
}

/// Parameter payloads are stored wholesale; only `updated_at` is interpreted.
#[derive(Debug, Clone)]
pub struct ParaPayload {
    pub updated_at: Stamp,
    pub para: Map<String, Value>,
}

impl<'de> Deserialize<'de> for ParaPayload {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let para = Map::<String, Value>::deserialize(deserializer)?;
        let updated_at = para.get("updated_at").map(stamp_from_value).unwrap_or_default();
        Ok(ParaPayload { updated_at, para })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RpcAckPayload {
    #[serde(deserialize_with = "lenient_string")]
    pub response_id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub request_id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmLevel {
    Info,
    Minor,
    Major,
    Critical,
}

impl AlarmLevel {
    /// Unknown levels are treated as informational.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => AlarmLevel::Critical,
            "major" => AlarmLevel::Major,
            "minor" => AlarmLevel::Minor,
            _ => AlarmLevel::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmLevel::Info => "info",
            AlarmLevel::Minor => "minor",
            AlarmLevel::Major => "major",
            AlarmLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmStatus {
    Active,
    Confirmed,
    Cleared,
}

impl AlarmStatus {
    /// Unknown statuses are treated as a fresh trigger.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "cleared" => AlarmStatus::Cleared,
            "confirmed" => AlarmStatus::Confirmed,
            _ => AlarmStatus::Active,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmStatus::Active => "active",
            AlarmStatus::Confirmed => "confirmed",
            AlarmStatus::Cleared => "cleared",
        }
    }
}

/// Terminal statuses a device may report for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Success,
    Failed,
    Error,
    Timeout,
}

impl AckStatus {
    /// Anything outside the known set collapses to `Error`.
    pub fn parse(s: &str) -> Self {
        match s {
            "success" => AckStatus::Success,
            "failed" => AckStatus::Failed,
            "timeout" => AckStatus::Timeout,
            _ => AckStatus::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AckStatus::Success => "success",
            AckStatus::Failed => "failed",
            AckStatus::Error => "error",
            AckStatus::Timeout => "timeout",
        }
    }
}

fn value_as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
        }
        _ => None,
    }
}

fn stamp_from_value(v: &Value) -> Stamp {
    match v {
        Value::Null => Stamp::Absent,
        Value::String(s) if s.trim().is_empty() => Stamp::Absent,
        Value::String(s) => parse_timestamp(s).map(Stamp::At).unwrap_or(Stamp::Unreadable),
        Value::Number(_) => value_as_i64(v)
            .and_then(crate::utils::timestamp_from_epoch)
            .map(Stamp::At)
            .unwrap_or(Stamp::Unreadable),
        _ => Stamp::Unreadable,
    }
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(deserializer)?;
    Ok(v.as_ref().and_then(value_as_i64))
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(deserializer)?;
    Ok(match v {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

fn lenient_stamp<'de, D>(deserializer: D) -> Result<Stamp, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(deserializer)?;
    Ok(v.as_ref().map(stamp_from_value).unwrap_or_default())
}
