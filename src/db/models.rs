//! Diesel model structs for the rows written by the ingestion path.
//!
//! The router normalizes every bus message straight into one of these shapes, so the
//! flushers never see a partially-filled record.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::message::AckStatus;
use crate::schema;

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::devices)]
pub struct NewDevice {
    pub id: i64,
    pub device_sn: String,
    pub created_at: DateTime<Utc>,
}

/// Latest telemetry snapshot, one row per device.
#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::ess_realtime_data)]
pub struct NewRealtimeData {
    pub device_id: i64,
    pub updated_at: DateTime<Utc>,
    pub soc: i64,
    pub soh: i64,
    pub pv: i64,
    pub load: i64,
    pub grid: i64,
    pub grid_q: i64,
    pub batt: i64,
    pub ac_v: i64,
    pub ac_f: i64,
    pub v_a: i64,
    pub v_b: i64,
    pub v_c: i64,
    pub i_a: i64,
    pub i_b: i64,
    pub i_c: i64,
    pub p_a: i64,
    pub p_b: i64,
    pub p_c: i64,
    pub q_a: i64,
    pub q_b: i64,
    pub q_c: i64,
    pub e_pv_today: i64,
    pub e_load_today: i64,
    pub e_charge_today: i64,
    pub e_discharge_today: i64,
}

/// Cumulative energy counters for one (device, ts) bucket.
#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::history_energy)]
pub struct NewHistoryEnergy {
    pub device_id: i64,
    pub ts: DateTime<Utc>,
    pub charge_wh_total: i64,
    pub discharge_wh_total: i64,
    pub pv_wh_total: i64,
    pub grid_wh_total: i64,
    pub load_wh_total: i64,
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::alarms)]
pub struct Alarm {
    pub id: i64,
    pub device_id: i64,
    pub alarm_type: String,
    pub code: String,
    pub level: String,
    pub extra: serde_json::Value,
    pub status: String,
    pub first_triggered_at: DateTime<Utc>,
    pub last_triggered_at: DateTime<Utc>,
    pub repeat_count: i32,
    pub remark: Option<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub confirmed_by: Option<String>,
    pub cleared_at: Option<DateTime<Utc>>,
    pub cleared_by: Option<String>,
}

/// A normalized alarm transition as received from a device.
///
/// `repeat_count` starts at 1 and grows when triggers of the same key are coalesced
/// inside one batch.
#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::alarms)]
pub struct NewAlarm {
    pub device_id: i64,
    pub alarm_type: String,
    pub code: String,
    pub level: String,
    pub extra: serde_json::Value,
    pub status: String,
    pub first_triggered_at: DateTime<Utc>,
    pub last_triggered_at: DateTime<Utc>,
    pub repeat_count: i32,
    pub remark: Option<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub confirmed_by: Option<String>,
    pub cleared_at: Option<DateTime<Utc>>,
    pub cleared_by: Option<String>,
}

#[cfg(test)]
impl NewAlarm {
    pub fn key(&self) -> (i64, &str, &str) {
        (self.device_id, self.alarm_type.as_str(), self.code.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::alarm_history)]
pub struct NewAlarmHistory {
    pub device_id: i64,
    pub alarm_type: String,
    pub code: String,
    pub level: String,
    pub extra: serde_json::Value,
    pub status: String,
    pub first_triggered_at: DateTime<Utc>,
    pub last_triggered_at: DateTime<Utc>,
    pub repeat_count: i32,
    pub remark: Option<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub confirmed_by: Option<String>,
    pub cleared_at: Option<DateTime<Utc>>,
    pub cleared_by: Option<String>,
    pub archived_at: DateTime<Utc>,
    pub duration_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::device_para)]
pub struct NewDevicePara {
    pub device_id: i64,
    pub para: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Command acknowledgment correlated by (device serial, request id).
#[derive(Debug, Clone, PartialEq)]
pub struct RpcAck {
    pub device_sn: String,
    pub request_id: String,
    pub status: AckStatus,
}
