//! Batch shaping shared by every store.
//!
//! A multi-row upsert may not touch the same row twice, so batches are reduced to one
//! row per natural key before they are written. Queue order is FIFO, which makes
//! "later in the batch" the same as "received later".

use crate::db::models::NewAlarm;
use crate::models::message::AlarmStatus;
use crate::services::registrar::referenced_devices;
use std::collections::BTreeMap;

/// Keep only the last row for each key.
pub fn latest_per_key<T, K, F>(rows: Vec<T>, key: F) -> Vec<T>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    let mut latest = BTreeMap::new();
    for row in rows {
        latest.insert(key(&row), row);
    }
    latest.into_values().collect()
}

/// Alarm batch split by transition. Triggers are coalesced per key; confirmations and
/// non-archivable clears keep the last message per key.
#[derive(Debug, Default, PartialEq)]
pub struct AlarmBatch {
    pub triggers: Vec<NewAlarm>,
    pub confirmations: Vec<NewAlarm>,
    pub clears: Vec<NewAlarm>,
}

impl AlarmBatch {
    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty() && self.confirmations.is_empty() && self.clears.is_empty()
    }

    /// Every device the batch refers to, sorted and unique.
    pub fn devices(&self) -> Vec<i64> {
        referenced_devices(
            self.triggers
                .iter()
                .chain(&self.confirmations)
                .chain(&self.clears)
                .map(|a| a.device_id),
        )
    }
}

pub fn shape_alarms(rows: Vec<NewAlarm>) -> AlarmBatch {
    let mut triggers: BTreeMap<(i64, String, String), NewAlarm> = BTreeMap::new();
    let mut confirmations = Vec::new();
    let mut clears = Vec::new();

    for row in rows {
        match AlarmStatus::parse(&row.status) {
            AlarmStatus::Cleared => {
                clears.push(row);
                continue;
            }
            AlarmStatus::Confirmed => {
                confirmations.push(row);
                continue;
            }
            AlarmStatus::Active => {}
        }
        let key = alarm_key(&row);
        match triggers.remove(&key) {
            Some(earlier) => {
                triggers.insert(key, merge_triggers(earlier, row));
            }
            None => {
                triggers.insert(key, row);
            }
        }
    }

    AlarmBatch {
        triggers: triggers.into_values().collect(),
        confirmations: latest_per_key(confirmations, alarm_key),
        clears: latest_per_key(clears, alarm_key),
    }
}

fn alarm_key(a: &NewAlarm) -> (i64, String, String) {
    (a.device_id, a.alarm_type.clone(), a.code.clone())
}

fn merge_triggers(earlier: NewAlarm, later: NewAlarm) -> NewAlarm {
    let mut merged = later;
    merged.first_triggered_at = earlier.first_triggered_at.min(merged.first_triggered_at);
    merged.last_triggered_at = earlier.last_triggered_at.max(merged.last_triggered_at);
    merged.repeat_count += earlier.repeat_count;
    if merged.confirmed_at.is_none() {
        merged.confirmed_at = earlier.confirmed_at;
        merged.confirmed_by = earlier.confirmed_by;
    }
    merged
}
