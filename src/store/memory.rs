//! In-memory store with the same natural-key semantics as the Postgres store.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Connect, Store, StoreError};
use crate::db::models::{
    Alarm, NewAlarm, NewAlarmHistory, NewDevice, NewDevicePara, NewHistoryEnergy, NewRealtimeData, RpcAck,
};
use crate::models::message::AlarmStatus;
use crate::services::archiver::history_row;
use crate::services::batch::AlarmBatch;
use crate::services::registrar::{placeholder_rows, referenced_devices};

#[derive(Debug, Clone, PartialEq)]
pub struct CommandLogRow {
    pub device_id: i64,
    pub request_id: String,
    pub status: String,
    pub confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    devices: BTreeMap<i64, NewDevice>,
    realtime: BTreeMap<i64, NewRealtimeData>,
    history: BTreeMap<(i64, DateTime<Utc>), NewHistoryEnergy>,
    alarms: Vec<Alarm>,
    next_alarm_id: i64,
    alarm_history: Vec<NewAlarmHistory>,
    params: BTreeMap<i64, NewDevicePara>,
    command_log: Vec<CommandLogRow>,
    injected: VecDeque<StoreError>,
}

impl State {
    fn ensure_devices(&mut self, ids: &[i64]) {
        for row in placeholder_rows(ids, Utc::now()) {
            self.devices.entry(row.id).or_insert(row);
        }
    }

    fn insert_alarm(&mut self, t: &NewAlarm) {
        self.next_alarm_id += 1;
        self.alarms.push(Alarm {
            id: self.next_alarm_id,
            device_id: t.device_id,
            alarm_type: t.alarm_type.clone(),
            code: t.code.clone(),
            level: t.level.clone(),
            extra: t.extra.clone(),
            status: t.status.clone(),
            first_triggered_at: t.first_triggered_at,
            last_triggered_at: t.last_triggered_at,
            repeat_count: t.repeat_count,
            remark: t.remark.clone(),
            confirmed_at: t.confirmed_at,
            confirmed_by: t.confirmed_by.clone(),
            cleared_at: t.cleared_at,
            cleared_by: t.cleared_by.clone(),
        });
    }

    fn take_injected(&mut self) -> Result<(), StoreError> {
        match self.injected.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn same_key(live: &Alarm, alarm: &NewAlarm) -> bool {
    (live.device_id, live.alarm_type.as_str(), live.code.as_str()) == alarm.key()
}

#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<State>>,
    connects: Arc<AtomicUsize>,
    refuse_connects: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Fail the next write (or archive) with `error`, leaving state untouched.
    pub fn inject_failure(&self, error: StoreError) {
        self.lock().injected.push_back(error);
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connects(&self, n: usize) {
        self.refuse_connects.store(n, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn register_device(&self, id: i64, device_sn: &str) {
        self.lock().devices.insert(
            id,
            NewDevice {
                id,
                device_sn: device_sn.to_string(),
                created_at: Utc::now(),
            },
        );
    }

    pub fn add_pending_command(&self, device_id: i64, request_id: &str) {
        self.lock().command_log.push(CommandLogRow {
            device_id,
            request_id: request_id.to_string(),
            status: "pending".to_string(),
            confirmed_at: None,
        });
    }

    pub fn devices(&self) -> Vec<NewDevice> {
        self.lock().devices.values().cloned().collect()
    }

    pub fn realtime(&self) -> Vec<NewRealtimeData> {
        self.lock().realtime.values().cloned().collect()
    }

    pub fn history(&self) -> Vec<NewHistoryEnergy> {
        self.lock().history.values().cloned().collect()
    }

    pub fn live_alarms(&self) -> Vec<Alarm> {
        self.lock().alarms.clone()
    }

    pub fn alarm_history(&self) -> Vec<NewAlarmHistory> {
        self.lock().alarm_history.clone()
    }

    pub fn params(&self) -> Vec<NewDevicePara> {
        self.lock().params.values().cloned().collect()
    }

    pub fn command_log(&self) -> Vec<CommandLogRow> {
        self.lock().command_log.clone()
    }
}

impl Connect for MemoryConnector {
    type Store = MemoryStore;

    fn connect(&self) -> Result<MemoryStore, StoreError> {
        let refused = self
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(StoreError::Connection("connection refused".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryStore {
            connector: self.clone(),
        })
    }
}

pub struct MemoryStore {
    connector: MemoryConnector,
}

impl Store for MemoryStore {
    fn write_realtime(&mut self, rows: &[NewRealtimeData]) -> Result<usize, StoreError> {
        let mut guard = self.connector.lock();
        let s = &mut *guard;
        s.take_injected()?;
        s.ensure_devices(&referenced_devices(rows.iter().map(|r| r.device_id)));
        for row in rows {
            s.realtime.insert(row.device_id, row.clone());
        }
        Ok(rows.len())
    }

    fn write_history(&mut self, rows: &[NewHistoryEnergy]) -> Result<usize, StoreError> {
        let mut guard = self.connector.lock();
        let s = &mut *guard;
        s.take_injected()?;
        s.ensure_devices(&referenced_devices(rows.iter().map(|r| r.device_id)));
        for row in rows {
            s.history.insert((row.device_id, row.ts), row.clone());
        }
        Ok(rows.len())
    }

    fn write_alarms(&mut self, batch: &AlarmBatch) -> Result<usize, StoreError> {
        let mut guard = self.connector.lock();
        let s = &mut *guard;
        s.take_injected()?;
        s.ensure_devices(&batch.devices());

        let mut count = 0;
        for t in &batch.triggers {
            match s.alarms.iter_mut().find(|a| same_key(a, t)) {
                Some(live) => {
                    live.level = t.level.clone();
                    live.extra = t.extra.clone();
                    live.last_triggered_at = t.last_triggered_at;
                    live.repeat_count += t.repeat_count;
                    live.remark = t.remark.clone();
                    if t.confirmed_at.is_some() {
                        live.confirmed_at = t.confirmed_at;
                    }
                    if t.confirmed_by.is_some() {
                        live.confirmed_by = t.confirmed_by.clone();
                    }
                }
                None => s.insert_alarm(t),
            }
            count += 1;
        }

        for c in &batch.confirmations {
            match s.alarms.iter_mut().find(|a| same_key(a, c)) {
                Some(live) => {
                    live.status = c.status.clone();
                    if c.confirmed_at.is_some() {
                        live.confirmed_at = c.confirmed_at;
                    }
                    if c.confirmed_by.is_some() {
                        live.confirmed_by = c.confirmed_by.clone();
                    }
                }
                None => s.insert_alarm(c),
            }
            count += 1;
        }

        for c in &batch.clears {
            for live in s
                .alarms
                .iter_mut()
                .filter(|a| same_key(a, c) && a.status != AlarmStatus::Cleared.as_str())
            {
                live.cleared_at = c.cleared_at;
                live.cleared_by = c.cleared_by.clone();
                count += 1;
            }
        }
        Ok(count)
    }

    fn write_params(&mut self, rows: &[NewDevicePara]) -> Result<usize, StoreError> {
        let mut guard = self.connector.lock();
        let s = &mut *guard;
        s.take_injected()?;
        s.ensure_devices(&referenced_devices(rows.iter().map(|r| r.device_id)));
        for row in rows {
            s.params.insert(row.device_id, row.clone());
        }
        Ok(rows.len())
    }

    fn apply_acks(&mut self, acks: &[RpcAck]) -> Result<usize, StoreError> {
        let mut guard = self.connector.lock();
        let s = &mut *guard;
        s.take_injected()?;
        let now = Utc::now();
        let mut count = 0;
        for ack in acks {
            let Some(device_id) = s.devices.values().find(|d| d.device_sn == ack.device_sn).map(|d| d.id) else {
                continue;
            };
            for row in s
                .command_log
                .iter_mut()
                .filter(|r| r.device_id == device_id && r.request_id == ack.request_id && r.status == "pending")
            {
                row.status = ack.status.as_str().to_string();
                row.confirmed_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    fn archive_alarm(
        &mut self,
        alarm: &NewAlarm,
        archived_at: DateTime<Utc>,
    ) -> Result<Option<NewAlarmHistory>, StoreError> {
        let mut guard = self.connector.lock();
        let s = &mut *guard;
        s.take_injected()?;
        let live = s
            .alarms
            .iter()
            .filter(|a| same_key(a, alarm) && a.status != AlarmStatus::Cleared.as_str())
            .max_by_key(|a| a.last_triggered_at)
            .cloned();
        let Some(live) = live else {
            return Ok(None);
        };
        let row = history_row(&live, alarm, archived_at);
        s.alarm_history.push(row.clone());
        s.alarms.retain(|a| a.id != live.id);
        Ok(Some(row))
    }
}
