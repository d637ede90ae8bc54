//! Alarm lifecycle: `active -> confirmed -> cleared -> archived`.
//!
//! The router decides which transitions are terminal; this worker moves the matching
//! live alarm into `alarm_history` and deletes it in the same transaction. It is the
//! only consumer of its queue, so archival of one key never races inside a process.
//!
//! Triggers reach the database through the alarm flusher, so a clear can arrive here
//! before its trigger is written. A clear that finds no live alarm is looked up again
//! a few times, one flush interval apart, before it is given up.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::db::models::{Alarm, NewAlarm, NewAlarmHistory};
use crate::models::message::{AlarmLevel, AlarmStatus};
use crate::queue::QueueReceiver;
use crate::store::{Connect, Store};
use crate::utils::StopSignal;

const POP_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_RECHECKS: u32 = 5;
const MAX_PENDING_RECHECKS: usize = 1024;

/// Critical alarms need a confirmation before a clear is terminal; any other level is
/// terminal as soon as it clears.
pub fn is_archivable(level: AlarmLevel, status: AlarmStatus, confirmed: bool) -> bool {
    match (level, status) {
        (AlarmLevel::Critical, AlarmStatus::Cleared) => confirmed,
        (_, AlarmStatus::Cleared) => true,
        _ => false,
    }
}

/// Whole seconds between first trigger and clear, never below one.
pub fn alarm_duration_secs(first_triggered_at: DateTime<Utc>, cleared_at: DateTime<Utc>) -> i64 {
    (cleared_at - first_triggered_at).num_seconds().max(1)
}

/// History row for `live`, closed by the clearing message `clear`.
pub fn history_row(live: &Alarm, clear: &NewAlarm, archived_at: DateTime<Utc>) -> NewAlarmHistory {
    // routed clears always carry cleared_at
    let cleared_at = clear.cleared_at.unwrap_or(archived_at);
    NewAlarmHistory {
        device_id: live.device_id,
        alarm_type: live.alarm_type.clone(),
        code: live.code.clone(),
        level: live.level.clone(),
        extra: live.extra.clone(),
        status: AlarmStatus::Cleared.as_str().to_string(),
        first_triggered_at: live.first_triggered_at,
        last_triggered_at: live.last_triggered_at,
        repeat_count: live.repeat_count,
        remark: live.remark.clone(),
        confirmed_at: live.confirmed_at.or(clear.confirmed_at),
        confirmed_by: live.confirmed_by.clone().or_else(|| clear.confirmed_by.clone()),
        cleared_at: Some(cleared_at),
        cleared_by: clear.cleared_by.clone(),
        archived_at,
        duration_secs: alarm_duration_secs(live.first_triggered_at, cleared_at),
    }
}

struct Recheck {
    alarm: NewAlarm,
    attempt: u32,
    due: Instant,
}

/// Next clear to look up: a due recheck first, otherwise whatever the queue yields
/// before the next recheck falls due.
fn next_clear(
    queue: &QueueReceiver<NewAlarm>,
    rechecks: &mut VecDeque<Recheck>,
    stop: &StopSignal,
) -> Option<(NewAlarm, u32)> {
    let now = Instant::now();
    if rechecks.front().is_some_and(|r| r.due <= now) {
        return rechecks.pop_front().map(|r| (r.alarm, r.attempt));
    }
    let timeout = rechecks.front().map_or(POP_TIMEOUT, |r| (r.due - now).min(POP_TIMEOUT));
    queue.pop(timeout, stop).map(|alarm| (alarm, 0))
}

pub fn run<C: Connect>(
    queue: QueueReceiver<NewAlarm>,
    connector: &C,
    recheck_delay: Duration,
    reconnect_backoff: Duration,
    stop: &StopSignal,
) {
    info!("Archiver started");
    let mut rechecks: VecDeque<Recheck> = VecDeque::new();
    while !stop.is_stopped() {
        let mut store = match connector.connect() {
            Ok(store) => {
                debug!("Archiver connected to database");
                store
            }
            Err(e) => {
                error!("Archiver: {}; retrying in {}s", e, reconnect_backoff.as_secs());
                stop.sleep(reconnect_backoff);
                continue;
            }
        };

        while !stop.is_stopped() {
            let Some((alarm, attempt)) = next_clear(&queue, &mut rechecks, stop) else {
                continue;
            };
            match store.archive_alarm(&alarm, Utc::now()) {
                Ok(Some(row)) => info!(
                    "Archived alarm device={} type={} code={} duration={}s",
                    row.device_id, row.alarm_type, row.code, row.duration_secs
                ),
                Ok(None) if attempt < MAX_RECHECKS && rechecks.len() < MAX_PENDING_RECHECKS => {
                    debug!(
                        "No live alarm yet for device={} type={} code={}; rechecking",
                        alarm.device_id, alarm.alarm_type, alarm.code
                    );
                    rechecks.push_back(Recheck {
                        alarm,
                        attempt: attempt + 1,
                        due: Instant::now() + recheck_delay,
                    });
                }
                Ok(None) => debug!(
                    "No live alarm to archive for device={} type={} code={}",
                    alarm.device_id, alarm.alarm_type, alarm.code
                ),
                Err(e) if e.is_connection() => {
                    error!("Archiver: {}; reconnecting in {}s", e, reconnect_backoff.as_secs());
                    break;
                }
                Err(e) => warn!(
                    "Archiver: archiving device={} type={} code={} failed: {}",
                    alarm.device_id, alarm.alarm_type, alarm.code, e
                ),
            }
        }

        drop(store);
        if !stop.is_stopped() {
            stop.sleep(reconnect_backoff);
        }
    }
    info!("Archiver stopped");
}
