//! Batch Flushers: one worker per Stream Queue, all sharing [`run`].
//!
//! A failed batch is rolled back and dropped, never requeued. Connection-level failures
//! discard the connection and reconnect after a fixed backoff.

use chrono::Utc;
use log::{debug, error, info};
use std::time::Duration;

use crate::db::models::{NewAlarm, NewDevicePara, NewHistoryEnergy, NewRealtimeData, RpcAck};
use crate::queue::QueueReceiver;
use crate::services::batch::{latest_per_key, shape_alarms};
use crate::store::{Connect, Store, StoreError};
use crate::utils::StopSignal;

#[derive(Debug, Clone, Copy)]
pub struct FlushSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub reconnect_backoff: Duration,
}

/// Writes one collected batch through a store; returns the affected row count.
pub type WriteBatch<S, T> = fn(&mut S, Vec<T>) -> Result<usize, StoreError>;

pub fn run<C, T>(
    queue: QueueReceiver<T>,
    connector: &C,
    write: WriteBatch<C::Store, T>,
    settings: FlushSettings,
    stop: &StopSignal,
) where
    C: Connect,
{
    let name = queue.name();
    info!(
        "Flusher {} started (batch_size={}, flush_interval={}ms)",
        name,
        settings.batch_size,
        settings.flush_interval.as_millis()
    );

    while !stop.is_stopped() {
        let mut store = match connector.connect() {
            Ok(store) => {
                debug!("Flusher {} connected to database", name);
                store
            }
            Err(e) => {
                error!(
                    "Flusher {}: {}; retrying in {}s",
                    name,
                    e,
                    settings.reconnect_backoff.as_secs()
                );
                stop.sleep(settings.reconnect_backoff);
                continue;
            }
        };

        while !stop.is_stopped() {
            // An in-flight batch is still written after stop is requested.
            let batch = queue.collect_batch(settings.batch_size, settings.flush_interval, stop);
            if batch.is_empty() {
                continue;
            }
            let len = batch.len();
            match write(&mut store, batch) {
                Ok(rows) => info!("Flusher {}: wrote batch of {} message(s), {} row(s)", name, len, rows),
                Err(e) if e.is_connection() => {
                    error!(
                        "Flusher {}: batch of {} message(s) lost: {}; reconnecting in {}s",
                        name,
                        len,
                        e,
                        settings.reconnect_backoff.as_secs()
                    );
                    break;
                }
                Err(e) => error!("Flusher {}: batch of {} message(s) rolled back: {}", name, len, e),
            }
        }

        drop(store);
        if !stop.is_stopped() {
            stop.sleep(settings.reconnect_backoff);
        }
    }
    info!("Flusher {} stopped ({} message(s) dropped on overload)", name, queue.dropped());
}

pub fn write_realtime<S: Store>(store: &mut S, batch: Vec<NewRealtimeData>) -> Result<usize, StoreError> {
    let written_at = Utc::now();
    let rows = latest_per_key(batch, |r| r.device_id)
        .into_iter()
        .map(|mut r| {
            r.updated_at = written_at;
            r
        })
        .collect::<Vec<_>>();
    store.write_realtime(&rows)
}

pub fn write_history<S: Store>(store: &mut S, batch: Vec<NewHistoryEnergy>) -> Result<usize, StoreError> {
    let rows = latest_per_key(batch, |r| (r.device_id, r.ts));
    store.write_history(&rows)
}

pub fn write_alarms<S: Store>(store: &mut S, batch: Vec<NewAlarm>) -> Result<usize, StoreError> {
    store.write_alarms(&shape_alarms(batch))
}

pub fn write_params<S: Store>(store: &mut S, batch: Vec<NewDevicePara>) -> Result<usize, StoreError> {
    let rows = latest_per_key(batch, |r| r.device_id);
    store.write_params(&rows)
}

pub fn write_acks<S: Store>(store: &mut S, batch: Vec<RpcAck>) -> Result<usize, StoreError> {
    store.apply_acks(&batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::AckStatus;
    use crate::queue::stream_queue;
    use crate::store::memory::MemoryConnector;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone};
    use serde_json::json;
    use std::thread;
    use std::time::Instant;

    fn settings() -> FlushSettings {
        FlushSettings {
            batch_size: 50,
            flush_interval: Duration::from_millis(30),
            reconnect_backoff: Duration::from_millis(20),
        }
    }

    fn realtime(device_id: i64, soc: i64) -> NewRealtimeData {
        let p = crate::models::message::RealtimePayload {
            soc: Some(soc),
            ..Default::default()
        };
        crate::router::normalize_realtime(device_id, &p, Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap())
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn trigger(secs: i64) -> NewAlarm {
        NewAlarm {
            device_id: 11,
            alarm_type: "inverter".into(),
            code: "E05".into(),
            level: "major".into(),
            extra: json!({}),
            status: "active".into(),
            first_triggered_at: at(secs),
            last_triggered_at: at(secs),
            repeat_count: 1,
            remark: None,
            confirmed_at: None,
            confirmed_by: None,
            cleared_at: None,
            cleared_by: None,
        }
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn duplicate_telemetry_keeps_one_row_with_latest_values() {
        let connector = MemoryConnector::new();
        let mut store = connector.connect().unwrap();
        let before = Utc::now();

        write_realtime(&mut store, vec![realtime(7, 40), realtime(7, 55)]).unwrap();
        write_realtime(&mut store, vec![realtime(7, 60)]).unwrap();

        let rows = connector.realtime();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].soc, 60);
        assert!(rows[0].updated_at >= before);
    }

    #[test]
    fn unknown_device_gets_placeholder_row() {
        let connector = MemoryConnector::new();
        let mut store = connector.connect().unwrap();
        write_realtime(&mut store, vec![realtime(123, 50)]).unwrap();

        let devices = connector.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, 123);
        assert_eq!(devices[0].device_sn, "SN0123");
        assert_eq!(connector.realtime().len(), 1);
    }

    #[test]
    fn registrar_keeps_existing_device_serial() {
        let connector = MemoryConnector::new();
        connector.register_device(5, "ESS-REAL-5");
        let mut store = connector.connect().unwrap();
        write_realtime(&mut store, vec![realtime(5, 10)]).unwrap();
        assert_eq!(connector.devices()[0].device_sn, "ESS-REAL-5");
    }

    #[test]
    fn history_bucket_collapses_to_later_counters() {
        let connector = MemoryConnector::new();
        let mut store = connector.connect().unwrap();
        let sample = |pv| NewHistoryEnergy {
            device_id: 3,
            ts: at(0),
            charge_wh_total: 1,
            discharge_wh_total: 2,
            pv_wh_total: pv,
            grid_wh_total: 4,
            load_wh_total: 5,
        };
        write_history(&mut store, vec![sample(100), sample(250)]).unwrap();
        write_history(&mut store, vec![sample(300)]).unwrap();

        let rows = connector.history();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pv_wh_total, 300);
    }

    #[test]
    fn alarm_repeat_counting_across_and_within_batches() {
        let connector = MemoryConnector::new();
        let mut store = connector.connect().unwrap();
        write_alarms(&mut store, vec![trigger(0), trigger(10)]).unwrap();
        write_alarms(&mut store, vec![trigger(20)]).unwrap();

        let live = connector.live_alarms();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].repeat_count, 3);
        assert_eq!(live[0].first_triggered_at, at(0));
        assert_eq!(live[0].last_triggered_at, at(20));
    }

    #[test]
    fn confirmed_alarm_survives_retrigger() {
        let connector = MemoryConnector::new();
        let mut store = connector.connect().unwrap();
        let mut confirmed = trigger(10);
        confirmed.status = "confirmed".into();
        confirmed.confirmed_at = Some(at(10));
        confirmed.confirmed_by = Some("operator".into());

        write_alarms(&mut store, vec![trigger(0)]).unwrap();
        write_alarms(&mut store, vec![confirmed]).unwrap();
        write_alarms(&mut store, vec![trigger(20)]).unwrap();

        let live = connector.live_alarms();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].status, "confirmed");
        assert_eq!(live[0].repeat_count, 2);
        assert_eq!(live[0].last_triggered_at, at(20));
        assert_eq!(live[0].confirmed_at, Some(at(10)));
        assert_eq!(live[0].confirmed_by.as_deref(), Some("operator"));
    }

    #[test]
    fn confirmation_in_one_batch_with_triggers() {
        let connector = MemoryConnector::new();
        let mut store = connector.connect().unwrap();
        let mut confirmed = trigger(5);
        confirmed.status = "confirmed".into();
        confirmed.confirmed_at = Some(at(5));

        write_alarms(&mut store, vec![trigger(0), confirmed, trigger(30)]).unwrap();

        let live = connector.live_alarms();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].status, "confirmed");
        assert_eq!(live[0].repeat_count, 2);
        assert_eq!(live[0].last_triggered_at, at(30));
        assert_eq!(live[0].confirmed_at, Some(at(5)));
    }

    #[test]
    fn critical_clear_waits_for_confirmation() {
        let connector = MemoryConnector::new();
        let mut store = connector.connect().unwrap();
        let mut active = trigger(0);
        active.level = "critical".into();
        write_alarms(&mut store, vec![active.clone()]).unwrap();

        // unconfirmed clear stays live, keeps its status
        let mut clear = active.clone();
        clear.status = "cleared".into();
        clear.cleared_at = Some(at(40));
        clear.last_triggered_at = at(40);
        write_alarms(&mut store, vec![clear.clone()]).unwrap();
        let live = connector.live_alarms();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].status, "active");
        assert_eq!(live[0].cleared_at, Some(at(40)));
        assert_eq!(live[0].repeat_count, 1);

        // confirmed clear archives it
        clear.confirmed_at = Some(at(50));
        let row = store.archive_alarm(&clear, at(60)).unwrap().expect("archived");
        assert_eq!(row.duration_secs, 40);
        assert_eq!(row.confirmed_at, Some(at(50)));
        assert!(connector.live_alarms().is_empty());
    }

    #[test]
    fn ack_only_terminates_pending_commands() {
        let connector = MemoryConnector::new();
        connector.register_device(8, "SN0008");
        connector.add_pending_command(8, "req-1");
        let mut store = connector.connect().unwrap();

        let ack = |status| RpcAck {
            device_sn: "SN0008".into(),
            request_id: "req-1".into(),
            status,
        };
        assert_eq!(write_acks(&mut store, vec![ack(AckStatus::Success)]).unwrap(), 1);
        assert_eq!(write_acks(&mut store, vec![ack(AckStatus::Failed)]).unwrap(), 0);

        let unknown = RpcAck {
            device_sn: "SN9999".into(),
            request_id: "req-404".into(),
            status: AckStatus::Success,
        };
        assert_eq!(write_acks(&mut store, vec![unknown]).unwrap(), 0);

        let log = connector.command_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, "success");
        assert!(log[0].confirmed_at.is_some());
        assert_eq!(connector.devices().len(), 1);
    }

    #[test]
    fn failed_batch_is_dropped_and_worker_continues() {
        let connector = MemoryConnector::new();
        connector.inject_failure(StoreError::Query("constraint violated".into()));
        let (tx, rx) = stream_queue("realtime", 16);
        let stop = StopSignal::new();
        let worker = {
            let connector = connector.clone();
            let stop = stop.clone();
            thread::spawn(move || run(rx, &connector, write_realtime, settings(), &stop))
        };

        tx.offer(realtime(1, 11));
        thread::sleep(Duration::from_millis(200));
        assert!(connector.realtime().is_empty());

        tx.offer(realtime(2, 22));
        wait_for(|| !connector.realtime().is_empty());
        stop.stop();
        worker.join().unwrap();

        let rows = connector.realtime();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].device_id, 2);
        assert_eq!(connector.connects(), 1);
    }

    #[test]
    fn connection_failure_reconnects() {
        let connector = MemoryConnector::new();
        connector.refuse_connects(1);
        connector.inject_failure(StoreError::Connection("server closed the connection".into()));
        let (tx, rx) = stream_queue("para", 16);
        let stop = StopSignal::new();
        let worker = {
            let connector = connector.clone();
            let stop = stop.clone();
            thread::spawn(move || run(rx, &connector, write_params, settings(), &stop))
        };

        let para = |device_id| NewDevicePara {
            device_id,
            para: json!({"mode": "eco"}),
            updated_at: at(0),
        };
        tx.offer(para(1));
        wait_for(|| connector.connects() >= 2);
        tx.offer(para(2));
        wait_for(|| !connector.params().is_empty());
        stop.stop();
        worker.join().unwrap();

        // first batch died with the connection; second went through the new one
        let rows = connector.params();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].device_id, 2);
        assert_eq!(connector.connects(), 2);
    }
}
