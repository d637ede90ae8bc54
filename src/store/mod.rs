//! Storage seam used by the flushers and the archiver.
//!
//! Each worker owns one [`Store`] obtained from a shared [`Connect`]; every method is a
//! single all-or-nothing transaction.

use chrono::{DateTime, Utc};
use core::fmt;
use std::error::Error;

use crate::db::models::{NewAlarm, NewAlarmHistory, NewDevicePara, NewHistoryEnergy, NewRealtimeData, RpcAck};
use crate::services::batch::AlarmBatch;

#[cfg(test)]
pub mod memory;
pub mod pg;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The connection is unusable and must be replaced.
    Connection(String),
    /// The statement failed; the connection can be reused.
    Query(String),
}

impl StoreError {
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Connection(e) => write!(f, "connection error: {}", e),
            StoreError::Query(e) => write!(f, "query error: {}", e),
        }
    }
}

impl Error for StoreError {}

pub trait Store {
    /// Upsert telemetry snapshots keyed by device. Rows must have unique device ids.
    fn write_realtime(&mut self, rows: &[NewRealtimeData]) -> Result<usize, StoreError>;

    /// Upsert energy samples keyed by (device, ts). Rows must have unique keys.
    fn write_history(&mut self, rows: &[NewHistoryEnergy]) -> Result<usize, StoreError>;

    /// Upsert coalesced triggers, then apply confirmations, then record pending clears.
    /// A trigger never changes the lifecycle status of a live alarm.
    fn write_alarms(&mut self, batch: &AlarmBatch) -> Result<usize, StoreError>;

    /// Replace parameter snapshots keyed by device. Rows must have unique device ids.
    fn write_params(&mut self, rows: &[NewDevicePara]) -> Result<usize, StoreError>;

    /// Move pending command log rows to their terminal status; returns rows changed.
    fn apply_acks(&mut self, acks: &[RpcAck]) -> Result<usize, StoreError>;

    /// Archive the live alarm matching `alarm`'s key, if there is one.
    fn archive_alarm(
        &mut self,
        alarm: &NewAlarm,
        archived_at: DateTime<Utc>,
    ) -> Result<Option<NewAlarmHistory>, StoreError>;
}

pub trait Connect: Send + Sync + 'static {
    type Store: Store;

    fn connect(&self) -> Result<Self::Store, StoreError>;
}
