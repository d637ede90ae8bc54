//! Device Registrar: makes sure every device a batch refers to has a row.
//!
//! Existing rows are never touched; unknown devices get a deterministic placeholder
//! serial until the API side registers the real one.

use crate::db::models::NewDevice;
use crate::schema;
use chrono::{DateTime, Utc};
use diesel::PgConnection;
use diesel::prelude::*;
use std::collections::BTreeSet;

pub fn placeholder_serial(device_id: i64) -> String {
    format!("SN{:04}", device_id)
}

/// Distinct device ids in ascending order. A stable order keeps concurrent flushers
/// from locking the same device rows in opposite orders.
pub fn referenced_devices<I>(ids: I) -> Vec<i64>
where
    I: IntoIterator<Item = i64>,
{
    ids.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}

pub fn placeholder_rows(ids: &[i64], now: DateTime<Utc>) -> Vec<NewDevice> {
    ids.iter()
        .map(|&id| NewDevice {
            id,
            device_sn: placeholder_serial(id),
            created_at: now,
        })
        .collect()
}

/// Insert-if-absent for `ids`; runs inside the caller's transaction.
pub fn ensure_devices(conn: &mut PgConnection, ids: &[i64]) -> QueryResult<usize> {
    if ids.is_empty() {
        return Ok(0);
    }

    use schema::devices::dsl as D;

    diesel::insert_into(D::devices)
        .values(placeholder_rows(ids, Utc::now()))
        .on_conflict(D::id)
        .do_nothing()
        .execute(conn)
}
