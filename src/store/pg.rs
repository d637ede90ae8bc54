//! PostgreSQL store backed by a single blocking diesel connection.

use chrono::{DateTime, Utc};
use diesel::PgConnection;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::query_builder::QueryFragment;
use diesel::query_dsl::methods::ExecuteDsl;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::upsert::excluded;

use super::{Connect, Store, StoreError};
use crate::db::models::{Alarm, NewAlarm, NewAlarmHistory, NewDevicePara, NewHistoryEnergy, NewRealtimeData, RpcAck};
use crate::models::message::AlarmStatus;
use crate::schema;
use crate::services::archiver::history_row;
use crate::services::batch::AlarmBatch;
use crate::services::registrar::{ensure_devices, referenced_devices};

diesel::define_sql_function! {
    #[sql_name = "COALESCE"]
    fn coalesce_ts(
        x: diesel::sql_types::Nullable<diesel::sql_types::Timestamptz>,
        y: diesel::sql_types::Nullable<diesel::sql_types::Timestamptz>
    ) -> diesel::sql_types::Nullable<diesel::sql_types::Timestamptz>;
}

diesel::define_sql_function! {
    #[sql_name = "COALESCE"]
    fn coalesce_text(
        x: diesel::sql_types::Nullable<diesel::sql_types::Text>,
        y: diesel::sql_types::Nullable<diesel::sql_types::Text>
    ) -> diesel::sql_types::Nullable<diesel::sql_types::Text>;
}

const PENDING: &str = "pending";

impl From<DieselError> for StoreError {
    fn from(e: DieselError) -> Self {
        match &e {
            DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, _)
            | DieselError::BrokenTransactionManager
            | DieselError::AlreadyInTransaction => StoreError::Connection(e.to_string()),
            _ => StoreError::Query(e.to_string()),
        }
    }
}

impl From<ConnectionError> for StoreError {
    fn from(e: ConnectionError) -> Self {
        StoreError::Connection(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct PgConnector {
    database_url: String,
}

impl PgConnector {
    pub fn new(database_url: impl Into<String>) -> Self {
        PgConnector {
            database_url: database_url.into(),
        }
    }
}

impl Connect for PgConnector {
    type Store = PgStore;

    fn connect(&self) -> Result<PgStore, StoreError> {
        let conn = PgConnection::establish(&self.database_url)?;
        Ok(PgStore { conn })
    }
}

pub struct PgStore {
    conn: PgConnection,
}

/// Insert new alarms; a re-trigger bumps the counter and occurrence time but keeps the
/// live status.
fn trigger_upsert<'a>(
    rows: &'a [NewAlarm],
) -> impl RunQueryDsl<PgConnection> + ExecuteDsl<PgConnection> + QueryFragment<Pg> + 'a {
    use schema::alarms::dsl as A;

    diesel::insert_into(A::alarms)
        .values(rows)
        .on_conflict((A::device_id, A::alarm_type, A::code))
        .do_update()
        .set((
            A::level.eq(excluded(A::level)),
            A::extra.eq(excluded(A::extra)),
            A::last_triggered_at.eq(excluded(A::last_triggered_at)),
            A::repeat_count.eq(A::repeat_count + excluded(A::repeat_count)),
            A::remark.eq(excluded(A::remark)),
            A::confirmed_at.eq(coalesce_ts(excluded(A::confirmed_at), A::confirmed_at)),
            A::confirmed_by.eq(coalesce_text(excluded(A::confirmed_by), A::confirmed_by)),
        ))
}

/// Move alarms to `confirmed`, inserting the row if the trigger was never seen.
fn confirmation_upsert<'a>(
    rows: &'a [NewAlarm],
) -> impl RunQueryDsl<PgConnection> + ExecuteDsl<PgConnection> + QueryFragment<Pg> + 'a {
    use schema::alarms::dsl as A;

    diesel::insert_into(A::alarms)
        .values(rows)
        .on_conflict((A::device_id, A::alarm_type, A::code))
        .do_update()
        .set((
            A::status.eq(excluded(A::status)),
            A::confirmed_at.eq(coalesce_ts(excluded(A::confirmed_at), A::confirmed_at)),
            A::confirmed_by.eq(coalesce_text(excluded(A::confirmed_by), A::confirmed_by)),
        ))
}

/// Not archivable yet: note the clear on the live row, keep its lifecycle status.
fn clear_update<'a>(
    clear: &'a NewAlarm,
) -> impl RunQueryDsl<PgConnection> + ExecuteDsl<PgConnection> + QueryFragment<Pg> + 'a {
    use schema::alarms::dsl as A;

    diesel::update(
        A::alarms
            .filter(A::device_id.eq(clear.device_id))
            .filter(A::alarm_type.eq(&clear.alarm_type))
            .filter(A::code.eq(&clear.code))
            .filter(A::status.ne(AlarmStatus::Cleared.as_str())),
    )
    .set((A::cleared_at.eq(clear.cleared_at), A::cleared_by.eq(&clear.cleared_by)))
}

impl Store for PgStore {
    fn write_realtime(&mut self, rows: &[NewRealtimeData]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        use schema::ess_realtime_data::dsl as R;

        let ids = referenced_devices(rows.iter().map(|r| r.device_id));
        let count = self.conn.transaction::<_, DieselError, _>(|conn| {
            ensure_devices(conn, &ids)?;
            diesel::insert_into(R::ess_realtime_data)
                .values(rows)
                .on_conflict(R::device_id)
                .do_update()
                .set((
                    R::updated_at.eq(excluded(R::updated_at)),
                    R::soc.eq(excluded(R::soc)),
                    R::soh.eq(excluded(R::soh)),
                    R::pv.eq(excluded(R::pv)),
                    R::load.eq(excluded(R::load)),
                    R::grid.eq(excluded(R::grid)),
                    R::grid_q.eq(excluded(R::grid_q)),
                    R::batt.eq(excluded(R::batt)),
                    R::ac_v.eq(excluded(R::ac_v)),
                    R::ac_f.eq(excluded(R::ac_f)),
                    R::v_a.eq(excluded(R::v_a)),
                    R::v_b.eq(excluded(R::v_b)),
                    R::v_c.eq(excluded(R::v_c)),
                    R::i_a.eq(excluded(R::i_a)),
                    R::i_b.eq(excluded(R::i_b)),
                    R::i_c.eq(excluded(R::i_c)),
                    R::p_a.eq(excluded(R::p_a)),
                    R::p_b.eq(excluded(R::p_b)),
                    R::p_c.eq(excluded(R::p_c)),
                    R::q_a.eq(excluded(R::q_a)),
                    R::q_b.eq(excluded(R::q_b)),
                    R::q_c.eq(excluded(R::q_c)),
                    R::e_pv_today.eq(excluded(R::e_pv_today)),
                    R::e_load_today.eq(excluded(R::e_load_today)),
                    R::e_charge_today.eq(excluded(R::e_charge_today)),
                    R::e_discharge_today.eq(excluded(R::e_discharge_today)),
                ))
                .execute(conn)
        })?;
        Ok(count)
    }

    fn write_history(&mut self, rows: &[NewHistoryEnergy]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        use schema::history_energy::dsl as H;

        let ids = referenced_devices(rows.iter().map(|r| r.device_id));
        let count = self.conn.transaction::<_, DieselError, _>(|conn| {
            ensure_devices(conn, &ids)?;
            diesel::insert_into(H::history_energy)
                .values(rows)
                .on_conflict((H::device_id, H::ts))
                .do_update()
                .set((
                    H::charge_wh_total.eq(excluded(H::charge_wh_total)),
                    H::discharge_wh_total.eq(excluded(H::discharge_wh_total)),
                    H::pv_wh_total.eq(excluded(H::pv_wh_total)),
                    H::grid_wh_total.eq(excluded(H::grid_wh_total)),
                    H::load_wh_total.eq(excluded(H::load_wh_total)),
                ))
                .execute(conn)
        })?;
        Ok(count)
    }

    fn write_alarms(&mut self, batch: &AlarmBatch) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let ids = batch.devices();
        let count = self.conn.transaction::<_, DieselError, _>(|conn| {
            ensure_devices(conn, &ids)?;
            let mut count = 0;
            if !batch.triggers.is_empty() {
                count += trigger_upsert(&batch.triggers).execute(conn)?;
            }
            if !batch.confirmations.is_empty() {
                count += confirmation_upsert(&batch.confirmations).execute(conn)?;
            }
            for clear in &batch.clears {
                count += clear_update(clear).execute(conn)?;
            }
            Ok(count)
        })?;
        Ok(count)
    }

    fn write_params(&mut self, rows: &[NewDevicePara]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        use schema::device_para::dsl as P;

        let ids = referenced_devices(rows.iter().map(|r| r.device_id));
        let count = self.conn.transaction::<_, DieselError, _>(|conn| {
            ensure_devices(conn, &ids)?;
            diesel::insert_into(P::device_para)
                .values(rows)
                .on_conflict(P::device_id)
                .do_update()
                .set((P::para.eq(excluded(P::para)), P::updated_at.eq(excluded(P::updated_at))))
                .execute(conn)
        })?;
        Ok(count)
    }

    fn apply_acks(&mut self, acks: &[RpcAck]) -> Result<usize, StoreError> {
        if acks.is_empty() {
            return Ok(0);
        }

        use schema::device_rpc_change_log::dsl as L;
        use schema::devices::dsl as D;

        let now = Utc::now();
        let count = self.conn.transaction::<_, DieselError, _>(|conn| {
            let mut count = 0;
            for ack in acks {
                let device = D::devices
                    .filter(D::device_sn.eq(&ack.device_sn))
                    .select(D::id)
                    .single_value();
                count += diesel::update(
                    L::device_rpc_change_log
                        .filter(L::request_id.eq(&ack.request_id))
                        .filter(L::device_id.nullable().eq(device))
                        .filter(L::status.eq(PENDING)),
                )
                .set((L::status.eq(ack.status.as_str()), L::confirmed_at.eq(Some(now))))
                .execute(conn)?;
            }
            Ok(count)
        })?;
        Ok(count)
    }

    fn archive_alarm(
        &mut self,
        alarm: &NewAlarm,
        archived_at: DateTime<Utc>,
    ) -> Result<Option<NewAlarmHistory>, StoreError> {
        use schema::alarm_history::dsl as AH;
        use schema::alarms::dsl as A;

        let archived = self.conn.transaction::<_, DieselError, _>(|conn| {
            let live: Option<Alarm> = A::alarms
                .filter(A::device_id.eq(alarm.device_id))
                .filter(A::alarm_type.eq(&alarm.alarm_type))
                .filter(A::code.eq(&alarm.code))
                .filter(A::status.ne(AlarmStatus::Cleared.as_str()))
                .order(A::last_triggered_at.desc())
                .select(Alarm::as_select())
                .for_update()
                .first(conn)
                .optional()?;
            let Some(live) = live else {
                return Ok(None);
            };

            let row = history_row(&live, alarm, archived_at);
            diesel::insert_into(AH::alarm_history).values(&row).execute(conn)?;
            diesel::delete(A::alarms.filter(A::id.eq(live.id))).execute(conn)?;
            Ok(Some(row))
        })?;
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn alarm(status: &str) -> NewAlarm {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        NewAlarm {
            device_id: 4,
            alarm_type: "pcs".into(),
            code: "F17".into(),
            level: "major".into(),
            extra: json!({}),
            status: status.into(),
            first_triggered_at: at,
            last_triggered_at: at,
            repeat_count: 1,
            remark: None,
            confirmed_at: None,
            confirmed_by: None,
            cleared_at: Some(at),
            cleared_by: None,
        }
    }

    /// SQL text before the bind list.
    fn sql(query: &impl QueryFragment<Pg>) -> String {
        let text = diesel::debug_query::<Pg, _>(query).to_string();
        text.split(" -- binds").next().unwrap_or_default().to_string()
    }

    fn update_set(sql: &str) -> &str {
        sql.split("DO UPDATE SET").nth(1).expect("upsert has a SET clause")
    }

    #[test]
    fn trigger_upsert_counts_repeats_and_keeps_status() {
        let rows = vec![alarm("active")];
        let sql = sql(&trigger_upsert(&rows));
        assert!(sql.contains(r#"ON CONFLICT ("device_id", "alarm_type", "code")"#), "{}", sql);

        let set = update_set(&sql);
        assert!(set.contains(r#""repeat_count" + excluded."repeat_count""#), "{}", set);
        assert!(set.contains(r#"COALESCE(excluded."confirmed_at", "#), "{}", set);
        assert!(set.contains(r#"COALESCE(excluded."confirmed_by", "#), "{}", set);
        assert!(set.contains(r#""last_triggered_at" = excluded."last_triggered_at""#), "{}", set);
        assert!(!set.contains(r#""status""#), "{}", set);
        assert!(!set.contains(r#""first_triggered_at""#), "{}", set);
    }

    #[test]
    fn confirmation_upsert_only_touches_confirmation() {
        let rows = vec![alarm("confirmed")];
        let sql = sql(&confirmation_upsert(&rows));

        let set = update_set(&sql);
        assert!(set.contains(r#""status" = excluded."status""#), "{}", set);
        assert!(set.contains(r#"COALESCE(excluded."confirmed_at", "#), "{}", set);
        assert!(!set.contains(r#""repeat_count""#), "{}", set);
        assert!(!set.contains(r#""last_triggered_at""#), "{}", set);
    }

    #[test]
    fn clear_update_records_clear_on_live_rows_only() {
        let clear = alarm("cleared");
        let sql = sql(&clear_update(&clear));
        let (set, filter) = sql.split_once(" WHERE ").expect("update is filtered");

        assert!(set.starts_with(r#"UPDATE "alarms" SET"#), "{}", sql);
        assert!(set.contains(r#""cleared_at" = $"#), "{}", set);
        assert!(set.contains(r#""cleared_by" = $"#), "{}", set);
        assert!(!set.contains(r#""status""#), "{}", set);
        assert!(filter.contains(r#""status" != $"#), "{}", filter);
    }
}
