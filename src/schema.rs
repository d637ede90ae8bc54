//! Handwritten Diesel schema declarations for the tables the ingestion path touches.
//!
//! `device_rpc_change_log` belongs to the API service; only the columns the
//! acknowledgment flusher reads or writes are declared here.

diesel::table! {
    devices (id) {
        id -> BigInt,
        device_sn -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    ess_realtime_data (device_id) {
        device_id -> BigInt,
        updated_at -> Timestamptz,
        soc -> BigInt,
        soh -> BigInt,
        pv -> BigInt,
        load -> BigInt,
        grid -> BigInt,
        grid_q -> BigInt,
        batt -> BigInt,
        ac_v -> BigInt,
        ac_f -> BigInt,
        v_a -> BigInt,
        v_b -> BigInt,
        v_c -> BigInt,
        i_a -> BigInt,
        i_b -> BigInt,
        i_c -> BigInt,
        p_a -> BigInt,
        p_b -> BigInt,
        p_c -> BigInt,
        q_a -> BigInt,
        q_b -> BigInt,
        q_c -> BigInt,
        e_pv_today -> BigInt,
        e_load_today -> BigInt,
        e_charge_today -> BigInt,
        e_discharge_today -> BigInt,
    }
}

diesel::table! {
    history_energy (device_id, ts) {
        device_id -> BigInt,
        ts -> Timestamptz,
        charge_wh_total -> BigInt,
        discharge_wh_total -> BigInt,
        pv_wh_total -> BigInt,
        grid_wh_total -> BigInt,
        load_wh_total -> BigInt,
    }
}

// Live alarms, unique on (device_id, alarm_type, code)
diesel::table! {
    alarms (id) {
        id -> BigInt,
        device_id -> BigInt,
        alarm_type -> Text,
        code -> Text,
        level -> Text,
        extra -> Jsonb,
        status -> Text,
        first_triggered_at -> Timestamptz,
        last_triggered_at -> Timestamptz,
        repeat_count -> Integer,
        remark -> Nullable<Text>,
        confirmed_at -> Nullable<Timestamptz>,
        confirmed_by -> Nullable<Text>,
        cleared_at -> Nullable<Timestamptz>,
        cleared_by -> Nullable<Text>,
    }
}

diesel::table! {
    alarm_history (id) {
        id -> BigInt,
        device_id -> BigInt,
        alarm_type -> Text,
        code -> Text,
        level -> Text,
        extra -> Jsonb,
        status -> Text,
        first_triggered_at -> Timestamptz,
        last_triggered_at -> Timestamptz,
        repeat_count -> Integer,
        remark -> Nullable<Text>,
        confirmed_at -> Nullable<Timestamptz>,
        confirmed_by -> Nullable<Text>,
        cleared_at -> Nullable<Timestamptz>,
        cleared_by -> Nullable<Text>,
        archived_at -> Timestamptz,
        duration_secs -> BigInt,
    }
}

diesel::table! {
    device_para (device_id) {
        device_id -> BigInt,
        para -> Jsonb,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    device_rpc_change_log (id) {
        id -> BigInt,
        device_id -> BigInt,
        request_id -> Text,
        status -> Text,
        confirmed_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(ess_realtime_data -> devices (device_id));
diesel::joinable!(history_energy -> devices (device_id));
diesel::joinable!(alarms -> devices (device_id));
diesel::joinable!(alarm_history -> devices (device_id));
diesel::joinable!(device_para -> devices (device_id));
diesel::joinable!(device_rpc_change_log -> devices (device_id));

diesel::allow_tables_to_appear_in_same_query!(
    devices,
    ess_realtime_data,
    history_energy,
    alarms,
    alarm_history,
    device_para,
    device_rpc_change_log,
);
