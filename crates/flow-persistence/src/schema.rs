//! Esquema Diesel. Reemplazable con `diesel print-schema`.

diesel::table! {
    flow_checkpoints (flow_id) {
        flow_id -> Uuid,
        sequence -> BigInt,
        fingerprint -> Text,
        payload -> Bytea,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    flow_outcomes (flow_id) {
        flow_id -> Uuid,
        status -> Text,
        error -> Nullable<Text>,
        finished_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(flow_checkpoints, flow_outcomes,);
