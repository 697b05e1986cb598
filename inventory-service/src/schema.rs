diesel::table! {
    batches (id) {
        id -> Uuid,
        variant_id -> Uuid,
        batch_code -> Varchar,
        manufacture_date -> Nullable<Date>,
        expiry_date -> Date,
        import_quantity -> Int4,
        remaining_quantity -> Int4,
        reserved_quantity -> Int4,
        version -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    stock_aggregates (variant_id) {
        variant_id -> Uuid,
        total_quantity -> Int4,
        reserved_quantity -> Int4,
        low_stock_threshold -> Int4,
        version -> Int4,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        order_id -> Uuid,
        batch_id -> Uuid,
        variant_id -> Uuid,
        reserved_quantity -> Int4,
        status -> Varchar,
        expires_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    stock_adjustments (id) {
        id -> Uuid,
        batch_id -> Uuid,
        variant_id -> Uuid,
        quantity -> Int4,
        reason -> Varchar,
        note -> Nullable<Text>,
        reservation_id -> Nullable<Uuid>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    processed_commands (idempotency_key) {
        idempotency_key -> Varchar,
        command_id -> Uuid,
        result -> Nullable<Jsonb>,
        processed_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(reservations -> batches (batch_id));
diesel::joinable!(stock_adjustments -> batches (batch_id));

diesel::allow_tables_to_appear_in_same_query!(
    batches,
    stock_aggregates,
    reservations,
    stock_adjustments,
    processed_commands,
);
