use sqlx::postgres::{PgPool, PgPoolOptions};

fn table_name(schema: &Option<String>, name: &str) -> String {
    match schema {
        Some(s) => format!("{s}.{name}"),
        None => name.to_string(),
    }
}

pub async fn connect(db_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(db_url)
        .await
}

pub async fn ensure_schema(pool: &PgPool, db_schema: &Option<String>) -> Result<(), sqlx::Error> {
    if let Some(schema) = db_schema {
        let ddl = format!("CREATE SCHEMA IF NOT EXISTS {schema}");
        let _ = sqlx::query(&ddl).execute(pool).await;
    }

    let customers = table_name(db_schema, "customers");
    let trips = table_name(db_schema, "trips");
    let stop_points = table_name(db_schema, "stop_points");
    let orders = table_name(db_schema, "orders");
    let tickets = table_name(db_schema, "tickets");
    let coupons = table_name(db_schema, "coupons");
    let coupon_usages = table_name(db_schema, "coupon_usages");
    let transactions = table_name(db_schema, "transactions");

    let ddls = [
        // Collaborator tables: owned by upstream services, read here for
        // pricing, foreign keys and the lookup projections.
        format!(
            "CREATE TABLE IF NOT EXISTS {customers} (\
             id VARCHAR(36) PRIMARY KEY,\
             full_name VARCHAR(120) NOT NULL,\
             email VARCHAR(254) NOT NULL,\
             phone VARCHAR(32) NOT NULL\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {trips} (\
             id VARCHAR(36) PRIMARY KEY,\
             label VARCHAR(160) NOT NULL,\
             depart_at TEXT,\
             arrive_at TEXT,\
             price BIGINT NOT NULL,\
             currency VARCHAR(3) NOT NULL DEFAULT 'VND',\
             status VARCHAR(16) NOT NULL DEFAULT 'open'\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {stop_points} (\
             id VARCHAR(36) PRIMARY KEY,\
             trip_id VARCHAR(36) NOT NULL,\
             name VARCHAR(160) NOT NULL,\
             kind VARCHAR(8) NOT NULL,\
             scheduled_at TEXT\
             )"
        ),
        // Core relations.
        format!(
            "CREATE TABLE IF NOT EXISTS {orders} (\
             id VARCHAR(36) PRIMARY KEY,\
             customer_id VARCHAR(36) NOT NULL,\
             coupon_id VARCHAR(36),\
             origin_amount BIGINT NOT NULL,\
             final_amount BIGINT NOT NULL,\
             status VARCHAR(16) NOT NULL DEFAULT 'pending',\
             created_at TEXT\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {tickets} (\
             id VARCHAR(36) PRIMARY KEY,\
             code VARCHAR(40) NOT NULL UNIQUE,\
             order_id VARCHAR(36) NOT NULL,\
             trip_id VARCHAR(36) NOT NULL,\
             seat_code VARCHAR(8) NOT NULL,\
             pickup_point_id VARCHAR(36),\
             dropoff_point_id VARCHAR(36),\
             status VARCHAR(16) NOT NULL DEFAULT 'pending',\
             purchased_at TEXT,\
             checked_in_at TEXT,\
             checked_in_by VARCHAR(36)\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {coupons} (\
             id VARCHAR(36) PRIMARY KEY,\
             code VARCHAR(40) NOT NULL,\
             discount_type VARCHAR(8) NOT NULL,\
             discount_value BIGINT NOT NULL,\
             max_discount BIGINT,\
             max_uses INTEGER NOT NULL DEFAULT 0,\
             used_count INTEGER NOT NULL DEFAULT 0,\
             valid_from TEXT,\
             valid_to TEXT,\
             status VARCHAR(16) NOT NULL DEFAULT 'active',\
             company_id VARCHAR(36)\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {coupon_usages} (\
             id VARCHAR(36) PRIMARY KEY,\
             customer_id VARCHAR(36) NOT NULL,\
             coupon_id VARCHAR(36) NOT NULL,\
             order_id VARCHAR(36) NOT NULL,\
             used_at TEXT,\
             is_active INTEGER NOT NULL DEFAULT 1\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {transactions} (\
             id VARCHAR(36) PRIMARY KEY,\
             order_id VARCHAR(36) NOT NULL UNIQUE,\
             amount BIGINT NOT NULL,\
             method VARCHAR(16) NOT NULL,\
             status VARCHAR(16) NOT NULL,\
             gateway_txn_no VARCHAR(64),\
             created_at TEXT\
             )"
        ),
        // One seat per trip among non-cancelled tickets. The application
        // checks under a row lock first; this index is the backstop that
        // turns a lost race into a constraint violation instead of a
        // double-sold seat.
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_tickets_trip_seat \
             ON {tickets}(trip_id, seat_code) WHERE status <> 'cancelled'"
        ),
        // At most one active usage per (customer, coupon).
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_usages_customer_coupon_active \
             ON {coupon_usages}(customer_id, coupon_id) WHERE is_active = 1"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_tickets_order ON {tickets}(order_id)"),
        format!("CREATE INDEX IF NOT EXISTS idx_tickets_trip ON {tickets}(trip_id)"),
        format!("CREATE INDEX IF NOT EXISTS idx_orders_customer ON {orders}(customer_id)"),
        format!("CREATE INDEX IF NOT EXISTS idx_usages_order ON {coupon_usages}(order_id)"),
        format!("CREATE INDEX IF NOT EXISTS idx_stop_points_trip ON {stop_points}(trip_id)"),
    ];

    for ddl in ddls {
        let _ = sqlx::query(&ddl).execute(pool).await;
    }

    let _ = sqlx::query(&format!(
        "ALTER TABLE {tickets} ADD COLUMN IF NOT EXISTS checked_in_by VARCHAR(36)"
    ))
    .execute(pool)
    .await;
    let _ = sqlx::query(&format!(
        "ALTER TABLE {coupons} ADD COLUMN IF NOT EXISTS company_id VARCHAR(36)"
    ))
    .execute(pool)
    .await;
    let _ = sqlx::query(&format!(
        "ALTER TABLE {transactions} ADD COLUMN IF NOT EXISTS gateway_txn_no VARCHAR(64)"
    ))
    .execute(pool)
    .await;

    Ok(())
}
