//! Common test utilities

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Connects to the test database and truncates every table this crate
/// owns, leaving a clean slate for the test that follows.
pub async fn setup_test_db() -> PgPool {
    dotenvy::dotenv().ok();
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for tests");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    sqlx::query("TRUNCATE TABLE wine_lot_events, action_events, wine_lots, actions CASCADE")
        .execute(&pool)
        .await
        .expect("Failed to clean up DB");

    pool
}
