//! Database module
//!
//! Connection verification and schema presence checks. Schema itself is
//! managed by migrations external to this crate (see `DESIGN.md`), not
//! embedded here.

use sqlx::PgPool;

pub async fn verify_connection(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Checks that every table this crate reads or writes exists, so a
/// misconfigured deployment fails fast at startup instead of at the
/// first query.
pub async fn check_schema(pool: &PgPool) -> Result<bool, sqlx::Error> {
    let required_tables = [
        "wine_lots",
        "actions",
        "wine_lot_events",
        "action_events",
    ];

    for table in required_tables {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = 'public' AND table_name = $1
            )
            "#,
        )
        .bind(table)
        .fetch_one(pool)
        .await?;

        if !exists {
            tracing::error!("Required table '{}' does not exist", table);
            return Ok(false);
        }
    }

    Ok(true)
}
