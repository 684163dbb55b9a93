//! Offline rebuild of the `wine_lots` and `actions` snapshot tables from
//! their event logs.
//!
//! Usage: `rebuild [wine-lot-id|action-id]` — with no argument, rebuilds
//! every aggregate of both kinds; with one, rebuilds only that aggregate.

use cellar_ledger::event_store::EventStore;
use cellar_ledger::repository::{ACTION_EVENTS_TABLE, WINE_LOT_EVENTS_TABLE};
use cellar_ledger::{replay, AggregateId, Config};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cellar_ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;
    let only_id = std::env::args()
        .nth(1)
        .map(|s| s.parse::<AggregateId>())
        .transpose()
        .map_err(|_| anyhow::anyhow!("argument is not a valid aggregate id"))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    if !cellar_ledger::db::check_schema(&pool).await? {
        return Err(anyhow::anyhow!("database schema incomplete"));
    }

    let wine_lot_events = EventStore::new(pool.clone(), WINE_LOT_EVENTS_TABLE);
    let action_events = EventStore::new(pool.clone(), ACTION_EVENTS_TABLE);

    let lots_rebuilt = replay::rebuild_wine_lots(
        &pool,
        &wine_lot_events,
        only_id,
        config.rebuild_chunk_size,
    )
    .await?;
    tracing::info!(lots_rebuilt, "wine_lots rebuild complete");

    let actions_rebuilt = replay::rebuild_actions(
        &pool,
        &action_events,
        only_id,
        config.rebuild_chunk_size,
    )
    .await?;
    tracing::info!(actions_rebuilt, "actions rebuild complete");

    pool.close().await;
    Ok(())
}
