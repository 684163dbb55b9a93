//! AggregateRepository (unit of work).
//!
//! Task-scoped, never a global: state lives inside a `tokio::task_local!`
//! cell that is populated fresh on entry to [`unit_of_work`] and torn down
//! on exit, so two concurrent unit-of-work scopes on different tasks never
//! share a buffer.

use std::cell::RefCell;
use std::future::Future;
use std::str::FromStr;

use sqlx::{PgPool, Postgres, Transaction};

use crate::aggregate::Aggregate;
use crate::domain::error::CoreError;
use crate::domain::{ActionEvent, WineLotEvent};
use crate::event_store::EventStore;
use crate::id::AggregateId;
use crate::notification::{self, Notification};

pub const WINE_LOT_EVENTS_TABLE: &str = "wine_lot_events";
pub const ACTION_EVENTS_TABLE: &str = "action_events";

/// Loads `id`'s current materialized state directly from the `wine_lots`
/// snapshot table — the live read path used by command handlers, as
/// opposed to folding the event log, which is reserved for temporal
/// replay and rebuilds.
pub async fn find_wine_lot(
    pool: &PgPool,
    id: AggregateId,
) -> Result<Option<crate::aggregate::WineLot>, CoreError> {
    let row: Option<(
        i64,
        String,
        rust_decimal::Decimal,
        Option<chrono::DateTime<chrono::Utc>>,
    )> = sqlx::query_as(
        "SELECT version, code, volume, deleted_at FROM wine_lots WHERE id = $1",
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await
    .map_err(|e| CoreError::from(crate::event_store::EventStoreError::from(e)))?;

    Ok(row.map(|(version, code, volume, deleted_at)| {
        let mut lot = crate::aggregate::WineLot::identity(id);
        lot.code = code;
        lot.volume = volume;
        lot.deleted_at = deleted_at;
        lot.set_version(version);
        lot
    }))
}

/// Mirrors [`find_wine_lot`] for the `actions` snapshot table.
pub async fn find_action(
    pool: &PgPool,
    id: AggregateId,
) -> Result<Option<crate::aggregate::Action>, CoreError> {
    #[allow(clippy::type_complexity)]
    let row: Option<(
        i64,
        chrono::DateTime<chrono::Utc>,
        chrono::DateTime<chrono::Utc>,
        Option<chrono::DateTime<chrono::Utc>>,
        Option<chrono::DateTime<chrono::Utc>>,
        Option<String>,
        Option<serde_json::Value>,
        Vec<String>,
        i32,
    )> = sqlx::query_as(
        "SELECT version, effective_at, recorded_at, updated_at, deleted_at, action_type, \
         details, involved_wine_lot_ids, revision_number FROM actions WHERE id = $1",
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await
    .map_err(|e| CoreError::from(crate::event_store::EventStoreError::from(e)))?;

    let Some((
        version,
        effective_at,
        recorded_at,
        updated_at,
        deleted_at,
        action_type,
        details,
        involved_wine_lot_ids,
        revision_number,
    )) = row
    else {
        return Ok(None);
    };

    let action_type = action_type
        .map(|s| crate::domain::ActionType::from_str(&s))
        .transpose()?;
    let details = details
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| CoreError::from(crate::event_store::EventStoreError::from(e)))?;
    let involved_wine_lot_ids = involved_wine_lot_ids
        .iter()
        .map(|s| {
            s.parse()
                .map_err(|_| CoreError::Persistence(format!("malformed wine lot id '{s}'")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut action = crate::aggregate::Action::identity(id);
    action.effective_at = effective_at;
    action.recorded_at = recorded_at;
    action.updated_at = updated_at;
    action.deleted_at = deleted_at;
    action.action_type = action_type;
    action.details = details;
    action.involved_wine_lot_ids = involved_wine_lot_ids;
    action.revision_number = revision_number;
    action.set_version(version);
    Ok(Some(action))
}

/// A registered aggregate plus the version it held when it entered this
/// unit of work — the compare-and-swap target for `commit()`.
enum PendingAggregate {
    WineLot {
        aggregate: crate::aggregate::WineLot,
        expected_version: i64,
    },
    Action {
        aggregate: crate::aggregate::Action,
        expected_version: i64,
    },
}

enum PendingAppend {
    WineLot(AggregateId, Vec<WineLotEvent>),
    Action(AggregateId, Vec<ActionEvent>),
}

enum PendingDeletion {
    WineLot(i64),
    Action(i64),
}

#[derive(Default)]
struct State {
    aggregates: Vec<PendingAggregate>,
    appends: Vec<PendingAppend>,
    deletions: Vec<PendingDeletion>,
    notifications: Vec<Notification>,
    tx: Option<Transaction<'static, Postgres>>,
}

tokio::task_local! {
    static UOW: RefCell<State>;
}

/// `None` outside an active [`unit_of_work`] — tolerated, not an error, so
/// that `Aggregate::apply_event`'s repository hook is a harmless no-op in
/// plain domain unit tests that never open a unit of work.
fn with_state<R>(f: impl FnOnce(&mut State) -> R) -> Option<R> {
    UOW.try_with(|cell| f(&mut cell.borrow_mut())).ok()
}

/// Registers `lot` for persistence and drains its uncommitted events and
/// pending retractions into the unit-of-work buffer. Fatal programmer
/// error (`CannotPersistView`) if `lot` is a `load_states_before` snapshot.
/// Called automatically by `WineLot::apply_event`; a no-op outside an
/// active [`unit_of_work`].
///
/// Idempotent per aggregate id within one unit of work: repeated calls
/// (one per `apply_event`) update the buffered snapshot in place and keep
/// accumulating appended events, but the optimistic-concurrency check
/// stays pinned to the version the aggregate held on its first call.
pub fn add_wine_lot(lot: &mut crate::aggregate::WineLot) -> Result<(), CoreError> {
    if !lot.is_persistable() {
        return Err(CoreError::CannotPersistView {
            aggregate_type: crate::aggregate::WineLot::aggregate_type(),
            aggregate_id: lot.id(),
        });
    }
    let expected_version = lot.version();
    let events = std::mem::take(lot.recorded_events_mut());
    let retractions = std::mem::take(lot.pending_retractions_mut());
    let snapshot = lot.clone();

    with_state(|state| {
        for row_id in retractions {
            state.deletions.push(PendingDeletion::WineLot(row_id));
        }
        if !events.is_empty() {
            for event in &events {
                state
                    .notifications
                    .push(Notification::WineLot(event.clone()));
            }
            state
                .appends
                .push(PendingAppend::WineLot(snapshot.id(), events));
        }
        let existing = state.aggregates.iter_mut().find_map(|p| match p {
            PendingAggregate::WineLot { aggregate, .. } if aggregate.id() == snapshot.id() => {
                Some(aggregate)
            }
            _ => None,
        });
        match existing {
            Some(aggregate) => *aggregate = snapshot,
            None => state.aggregates.push(PendingAggregate::WineLot {
                aggregate: snapshot,
                expected_version,
            }),
        }
    });
    Ok(())
}

/// Registers `action` for persistence and drains its uncommitted events
/// and pending retractions into the unit-of-work buffer. Fatal programmer
/// error (`CannotPersistView`) if `action` is a `load_states_before` snapshot.
/// Called automatically by `Action::apply_event`; a no-op outside an
/// active [`unit_of_work`]. Idempotent per aggregate id — see
/// [`add_wine_lot`].
pub fn add_action(action: &mut crate::aggregate::Action) -> Result<(), CoreError> {
    if !action.is_persistable() {
        return Err(CoreError::CannotPersistView {
            aggregate_type: crate::aggregate::Action::aggregate_type(),
            aggregate_id: action.id(),
        });
    }
    let expected_version = action.version();
    let events = std::mem::take(action.recorded_events_mut());
    let retractions = std::mem::take(action.pending_retractions_mut());
    let snapshot = action.clone();

    with_state(|state| {
        for row_id in retractions {
            state.deletions.push(PendingDeletion::Action(row_id));
        }
        if !events.is_empty() {
            for event in &events {
                state
                    .notifications
                    .push(Notification::Action(event.clone()));
            }
            state
                .appends
                .push(PendingAppend::Action(snapshot.id(), events));
        }
        let existing = state.aggregates.iter_mut().find_map(|p| match p {
            PendingAggregate::Action { aggregate, .. } if aggregate.id() == snapshot.id() => {
                Some(aggregate)
            }
            _ => None,
        });
        match existing {
            Some(aggregate) => *aggregate = snapshot,
            None => state.aggregates.push(PendingAggregate::Action {
                aggregate: snapshot,
                expected_version,
            }),
        }
    });
    Ok(())
}

/// Registers `stored_event_id` for retraction and re-registers `lot` for
/// persistence even though it may carry no new uncommitted events —
/// used when an edit only retracts a prior event and the aggregate's
/// current state is reconstructed entirely by `reapply_downstream`.
pub fn mark_wine_lot_event_edited(
    lot: &mut crate::aggregate::WineLot,
    stored_event_id: i64,
) -> Result<(), CoreError> {
    lot.queue_retraction(stored_event_id);
    add_wine_lot(lot)
}

pub fn mark_action_event_edited(
    action: &mut crate::aggregate::Action,
    stored_event_id: i64,
) -> Result<(), CoreError> {
    action.queue_retraction(stored_event_id);
    add_action(action)
}

pub(crate) async fn persist_wine_lot_row(
    tx: &mut Transaction<'_, Postgres>,
    lot: &crate::aggregate::WineLot,
    expected_version: i64,
) -> Result<i64, CoreError> {
    let new_version = expected_version + 1;
    let rows_affected = if expected_version == 0 {
        sqlx::query(
            "INSERT INTO wine_lots (id, version, code, volume, deleted_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(lot.id().to_string())
        .bind(new_version)
        .bind(&lot.code)
        .bind(lot.volume)
        .bind(lot.deleted_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| CoreError::from(crate::event_store::EventStoreError::from(e)))?
        .rows_affected()
    } else {
        sqlx::query(
            "UPDATE wine_lots SET version = $1, code = $2, volume = $3, deleted_at = $4 \
             WHERE id = $5 AND version = $6",
        )
        .bind(new_version)
        .bind(&lot.code)
        .bind(lot.volume)
        .bind(lot.deleted_at)
        .bind(lot.id().to_string())
        .bind(expected_version)
        .execute(&mut **tx)
        .await
        .map_err(|e| CoreError::from(crate::event_store::EventStoreError::from(e)))?
        .rows_affected()
    };

    if rows_affected == 0 {
        return Err(CoreError::OutOfDateVersion {
            aggregate_type: crate::aggregate::WineLot::aggregate_type(),
            aggregate_id: lot.id(),
        });
    }
    Ok(new_version)
}

/// Unconditional upsert used only by `rebuild_aggregates`: the rebuilt
/// version is derived from the folded event count, not a compare-and-swap,
/// since the whole point of a rebuild is to overwrite a possibly-corrupt row.
pub(crate) async fn upsert_wine_lot_row(
    tx: &mut Transaction<'_, Postgres>,
    lot: &crate::aggregate::WineLot,
    version: i64,
) -> Result<(), CoreError> {
    sqlx::query(
        "INSERT INTO wine_lots (id, version, code, volume, deleted_at) VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (id) DO UPDATE SET version = $2, code = $3, volume = $4, deleted_at = $5",
    )
    .bind(lot.id().to_string())
    .bind(version)
    .bind(&lot.code)
    .bind(lot.volume)
    .bind(lot.deleted_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| CoreError::from(crate::event_store::EventStoreError::from(e)))?;
    Ok(())
}

pub(crate) async fn persist_action_row(
    tx: &mut Transaction<'_, Postgres>,
    action: &crate::aggregate::Action,
    expected_version: i64,
) -> Result<i64, CoreError> {
    let new_version = expected_version + 1;
    let action_type = action.action_type.map(|t| t.as_str());
    let details = action
        .details
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| CoreError::from(crate::event_store::EventStoreError::from(e)))?;
    let involved: Vec<String> = action
        .involved_wine_lot_ids
        .iter()
        .map(|id| id.to_string())
        .collect();

    let rows_affected = if expected_version == 0 {
        sqlx::query(
            "INSERT INTO actions (id, version, effective_at, recorded_at, updated_at, deleted_at, \
             action_type, details, involved_wine_lot_ids, revision_number) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(action.id().to_string())
        .bind(new_version)
        .bind(action.effective_at)
        .bind(action.recorded_at)
        .bind(action.updated_at)
        .bind(action.deleted_at)
        .bind(action_type)
        .bind(details)
        .bind(&involved)
        .bind(action.revision_number)
        .execute(&mut **tx)
        .await
        .map_err(|e| CoreError::from(crate::event_store::EventStoreError::from(e)))?
        .rows_affected()
    } else {
        sqlx::query(
            "UPDATE actions SET version = $1, effective_at = $2, recorded_at = $3, updated_at = $4, \
             deleted_at = $5, action_type = $6, details = $7, involved_wine_lot_ids = $8, \
             revision_number = $9 WHERE id = $10 AND version = $11",
        )
        .bind(new_version)
        .bind(action.effective_at)
        .bind(action.recorded_at)
        .bind(action.updated_at)
        .bind(action.deleted_at)
        .bind(action_type)
        .bind(details)
        .bind(&involved)
        .bind(action.revision_number)
        .bind(action.id().to_string())
        .bind(expected_version)
        .execute(&mut **tx)
        .await
        .map_err(|e| CoreError::from(crate::event_store::EventStoreError::from(e)))?
        .rows_affected()
    };

    if rows_affected == 0 {
        return Err(CoreError::OutOfDateVersion {
            aggregate_type: crate::aggregate::Action::aggregate_type(),
            aggregate_id: action.id(),
        });
    }
    Ok(new_version)
}

/// Unconditional upsert used only by `rebuild_aggregates`, mirroring
/// [`upsert_wine_lot_row`].
pub(crate) async fn upsert_action_row(
    tx: &mut Transaction<'_, Postgres>,
    action: &crate::aggregate::Action,
    version: i64,
) -> Result<(), CoreError> {
    let action_type = action.action_type.map(|t| t.as_str());
    let details = action
        .details
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| CoreError::from(crate::event_store::EventStoreError::from(e)))?;
    let involved: Vec<String> = action
        .involved_wine_lot_ids
        .iter()
        .map(|id| id.to_string())
        .collect();

    sqlx::query(
        "INSERT INTO actions (id, version, effective_at, recorded_at, updated_at, deleted_at, \
         action_type, details, involved_wine_lot_ids, revision_number) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         ON CONFLICT (id) DO UPDATE SET version = $2, effective_at = $3, recorded_at = $4, \
         updated_at = $5, deleted_at = $6, action_type = $7, details = $8, \
         involved_wine_lot_ids = $9, revision_number = $10",
    )
    .bind(action.id().to_string())
    .bind(version)
    .bind(action.effective_at)
    .bind(action.recorded_at)
    .bind(action.updated_at)
    .bind(action.deleted_at)
    .bind(action_type)
    .bind(details)
    .bind(&involved)
    .bind(action.revision_number)
    .execute(&mut **tx)
    .await
    .map_err(|e| CoreError::from(crate::event_store::EventStoreError::from(e)))?;
    Ok(())
}

/// The only way to run a write flow against this repository: opens the
/// database transaction, then runs `f` with a fresh task-scoped buffer
/// bound to the current task — opening the transaction before `f` gets a
/// chance to buffer anything via `apply_event`, per the unit-of-work's
/// scope contract. On `Ok`, persists the buffer against that same
/// transaction, commits, and dispatches notifications only after the
/// commit succeeds. On any error — from `f` itself or from the commit —
/// rolls the transaction back and discards the buffer.
///
/// `f`'s body should call aggregate factory/mutator methods and
/// `apply_event` only; those already register themselves via
/// `add_wine_lot`/`add_action`, so `f` never needs to call them directly.
pub async fn unit_of_work<F, Fut, T>(
    pool: &PgPool,
    wine_lot_events: &EventStore<WineLotEvent>,
    action_events: &EventStore<ActionEvent>,
    f: F,
) -> Result<T, CoreError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let tx = pool
        .begin()
        .await
        .map_err(|e| CoreError::from(crate::event_store::EventStoreError::from(e)))?;

    let state = State {
        tx: Some(tx),
        ..State::default()
    };

    UOW.scope(RefCell::new(state), async move {
        match f().await {
            Ok(value) => match commit(wine_lot_events, action_events).await {
                Ok(()) => Ok(value),
                Err(e) => {
                    rollback().await;
                    Err(e)
                }
            },
            Err(e) => {
                rollback().await;
                Err(e)
            }
        }
    })
    .await
}

/// Drains the buffer and the open transaction, writes everything against
/// it, commits, then dispatches notifications.
async fn commit(
    wine_lot_events: &EventStore<WineLotEvent>,
    action_events: &EventStore<ActionEvent>,
) -> Result<(), CoreError> {
    let (aggregates, appends, deletions, notifications, tx) = with_state(|state| {
        (
            std::mem::take(&mut state.aggregates),
            std::mem::take(&mut state.appends),
            std::mem::take(&mut state.deletions),
            std::mem::take(&mut state.notifications),
            state.tx.take(),
        )
    })
    .expect("commit is only ever called from within unit_of_work's scope");

    let mut tx = tx.expect("unit_of_work always opens the transaction before buffering begins");

    for pending in &aggregates {
        match pending {
            PendingAggregate::WineLot {
                aggregate,
                expected_version,
            } => {
                persist_wine_lot_row(&mut tx, aggregate, *expected_version).await?;
            }
            PendingAggregate::Action {
                aggregate,
                expected_version,
            } => {
                persist_action_row(&mut tx, aggregate, *expected_version).await?;
            }
        }
    }

    for append in &appends {
        match append {
            PendingAppend::WineLot(aggregate_id, events) => {
                wine_lot_events
                    .append(&mut *tx, *aggregate_id, events)
                    .await
                    .map_err(CoreError::from)?;
            }
            PendingAppend::Action(aggregate_id, events) => {
                action_events
                    .append(&mut *tx, *aggregate_id, events)
                    .await
                    .map_err(CoreError::from)?;
            }
        }
    }

    let wine_lot_deletions: Vec<i64> = deletions
        .iter()
        .filter_map(|d| match d {
            PendingDeletion::WineLot(id) => Some(*id),
            PendingDeletion::Action(_) => None,
        })
        .collect();
    let action_deletions: Vec<i64> = deletions
        .iter()
        .filter_map(|d| match d {
            PendingDeletion::Action(id) => Some(*id),
            PendingDeletion::WineLot(_) => None,
        })
        .collect();

    wine_lot_events
        .delete(&mut *tx, &wine_lot_deletions)
        .await
        .map_err(CoreError::from)?;
    action_events
        .delete(&mut *tx, &action_deletions)
        .await
        .map_err(CoreError::from)?;

    tx.commit()
        .await
        .map_err(|e| CoreError::from(crate::event_store::EventStoreError::from(e)))?;

    notification::dispatch_all(&notifications)?;

    Ok(())
}

/// Discards the buffer and rolls the open transaction back. Best-effort:
/// a failed `ROLLBACK` still leaves the buffer cleared and the connection
/// returned to the pool.
async fn rollback() {
    let tx = with_state(|state| {
        state.aggregates.clear();
        state.appends.clear();
        state.deletions.clear();
        state.notifications.clear();
        state.tx.take()
    })
    .flatten();

    if let Some(tx) = tx {
        let _ = tx.rollback().await;
    }
}
