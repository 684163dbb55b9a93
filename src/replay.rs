//! Temporal replay.
//!
//! Backdated inserts and edits share one shape: fold history up to a
//! cutoff into an editable instance, let the caller apply the new or
//! revised event, then fold everything after the cutoff back on top so
//! the aggregate's current state reflects the now-revised history.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, SubsecRound, Utc};
use sqlx::PgPool;

use crate::aggregate::{Action, Aggregate, WineLot};
use crate::cursor::{self, CursorKey};
use crate::domain::error::CoreError;
use crate::domain::{ActionEvent, WineLotEvent};
use crate::event_store::{EventStore, TemporalBound};
use crate::id::AggregateId;
use crate::repository;

/// Backdated mutations must land at least two seconds in the past, with
/// sub-second precision truncated away — callers pass the result of this
/// function on to `load_editable_at_time`/`load_editable_at_time_and_point`,
/// never the raw, unvalidated timestamp they were given.
pub fn validate_effective_at(
    effective_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, CoreError> {
    let truncated = effective_at.trunc_subsecs(0);
    if truncated > now - chrono::Duration::seconds(2) {
        return Err(CoreError::domain_validation(
            "effective_at must be functionally in the past",
        ));
    }
    Ok(truncated)
}

/// §4.4.1 — seeds usable to insert a new event at time `t`.
///
/// Every aggregate in `aggregates` that is still unpersisted is kept
/// as-is (just marked for backdating); persisted aggregates are rebuilt
/// from `identity()` by folding their history up to `t`, or, lacking any
/// such history, seeded from the single earliest event strictly after `t`.
pub async fn load_editable_at_time<A>(
    pool: &PgPool,
    store: &EventStore<A::Event>,
    aggregates: &[A],
    t: DateTime<Utc>,
) -> Result<HashMap<AggregateId, A>, CoreError>
where
    A: Aggregate + Clone,
{
    let versions = current_versions(aggregates);
    let (mut result, needs_seed) = split_unpersisted(aggregates);
    if needs_seed.is_empty() {
        return Ok(result);
    }

    let rows = store
        .fetch(pool, &needs_seed, &TemporalBound::AtOrBefore(t), false, None)
        .await?;

    let mut seen = HashSet::new();
    for row in rows {
        let entry = result
            .entry(row.aggregate_id)
            .or_insert_with(|| A::identity(row.aggregate_id));
        entry.load_event(row.event_data)?;
        seen.insert(row.aggregate_id);
    }

    for id in needs_seed {
        if seen.contains(&id) {
            continue;
        }
        if let Some(row) = store
            .fetch(pool, &[id], &TemporalBound::After(t), false, Some(1))
            .await?
            .into_iter()
            .next()
        {
            let mut entry = A::identity(id);
            entry.load_event(row.event_data)?;
            entry.mark_for_backdating();
            result.insert(id, entry);
        }
    }

    restore_versions(&mut result, &versions);
    Ok(result)
}

/// §4.4.2 — seeds usable to edit the event at `(t, seq)`.
///
/// Same fold as [`load_editable_at_time`], but the window extends up to
/// and including `seq` at `t`; the row whose `sequence_number` equals
/// `seq` is withheld from the fold — its own effect is never applied —
/// and reported through `on_edited_row` so the caller can queue it for
/// retraction. The resulting seed reflects state as of just before that
/// point, ready for either a corrected event on the same aggregate or
/// none at all, if the correction now lands on a different aggregate.
pub async fn load_editable_at_time_and_point<A>(
    pool: &PgPool,
    store: &EventStore<A::Event>,
    aggregates: &[A],
    t: DateTime<Utc>,
    seq: &str,
    mut on_edited_row: impl FnMut(&mut A, i64),
) -> Result<HashMap<AggregateId, A>, CoreError>
where
    A: Aggregate + Clone,
{
    let versions = current_versions(aggregates);
    let (mut result, needs_seed) = split_unpersisted(aggregates);
    if needs_seed.is_empty() {
        return Ok(result);
    }

    let bound = TemporalBound::BeforeOrAtWithSeqAtMost(t, seq.to_string());
    let rows = store.fetch(pool, &needs_seed, &bound, false, None).await?;

    let mut seen = HashSet::new();
    for row in rows {
        let is_edited_row = row.sequence_number.as_deref() == Some(seq);
        let entry = result
            .entry(row.aggregate_id)
            .or_insert_with(|| A::identity(row.aggregate_id));
        // The edited row's own effect is never folded in: the seed must
        // reflect state as of just before it, ready to receive either a
        // corrected event on this same aggregate or nothing at all, if
        // the correction now lands on a different aggregate entirely.
        if is_edited_row {
            on_edited_row(entry, row.id);
        } else {
            entry.load_event(row.event_data)?;
        }
        seen.insert(row.aggregate_id);
    }

    let fallback_bound = TemporalBound::AfterWithSeqGreaterThan(t, seq.to_string());
    for id in needs_seed {
        if seen.contains(&id) {
            continue;
        }
        if let Some(row) = store
            .fetch(pool, &[id], &fallback_bound, false, Some(1))
            .await?
            .into_iter()
            .next()
        {
            let mut entry = A::identity(id);
            entry.load_event(row.event_data)?;
            entry.mark_for_backdating();
            result.insert(id, entry);
        }
    }

    restore_versions(&mut result, &versions);
    Ok(result)
}

/// §4.4.3 — read-only snapshots strictly before `(t, seq)` (or strictly
/// before `t` alone, when `seq` is absent). Marked not-persistable;
/// `repository::add_*` on one of these is a programmer error the call
/// sites must not make (`CoreError::CannotPersistView` is reserved for
/// that case at the use-case layer).
pub async fn load_states_before<A>(
    pool: &PgPool,
    store: &EventStore<A::Event>,
    aggregate_ids: &[AggregateId],
    t: DateTime<Utc>,
    seq: Option<&str>,
) -> Result<HashMap<AggregateId, A>, CoreError>
where
    A: Aggregate,
{
    let bound = match seq {
        Some(seq) => TemporalBound::BeforeWithSeqLessThan(t, seq.to_string()),
        None => TemporalBound::StrictlyBefore(t),
    };
    let rows = store.fetch(pool, aggregate_ids, &bound, false, None).await?;

    let mut result = HashMap::new();
    for row in rows {
        let entry = result
            .entry(row.aggregate_id)
            .or_insert_with(|| A::identity(row.aggregate_id));
        entry.load_event(row.event_data)?;
    }
    for entry in result.values_mut() {
        entry.mark_not_persistable();
    }
    Ok(result)
}

/// §4.4.4 — folds every event strictly after `(t, seq)` onto `aggregate`
/// in place, re-deriving its current state once the new/edited event at
/// `(t, seq)` has already been applied by the caller.
pub async fn reapply_downstream<A>(
    pool: &PgPool,
    store: &EventStore<A::Event>,
    aggregate: &mut A,
    t: DateTime<Utc>,
    seq: &str,
) -> Result<(), CoreError>
where
    A: Aggregate,
{
    let bound = TemporalBound::AfterWithSeqGreaterThan(t, seq.to_string());
    let rows = store.fetch(pool, &[aggregate.id()], &bound, false, None).await?;
    for row in rows {
        aggregate.load_event(row.event_data)?;
    }
    Ok(())
}

/// The row in `wine_lots`/`actions` already exists at whatever version the
/// caller last read; a seed rebuilt from `identity()` must carry that same
/// version forward so its eventual CAS update targets the real row instead
/// of racing an `INSERT` against it.
fn current_versions<A: Aggregate>(aggregates: &[A]) -> HashMap<AggregateId, i64> {
    aggregates
        .iter()
        .filter(|a| !a.is_adding())
        .map(|a| (a.id(), a.version()))
        .collect()
}

fn restore_versions<A: Aggregate>(result: &mut HashMap<AggregateId, A>, versions: &HashMap<AggregateId, i64>) {
    for (id, version) in versions {
        if let Some(entry) = result.get_mut(id) {
            entry.set_version(*version);
        }
    }
}

fn split_unpersisted<A: Aggregate + Clone>(aggregates: &[A]) -> (HashMap<AggregateId, A>, Vec<AggregateId>) {
    let mut result = HashMap::new();
    let mut needs_seed = Vec::new();
    for aggregate in aggregates {
        if aggregate.is_adding() {
            let mut seed = aggregate.clone();
            seed.mark_for_backdating();
            result.insert(seed.id(), seed);
        } else {
            needs_seed.push(aggregate.id());
        }
    }
    (result, needs_seed)
}

/// §4.4.5 — offline rebuild of the `wine_lots` snapshot table from its
/// complete event log, chunked via cursor pagination, optionally
/// filtered to a single lot. The rebuilt `version` is approximated as the
/// folded event count: a faithful count of persisted versions isn't
/// recoverable from the log alone once an edit has retracted an event,
/// but the row is only read by `version`-keyed optimistic CAS, which a
/// post-rebuild caller re-establishes on its next successful persist.
pub async fn rebuild_wine_lots(
    pool: &PgPool,
    store: &EventStore<WineLotEvent>,
    only_id: Option<AggregateId>,
    chunk_size: i64,
) -> Result<u64, CoreError> {
    let mut rebuilt = 0u64;
    let mut after = None;
    loop {
        let ids = next_chunk(pool, store, only_id, after, chunk_size).await?;
        if ids.is_empty() {
            break;
        }
        after = ids.last().copied();

        let mut tx = pool.begin().await.map_err(db_err)?;
        for &id in &ids {
            let mut lot = WineLot::identity(id);
            let events = store.fetch_all(&mut *tx, &[id]).await?;
            let version = events.len() as i64;
            for event in events {
                lot.load_event(event.event_data)?;
            }
            repository::upsert_wine_lot_row(&mut tx, &lot, version).await?;
            rebuilt += 1;
        }
        tx.commit().await.map_err(db_err)?;
        tracing::info!(rebuilt, "wine_lots rebuild chunk committed");

        if only_id.is_some() {
            break;
        }
    }
    Ok(rebuilt)
}

/// §4.4.5 for the `actions` snapshot table.
pub async fn rebuild_actions(
    pool: &PgPool,
    store: &EventStore<ActionEvent>,
    only_id: Option<AggregateId>,
    chunk_size: i64,
) -> Result<u64, CoreError> {
    let mut rebuilt = 0u64;
    let mut after = None;
    loop {
        let ids = next_chunk(pool, store, only_id, after, chunk_size).await?;
        if ids.is_empty() {
            break;
        }
        after = ids.last().copied();

        let mut tx = pool.begin().await.map_err(db_err)?;
        for &id in &ids {
            let mut action = Action::identity(id);
            let events = store.fetch_all(&mut *tx, &[id]).await?;
            let version = events.len() as i64;
            for event in events {
                action.load_event(event.event_data)?;
            }
            repository::upsert_action_row(&mut tx, &action, version).await?;
            rebuilt += 1;
        }
        tx.commit().await.map_err(db_err)?;
        tracing::info!(rebuilt, "actions rebuild chunk committed");

        if only_id.is_some() {
            break;
        }
    }
    Ok(rebuilt)
}

/// Wraps an `aggregate_id` so the bare-id rows `distinct_aggregate_ids`
/// returns can flow through [`cursor::paginate`]'s "fetch one extra row"
/// contract.
#[derive(Clone)]
struct IdKey(AggregateId);

impl CursorKey for IdKey {
    fn pk(&self) -> String {
        self.0.to_string()
    }
}

async fn next_chunk<E: crate::aggregate::AggregateEvent>(
    pool: &PgPool,
    store: &EventStore<E>,
    only_id: Option<AggregateId>,
    after: Option<AggregateId>,
    chunk_size: i64,
) -> Result<Vec<AggregateId>, CoreError> {
    if let Some(id) = only_id {
        return Ok(if after.is_none() { vec![id] } else { Vec::new() });
    }
    let rows = store
        .distinct_aggregate_ids(pool, after, chunk_size + 1)
        .await?
        .into_iter()
        .map(IdKey)
        .collect();
    let page = cursor::paginate(rows, chunk_size as usize, true);
    Ok(page.items.into_iter().map(|key| key.0).collect())
}

fn db_err(e: sqlx::Error) -> CoreError {
    CoreError::from(crate::event_store::EventStoreError::from(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_effective_at_accepts_two_seconds_in_the_past() {
        let now = Utc::now();
        let t = now - chrono::Duration::seconds(2);
        assert_eq!(validate_effective_at(t, now).unwrap(), t.trunc_subsecs(0));
    }

    #[test]
    fn validate_effective_at_rejects_too_recent() {
        let now = Utc::now();
        let t = now - chrono::Duration::milliseconds(500);
        assert!(validate_effective_at(t, now).is_err());
    }

    #[test]
    fn validate_effective_at_truncates_sub_second_precision() {
        let now = Utc::now();
        let t = (now - chrono::Duration::seconds(5))
            .trunc_subsecs(0)
            + chrono::Duration::milliseconds(750);
        assert_eq!(validate_effective_at(t, now).unwrap().timestamp_subsec_millis(), 0);
    }
}
