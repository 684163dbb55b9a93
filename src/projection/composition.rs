//! Composition projection.
//!
//! Derives a lot's fractional makeup by replaying the DAG of blends that
//! fed it, rather than storing composition on the aggregate itself.
//! Source discovery is an explicit queue-and-visited-set breadth-first
//! search — never recursion, so a malformed cycle in stored data fails
//! by exhausting memory slowly instead of blowing the stack.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::aggregate::{Aggregate, WineLot};
use crate::domain::composition::Composition;
use crate::domain::error::CoreError;
use crate::domain::WineLotEvent;
use crate::event_store::{EventStore, TemporalBound};
use crate::id::AggregateId;

/// The shared temporal-cutoff rule between replay and this projector:
/// with no `action_id`, `occurred_at <= effective_at`; with one, ties at
/// `effective_at` break on `sequence_number <= action_id`.
fn cutoff(effective_at: DateTime<Utc>, action_id: Option<&str>) -> TemporalBound {
    match action_id {
        Some(seq) => TemporalBound::BeforeOrAtWithSeqAtMost(effective_at, seq.to_string()),
        None => TemporalBound::AtOrBefore(effective_at),
    }
}

/// Computes `lot_id`'s composition as of `effective_at` (defaulting to
/// now), optionally tie-broken by `action_id`.
pub async fn calculate_composition(
    pool: &PgPool,
    store: &EventStore<WineLotEvent>,
    lot_id: AggregateId,
    effective_at: Option<DateTime<Utc>>,
    action_id: Option<&str>,
) -> Result<Composition, CoreError> {
    if action_id.is_some() && effective_at.is_none() {
        return Err(CoreError::domain_validation(
            "effective_at is required when action_id is provided",
        ));
    }
    let effective_at = effective_at.unwrap_or_else(Utc::now).trunc_subsecs(0);
    let bound = cutoff(effective_at, action_id);

    if store.fetch_all(pool, &[lot_id]).await?.is_empty() {
        return Err(CoreError::missing_entity(format!(
            "wine lot {lot_id} does not exist"
        )));
    }

    let discovered = discover_sources(pool, store, lot_id, &bound).await?;
    fold_composition(pool, store, &discovered, lot_id, &bound).await
}

/// Breadth-first discovery of every lot that contributed, directly or
/// transitively, to `lot_id`'s volume — an explicit `VecDeque` queue plus
/// a `HashSet` of already-seen ids, never recursion.
async fn discover_sources(
    pool: &PgPool,
    store: &EventStore<WineLotEvent>,
    lot_id: AggregateId,
    bound: &TemporalBound,
) -> Result<HashSet<AggregateId>, CoreError> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(lot_id);
    visited.insert(lot_id);

    while let Some(current) = queue.pop_front() {
        let rows = store.fetch(pool, &[current], bound, false, None).await?;
        for row in rows {
            if let WineLotEvent::VolumeBlended(e) = &row.event_data {
                for source in e.volumes.keys() {
                    if let Ok(source_id) = source.parse::<AggregateId>() {
                        if visited.insert(source_id) {
                            queue.push_back(source_id);
                        }
                    }
                }
            }
        }
    }

    Ok(visited)
}

/// Folds every discovered lot's events, in canonical order, maintaining
/// a per-lot `Composition` and transient `WineLot` snapshot, then returns
/// the requested lot's final composition.
async fn fold_composition(
    pool: &PgPool,
    store: &EventStore<WineLotEvent>,
    lot_ids: &HashSet<AggregateId>,
    target: AggregateId,
    bound: &TemporalBound,
) -> Result<Composition, CoreError> {
    let ids: Vec<AggregateId> = lot_ids.iter().copied().collect();
    let rows = store.fetch(pool, &ids, bound, false, None).await?;

    let mut compositions: HashMap<AggregateId, Composition> = HashMap::new();
    let mut snapshots: HashMap<AggregateId, WineLot> = HashMap::new();

    for row in rows {
        let lot_id = row.aggregate_id;
        let snapshot = snapshots
            .entry(lot_id)
            .or_insert_with(|| WineLot::identity(lot_id));

        if let WineLotEvent::WineLotCreated(created) = &row.event_data {
            compositions.insert(lot_id, Composition::from_components(&created.components));
        }

        if let WineLotEvent::VolumeBlended(blended) = &row.event_data {
            let v_old = snapshot.volume;
            let total_drawn: Decimal = blended.volumes.values().copied().sum();
            let v_new = v_old + total_drawn;

            if v_new != Decimal::ZERO {
                let existing = compositions.remove(&lot_id).unwrap_or_default();
                let mut updated = existing.scaled(v_old / v_new);

                for (source, blend_volume) in &blended.volumes {
                    if *blend_volume <= Decimal::ZERO {
                        continue;
                    }
                    if let Ok(source_id) = source.parse::<AggregateId>() {
                        if let Some(source_composition) = compositions.get(&source_id) {
                            updated.merge_add(&source_composition.scaled(*blend_volume / v_new));
                        }
                    }
                }
                compositions.insert(lot_id, updated);
            }
        }

        snapshot.load_event(row.event_data)?;
    }

    Ok(compositions.remove(&target).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_without_action_id_is_at_or_before() {
        let t = Utc::now();
        match cutoff(t, None) {
            TemporalBound::AtOrBefore(_) => {}
            _ => panic!("expected AtOrBefore"),
        }
    }

    #[test]
    fn cutoff_with_action_id_ties_break_on_sequence_number() {
        let t = Utc::now();
        match cutoff(t, Some("act-1")) {
            TemporalBound::BeforeOrAtWithSeqAtMost(_, seq) => assert_eq!(seq, "act-1"),
            _ => panic!("expected BeforeOrAtWithSeqAtMost"),
        }
    }
}
