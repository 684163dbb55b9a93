//! Generic event store.
//!
//! One `EventStore<E>` is constructed per aggregate stream table
//! (`wine_lot_events`, `action_events`). The table name is a compile-time
//! constant supplied by the caller, never user input, so interpolating it
//! into the query text with `format!` is safe.

use chrono::{DateTime, Utc};
use sqlx::PgExecutor;

use crate::aggregate::AggregateEvent;
use crate::event_store::error::EventStoreError;
use crate::id::AggregateId;

/// A row as physically stored. Canonical order is defined entirely by
/// `(occurred_at, sequence_number NULLS FIRST, id)`.
#[derive(Debug, Clone)]
pub struct StoredEvent<E> {
    pub id: i64,
    pub aggregate_id: AggregateId,
    pub event_type: String,
    pub event_data: E,
    pub created_at: DateTime<Utc>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub sequence_number: Option<String>,
}

/// The temporal predicate driving every replay and projection query.
/// Each variant is expressed purely in terms of `occurred_at`/
/// `sequence_number`, never a physical row offset, so it agrees with
/// canonical order regardless of insertion time.
#[derive(Debug, Clone)]
pub enum TemporalBound {
    /// `occurred_at <= t` — main fold with no action id to break ties on.
    AtOrBefore(DateTime<Utc>),
    /// `occurred_at < t OR (occurred_at = t AND sequence_number <= seq)` — main fold tie-broken by an action id.
    BeforeOrAtWithSeqAtMost(DateTime<Utc>, String),
    /// `occurred_at < t` — a view strictly before a cutoff, no sequence bound.
    StrictlyBefore(DateTime<Utc>),
    /// `occurred_at < t OR (occurred_at = t AND sequence_number < seq)` — a view strictly before a cutoff, tie-broken by an action id.
    BeforeWithSeqLessThan(DateTime<Utc>, String),
    /// `occurred_at > t` — seeding fallback with no sequence number involved.
    After(DateTime<Utc>),
    /// `occurred_at > t OR (occurred_at = t AND sequence_number > seq)` — downstream fold / seeding fallback tie-broken by an action id.
    AfterWithSeqGreaterThan(DateTime<Utc>, String),
}

enum BoundParam {
    Time(DateTime<Utc>),
    Seq(String),
}

impl TemporalBound {
    fn sql_predicate(&self, start_param: usize) -> (String, Vec<BoundParam>) {
        match self {
            TemporalBound::AtOrBefore(t) => (
                format!("occurred_at <= ${start_param}"),
                vec![BoundParam::Time(*t)],
            ),
            TemporalBound::StrictlyBefore(t) => (
                format!("occurred_at < ${start_param}"),
                vec![BoundParam::Time(*t)],
            ),
            TemporalBound::After(t) => (
                format!("occurred_at > ${start_param}"),
                vec![BoundParam::Time(*t)],
            ),
            TemporalBound::BeforeOrAtWithSeqAtMost(t, seq) => (
                format!(
                    "(occurred_at < ${p1} OR (occurred_at = ${p1} AND sequence_number <= ${p2}))",
                    p1 = start_param,
                    p2 = start_param + 1
                ),
                vec![BoundParam::Time(*t), BoundParam::Seq(seq.clone())],
            ),
            TemporalBound::BeforeWithSeqLessThan(t, seq) => (
                format!(
                    "(occurred_at < ${p1} OR (occurred_at = ${p1} AND sequence_number < ${p2}))",
                    p1 = start_param,
                    p2 = start_param + 1
                ),
                vec![BoundParam::Time(*t), BoundParam::Seq(seq.clone())],
            ),
            TemporalBound::AfterWithSeqGreaterThan(t, seq) => (
                format!(
                    "(occurred_at > ${p1} OR (occurred_at = ${p1} AND sequence_number > ${p2}))",
                    p1 = start_param,
                    p2 = start_param + 1
                ),
                vec![BoundParam::Time(*t), BoundParam::Seq(seq.clone())],
            ),
        }
    }
}

/// Canonical order, reversed for queries that only want the single
/// earliest/latest qualifying row (the backdating seed fallbacks).
fn order_by(reverse: bool) -> &'static str {
    if reverse {
        "occurred_at DESC, sequence_number DESC NULLS LAST, id DESC"
    } else {
        "occurred_at ASC, sequence_number ASC NULLS FIRST, id ASC"
    }
}

#[allow(clippy::type_complexity)]
fn decode_rows<E: AggregateEvent>(
    rows: Vec<(
        i64,
        String,
        String,
        serde_json::Value,
        DateTime<Utc>,
        Option<DateTime<Utc>>,
        Option<String>,
    )>,
) -> Result<Vec<StoredEvent<E>>, EventStoreError> {
    rows.into_iter()
        .map(
            |(id, aggregate_id, event_type, event_data, created_at, occurred_at, sequence_number)| {
                let aggregate_id = aggregate_id
                    .parse()
                    .map_err(|_| EventStoreError::MalformedId(AggregateId::nil()))?;
                Ok(StoredEvent {
                    id,
                    aggregate_id,
                    event_type,
                    event_data: serde_json::from_value(event_data)?,
                    created_at,
                    occurred_at,
                    sequence_number,
                })
            },
        )
        .collect()
}

pub struct EventStore<E> {
    pool: sqlx::PgPool,
    table: &'static str,
    _marker: std::marker::PhantomData<E>,
}

impl<E: AggregateEvent> EventStore<E> {
    pub fn new(pool: sqlx::PgPool, table: &'static str) -> Self {
        Self {
            pool,
            table,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    /// Bulk insert preserving input order; atomic with whatever
    /// transaction `exec` belongs to. Returns the surrogate row ids
    /// assigned, in the same order as `events`.
    pub async fn append<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        aggregate_id: AggregateId,
        events: &[E],
    ) -> Result<Vec<i64>, EventStoreError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut event_types = Vec::with_capacity(events.len());
        let mut event_datas = Vec::with_capacity(events.len());
        let mut occurred_ats = Vec::with_capacity(events.len());
        let mut sequence_numbers = Vec::with_capacity(events.len());
        for event in events {
            event_types.push(event.event_type().to_string());
            event_datas.push(serde_json::to_value(event)?);
            occurred_ats.push(event.occurred_at());
            sequence_numbers.push(event.sequence_number());
        }

        let sql = format!(
            r#"
            INSERT INTO {table} (aggregate_id, event_type, event_data, occurred_at, sequence_number)
            SELECT $1, t.event_type, t.event_data, t.occurred_at, t.sequence_number
            FROM UNNEST($2::text[], $3::jsonb[], $4::timestamptz[], $5::text[])
                AS t(event_type, event_data, occurred_at, sequence_number)
            RETURNING id
            "#,
            table = self.table
        );

        let rows: Vec<(i64,)> = sqlx::query_as(&sql)
            .bind(aggregate_id.to_string())
            .bind(&event_types)
            .bind(&event_datas)
            .bind(&occurred_ats)
            .bind(&sequence_numbers)
            .fetch_all(exec)
            .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Fetches events for the given aggregate ids matching `bound`, in
    /// canonical order (or reversed, when the caller only wants the
    /// single earliest/latest qualifying row via `limit`).
    pub async fn fetch<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        aggregate_ids: &[AggregateId],
        bound: &TemporalBound,
        reverse: bool,
        limit: Option<i64>,
    ) -> Result<Vec<StoredEvent<E>>, EventStoreError> {
        let ids: Vec<String> = aggregate_ids.iter().map(|id| id.to_string()).collect();
        let (predicate, params) = bound.sql_predicate(2);

        let sql = format!(
            r#"
            SELECT id, aggregate_id, event_type, event_data, created_at, occurred_at, sequence_number
            FROM {table}
            WHERE aggregate_id = ANY($1) AND {predicate}
            ORDER BY {order}
            {limit_clause}
            "#,
            table = self.table,
            predicate = predicate,
            order = order_by(reverse),
            limit_clause = limit.map(|n| format!("LIMIT {n}")).unwrap_or_default(),
        );

        let mut query = sqlx::query_as::<
            _,
            (
                i64,
                String,
                String,
                serde_json::Value,
                DateTime<Utc>,
                Option<DateTime<Utc>>,
                Option<String>,
            ),
        >(&sql)
        .bind(&ids);
        for param in &params {
            query = match param {
                BoundParam::Time(t) => query.bind(t),
                BoundParam::Seq(s) => query.bind(s),
            };
        }

        let rows = query.fetch_all(exec).await?;
        decode_rows(rows)
    }

    /// Fetches every event for the given aggregate ids, with no temporal
    /// predicate, in canonical order. Used by offline rebuilds, which
    /// fold an aggregate's complete history rather than a windowed slice.
    pub async fn fetch_all<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        aggregate_ids: &[AggregateId],
    ) -> Result<Vec<StoredEvent<E>>, EventStoreError> {
        let ids: Vec<String> = aggregate_ids.iter().map(|id| id.to_string()).collect();

        let sql = format!(
            r#"
            SELECT id, aggregate_id, event_type, event_data, created_at, occurred_at, sequence_number
            FROM {table}
            WHERE aggregate_id = ANY($1)
            ORDER BY {order}
            "#,
            table = self.table,
            order = order_by(false),
        );

        let rows = sqlx::query_as::<
            _,
            (
                i64,
                String,
                String,
                serde_json::Value,
                DateTime<Utc>,
                Option<DateTime<Utc>>,
                Option<String>,
            ),
        >(&sql)
        .bind(&ids)
        .fetch_all(exec)
        .await?;

        decode_rows(rows)
    }

    /// Distinct aggregate ids known to this store, ascending, for the
    /// cursor pagination `rebuild_aggregates` drives over the whole table.
    pub async fn distinct_aggregate_ids<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        after: Option<AggregateId>,
        limit: i64,
    ) -> Result<Vec<AggregateId>, EventStoreError> {
        let sql = format!(
            r#"
            SELECT DISTINCT aggregate_id FROM {table}
            WHERE $1::text IS NULL OR aggregate_id > $1
            ORDER BY aggregate_id ASC
            LIMIT $2
            "#,
            table = self.table
        );
        let rows: Vec<(String,)> = sqlx::query_as(&sql)
            .bind(after.map(|id| id.to_string()))
            .bind(limit)
            .fetch_all(exec)
            .await?;
        rows.into_iter()
            .map(|(id,)| {
                id.parse()
                    .map_err(|_| EventStoreError::MalformedId(AggregateId::nil()))
            })
            .collect()
    }

    pub async fn delete<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        row_ids: &[i64],
    ) -> Result<(), EventStoreError> {
        if row_ids.is_empty() {
            return Ok(());
        }
        let sql = format!("DELETE FROM {table} WHERE id = ANY($1)", table = self.table);
        sqlx::query(&sql).bind(row_ids).execute(exec).await?;
        Ok(())
    }
}
