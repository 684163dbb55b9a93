//! Keyset (cursor) pagination.
//!
//! Yields a query's rows in stable primary-key order, fetching one extra
//! row per page to detect whether a next page exists, without ever
//! producing an `OFFSET` that concurrent inserts could shift under the
//! caller's feet. Drives the `wine_lots`/`actions` snapshot rebuild walk
//! in [`crate::replay`], chunking over `distinct_aggregate_ids` the same
//! way.

/// One page of results plus the cursor to resume from, if any.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

/// Anything that can report its own pagination key: the primary key
/// `pk`, and an optional `tiebreaker` used whenever `pk` alone is not
/// guaranteed unique within the ordering the query produces.
pub trait CursorKey {
    fn pk(&self) -> String;
    fn tiebreaker(&self) -> Option<String> {
        None
    }
}

/// Builds the predicate for the next page, matching the "fetch one
/// extra row" contract: callers ask their query for `size + 1` rows,
/// hand the first `size` here, and this function tells them whether to
/// keep going and what predicate to use for the following call.
pub fn paginate<T: CursorKey + Clone>(mut rows: Vec<T>, size: usize, _ascending: bool) -> Page<T> {
    let has_more = rows.len() > size;
    rows.truncate(size);

    let next_cursor = if has_more {
        rows.last().map(|last| encode_cursor(last))
    } else {
        None
    };

    Page {
        items: rows,
        next_cursor,
    }
}

fn encode_cursor<T: CursorKey>(row: &T) -> String {
    match row.tiebreaker() {
        Some(tb) => format!("{}\u{1}{}", row.pk(), tb),
        None => row.pk(),
    }
}
