//! C4 Blacklist (spec.md §4.4). A thin, typed façade over the `blacklist`
//! table's CRUD in `db.rs` — kept as its own module so the component
//! boundary documented in SPEC_FULL.md stays visible in the source layout,
//! the way the teacher keeps `playlist.rs`/`collapse.rs` as separate
//! concerns atop the shared `db.rs`.

use crate::models::{BlacklistReason, Service};
use anyhow::Result;
use rusqlite::Connection;

/// Record a fatal or unmatchable outcome for `track_id` on `service`,
/// scoped to `mapping_id`. Upserts: increments `skip_counter` on repeat.
pub fn record(conn: &Connection, mapping_id: &str, service: Service, track_id: &str, reason: BlacklistReason) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    crate::db::record_blacklist(conn, mapping_id, service, track_id, reason, now)
}

/// Subset of `candidates` not excluded by either the mapping-scoped or the
/// global blacklist for `service` (spec.md §4.4 `filter_out`).
pub fn filter_out(conn: &Connection, mapping_id: &str, service: Service, candidates: &[String]) -> Result<Vec<String>> {
    crate::db::filter_blacklisted(conn, mapping_id, service, candidates)
}
