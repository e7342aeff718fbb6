//! Persistence layer. A thin typed wrapper over rusqlite, following the
//! teacher's `open_or_create` / `run_migrations` / per-entity
//! `upsert_x`/`get_x` naming. The sqlite file is the single source of
//! truth for mapping, token, work-item and blacklist rows (spec.md §3, §5).

use crate::models::{
    Action, BlacklistEntry, BlacklistReason, Mapping, Service, StoredToken, WorkItem, WorkStatus,
};
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

const SCHEMA: &str = include_str!("../db/schema.sql");

pub fn open_or_create(path: &std::path::Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    run_migrations(&conn)?;
    Ok(conn)
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

// ---------------------------------------------------------------------
// Mappings
// ---------------------------------------------------------------------

fn row_to_mapping(r: &rusqlite::Row) -> rusqlite::Result<Mapping> {
    Ok(Mapping {
        id: r.get(0)?,
        playlist_a_id: r.get(1)?,
        playlist_b_id: r.get(2)?,
        name_a: r.get(3)?,
        name_b: r.get(4)?,
        sync_names: r.get::<_, i64>(5)? != 0,
        sync_tracks: r.get::<_, i64>(6)? != 0,
        interval_minutes: r.get(7)?,
        last_analysis_at: r.get(8)?,
        next_analysis_at: r.get(9)?,
    })
}

const MAPPING_COLUMNS: &str = "id, playlist_a_id, playlist_b_id, name_a, name_b, sync_names, sync_tracks, interval_minutes, last_analysis_at, next_analysis_at";

/// Mappings whose `next_analysis_at` is null or has already passed
/// (spec.md §4.5 "Schedule"). Ordering among mappings is unspecified.
pub fn select_due_mappings(conn: &Connection, now: i64) -> Result<Vec<Mapping>> {
    let sql = format!(
        "SELECT {} FROM mappings WHERE next_analysis_at IS NULL OR next_analysis_at <= ?1",
        MAPPING_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![now], row_to_mapping)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn get_mapping(conn: &Connection, id: &str) -> Result<Option<Mapping>> {
    let sql = format!("SELECT {} FROM mappings WHERE id = ?1", MAPPING_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    Ok(stmt.query_row(params![id], row_to_mapping).optional()?)
}

pub fn upsert_mapping(conn: &Connection, m: &Mapping) -> Result<()> {
    conn.execute(
        "INSERT INTO mappings (id, playlist_a_id, playlist_b_id, name_a, name_b, sync_names, sync_tracks, interval_minutes, last_analysis_at, next_analysis_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
            playlist_a_id = excluded.playlist_a_id,
            playlist_b_id = excluded.playlist_b_id,
            name_a = excluded.name_a,
            name_b = excluded.name_b,
            sync_names = excluded.sync_names,
            sync_tracks = excluded.sync_tracks,
            interval_minutes = excluded.interval_minutes,
            last_analysis_at = excluded.last_analysis_at,
            next_analysis_at = excluded.next_analysis_at",
        params![
            m.id,
            m.playlist_a_id,
            m.playlist_b_id,
            m.name_a,
            m.name_b,
            m.sync_names as i64,
            m.sync_tracks as i64,
            m.interval_minutes,
            m.last_analysis_at,
            m.next_analysis_at,
        ],
    )?;
    Ok(())
}

/// Advance `last_analysis_at`/`next_analysis_at` after a clean sweep of
/// this mapping (spec.md §4.5 step 5). Left untouched on partial failure
/// so the next tick retries (spec.md §5 ordering guarantees).
pub fn mark_mapping_analyzed(conn: &Connection, mapping_id: &str, now: i64, interval_minutes: i64) -> Result<()> {
    conn.execute(
        "UPDATE mappings SET last_analysis_at = ?1, next_analysis_at = ?2 WHERE id = ?3",
        params![now, now + interval_minutes * 60, mapping_id],
    )?;
    Ok(())
}

/// Update just the cached name for one side of a mapping, e.g. after a
/// `rename_playlist` work item completes, so the next analysis sweep
/// doesn't see a stale mismatch and re-enqueue the same rename forever.
pub fn update_mapping_name(conn: &Connection, mapping_id: &str, service: Service, name: &str) -> Result<()> {
    let column = match service {
        Service::A => "name_a",
        Service::B => "name_b",
    };
    let sql = format!("UPDATE mappings SET {} = ?1 WHERE id = ?2", column);
    conn.execute(&sql, params![name, mapping_id])?;
    Ok(())
}

// ---------------------------------------------------------------------
// Credentials (C1) and OAuth tokens (C2)
// ---------------------------------------------------------------------

pub fn load_credential_fields(conn: &Connection, service: Service) -> Result<(Option<String>, Option<String>)> {
    let (id_col, secret_col) = match service {
        Service::A => ("a_client_id", "a_client_secret"),
        Service::B => ("b_client_id", "b_client_secret"),
    };
    let sql = format!("SELECT {}, {} FROM credentials WHERE id = 1", id_col, secret_col);
    let mut stmt = conn.prepare(&sql)?;
    let row = stmt
        .query_row([], |r| Ok((r.get::<_, Option<String>>(0)?, r.get::<_, Option<String>>(1)?)))
        .optional()?;
    Ok(row.unwrap_or((None, None)))
}

pub fn save_credential_fields(conn: &Connection, service: Service, client_id: &str, client_secret: &str) -> Result<()> {
    match service {
        Service::A => conn.execute(
            "INSERT INTO credentials (id, a_client_id, a_client_secret) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET a_client_id = excluded.a_client_id, a_client_secret = excluded.a_client_secret",
            params![client_id, client_secret],
        )?,
        Service::B => conn.execute(
            "INSERT INTO credentials (id, b_client_id, b_client_secret) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET b_client_id = excluded.b_client_id, b_client_secret = excluded.b_client_secret",
            params![client_id, client_secret],
        )?,
    };
    Ok(())
}

pub fn load_token(conn: &Connection, service: Service) -> Result<Option<StoredToken>> {
    let mut stmt = conn.prepare("SELECT access_token, refresh_token, expiry, scopes FROM oauth_tokens WHERE service = ?1")?;
    let row = stmt
        .query_row(params![service.as_str()], |r| {
            Ok(StoredToken {
                access_token: r.get(0)?,
                refresh_token: r.get(1)?,
                expiry: r.get(2)?,
                scopes: r.get(3)?,
            })
        })
        .optional()?;
    Ok(row)
}

pub fn save_token(conn: &Connection, service: Service, token: &StoredToken) -> Result<()> {
    conn.execute(
        "INSERT INTO oauth_tokens (service, access_token, refresh_token, expiry, scopes) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(service) DO UPDATE SET access_token = excluded.access_token, refresh_token = excluded.refresh_token,
            expiry = excluded.expiry, scopes = excluded.scopes",
        params![service.as_str(), token.access_token, token.refresh_token, token.expiry, token.scopes],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------
// Work items (queue)
// ---------------------------------------------------------------------

fn row_to_work_item(r: &rusqlite::Row) -> rusqlite::Result<WorkItem> {
    let dest: String = r.get(2)?;
    let src: String = r.get(3)?;
    let action: String = r.get(4)?;
    let status: String = r.get(9)?;
    Ok(WorkItem {
        id: r.get(0)?,
        mapping_id: r.get(1)?,
        destination_service: dest.parse().unwrap_or(Service::A),
        source_service: src.parse().unwrap_or(Service::A),
        action: action.parse().unwrap_or(Action::AddTrack),
        source_track_id: r.get(5)?,
        source_track_title: r.get(6)?,
        payload: r.get(7)?,
        action_key: r.get(8)?,
        status: status.parse().unwrap_or(WorkStatus::Pending),
        attempts: r.get::<_, i64>(10)? as u32,
        next_attempt_at: r.get(11)?,
        attempt_backoff_secs: r.get::<_, i64>(12)? as u32,
        last_error: r.get(13)?,
        created_at: r.get(14)?,
    })
}

const WORK_ITEM_COLUMNS: &str = "id, mapping_id, destination_service, source_service, action, source_track_id, source_track_title, payload, action_key, status, attempts, next_attempt_at, attempt_backoff_secs, last_error, created_at";

/// Returns `true` if an active (non-terminal) row already exists for this
/// dedup key — the pre-insert half of the §3/§9 uniqueness guard.
pub fn has_active_work_item(
    conn: &Connection,
    mapping_id: &str,
    destination_service: Service,
    action: Action,
    action_key: &str,
) -> Result<bool> {
    let mut stmt = conn.prepare(
        "SELECT 1 FROM work_items WHERE mapping_id = ?1 AND destination_service = ?2 AND action = ?3 AND action_key = ?4
         AND status IN ('pending', 'running') LIMIT 1",
    )?;
    Ok(stmt
        .query_row(
            params![mapping_id, destination_service.as_str(), action.as_str(), action_key],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

/// Insert a new pending work item unless an active row with the same
/// dedup key already exists. Returns `true` if inserted.
///
/// The unique partial index (`idx_work_items_dedup_active`) is the
/// authoritative guard; a `UNIQUE constraint failed` from a race between
/// the pre-check and the insert is swallowed as a no-op, matching the
/// "two strategies are acceptable" language of spec.md §4.5.
pub fn enqueue_work_item(conn: &Connection, item: &WorkItem) -> Result<bool> {
    if has_active_work_item(conn, &item.mapping_id, item.destination_service, item.action, &item.action_key)? {
        return Ok(false);
    }
    let res = conn.execute(
        "INSERT INTO work_items (id, mapping_id, destination_service, source_service, action, source_track_id, source_track_title, payload, action_key, status, attempts, next_attempt_at, attempt_backoff_secs, last_error, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            item.id,
            item.mapping_id,
            item.destination_service.as_str(),
            item.source_service.as_str(),
            item.action.as_str(),
            item.source_track_id,
            item.source_track_title,
            item.payload,
            item.action_key,
            item.status.as_str(),
            item.attempts,
            item.next_attempt_at,
            item.attempt_backoff_secs,
            item.last_error,
            item.created_at,
        ],
    );
    match res {
        Ok(_) => Ok(true),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Select up to `limit` pending, due work items ordered by creation time
/// (spec.md §4.6 "Selection"), and atomically flip them to `running` so a
/// single tick never hands the same row to two dispatch loops.
pub fn claim_batch(conn: &mut Connection, now: i64, limit: usize) -> Result<Vec<WorkItem>> {
    let tx = conn.transaction()?;
    let ids: Vec<String> = {
        let sql = "SELECT id FROM work_items WHERE status = 'pending' AND next_attempt_at <= ?1 ORDER BY created_at ASC LIMIT ?2";
        let mut stmt = tx.prepare(sql)?;
        let rows = stmt.query_map(params![now, limit as i64], |r| r.get::<_, String>(0))?;
        let mut v = Vec::new();
        for r in rows {
            v.push(r?);
        }
        v
    };
    for id in &ids {
        tx.execute("UPDATE work_items SET status = 'running' WHERE id = ?1", params![id])?;
    }
    let mut out = Vec::new();
    if !ids.is_empty() {
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT {} FROM work_items WHERE id IN ({})", WORK_ITEM_COLUMNS, placeholders);
        let mut stmt = tx.prepare(&sql)?;
        let params_dyn: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(params_dyn.as_slice(), row_to_work_item)?;
        for r in rows {
            out.push(r?);
        }
    }
    tx.commit()?;
    Ok(out)
}

pub fn get_work_item(conn: &Connection, id: &str) -> Result<Option<WorkItem>> {
    let sql = format!("SELECT {} FROM work_items WHERE id = ?1", WORK_ITEM_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    Ok(stmt.query_row(params![id], row_to_work_item).optional()?)
}

pub fn mark_done(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("UPDATE work_items SET status = 'done' WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn mark_skipped(conn: &Connection, id: &str, last_error: &str) -> Result<()> {
    conn.execute(
        "UPDATE work_items SET status = 'skipped', last_error = ?2 WHERE id = ?1",
        params![id, crate::constants::truncate_error(last_error)],
    )?;
    Ok(())
}

pub fn mark_error(conn: &Connection, id: &str, last_error: &str) -> Result<()> {
    conn.execute(
        "UPDATE work_items SET status = 'error', last_error = ?2 WHERE id = ?1",
        params![id, crate::constants::truncate_error(last_error)],
    )?;
    Ok(())
}

/// Reset a retryable failure back to `pending` with doubled backoff
/// (spec.md §4.6 "Backoff", I2). `prior_attempts` is the attempt count
/// *before* this failure (0 on the first retry, so the first backoff is
/// `backoff_secs(0) = 30`, matching spec.md §8 scenario 4's 30/60/120
/// sequence); the stored `attempts` column is `prior_attempts + 1`.
pub fn reschedule_retry(conn: &Connection, id: &str, now: i64, prior_attempts: u32, last_error: &str) -> Result<()> {
    let backoff = crate::constants::backoff_secs(prior_attempts);
    let attempts = prior_attempts + 1;
    conn.execute(
        "UPDATE work_items SET status = 'pending', attempts = ?2, attempt_backoff_secs = ?3, next_attempt_at = ?4, last_error = ?5
         WHERE id = ?1",
        params![id, attempts, backoff as i64, now + backoff as i64, crate::constants::truncate_error(last_error)],
    )?;
    Ok(())
}

/// Persist the destination track id resolved by search back into the
/// payload (spec.md §4.6 "add_track" step 2).
pub fn set_payload(conn: &Connection, id: &str, payload: &str) -> Result<()> {
    conn.execute("UPDATE work_items SET payload = ?2 WHERE id = ?1", params![id, payload])?;
    Ok(())
}

/// Rows left `running` by a crashed worker are selectable again on the
/// next sweep (spec.md §4.6 "Concurrency safety").
pub fn reclaim_orphaned_running(conn: &Connection, now: i64) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE work_items SET status = 'pending', next_attempt_at = ?1 WHERE status = 'running'",
        params![now],
    )?)
}

pub fn status_counts(conn: &Connection) -> Result<std::collections::HashMap<String, i64>> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM work_items GROUP BY status")?;
    let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
    let mut out = std::collections::HashMap::new();
    for r in rows {
        let (k, v) = r?;
        out.insert(k, v);
    }
    Ok(out)
}

// ---------------------------------------------------------------------
// Blacklist (C4)
// ---------------------------------------------------------------------

/// Upsert on `(mapping_id, service, track_id)`: increments the skip
/// counter on a repeat hit, inserts with `skip_counter = 1` on a miss
/// (spec.md §4.4).
pub fn record_blacklist(conn: &Connection, mapping_id: &str, service: Service, track_id: &str, reason: BlacklistReason, now: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO blacklist (mapping_id, service, track_id, reason, skip_counter, last_skipped_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5)
         ON CONFLICT(COALESCE(mapping_id,''), service, track_id) DO UPDATE SET
            reason = excluded.reason,
            skip_counter = blacklist.skip_counter + 1,
            last_skipped_at = excluded.last_skipped_at",
        params![mapping_id, service.as_str(), track_id, reason.as_str(), now],
    )?;
    Ok(())
}

pub fn get_blacklist_entry(conn: &Connection, mapping_id: &str, service: Service, track_id: &str) -> Result<Option<BlacklistEntry>> {
    let mut stmt = conn.prepare(
        "SELECT mapping_id, service, track_id, reason, skip_counter, last_skipped_at FROM blacklist
         WHERE COALESCE(mapping_id,'') = ?1 AND service = ?2 AND track_id = ?3",
    )?;
    let row = stmt
        .query_row(params![mapping_id, service.as_str(), track_id], |r| {
            let reason: String = r.get(3)?;
            Ok(BlacklistEntry {
                mapping_id: r.get(0)?,
                service: r.get::<_, String>(1)?.parse().unwrap_or(Service::A),
                track_id: r.get(2)?,
                reason: reason.parse().unwrap_or(BlacklistReason::Error),
                skip_counter: r.get::<_, i64>(4)? as u32,
                last_skipped_at: r.get(5)?,
            })
        })
        .optional()?;
    Ok(row)
}

/// Subset of `candidate_track_ids` not present in either the
/// mapping-scoped or global (`mapping_id IS NULL`) blacklist for
/// `service` (spec.md §4.4 `filter_out`).
pub fn filter_blacklisted(conn: &Connection, mapping_id: &str, service: Service, candidates: &[String]) -> Result<Vec<String>> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT track_id FROM blacklist WHERE service = ?1 AND (mapping_id = ?2 OR mapping_id IS NULL)",
    )?;
    let rows = stmt.query_map(params![service.as_str(), mapping_id], |r| r.get::<_, String>(0))?;
    let mut blocked = std::collections::HashSet::new();
    for r in rows {
        blocked.insert(r?);
    }
    Ok(candidates.iter().filter(|c| !blocked.contains(*c)).cloned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Service;

    #[test]
    fn enqueue_dedup_and_terminal_reuse() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let item = WorkItem {
            id: "w1".into(),
            mapping_id: "m1".into(),
            destination_service: Service::B,
            source_service: Service::A,
            action: Action::AddTrack,
            source_track_id: Some("t1".into()),
            source_track_title: Some("Song".into()),
            payload: "{}".into(),
            action_key: "A_B_t1".into(),
            status: WorkStatus::Pending,
            attempts: 0,
            next_attempt_at: 0,
            attempt_backoff_secs: 30,
            last_error: None,
            created_at: 0,
        };
        assert!(enqueue_work_item(&conn, &item).unwrap());

        let mut dup = item.clone();
        dup.id = "w2".into();
        assert!(!enqueue_work_item(&conn, &dup).unwrap());

        mark_done(&conn, "w1").unwrap();
        // terminal rows don't block re-enqueue
        assert!(enqueue_work_item(&conn, &dup).unwrap());
    }

    #[test]
    fn blacklist_increments_counter_on_repeat() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        record_blacklist(&conn, "m1", Service::B, "t1", BlacklistReason::SearchFailed, 100).unwrap();
        record_blacklist(&conn, "m1", Service::B, "t1", BlacklistReason::SearchFailed, 200).unwrap();
        let e = get_blacklist_entry(&conn, "m1", Service::B, "t1").unwrap().unwrap();
        assert_eq!(e.skip_counter, 2);
        assert_eq!(e.last_skipped_at, 200);
    }

    #[test]
    fn filter_blacklisted_excludes_mapping_and_global() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        record_blacklist(&conn, "m1", Service::B, "t1", BlacklistReason::NotFound, 1).unwrap();
        conn.execute(
            "INSERT INTO blacklist (mapping_id, service, track_id, reason, skip_counter, last_skipped_at) VALUES (NULL, 'B', 't2', 'forbidden', 1, 1)",
            [],
        )
        .unwrap();
        let candidates = vec!["t1".to_string(), "t2".to_string(), "t3".to_string()];
        let out = filter_blacklisted(&conn, "m1", Service::B, &candidates).unwrap();
        assert_eq!(out, vec!["t3".to_string()]);
    }
}
