//! C6 Execution Worker (spec.md §4.6). Claims due work items, dispatches
//! them into a bounded pool, and classifies each outcome into the next
//! status/backoff/blacklist write. Grounded on the teacher's
//! `apply_in_batches` in `worker.rs` (same string-retry-after parsing and
//! exponential-backoff-capped-at-a-ceiling shape), generalized to the
//! typed `PlatformError` classification and the two-action state machine
//! this spec requires.

use crate::adapter::{FatalKind, Platform, PlatformError};
use crate::models::{Action, BlacklistReason, Service, WorkItem, WorkStatus};
use crate::quota::QuotaBucket;
use crate::ratelimit::RateLimiter;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

pub struct ExecutionContext {
    pub db_path: PathBuf,
    pub platform_a: Arc<dyn Platform>,
    pub platform_b: Arc<dyn Platform>,
    pub quota_b: Arc<QuotaBucket>,
    pub rate_limit_a: Arc<RateLimiter>,
    pub batch_size: usize,
    pub concurrency: usize,
    pub quota_cost_add_track: u32,
    pub quota_cost_rename: u32,
}

impl ExecutionContext {
    fn platform_for(&self, service: Service) -> Arc<dyn Platform> {
        match service {
            Service::A => self.platform_a.clone(),
            Service::B => self.platform_b.clone(),
        }
    }
}

/// One tick: claim up to `batch_size` due items and process them under a
/// semaphore-bounded pool of `concurrency` concurrent tasks (spec.md §4.6
/// "Selection").
pub async fn run_tick(ctx: Arc<ExecutionContext>) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let db_path = ctx.db_path.clone();
    let batch_size = ctx.batch_size;
    let items = tokio::task::spawn_blocking(move || -> Result<Vec<WorkItem>> {
        let mut conn = rusqlite::Connection::open(db_path)?;
        crate::db::claim_batch(&mut conn, now, batch_size)
    })
    .await??;

    if items.is_empty() {
        return Ok(());
    }
    info!(count = items.len(), "execution tick claimed work items");

    let semaphore = Arc::new(Semaphore::new(ctx.concurrency));
    let mut handles = Vec::with_capacity(items.len());
    for item in items {
        let ctx = ctx.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            process_item(&ctx, item).await
        }));
    }
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "execution task panicked; item left running until the process restarts and reclaims orphaned rows");
        }
    }
    Ok(())
}

async fn process_item(ctx: &ExecutionContext, item: WorkItem) {
    let id = item.id.clone();
    let result = match item.action {
        Action::AddTrack => handle_add_track(ctx, &item).await,
        Action::RenamePlaylist => handle_rename_playlist(ctx, &item).await,
    };
    if let Err(e) = result {
        warn!(work_item_id = %id, error = %e, "unexpected error processing work item");
        let _ = write_outcome(ctx, &item, Outcome::Retry(PlatformError::Transient(e))).await;
    }
}

enum Outcome {
    Done,
    Skipped { reason: &'static str, blacklist: Option<BlacklistReason> },
    Retry(PlatformError),
    /// `AuthFailure` (spec.md §4.2, §7): fatal for this item, but not a
    /// statement about the track/playlist, so no blacklist entry and no
    /// automatic retry — `error` status requires a human to reset it to
    /// `pending` once credentials are fixed (spec.md §7 "User-visible
    /// behaviour").
    Error(PlatformError),
}

async fn write_outcome(ctx: &ExecutionContext, item: &WorkItem, outcome: Outcome) -> Result<()> {
    let db_path = ctx.db_path.clone();
    let item = item.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let conn = rusqlite::Connection::open(&db_path)?;
        match outcome {
            Outcome::Done => crate::db::mark_done(&conn, &item.id)?,
            Outcome::Skipped { reason, blacklist } => {
                if let (Some(reason_code), Action::AddTrack, Some(track_id)) =
                    (blacklist, item.action, item.source_track_id.as_ref())
                {
                    crate::blacklist::record(&conn, &item.mapping_id, item.destination_service, track_id, reason_code)?;
                }
                crate::db::mark_skipped(&conn, &item.id, reason)?;
            }
            Outcome::Retry(err) => {
                let now = chrono::Utc::now().timestamp();
                crate::db::reschedule_retry(&conn, &item.id, now, item.attempts, &err.to_string())?;
            }
            Outcome::Error(err) => {
                crate::db::mark_error(&conn, &item.id, &err.to_string())?;
            }
        }
        Ok(())
    })
    .await??;
    Ok(())
}

fn classify_to_outcome(err: PlatformError, blacklist_on_fatal: bool) -> Outcome {
    match err {
        PlatformError::Fatal(kind) => Outcome::Skipped {
            reason: fatal_reason_str(kind),
            blacklist: blacklist_on_fatal.then_some(kind.as_blacklist_reason()),
        },
        PlatformError::AuthFailure(e) => Outcome::Error(PlatformError::AuthFailure(e)),
        other => Outcome::Retry(other),
    }
}

fn fatal_reason_str(kind: FatalKind) -> &'static str {
    match kind {
        FatalKind::NotFound => "not_found",
        FatalKind::Forbidden => "forbidden",
        FatalKind::Unauthorized => "unauthorized",
        FatalKind::Invalid => "invalid",
    }
}

async fn handle_add_track(ctx: &ExecutionContext, item: &WorkItem) -> Result<()> {
    let mapping = load_mapping(ctx, &item.mapping_id).await?;
    let Some(mapping) = mapping else {
        return write_outcome(ctx, item, Outcome::Skipped { reason: "mapping_deleted", blacklist: None }).await;
    };

    // Step 1 (spec.md §4.6 "add_track"): a read-only gate, not a debit — an
    // item that fails to resolve a destination id below must not have spent
    // quota it never used for an actual mutating call.
    if item.destination_service == Service::B && !ctx.quota_b.would_fit(ctx.quota_cost_add_track) {
        return write_outcome(ctx, item, Outcome::Skipped { reason: "quota", blacklist: None }).await;
    }

    let mut payload: serde_json::Value = serde_json::from_str(&item.payload).unwrap_or(serde_json::json!({}));
    let destination_track_id = payload["destination_track_id"].as_str().map(|s| s.to_string());

    let destination_track_id = match destination_track_id {
        Some(id) if !id.is_empty() => id,
        _ => {
            let title = item.source_track_title.clone().unwrap_or_default();
            if item.destination_service == Service::A {
                ctx.rate_limit_a.acquire().await;
            }
            match ctx.platform_for(item.destination_service).search_track(&title).await {
                Ok(Some(found)) => {
                    payload["destination_track_id"] = serde_json::Value::String(found.clone());
                    let db_path = ctx.db_path.clone();
                    let id = item.id.clone();
                    let payload_str = payload.to_string();
                    tokio::task::spawn_blocking(move || -> Result<()> {
                        let conn = rusqlite::Connection::open(db_path)?;
                        crate::db::set_payload(&conn, &id, &payload_str)
                    })
                    .await??;
                    found
                }
                Ok(None) => {
                    return write_outcome(
                        ctx,
                        item,
                        Outcome::Skipped { reason: "search_failed", blacklist: Some(BlacklistReason::SearchFailed) },
                    )
                    .await;
                }
                Err(e) => return write_outcome(ctx, item, classify_to_outcome(e, true)).await,
            }
        }
    };

    // Step 3: the actual debit, right before the mutating call. A second
    // item racing against this one between the step-1 peek and here could
    // have exhausted the bucket in the meantime; re-checking atomically at
    // the point of consumption is what the spec's "checked-and-consumed
    // atomically" quota discipline is guarding against.
    if item.destination_service == Service::B && !ctx.quota_b.check_and_consume(ctx.quota_cost_add_track) {
        return write_outcome(ctx, item, Outcome::Skipped { reason: "quota", blacklist: None }).await;
    }

    let destination_playlist_id = match item.destination_service {
        Service::A => mapping.playlist_a_id.clone(),
        Service::B => mapping.playlist_b_id.clone(),
    };

    if item.destination_service == Service::A {
        ctx.rate_limit_a.acquire().await;
    }
    match ctx
        .platform_for(item.destination_service)
        .add_track(&destination_playlist_id, &destination_track_id)
        .await
    {
        Ok(()) => write_outcome(ctx, item, Outcome::Done).await,
        Err(e) => write_outcome(ctx, item, classify_to_outcome(e, true)).await,
    }
}

async fn handle_rename_playlist(ctx: &ExecutionContext, item: &WorkItem) -> Result<()> {
    let mapping = load_mapping(ctx, &item.mapping_id).await?;
    let Some(mapping) = mapping else {
        return write_outcome(ctx, item, Outcome::Skipped { reason: "mapping_deleted", blacklist: None }).await;
    };

    if item.destination_service == Service::B && !ctx.quota_b.check_and_consume(ctx.quota_cost_rename) {
        return write_outcome(ctx, item, Outcome::Skipped { reason: "quota", blacklist: None }).await;
    }

    let payload: serde_json::Value = serde_json::from_str(&item.payload).unwrap_or(serde_json::json!({}));
    let new_name = match payload["new_name"].as_str() {
        Some(n) => n.to_string(),
        None => return write_outcome(ctx, item, Outcome::Skipped { reason: "invalid_payload", blacklist: None }).await,
    };

    let destination_playlist_id = match item.destination_service {
        Service::A => mapping.playlist_a_id.clone(),
        Service::B => mapping.playlist_b_id.clone(),
    };

    if item.destination_service == Service::A {
        ctx.rate_limit_a.acquire().await;
    }
    match ctx
        .platform_for(item.destination_service)
        .rename_playlist(&destination_playlist_id, &new_name)
        .await
    {
        Ok(()) => {
            let db_path = ctx.db_path.clone();
            let mapping_id = item.mapping_id.clone();
            let destination_service = item.destination_service;
            let new_name2 = new_name.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                let conn = rusqlite::Connection::open(db_path)?;
                crate::db::update_mapping_name(&conn, &mapping_id, destination_service, &new_name2)
            })
            .await??;
            write_outcome(ctx, item, Outcome::Done).await
        }
        // Blacklist is tracks-only (spec.md §4.6 "rename_playlist" step 2).
        Err(e) => write_outcome(ctx, item, classify_to_outcome(e, false)).await,
    }
}

async fn load_mapping(ctx: &ExecutionContext, mapping_id: &str) -> Result<Option<crate::models::Mapping>> {
    let db_path = ctx.db_path.clone();
    let mapping_id = mapping_id.to_string();
    tokio::task::spawn_blocking(move || -> Result<Option<crate::models::Mapping>> {
        let conn = rusqlite::Connection::open(db_path)?;
        crate::db::get_mapping(&conn, &mapping_id)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::PlatformError;
    use async_trait::async_trait;

    struct StubPlatform {
        name: &'static str,
        search_result: Option<String>,
        add_result: std::sync::Mutex<Option<Result<(), PlatformError>>>,
    }

    #[async_trait]
    impl Platform for StubPlatform {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn list_tracks(&self, _playlist_id: &str) -> Result<Vec<(String, String)>, PlatformError> {
            Ok(vec![])
        }
        async fn get_playlist_name(&self, _playlist_id: &str) -> Result<String, PlatformError> {
            Ok(String::new())
        }
        async fn search_track(&self, _title: &str) -> Result<Option<String>, PlatformError> {
            Ok(self.search_result.clone())
        }
        async fn add_track(&self, _playlist_id: &str, _track_id: &str) -> Result<(), PlatformError> {
            self.add_result.lock().unwrap().take().unwrap_or(Ok(()))
        }
        async fn rename_playlist(&self, _playlist_id: &str, _new_name: &str) -> Result<(), PlatformError> {
            Ok(())
        }
    }

    fn test_mapping(id: &str) -> crate::models::Mapping {
        crate::models::Mapping {
            id: id.to_string(),
            playlist_a_id: "pa".into(),
            playlist_b_id: "pb".into(),
            name_a: "Mix".into(),
            name_b: "Mix".into(),
            sync_names: true,
            sync_tracks: true,
            interval_minutes: 60,
            last_analysis_at: None,
            next_analysis_at: None,
        }
    }

    fn test_context(db_path: PathBuf, platform_b: Arc<dyn Platform>) -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext {
            db_path,
            platform_a: Arc::new(StubPlatform { name: "a", search_result: None, add_result: std::sync::Mutex::new(None) }),
            platform_b,
            quota_b: Arc::new(QuotaBucket::new(10_000)),
            rate_limit_a: Arc::new(RateLimiter::new(100)),
            batch_size: 50,
            concurrency: 5,
            quota_cost_add_track: 50,
            quota_cost_rename: 1,
        })
    }

    fn pending_add_track_item(mapping_id: &str) -> WorkItem {
        let now = chrono::Utc::now().timestamp();
        WorkItem {
            id: uuid::Uuid::new_v4().to_string(),
            mapping_id: mapping_id.to_string(),
            destination_service: Service::B,
            source_service: Service::A,
            action: Action::AddTrack,
            source_track_id: Some("t1".into()),
            source_track_title: Some("Track One".into()),
            payload: serde_json::json!({ "source_track_id": "t1" }).to_string(),
            action_key: "A_B_t1".into(),
            status: WorkStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            attempt_backoff_secs: 30,
            last_error: None,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn search_miss_blacklists_and_skips_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("sync.db");
        let item = pending_add_track_item("m1");
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            crate::db::run_migrations(&conn).unwrap();
            crate::db::upsert_mapping(&conn, &test_mapping("m1")).unwrap();
            crate::db::enqueue_work_item(&conn, &item).unwrap();
        }
        let ctx = test_context(
            db_path.clone(),
            Arc::new(StubPlatform { name: "b", search_result: None, add_result: std::sync::Mutex::new(None) }),
        );

        handle_add_track(&ctx, &item).await.unwrap();

        let conn = rusqlite::Connection::open(&db_path).unwrap();
        let stored = crate::db::get_work_item(&conn, &item.id).unwrap().unwrap();
        assert_eq!(stored.status, WorkStatus::Skipped);
        assert_eq!(stored.last_error.as_deref(), Some("search_failed"));
        let entry = crate::db::get_blacklist_entry(&conn, "m1", Service::B, "t1").unwrap().unwrap();
        assert_eq!(entry.reason, BlacklistReason::SearchFailed);
        assert_eq!(entry.skip_counter, 1);
        // a search miss never reaches the add_track call, so it must not
        // have debited the destination-B quota bucket (spec.md §4.6 step 3
        // only consumes quota for an operation that actually happens).
        assert_eq!(ctx.quota_b.used(), 0);
    }

    #[tokio::test]
    async fn quota_exhaustion_skips_without_consuming_further_or_blacklisting() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("sync.db");
        let item = pending_add_track_item("m1");
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            crate::db::run_migrations(&conn).unwrap();
            crate::db::upsert_mapping(&conn, &test_mapping("m1")).unwrap();
            crate::db::enqueue_work_item(&conn, &item).unwrap();
        }
        let mut ctx_inner = ExecutionContext {
            db_path: db_path.clone(),
            platform_a: Arc::new(StubPlatform { name: "a", search_result: None, add_result: std::sync::Mutex::new(None) }),
            platform_b: Arc::new(StubPlatform { name: "b", search_result: Some("dst1".into()), add_result: std::sync::Mutex::new(None) }),
            quota_b: Arc::new(QuotaBucket::new(10_000)),
            rate_limit_a: Arc::new(RateLimiter::new(100)),
            batch_size: 50,
            concurrency: 5,
            quota_cost_add_track: 50,
            quota_cost_rename: 1,
        };
        ctx_inner.quota_b.check_and_consume(9_990);
        let ctx = Arc::new(ctx_inner);

        handle_add_track(&ctx, &item).await.unwrap();

        let conn = rusqlite::Connection::open(&db_path).unwrap();
        let stored = crate::db::get_work_item(&conn, &item.id).unwrap().unwrap();
        assert_eq!(stored.status, WorkStatus::Skipped);
        assert_eq!(stored.last_error.as_deref(), Some("quota"));
        assert_eq!(ctx.quota_b.used(), 9_990);
        assert!(crate::db::get_blacklist_entry(&conn, "m1", Service::B, "t1").unwrap().is_none());
    }

    #[tokio::test]
    async fn rate_limited_add_is_rescheduled_with_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("sync.db");
        let item = pending_add_track_item("m1");
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            crate::db::run_migrations(&conn).unwrap();
            crate::db::upsert_mapping(&conn, &test_mapping("m1")).unwrap();
            crate::db::enqueue_work_item(&conn, &item).unwrap();
        }
        let platform_b = Arc::new(StubPlatform {
            name: "b",
            search_result: Some("dst1".into()),
            add_result: std::sync::Mutex::new(Some(Err(PlatformError::RateLimited { retry_after: Some(5) }))),
        });
        let ctx = test_context(db_path.clone(), platform_b);

        handle_add_track(&ctx, &item).await.unwrap();

        let conn = rusqlite::Connection::open(&db_path).unwrap();
        let stored = crate::db::get_work_item(&conn, &item.id).unwrap().unwrap();
        assert_eq!(stored.status, WorkStatus::Pending);
        assert_eq!(stored.attempts, 1);
        // first retry uses the pre-increment attempt count (0), so
        // backoff_secs(0) = 30 (spec.md §8 scenario 4: 30, 60, 120, ...).
        assert_eq!(stored.attempt_backoff_secs, 30);
    }

    #[tokio::test]
    async fn auth_failure_marks_error_without_retry_or_blacklist() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("sync.db");
        let item = pending_add_track_item("m1");
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            crate::db::run_migrations(&conn).unwrap();
            crate::db::upsert_mapping(&conn, &test_mapping("m1")).unwrap();
            crate::db::enqueue_work_item(&conn, &item).unwrap();
        }
        let platform_b = Arc::new(StubPlatform {
            name: "b",
            search_result: Some("dst1".into()),
            add_result: std::sync::Mutex::new(Some(Err(PlatformError::AuthFailure(anyhow::anyhow!("refresh token revoked"))))),
        });
        let ctx = test_context(db_path.clone(), platform_b);

        handle_add_track(&ctx, &item).await.unwrap();

        let conn = rusqlite::Connection::open(&db_path).unwrap();
        let stored = crate::db::get_work_item(&conn, &item.id).unwrap().unwrap();
        assert_eq!(stored.status, WorkStatus::Error);
        assert_eq!(stored.attempts, 0);
        assert!(crate::db::get_blacklist_entry(&conn, "m1", Service::B, "t1").unwrap().is_none());
    }
}
