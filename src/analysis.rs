//! C5 Analysis Scheduler (spec.md §4.5). Per-mapping diff + enqueue,
//! isolated so one slow or broken mapping never starves the others —
//! grounded on the teacher's `run_worker_once` in `worker.rs`, which
//! applies the same "catch the per-item error, log it, keep going"
//! discipline one layer down (per work item rather than per mapping).

use crate::adapter::{Platform, PlatformError};
use crate::models::{Action, Mapping, Service, WorkItem, WorkStatus};
use anyhow::Result;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct AnalysisContext {
    pub db_path: PathBuf,
    pub platform_a: Arc<dyn Platform>,
    pub platform_b: Arc<dyn Platform>,
}

/// One sweep: every mapping due for analysis gets diffed and has its
/// reconciling work items enqueued. A fetch or enqueue failure on one
/// mapping is logged and does not affect the others (spec.md §4.5
/// "Failure semantics") — except credential/token failures, which abort
/// the whole sweep ("a run that cannot resolve credentials aborts the
/// sweep entirely"): every other mapping would fail the same way, and
/// retrying them individually just spams the log until a human fixes
/// the stored OAuth credentials.
pub async fn run_sweep(ctx: &AnalysisContext) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let db_path = ctx.db_path.clone();
    let mappings = tokio::task::spawn_blocking(move || -> Result<Vec<Mapping>> {
        let conn = rusqlite::Connection::open(db_path)?;
        crate::db::select_due_mappings(&conn, now)
    })
    .await??;

    info!(count = mappings.len(), "analysis sweep starting");
    for mapping in mappings {
        if let Err(e) = process_mapping(ctx, &mapping, now).await {
            if e.downcast_ref::<PlatformError>().map(is_auth_failure).unwrap_or(false) {
                error!(mapping_id = %mapping.id, error = %e, "aborting analysis sweep: credentials could not be resolved");
                return Err(e);
            }
            warn!(mapping_id = %mapping.id, error = %e, "analysis failed for mapping, will retry next sweep");
        }
    }
    Ok(())
}

fn is_auth_failure(e: &PlatformError) -> bool {
    matches!(e, PlatformError::AuthFailure(_))
}

async fn process_mapping(ctx: &AnalysisContext, mapping: &Mapping, now: i64) -> Result<()> {
    let (tracks_a, tracks_b) = tokio::try_join!(
        fetch_tracks(ctx.platform_a.clone(), mapping.playlist_a_id.clone()),
        fetch_tracks(ctx.platform_b.clone(), mapping.playlist_b_id.clone()),
    )?;

    if mapping.sync_tracks {
        enqueue_track_diffs(ctx, mapping, &tracks_a, &tracks_b).await?;
    }
    if mapping.sync_names {
        enqueue_rename_if_needed(ctx, mapping).await?;
    }

    let db_path = ctx.db_path.clone();
    let mapping_id = mapping.id.clone();
    let interval_minutes = mapping.interval_minutes;
    tokio::task::spawn_blocking(move || -> Result<()> {
        let conn = rusqlite::Connection::open(db_path)?;
        crate::db::mark_mapping_analyzed(&conn, &mapping_id, now, interval_minutes)
    })
    .await??;
    Ok(())
}

async fn fetch_tracks(platform: Arc<dyn Platform>, playlist_id: String) -> Result<Vec<(String, String)>> {
    platform.list_tracks(&playlist_id).await.map_err(|e| {
        warn!(playlist_id = %playlist_id, platform = platform.name(), error = %e, "list_tracks failed");
        anyhow::Error::new(e)
    })
}

async fn enqueue_track_diffs(
    ctx: &AnalysisContext,
    mapping: &Mapping,
    tracks_a: &[(String, String)],
    tracks_b: &[(String, String)],
) -> Result<()> {
    let ids_a: HashSet<&str> = tracks_a.iter().map(|(id, _)| id.as_str()).collect();
    let ids_b: HashSet<&str> = tracks_b.iter().map(|(id, _)| id.as_str()).collect();

    let missing_on_b: Vec<&(String, String)> = tracks_a.iter().filter(|(id, _)| !ids_b.contains(id.as_str())).collect();
    let missing_on_a: Vec<&(String, String)> = tracks_b.iter().filter(|(id, _)| !ids_a.contains(id.as_str())).collect();

    enqueue_missing(ctx, mapping, Service::A, Service::B, missing_on_b).await?;
    enqueue_missing(ctx, mapping, Service::B, Service::A, missing_on_a).await?;
    Ok(())
}

async fn enqueue_missing(
    ctx: &AnalysisContext,
    mapping: &Mapping,
    source_service: Service,
    destination_service: Service,
    missing: Vec<&(String, String)>,
) -> Result<()> {
    if missing.is_empty() {
        return Ok(());
    }
    let db_path = ctx.db_path.clone();
    let mapping_id = mapping.id.clone();
    let missing_owned: Vec<(String, String)> = missing.into_iter().cloned().collect();

    let enqueued: usize = tokio::task::spawn_blocking(move || -> Result<usize> {
        let conn = rusqlite::Connection::open(&db_path)?;
        let candidate_ids: Vec<String> = missing_owned.iter().map(|(id, _)| id.clone()).collect();
        let allowed = crate::blacklist::filter_out(&conn, &mapping_id, destination_service, &candidate_ids)?;
        let allowed_set: HashSet<&str> = allowed.iter().map(|s| s.as_str()).collect();
        let now = chrono::Utc::now().timestamp();
        let mut enqueued = 0;
        for (id, title) in &missing_owned {
            if !allowed_set.contains(id.as_str()) {
                continue;
            }
            let action_key = format!("{}_{}_{}", source_service.as_str(), destination_service.as_str(), id);
            let payload = serde_json::json!({ "source_track_id": id, "action_key": action_key }).to_string();
            let item = WorkItem {
                id: uuid::Uuid::new_v4().to_string(),
                mapping_id: mapping_id.clone(),
                destination_service,
                source_service,
                action: Action::AddTrack,
                source_track_id: Some(id.clone()),
                source_track_title: Some(title.clone()),
                payload,
                action_key,
                status: WorkStatus::Pending,
                attempts: 0,
                next_attempt_at: now,
                attempt_backoff_secs: crate::constants::BACKOFF_BASE_SECS as u32,
                last_error: None,
                created_at: now,
            };
            if crate::db::enqueue_work_item(&conn, &item)? {
                enqueued += 1;
            }
        }
        Ok(enqueued)
    })
    .await??;

    info!(
        mapping_id = %mapping.id,
        source = %source_service,
        destination = %destination_service,
        enqueued,
        "enqueued add_track work items"
    );
    Ok(())
}

async fn enqueue_rename_if_needed(ctx: &AnalysisContext, mapping: &Mapping) -> Result<()> {
    if mapping.name_a.is_empty() || mapping.name_b.is_empty() || mapping.name_a == mapping.name_b {
        return Ok(());
    }
    // Platform-B's name is the fixed canonical choice (spec.md §9 Open
    // Questions: the source was ambiguous between "B wins" and
    // "first non-empty wins"; we commit to B).
    let canonical = mapping.name_b.clone();
    let db_path = ctx.db_path.clone();
    let mapping_id = mapping.id.clone();
    let now = chrono::Utc::now().timestamp();
    let item = WorkItem {
        id: uuid::Uuid::new_v4().to_string(),
        mapping_id: mapping_id.clone(),
        destination_service: Service::A,
        source_service: Service::B,
        action: Action::RenamePlaylist,
        source_track_id: None,
        source_track_title: None,
        payload: serde_json::json!({ "new_name": canonical }).to_string(),
        action_key: format!("rename:{}", canonical),
        status: WorkStatus::Pending,
        attempts: 0,
        next_attempt_at: now,
        attempt_backoff_secs: crate::constants::BACKOFF_BASE_SECS as u32,
        last_error: None,
        created_at: now,
    };
    tokio::task::spawn_blocking(move || -> Result<()> {
        let conn = rusqlite::Connection::open(&db_path)?;
        if crate::db::enqueue_work_item(&conn, &item)? {
            info!(mapping_id = %mapping_id, new_name = %item.payload, "enqueued rename_playlist work item");
        }
        Ok(())
    })
    .await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::PlatformError;
    use async_trait::async_trait;

    struct StubPlatform {
        name: &'static str,
        tracks: Vec<(String, String)>,
    }

    #[async_trait]
    impl Platform for StubPlatform {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn list_tracks(&self, _playlist_id: &str) -> Result<Vec<(String, String)>, PlatformError> {
            Ok(self.tracks.clone())
        }
        async fn get_playlist_name(&self, _playlist_id: &str) -> Result<String, PlatformError> {
            Ok(String::new())
        }
        async fn search_track(&self, _title: &str) -> Result<Option<String>, PlatformError> {
            Ok(None)
        }
        async fn add_track(&self, _playlist_id: &str, _track_id: &str) -> Result<(), PlatformError> {
            Ok(())
        }
        async fn rename_playlist(&self, _playlist_id: &str, _new_name: &str) -> Result<(), PlatformError> {
            Ok(())
        }
    }

    fn test_mapping() -> Mapping {
        Mapping {
            id: "m1".into(),
            playlist_a_id: "pa".into(),
            playlist_b_id: "pb".into(),
            name_a: "My Mix".into(),
            name_b: "My Mix".into(),
            sync_names: true,
            sync_tracks: true,
            interval_minutes: 60,
            last_analysis_at: None,
            next_analysis_at: None,
        }
    }

    #[tokio::test]
    async fn additive_sync_enqueues_exactly_one_add_track() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("sync.db");
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            crate::db::run_migrations(&conn).unwrap();
            crate::db::upsert_mapping(&conn, &test_mapping()).unwrap();
        }

        let ctx = AnalysisContext {
            db_path: db_path.clone(),
            platform_a: Arc::new(StubPlatform {
                name: "a",
                tracks: vec![("t1".into(), "Track One".into()), ("t2".into(), "Track Two".into())],
            }),
            platform_b: Arc::new(StubPlatform {
                name: "b",
                tracks: vec![("t2".into(), "Track Two".into())],
            }),
        };

        run_sweep(&ctx).await.unwrap();

        let conn = rusqlite::Connection::open(&db_path).unwrap();
        let counts = crate::db::status_counts(&conn).unwrap();
        assert_eq!(counts.get("pending").copied().unwrap_or(0), 1);

        // second sweep before execution touches anything: still exactly one
        run_sweep(&ctx).await.unwrap();
        let counts2 = crate::db::status_counts(&conn).unwrap();
        assert_eq!(counts2.get("pending").copied().unwrap_or(0), 1);
    }

    struct AuthFailingPlatform {
        name: &'static str,
    }

    #[async_trait]
    impl Platform for AuthFailingPlatform {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn list_tracks(&self, _playlist_id: &str) -> Result<Vec<(String, String)>, PlatformError> {
            Err(PlatformError::AuthFailure(anyhow::anyhow!("token refresh failed")))
        }
        async fn get_playlist_name(&self, _playlist_id: &str) -> Result<String, PlatformError> {
            Ok(String::new())
        }
        async fn search_track(&self, _title: &str) -> Result<Option<String>, PlatformError> {
            Ok(None)
        }
        async fn add_track(&self, _playlist_id: &str, _track_id: &str) -> Result<(), PlatformError> {
            Ok(())
        }
        async fn rename_playlist(&self, _playlist_id: &str, _new_name: &str) -> Result<(), PlatformError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn sweep_aborts_entirely_when_credentials_cannot_be_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("sync.db");
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            crate::db::run_migrations(&conn).unwrap();
            crate::db::upsert_mapping(&conn, &test_mapping()).unwrap();
            let mut second = test_mapping();
            second.id = "m2".into();
            second.playlist_a_id = "pa2".into();
            second.playlist_b_id = "pb2".into();
            crate::db::upsert_mapping(&conn, &second).unwrap();
        }

        let ctx = AnalysisContext {
            db_path: db_path.clone(),
            platform_a: Arc::new(AuthFailingPlatform { name: "a" }),
            platform_b: Arc::new(StubPlatform { name: "b", tracks: vec![] }),
        };

        let err = run_sweep(&ctx).await.unwrap_err();
        assert!(err.downcast_ref::<PlatformError>().is_some());

        let conn = rusqlite::Connection::open(&db_path).unwrap();
        // neither mapping advanced past this failed sweep
        let m1 = crate::db::get_mapping(&conn, "m1").unwrap().unwrap();
        assert!(m1.last_analysis_at.is_none());
    }
}
