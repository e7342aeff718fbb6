//! Aggregate status snapshot for the admin read-only endpoint (spec.md §6
//! "Status output"). The core only publishes counts; the HTTP surface
//! that serves them lives outside this crate's scope.

use crate::quota::QuotaBucket;
use anyhow::Result;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub pending: i64,
    pub running: i64,
    pub done: i64,
    pub skipped: i64,
    pub error: i64,
    pub platform_b_quota_used: u32,
    pub platform_b_quota_limit: u32,
}

pub fn snapshot(db_path: &Path, quota_b: &QuotaBucket) -> Result<StatusSnapshot> {
    let conn = rusqlite::Connection::open(db_path)?;
    let counts = crate::db::status_counts(&conn)?;
    Ok(StatusSnapshot {
        pending: counts.get("pending").copied().unwrap_or(0),
        running: counts.get("running").copied().unwrap_or(0),
        done: counts.get("done").copied().unwrap_or(0),
        skipped: counts.get("skipped").copied().unwrap_or(0),
        error: counts.get("error").copied().unwrap_or(0),
        platform_b_quota_used: quota_b.used(),
        platform_b_quota_limit: quota_b.ceiling(),
    })
}
