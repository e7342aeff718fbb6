//! Core entity types (spec.md §3). These are the in-process, short-lived
//! copies the sqlite rows are marshalled into and out of; the database is
//! the owner of record (see `db.rs`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// `"A"` (Spotify-class) or `"B"` (YouTube-class).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Service {
    A,
    B,
}

impl Service {
    pub fn other(self) -> Service {
        match self {
            Service::A => Service::B,
            Service::B => Service::A,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Service::A => "A",
            Service::B => "B",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Service {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "A" => Ok(Service::A),
            "B" => Ok(Service::B),
            other => Err(anyhow::anyhow!("unknown service: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Mapping {
    pub id: String,
    pub playlist_a_id: String,
    pub playlist_b_id: String,
    pub name_a: String,
    pub name_b: String,
    pub sync_names: bool,
    pub sync_tracks: bool,
    pub interval_minutes: i64,
    pub last_analysis_at: Option<i64>,
    pub next_analysis_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expiry: i64,
    pub scopes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    AddTrack,
    RenamePlaylist,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::AddTrack => "add_track",
            Action::RenamePlaylist => "rename_playlist",
        }
    }
}

impl std::str::FromStr for Action {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "add_track" => Ok(Action::AddTrack),
            "rename_playlist" => Ok(Action::RenamePlaylist),
            other => Err(anyhow::anyhow!("unknown action: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    Pending,
    Running,
    Done,
    Error,
    Skipped,
}

impl WorkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Running => "running",
            WorkStatus::Done => "done",
            WorkStatus::Error => "error",
            WorkStatus::Skipped => "skipped",
        }
    }

    /// Terminal statuses coexist freely and never block a new enqueue
    /// with the same dedup key (spec.md §3 work item uniqueness invariant).
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkStatus::Done | WorkStatus::Error | WorkStatus::Skipped)
    }
}

impl std::str::FromStr for WorkStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(WorkStatus::Pending),
            "running" => Ok(WorkStatus::Running),
            "done" => Ok(WorkStatus::Done),
            "error" => Ok(WorkStatus::Error),
            "skipped" => Ok(WorkStatus::Skipped),
            other => Err(anyhow::anyhow!("unknown work item status: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: String,
    pub mapping_id: String,
    pub destination_service: Service,
    pub source_service: Service,
    pub action: Action,
    pub source_track_id: Option<String>,
    pub source_track_title: Option<String>,
    pub payload: String,
    pub action_key: String,
    pub status: WorkStatus,
    pub attempts: u32,
    pub next_attempt_at: i64,
    pub attempt_backoff_secs: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
}

/// Reason a track was blacklisted (spec.md §3, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistReason {
    NotFound,
    Forbidden,
    Unauthorized,
    Invalid,
    SearchFailed,
    Error,
}

impl BlacklistReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BlacklistReason::NotFound => "not_found",
            BlacklistReason::Forbidden => "forbidden",
            BlacklistReason::Unauthorized => "unauthorized",
            BlacklistReason::Invalid => "invalid",
            BlacklistReason::SearchFailed => "search_failed",
            BlacklistReason::Error => "error",
        }
    }
}

impl std::str::FromStr for BlacklistReason {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "not_found" => Ok(BlacklistReason::NotFound),
            "forbidden" => Ok(BlacklistReason::Forbidden),
            "unauthorized" => Ok(BlacklistReason::Unauthorized),
            "invalid" => Ok(BlacklistReason::Invalid),
            "search_failed" => Ok(BlacklistReason::SearchFailed),
            "error" => Ok(BlacklistReason::Error),
            other => Err(anyhow::anyhow!("unknown blacklist reason: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlacklistEntry {
    pub mapping_id: Option<String>,
    pub service: Service,
    pub track_id: String,
    pub reason: BlacklistReason,
    pub skip_counter: u32,
    pub last_skipped_at: i64,
}
