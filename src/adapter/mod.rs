//! C3 Platform Adapter (spec.md §4.3). One implementation of `Platform`
//! per streaming service, each owning its own HTTP quirks behind a common
//! interface. Shaped after the teacher's `Provider` trait in `api/mod.rs`,
//! trimmed to the five operations the sync engine actually needs and with
//! error classification promoted from ad-hoc string matching to a typed
//! `PlatformError`.

pub mod spotify;
pub mod youtube;

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

/// One playlist track as seen through an adapter: `(track_id, title)`.
pub type Track = (String, String);

#[async_trait]
pub trait Platform: Send + Sync {
    /// Stable name used in logs and error messages ("spotify", "youtube").
    fn name(&self) -> &'static str;

    async fn list_tracks(&self, playlist_id: &str) -> Result<Vec<Track>, PlatformError>;

    async fn get_playlist_name(&self, playlist_id: &str) -> Result<String, PlatformError>;

    /// Best-effort search for `title` on this platform. `Ok(None)` means
    /// the search succeeded but found nothing worth using — a distinct
    /// outcome from a transport/API failure (spec.md §4.3 "search_track").
    async fn search_track(&self, title: &str) -> Result<Option<String>, PlatformError>;

    async fn add_track(&self, playlist_id: &str, track_id: &str) -> Result<(), PlatformError>;

    async fn rename_playlist(&self, playlist_id: &str, new_name: &str) -> Result<(), PlatformError>;
}

/// Why a platform call failed, classified coarsely enough for the
/// execution worker to decide retry vs blacklist vs abort (spec.md §4.6).
#[derive(Debug)]
pub enum PlatformError {
    /// 429 or equivalent; `retry_after` seconds if the platform provided one.
    RateLimited { retry_after: Option<u64> },
    /// Not retryable as-is: the track/playlist doesn't exist, access was
    /// denied, or the request was malformed.
    Fatal(FatalKind),
    /// Transport error, 5xx, or anything else worth a backoff-and-retry.
    Transient(anyhow::Error),
    /// Credentials are missing or token refresh failed (spec.md §4.2
    /// "Failure semantics", §7 taxonomy item 1). Fatal for the affected
    /// work item but distinct from `Fatal`: it is not a statement about
    /// the track or playlist, so it must not reach the blacklist, and it
    /// is not retried on a timer — it needs a human to fix credentials.
    AuthFailure(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    NotFound,
    Forbidden,
    Unauthorized,
    Invalid,
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::RateLimited { retry_after } => {
                write!(f, "rate limited (retry_after={:?})", retry_after)
            }
            PlatformError::Fatal(kind) => write!(f, "fatal: {:?}", kind),
            PlatformError::Transient(e) => write!(f, "transient: {}", e),
            PlatformError::AuthFailure(e) => write!(f, "auth failure: {}", e),
        }
    }
}

impl std::error::Error for PlatformError {}

impl From<reqwest::Error> for PlatformError {
    fn from(e: reqwest::Error) -> Self {
        PlatformError::Transient(e.into())
    }
}

/// Map an HTTP response status (plus an optional `Retry-After` header) to
/// a `PlatformError`, the common classification point both adapters use
/// after a non-2xx response (spec.md §4.3 "Error classification").
pub fn classify_status(status: reqwest::StatusCode, retry_after: Option<u64>) -> PlatformError {
    match status.as_u16() {
        429 => PlatformError::RateLimited { retry_after },
        401 => PlatformError::Fatal(FatalKind::Unauthorized),
        403 => PlatformError::Fatal(FatalKind::Forbidden),
        404 => PlatformError::Fatal(FatalKind::NotFound),
        400 | 422 => PlatformError::Fatal(FatalKind::Invalid),
        _ => PlatformError::Transient(anyhow::anyhow!("unexpected status: {}", status)),
    }
}

impl FatalKind {
    pub fn as_blacklist_reason(self) -> crate::models::BlacklistReason {
        match self {
            FatalKind::NotFound => crate::models::BlacklistReason::NotFound,
            FatalKind::Forbidden => crate::models::BlacklistReason::Forbidden,
            FatalKind::Unauthorized => crate::models::BlacklistReason::Unauthorized,
            FatalKind::Invalid => crate::models::BlacklistReason::Invalid,
        }
    }
}
