//! Fixed constants from the spec (§6). All are also exposed as overridable
//! `Config` fields with matching defaults; these `const`s are what the
//! defaults resolve to and what tests assert against directly.

pub const ANALYSIS_PERIOD_SECS: u64 = 60;
pub const EXECUTION_PERIOD_SECS: u64 = 5;
pub const EXECUTION_BATCH_SIZE: usize = 50;
pub const EXECUTION_CONCURRENCY: usize = 5;

pub const TOKEN_REFRESH_MARGIN_SECS: i64 = 30;

pub const BACKOFF_BASE_SECS: u64 = 30;
pub const BACKOFF_MAX_SECS: u64 = 3600;

pub const DAILY_QUOTA_CEILING: u32 = 10_000;
pub const QUOTA_COST_ADD_TRACK: u32 = 50;
pub const QUOTA_COST_RENAME: u32 = 1;

pub const LAST_ERROR_MAX_CHARS: usize = 512;

pub const PLATFORM_A_RATE_LIMIT_PER_SEC: u32 = 10;

/// `min(2^attempts * BACKOFF_BASE_SECS, BACKOFF_MAX_SECS)` — spec.md §6/§8 I2.
pub fn backoff_secs(attempts: u32) -> u64 {
    let exp = 2u64.saturating_pow(attempts).saturating_mul(BACKOFF_BASE_SECS);
    exp.min(BACKOFF_MAX_SECS)
}

/// Truncate an error message to the §3/§6 storage cap, at a char boundary.
pub fn truncate_error(msg: &str) -> String {
    if msg.len() <= LAST_ERROR_MAX_CHARS {
        return msg.to_string();
    }
    let mut end = LAST_ERROR_MAX_CHARS;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    msg[..end].to_string()
}
