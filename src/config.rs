use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Path to the sqlite database holding mappings, tokens, the work
    /// queue and the blacklist.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    // Scheduling
    #[serde(default = "default_analysis_period_secs")]
    pub analysis_period_secs: u64,
    #[serde(default = "default_execution_period_secs")]
    pub execution_period_secs: u64,

    // Execution
    #[serde(default = "default_execution_batch_size")]
    pub execution_batch_size: usize,
    #[serde(default = "default_execution_concurrency")]
    pub execution_concurrency: usize,

    // OAuth
    #[serde(default = "default_token_refresh_margin_secs")]
    pub token_refresh_margin_secs: i64,

    // Quota (platform B, spec.md §6)
    #[serde(default = "default_daily_quota_ceiling")]
    pub daily_quota_ceiling: u32,
    #[serde(default = "default_quota_cost_add_track")]
    pub quota_cost_add_track: u32,
    #[serde(default = "default_quota_cost_rename")]
    pub quota_cost_rename: u32,

    #[serde(default = "default_rate_limit_per_sec")]
    pub platform_a_rate_limit_per_sec: u32,
}

fn default_db_path() -> PathBuf {
    "/var/lib/playlist-bridge-sync/sync.db".into()
}
fn default_log_dir() -> PathBuf {
    "/var/log/playlist-bridge-sync".into()
}
fn default_analysis_period_secs() -> u64 {
    crate::constants::ANALYSIS_PERIOD_SECS
}
fn default_execution_period_secs() -> u64 {
    crate::constants::EXECUTION_PERIOD_SECS
}
fn default_execution_batch_size() -> usize {
    crate::constants::EXECUTION_BATCH_SIZE
}
fn default_execution_concurrency() -> usize {
    crate::constants::EXECUTION_CONCURRENCY
}
fn default_token_refresh_margin_secs() -> i64 {
    crate::constants::TOKEN_REFRESH_MARGIN_SECS
}
fn default_daily_quota_ceiling() -> u32 {
    crate::constants::DAILY_QUOTA_CEILING
}
fn default_quota_cost_add_track() -> u32 {
    crate::constants::QUOTA_COST_ADD_TRACK
}
fn default_quota_cost_rename() -> u32 {
    crate::constants::QUOTA_COST_RENAME
}
fn default_rate_limit_per_sec() -> u32 {
    crate::constants::PLATFORM_A_RATE_LIMIT_PER_SEC
}

impl Config {
    pub fn from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&s)?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_fills_in_all_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.analysis_period_secs, crate::constants::ANALYSIS_PERIOD_SECS);
        assert_eq!(cfg.execution_batch_size, crate::constants::EXECUTION_BATCH_SIZE);
        assert_eq!(cfg.daily_quota_ceiling, crate::constants::DAILY_QUOTA_CEILING);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let cfg: Config = toml::from_str("execution_concurrency = 2\n").unwrap();
        assert_eq!(cfg.execution_concurrency, 2);
        assert_eq!(cfg.execution_period_secs, crate::constants::EXECUTION_PERIOD_SECS);
    }
}
