//! Environment-driven tuning knobs.
//!
//! All of these have defaults that are safe for the public Common Crawl and
//! Internet Archive endpoints; the environment variables exist so that
//! long-running jobs (and tests) can adjust behavior without a rebuild.

use std::env;

fn env_f64(var: &str, default: f64) -> f64 {
    env::var(var)
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_u32(var: &str, default: u32) -> u32 {
    env::var(var)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

lazy_static::lazy_static! {
    /// Connection failures tolerated before a request gives up entirely.
    pub static ref MAX_ERRORS: u32 = env_u32("CDXT_MAX_ERRORS", 100);
    /// Connection failures before retry logging escalates to WARN.
    pub static ref WARNING_AFTER_N_ERRORS: u32 = env_u32("CDXT_WARNING_AFTER_N_ERRORS", 10);

    /// Minimum seconds between requests to a host we know nothing about.
    pub static ref DEFAULT_MIN_RETRY_INTERVAL: f64 = env_f64("CDXT_DEFAULT_MIN_RETRY_INTERVAL", 3.0);
    /// index.commoncrawl.org
    pub static ref CC_INDEX_MIN_RETRY_INTERVAL: f64 = env_f64("CDXT_CC_INDEX_MIN_RETRY_INTERVAL", 1.0);
    /// data.commoncrawl.org
    pub static ref CC_DATA_MIN_RETRY_INTERVAL: f64 = env_f64("CDXT_CC_DATA_MIN_RETRY_INTERVAL", 0.55);
    /// web.archive.org
    pub static ref IA_MIN_RETRY_INTERVAL: f64 = env_f64("CDXT_IA_MIN_RETRY_INTERVAL", 6.0);
}

/// Mock clock for tests, evaluated dynamically so a test can set it after
/// process start.
pub fn mock_time() -> Option<i64> {
    env::var("CDXT_MOCK_TIME")
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .map(|t| t as i64)
}

/// Test hook: make the first connection failure fatal instead of sleeping
/// through the long retry schedule.
pub fn test_failfast() -> bool {
    env::var("CDXT_TEST_FAILFAST").is_ok()
}

/// Current unix time, honoring `CDXT_MOCK_TIME`.
pub fn now() -> i64 {
    match mock_time() {
        Some(t) => t,
        None => chrono::Utc::now().timestamp(),
    }
}
