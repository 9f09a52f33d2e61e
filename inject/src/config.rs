//! Tunables for tracing sessions.

use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

const STEP_TIMEOUT_ENV: &str = "CHAOS_INJECT_STEP_TIMEOUT_MS";
const POLL_INTERVAL_ENV: &str = "CHAOS_INJECT_POLL_INTERVAL_US";
const BULK_WRITE_MIN_ENV: &str = "CHAOS_INJECT_BULK_WRITE_MIN";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectConfig {
    /// Longest time to wait for the target to report a stop after attach or single-step.
    pub step_timeout: Duration,
    /// Sleep between `waitpid` polls while waiting for a stop.
    pub poll_interval: Duration,
    /// Writes at least this long try `process_vm_writev` before falling back to word pokes.
    pub bulk_write_threshold: usize,
}

impl Default for InjectConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_micros(100),
            bulk_write_threshold: 64,
        }
    }
}

impl InjectConfig {
    /// Defaults overlaid with `CHAOS_INJECT_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(ms) = parse_var(&lookup, STEP_TIMEOUT_ENV) {
            self.step_timeout = Duration::from_millis(ms);
        }
        if let Some(us) = parse_var(&lookup, POLL_INTERVAL_ENV) {
            self.poll_interval = Duration::from_micros(us);
        }
        if let Some(min) = parse_var(&lookup, BULK_WRITE_MIN_ENV) {
            self.bulk_write_threshold = min as usize;
        }
        self
    }
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("ignoring {}={:?}: {}", key, raw, e);
            None
        }
    }
}
