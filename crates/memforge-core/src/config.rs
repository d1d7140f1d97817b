//! Engine configuration.
//!
//! [`EngineConfig::default`] carries the system defaults; [`EngineConfig::from_env`]
//! overlays `MEMFORGE_*` environment variables. Per-owner overrides live in
//! `OwnerSettings` and are resolved at session start.

use std::str::FromStr;
use std::time::Duration;

use memforge_state::OwnerSettings;

use crate::error::{EngineError, Result};

pub const MAX_MUTATIONS_PER_SESSION: u32 = 10;
pub const DEFAULT_RETENTION_THRESHOLD: f64 = 0.7;
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Job-level retry policy for transient LLM/network failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based). A server hint wins.
    pub fn delay_for(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        if let Some(seconds) = retry_after_secs {
            return Duration::from_secs(seconds.min(self.max_delay_ms / 1000).max(1));
        }

        let multiplier = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        let delay = (self.initial_delay_ms as f64 * multiplier) as u64;
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard cap on mutating actions per session
    pub max_mutations_per_session: u32,
    /// Fraction of pre-session core mass that must survive a session
    pub default_retention_threshold: f64,
    /// Core mass above which an owner is eligible regardless of schedule
    pub mass_budget: u64,
    /// Interval after which an owner is due for a session
    pub refine_interval_secs: u64,
    /// LLM turns per session before the loop stops on its own
    pub max_turns: u32,
    /// Sessions for different owners running at once
    pub max_concurrent_sessions: usize,
    pub retry: RetryPolicy,
    pub model: String,
    pub llm_timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_mutations_per_session: MAX_MUTATIONS_PER_SESSION,
            default_retention_threshold: DEFAULT_RETENTION_THRESHOLD,
            mass_budget: 2_000,
            refine_interval_secs: 24 * 60 * 60,
            max_turns: 12,
            max_concurrent_sessions: 4,
            retry: RetryPolicy::default(),
            model: DEFAULT_MODEL.to_string(),
            llm_timeout_secs: 60,
            max_tokens: 4_096,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with environment variables
    ///
    /// Reads:
    /// - MEMFORGE_MAX_MUTATIONS
    /// - MEMFORGE_RETENTION_THRESHOLD
    /// - MEMFORGE_MASS_BUDGET
    /// - MEMFORGE_REFINE_INTERVAL_SECS
    /// - MEMFORGE_MAX_TURNS
    /// - MEMFORGE_MAX_CONCURRENT
    /// - MEMFORGE_MAX_RETRIES
    /// - MEMFORGE_MODEL
    /// - MEMFORGE_LLM_TIMEOUT_SECS
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "MEMFORGE_MAX_MUTATIONS")? {
            config.max_mutations_per_session = v;
        }
        if let Some(v) = parse_var(&lookup, "MEMFORGE_RETENTION_THRESHOLD")? {
            config.default_retention_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "MEMFORGE_MASS_BUDGET")? {
            config.mass_budget = v;
        }
        if let Some(v) = parse_var(&lookup, "MEMFORGE_REFINE_INTERVAL_SECS")? {
            config.refine_interval_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "MEMFORGE_MAX_TURNS")? {
            config.max_turns = v;
        }
        if let Some(v) = parse_var(&lookup, "MEMFORGE_MAX_CONCURRENT")? {
            config.max_concurrent_sessions = v;
        }
        if let Some(v) = parse_var(&lookup, "MEMFORGE_MAX_RETRIES")? {
            config.retry.max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "MEMFORGE_LLM_TIMEOUT_SECS")? {
            config.llm_timeout_secs = v;
        }
        if let Some(model) = lookup("MEMFORGE_MODEL").filter(|m| !m.trim().is_empty()) {
            config.model = model;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !valid_threshold(self.default_retention_threshold) {
            return Err(EngineError::Config(format!(
                "retention threshold must be in (0, 1], got {}",
                self.default_retention_threshold
            )));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(EngineError::Config(
                "max concurrent sessions must be at least 1".to_string(),
            ));
        }
        if self.max_turns == 0 {
            return Err(EngineError::Config("max turns must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Owner override if present and sane, else the system default.
    pub fn retention_threshold_for(&self, settings: Option<&OwnerSettings>) -> f64 {
        settings
            .and_then(|s| s.retention_threshold)
            .filter(|t| valid_threshold(*t))
            .unwrap_or(self.default_retention_threshold)
    }

    pub fn refine_interval(&self) -> Duration {
        Duration::from_secs(self.refine_interval_secs)
    }
}

pub fn valid_threshold(threshold: f64) -> bool {
    threshold > 0.0 && threshold <= 1.0
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| EngineError::Config(format!("{key}={raw}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_session_contract() {
        let config = EngineConfig::default();
        assert_eq!(config.max_mutations_per_session, 10);
        assert_eq!(config.default_retention_threshold, 0.7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("MEMFORGE_MAX_MUTATIONS", "4"),
            ("MEMFORGE_RETENTION_THRESHOLD", "0.5"),
            ("MEMFORGE_MODEL", "claude-test"),
        ]))
        .unwrap();
        assert_eq!(config.max_mutations_per_session, 4);
        assert_eq!(config.default_retention_threshold, 0.5);
        assert_eq!(config.model, "claude-test");
    }

    #[test]
    fn test_bad_env_value_is_config_error() {
        let err = EngineConfig::from_lookup(lookup(&[("MEMFORGE_MASS_BUDGET", "lots")]))
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(msg) if msg.contains("MEMFORGE_MASS_BUDGET")));

        let err = EngineConfig::from_lookup(lookup(&[("MEMFORGE_RETENTION_THRESHOLD", "1.5")]))
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_owner_threshold_override() {
        let config = EngineConfig::default();
        assert_eq!(config.retention_threshold_for(None), 0.7);

        let settings = OwnerSettings::new("o").with_retention_threshold(0.9);
        assert_eq!(config.retention_threshold_for(Some(&settings)), 0.9);

        let nonsense = OwnerSettings::new("o").with_retention_threshold(0.0);
        assert_eq!(config.retention_threshold_for(Some(&nonsense)), 0.7);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3, None), Duration::from_millis(800));
        assert_eq!(policy.delay_for(10, None), Duration::from_millis(5_000));
    }

    #[test]
    fn test_retry_after_hint_is_bounded() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1, Some(2)), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1, Some(600)), Duration::from_secs(5));
    }
}
