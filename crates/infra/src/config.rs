//! Process configuration loaded from `DOCPIPE_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::monitor::MonitorConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::retry::RetryPolicy;
use crate::search::{RankingConfig, default_space_weights};
use crate::worker::JobWorkerConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineConfig {
    pub bind: String,
    /// Postgres URL; in-memory stores are used when unset.
    #[serde(skip_serializing)]
    pub database_url: Option<String>,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_multiplier: f64,
    pub retry_jitter: f64,
    pub stage_timeout: Option<Duration>,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub hard_timeout: Duration,
    pub monitor_scan_interval: Duration,
    pub max_resume_attempts: u32,
    pub worker_poll_interval: Duration,
    pub worker_max_concurrent: usize,
    pub stage_concurrency: usize,
    pub search_oversample: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            bind: "0.0.0.0:8080".to_string(),
            database_url: None,
            retry_max_attempts: retry.max_attempts,
            retry_base_delay: retry.base_delay,
            retry_max_delay: retry.max_delay,
            retry_multiplier: retry.multiplier,
            retry_jitter: retry.jitter,
            stage_timeout: None,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(300),
            hard_timeout: Duration::from_secs(1800),
            monitor_scan_interval: Duration::from_secs(60),
            max_resume_attempts: 3,
            worker_poll_interval: Duration::from_millis(250),
            worker_max_concurrent: 4,
            stage_concurrency: 8,
            search_oversample: 3,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let env = Env(&lookup);

        if let Some(bind) = lookup("DOCPIPE_BIND") {
            cfg.bind = bind;
        }
        cfg.database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        if let Some(v) = env.parse::<u32>("DOCPIPE_RETRY_MAX_ATTEMPTS")? {
            cfg.retry_max_attempts = v.max(1);
        }
        if let Some(v) = env.millis("DOCPIPE_RETRY_BASE_DELAY_MS")? {
            cfg.retry_base_delay = v;
        }
        if let Some(v) = env.millis("DOCPIPE_RETRY_MAX_DELAY_MS")? {
            cfg.retry_max_delay = v;
        }
        if let Some(v) = env.parse::<f64>("DOCPIPE_RETRY_MULTIPLIER")? {
            cfg.retry_multiplier = env.check("DOCPIPE_RETRY_MULTIPLIER", v, v.is_finite() && v >= 1.0)?;
        }
        if let Some(v) = env.parse::<f64>("DOCPIPE_RETRY_JITTER")? {
            cfg.retry_jitter = env.check("DOCPIPE_RETRY_JITTER", v, (0.0..=1.0).contains(&v))?;
        }
        if let Some(v) = env.secs("DOCPIPE_STAGE_TIMEOUT_SECS")? {
            cfg.stage_timeout = (!v.is_zero()).then_some(v);
        }
        if let Some(v) = env.parse::<u64>("DOCPIPE_HEARTBEAT_INTERVAL_SECS")? {
            let v = env.check("DOCPIPE_HEARTBEAT_INTERVAL_SECS", v, v > 0)?;
            cfg.heartbeat_interval = Duration::from_secs(v);
        }
        if let Some(v) = env.secs("DOCPIPE_HEARTBEAT_TIMEOUT_SECS")? {
            cfg.heartbeat_timeout = v;
        }
        if let Some(v) = env.secs("DOCPIPE_HARD_TIMEOUT_SECS")? {
            cfg.hard_timeout = v;
        }
        if let Some(v) = env.parse::<u64>("DOCPIPE_MONITOR_SCAN_INTERVAL_SECS")? {
            let v = env.check("DOCPIPE_MONITOR_SCAN_INTERVAL_SECS", v, v > 0)?;
            cfg.monitor_scan_interval = Duration::from_secs(v);
        }
        if let Some(v) = env.parse::<u32>("DOCPIPE_MAX_RESUME_ATTEMPTS")? {
            cfg.max_resume_attempts = v;
        }
        if let Some(v) = env.parse::<u64>("DOCPIPE_WORKER_POLL_INTERVAL_MS")? {
            let v = env.check("DOCPIPE_WORKER_POLL_INTERVAL_MS", v, v > 0)?;
            cfg.worker_poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = env.parse::<usize>("DOCPIPE_WORKER_MAX_CONCURRENT")? {
            cfg.worker_max_concurrent = env.check("DOCPIPE_WORKER_MAX_CONCURRENT", v, v > 0)?;
        }
        if let Some(v) = env.parse::<usize>("DOCPIPE_STAGE_CONCURRENCY")? {
            cfg.stage_concurrency = env.check("DOCPIPE_STAGE_CONCURRENCY", v, v > 0)?;
        }
        if let Some(v) = env.parse::<usize>("DOCPIPE_SEARCH_OVERSAMPLE")? {
            cfg.search_oversample = env.check("DOCPIPE_SEARCH_OVERSAMPLE", v, v > 0)?;
        }

        Ok(cfg)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            multiplier: self.retry_multiplier,
            jitter: self.retry_jitter,
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            retry: self.retry_policy(),
            stage_timeout: self.stage_timeout,
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
        }
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            scan_interval: self.monitor_scan_interval,
            heartbeat_timeout: self.heartbeat_timeout,
            hard_timeout: self.hard_timeout,
            max_resume_attempts: self.max_resume_attempts,
        }
    }

    pub fn worker(&self) -> JobWorkerConfig {
        JobWorkerConfig::default()
            .with_max_concurrent(self.worker_max_concurrent)
            .with_poll_interval(self.worker_poll_interval)
    }

    pub fn ranking(&self) -> RankingConfig {
        RankingConfig {
            default_spaces: default_space_weights(),
            oversample: self.search_oversample,
            retry: self.retry_policy(),
        }
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        match (self.0)(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| ConfigError::Invalid { key, value: raw }),
        }
    }

    fn secs(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs))
    }

    fn millis(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }

    fn check<T: ToString>(&self, key: &'static str, value: T, ok: bool) -> Result<T, ConfigError> {
        if ok {
            Ok(value)
        } else {
            Err(ConfigError::Invalid {
                key,
                value: value.to_string(),
            })
        }
    }
}
