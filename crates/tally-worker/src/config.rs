//! Worker configuration, read from a TOML file and `TALLY_*` environment
//! variables.

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::{Context as _, bail};
use serde::Deserialize;
use tally_core::{
  course_grade::DEFAULT_GRADE_EPSILON, gamification::GamificationConfig, ids::CourseId,
  time::ReportingZone,
};
use tally_engine::{EngineConfig, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  pub store_path:         PathBuf,
  /// Concurrent job consumers.
  pub workers:            usize,
  pub queue_capacity:     usize,
  /// Seconds between scheduled rollup passes.
  pub tick_secs:          u64,
  pub job_timeout_secs:   u64,
  /// Offset of the reporting zone from UTC. Rollup dates and cut-offs are
  /// local to it.
  pub utc_offset_minutes: i32,
  pub grade_epsilon:      f64,
  pub retry:              RetryConfig,
  pub gamification:       GamificationConfig,
  /// Restrict scheduled rollups to these courses. All courses when unset.
  pub courses:            Option<Vec<CourseId>>,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      store_path:         PathBuf::from("~/.local/share/tally/tally.db"),
      workers:            4,
      queue_capacity:     256,
      tick_secs:          3600,
      job_timeout_secs:   30,
      utc_offset_minutes: 0,
      grade_epsilon:      DEFAULT_GRADE_EPSILON,
      retry:              RetryConfig::default(),
      gamification:       GamificationConfig::default(),
      courses:            None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_attempts:  u32,
  pub base_delay_ms: u64,
  pub max_delay_ms:  u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    let policy = RetryPolicy::default();
    Self {
      max_attempts:  policy.max_attempts,
      base_delay_ms: u64::try_from(policy.base_delay.as_millis()).unwrap_or(u64::MAX),
      max_delay_ms:  u64::try_from(policy.max_delay.as_millis()).unwrap_or(u64::MAX),
    }
  }
}

impl WorkerConfig {
  /// Layer `TALLY_*` environment variables over the file at `path`. A missing
  /// file is fine; every field has a default.
  ///
  /// Nested keys use a double underscore: `TALLY_RETRY__MAX_ATTEMPTS=5`.
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(
        config::Environment::with_prefix("TALLY")
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true),
      )
      .build()
      .context("failed to read config file")?;

    settings
      .try_deserialize()
      .context("failed to deserialise WorkerConfig")
  }

  pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
    let Some(zone) = ReportingZone::from_offset_minutes(self.utc_offset_minutes) else {
      bail!("utc_offset_minutes out of range: {}", self.utc_offset_minutes);
    };
    if self.workers == 0 {
      bail!("workers must be at least 1");
    }
    if !self.grade_epsilon.is_finite() || self.grade_epsilon < 0.0 {
      bail!("grade_epsilon must be a non-negative number");
    }

    Ok(EngineConfig {
      retry: RetryPolicy {
        max_attempts: self.retry.max_attempts,
        base_delay:   Duration::from_millis(self.retry.base_delay_ms),
        max_delay:    Duration::from_millis(self.retry.max_delay_ms),
      },
      job_timeout: Duration::from_secs(self.job_timeout_secs),
      grade_epsilon: self.grade_epsilon,
      zone,
      gamification: self.gamification.clone(),
    })
  }

  /// The store path with a leading `~` expanded.
  pub fn resolved_store_path(&self) -> PathBuf { expand_tilde(&self.store_path) }

  pub fn tick(&self) -> Duration { Duration::from_secs(self.tick_secs.max(1)) }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(toml: &str) -> WorkerConfig {
    config::Config::builder()
      .add_source(config::File::from_str(toml, config::FileFormat::Toml))
      .build()
      .unwrap()
      .try_deserialize()
      .unwrap()
  }

  #[test]
  fn empty_file_gives_defaults() {
    assert_eq!(parse(""), WorkerConfig::default());
  }

  #[test]
  fn nested_tables_override_defaults() {
    let config = parse(
      r#"
        store_path = "/var/lib/tally.db"
        workers = 2
        utc_offset_minutes = -300
        courses = [1, 4]

        [retry]
        max_attempts = 5

        [gamification]
        success_threshold = 0.75
      "#,
    );

    assert_eq!(config.store_path, PathBuf::from("/var/lib/tally.db"));
    assert_eq!(config.workers, 2);
    assert_eq!(config.courses, Some(vec![1, 4]));
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.base_delay_ms, RetryConfig::default().base_delay_ms);
    assert_eq!(config.gamification.success_threshold, 0.75);
    assert_eq!(config.gamification.xp_per_point, GamificationConfig::default().xp_per_point);

    let engine = config.engine_config().unwrap();
    assert_eq!(engine.retry.max_attempts, 5);
    assert_eq!(engine.zone.offset().local_minus_utc(), -300 * 60);
  }

  #[test]
  fn out_of_range_offset_is_rejected() {
    let config = WorkerConfig { utc_offset_minutes: 24 * 60, ..WorkerConfig::default() };
    assert!(config.engine_config().is_err());
  }

  #[test]
  fn zero_workers_is_rejected() {
    let config = WorkerConfig { workers: 0, ..WorkerConfig::default() };
    assert!(config.engine_config().is_err());
  }

  #[test]
  fn absolute_store_path_is_untouched() {
    let config = WorkerConfig { store_path: "/tmp/tally.db".into(), ..WorkerConfig::default() };
    assert_eq!(config.resolved_store_path(), PathBuf::from("/tmp/tally.db"));
  }
}
