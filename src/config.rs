//! # Run configuration
//!
//! [`RunConfig`] is immutable once built. Every value is validated once, in
//! [`RunConfigBuilder::build`] (or [`RunConfig::from_json`], which goes
//! through the same builder), so the engine never has to re-check it.
//!
//! ```rust
//! use countweave::{OffsetResetPolicy, RunConfig};
//! use std::time::Duration;
//!
//! let config = RunConfig::builder("wordcount-live-test")
//!   .with_bootstrap_endpoint("memory://local")
//!   .with_commit_interval(Duration::from_millis(500))
//!   .with_offset_reset(OffsetResetPolicy::Earliest)
//!   .build()
//!   .unwrap();
//! assert_eq!(config.application_id(), "wordcount-live-test");
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::codec::Codec;
use crate::error::{EngineError, Result};
use crate::offset::OffsetResetPolicy;

/// Default commit interval.
pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_millis(30_000);
/// Default poll timeout.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// Default bootstrap endpoint.
pub const DEFAULT_BOOTSTRAP_ENDPOINT: &str = "localhost:9092";

/// Validated, immutable settings for one engine run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
  bootstrap_endpoint: String,
  application_id: String,
  state_directory: PathBuf,
  commit_interval: Duration,
  offset_reset: OffsetResetPolicy,
  key_codec: Codec,
  value_codec: Codec,
  poll_timeout: Duration,
  num_workers: usize,
  ephemeral_state: bool,
}

impl RunConfig {
  /// Starts a builder for the application `application_id`.
  pub fn builder(application_id: impl Into<String>) -> RunConfigBuilder {
    RunConfigBuilder::new(application_id)
  }

  /// Parses a JSON document. Durations are given in milliseconds:
  ///
  /// ```json
  /// { "application_id": "wordcount", "commit_interval_ms": 1000, "offset_reset": "earliest" }
  /// ```
  pub fn from_json(json: &str) -> Result<Self> {
    let file: ConfigFile =
      serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))?;
    file.into_builder().build()
  }

  /// Broker address.
  pub fn bootstrap_endpoint(&self) -> &str {
    &self.bootstrap_endpoint
  }

  /// Application id: names the state directory and the consumer group.
  pub fn application_id(&self) -> &str {
    &self.application_id
  }

  /// Root directory for state stores.
  pub fn state_directory(&self) -> &Path {
    &self.state_directory
  }

  /// `<state_directory>/<application_id>`.
  pub fn state_path(&self) -> PathBuf {
    self.state_directory.join(&self.application_id)
  }

  /// Interval between state flushes and offset commits.
  pub fn commit_interval(&self) -> Duration {
    self.commit_interval
  }

  /// Where to start when no offset is committed.
  pub fn offset_reset(&self) -> OffsetResetPolicy {
    self.offset_reset
  }

  /// Codec for keys read by sources.
  pub fn key_codec(&self) -> Codec {
    self.key_codec
  }

  /// Codec for values read by sources.
  pub fn value_codec(&self) -> Codec {
    self.value_codec
  }

  /// How long a poll waits for records.
  pub fn poll_timeout(&self) -> Duration {
    self.poll_timeout
  }

  /// Number of worker tasks.
  pub fn num_workers(&self) -> usize {
    self.num_workers
  }

  /// Whether the state directory is removed when the engine stops.
  pub fn ephemeral_state(&self) -> bool {
    self.ephemeral_state
  }
}

/// Builder for [`RunConfig`].
#[derive(Debug, Clone)]
pub struct RunConfigBuilder {
  bootstrap_endpoint: String,
  application_id: String,
  state_directory: PathBuf,
  commit_interval: Duration,
  offset_reset: OffsetResetPolicy,
  key_codec: Codec,
  value_codec: Codec,
  poll_timeout: Duration,
  num_workers: usize,
  ephemeral_state: bool,
}

impl RunConfigBuilder {
  fn new(application_id: impl Into<String>) -> Self {
    Self {
      bootstrap_endpoint: DEFAULT_BOOTSTRAP_ENDPOINT.to_string(),
      application_id: application_id.into(),
      state_directory: std::env::temp_dir().join("countweave"),
      commit_interval: DEFAULT_COMMIT_INTERVAL,
      offset_reset: OffsetResetPolicy::default(),
      key_codec: Codec::String,
      value_codec: Codec::String,
      poll_timeout: DEFAULT_POLL_TIMEOUT,
      num_workers: 1,
      ephemeral_state: false,
    }
  }

  /// Sets the broker address.
  pub fn with_bootstrap_endpoint(mut self, endpoint: impl Into<String>) -> Self {
    self.bootstrap_endpoint = endpoint.into();
    self
  }

  /// Sets the root directory for state stores.
  pub fn with_state_directory(mut self, dir: impl Into<PathBuf>) -> Self {
    self.state_directory = dir.into();
    self
  }

  /// Sets the commit interval. Must be non-zero.
  pub fn with_commit_interval(mut self, interval: Duration) -> Self {
    self.commit_interval = interval;
    self
  }

  /// Sets the offset reset policy.
  pub fn with_offset_reset(mut self, policy: OffsetResetPolicy) -> Self {
    self.offset_reset = policy;
    self
  }

  /// Sets the key codec used by sources.
  pub fn with_key_codec(mut self, codec: Codec) -> Self {
    self.key_codec = codec;
    self
  }

  /// Sets the value codec used by sources.
  pub fn with_value_codec(mut self, codec: Codec) -> Self {
    self.value_codec = codec;
    self
  }

  /// Sets the poll timeout. Must be non-zero.
  pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
    self.poll_timeout = timeout;
    self
  }

  /// Sets the number of worker tasks.
  pub fn with_num_workers(mut self, workers: usize) -> Self {
    self.num_workers = workers;
    self
  }

  /// Removes the state directory when the engine stops.
  pub fn with_ephemeral_state(mut self, ephemeral: bool) -> Self {
    self.ephemeral_state = ephemeral;
    self
  }

  /// Validates and freezes the configuration.
  pub fn build(self) -> Result<RunConfig> {
    if self.bootstrap_endpoint.trim().is_empty() {
      return Err(EngineError::Config(
        "bootstrap_endpoint must be non-empty".to_string(),
      ));
    }
    if self.application_id.trim().is_empty() {
      return Err(EngineError::Config(
        "application_id must be non-empty".to_string(),
      ));
    }
    if !self
      .application_id
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
      || self.application_id.starts_with('.')
    {
      return Err(EngineError::Config(format!(
        "application_id '{}' must only use letters, digits, '-', '_' or '.'",
        self.application_id
      )));
    }
    if self.commit_interval.is_zero() {
      return Err(EngineError::Config(
        "commit_interval must be greater than zero".to_string(),
      ));
    }
    if self.poll_timeout.is_zero() {
      return Err(EngineError::Config(
        "poll_timeout must be greater than zero".to_string(),
      ));
    }
    if self.num_workers == 0 {
      return Err(EngineError::Config(
        "num_workers must be at least 1".to_string(),
      ));
    }
    Ok(RunConfig {
      bootstrap_endpoint: self.bootstrap_endpoint,
      application_id: self.application_id,
      state_directory: self.state_directory,
      commit_interval: self.commit_interval,
      offset_reset: self.offset_reset,
      key_codec: self.key_codec,
      value_codec: self.value_codec,
      poll_timeout: self.poll_timeout,
      num_workers: self.num_workers,
      ephemeral_state: self.ephemeral_state,
    })
  }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
  application_id: String,
  bootstrap_endpoint: Option<String>,
  state_directory: Option<PathBuf>,
  commit_interval_ms: Option<u64>,
  offset_reset: Option<OffsetResetPolicy>,
  key_codec: Option<Codec>,
  value_codec: Option<Codec>,
  poll_timeout_ms: Option<u64>,
  num_workers: Option<usize>,
  ephemeral_state: Option<bool>,
}

impl ConfigFile {
  fn into_builder(self) -> RunConfigBuilder {
    let mut builder = RunConfigBuilder::new(self.application_id);
    if let Some(endpoint) = self.bootstrap_endpoint {
      builder = builder.with_bootstrap_endpoint(endpoint);
    }
    if let Some(dir) = self.state_directory {
      builder = builder.with_state_directory(dir);
    }
    if let Some(ms) = self.commit_interval_ms {
      builder = builder.with_commit_interval(Duration::from_millis(ms));
    }
    if let Some(policy) = self.offset_reset {
      builder = builder.with_offset_reset(policy);
    }
    if let Some(codec) = self.key_codec {
      builder = builder.with_key_codec(codec);
    }
    if let Some(codec) = self.value_codec {
      builder = builder.with_value_codec(codec);
    }
    if let Some(ms) = self.poll_timeout_ms {
      builder = builder.with_poll_timeout(Duration::from_millis(ms));
    }
    if let Some(workers) = self.num_workers {
      builder = builder.with_num_workers(workers);
    }
    if let Some(ephemeral) = self.ephemeral_state {
      builder = builder.with_ephemeral_state(ephemeral);
    }
    builder
  }
}
