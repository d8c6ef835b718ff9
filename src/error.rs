//! # Error taxonomy
//!
//! Build-time and start-up failures are returned as [`EngineError`] and fail
//! fast. Per-record failures are [`RecordProcessingError`] values: the engine
//! reports them to the configured error callback and keeps going, so one
//! poisoned record never halts a pipeline.
//!
//! | Error | When | Retryable |
//! |---|---|---|
//! | `InvalidTopology` | `TopologyBuilder::build` | no |
//! | `StorageUnavailable` | state store open / flush | no |
//! | `AdapterConnection` | source or sink lost its transport | no, stops the engine |
//! | `RecordProcessing` | one record failed in one node | recovered |
//! | `IllegalState` | lifecycle misuse (`start` twice, ...) | no |
//! | `Worker` | a worker task panicked | no, stops the engine |

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::adapter::AdapterError;
use crate::engine::EngineState;
use crate::message::Record;
use crate::offset::OffsetError;
use crate::state::StateError;

/// Result alias used across the crate.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Errors surfaced to callers of the builder, `start()`, `stop()` and `run_for()`.
#[derive(Debug, Error)]
pub enum EngineError {
  /// The declared topology is not executable.
  #[error("invalid topology: {0}")]
  InvalidTopology(String),

  /// The state directory cannot be created, read or written.
  #[error("state storage unavailable at {}: {reason}", .path.display())]
  StorageUnavailable {
    /// Directory or file that failed.
    path: PathBuf,
    /// Underlying cause.
    reason: String,
  },

  /// A source or sink adapter lost its connection. Fatal.
  #[error("adapter connection error: {0}")]
  AdapterConnection(AdapterError),

  /// A single record failed inside a node.
  #[error(transparent)]
  RecordProcessing(#[from] RecordProcessingError),

  /// Lifecycle misuse.
  #[error("illegal state: cannot {operation} an engine that is {state}")]
  IllegalState {
    /// The operation that was attempted.
    operation: &'static str,
    /// The state the engine was in.
    state: EngineState,
  },

  /// Invalid run configuration.
  #[error("configuration error: {0}")]
  Config(String),

  /// Offset bookkeeping failed.
  #[error("offset error: {0}")]
  Offset(#[from] OffsetError),

  /// A worker task panicked or was aborted.
  #[error("worker task failed: {0}")]
  Worker(String),
}

impl From<StateError> for EngineError {
  fn from(err: StateError) -> Self {
    let path = err.path().map(PathBuf::from).unwrap_or_default();
    EngineError::StorageUnavailable {
      path,
      reason: err.to_string(),
    }
  }
}

impl From<AdapterError> for EngineError {
  fn from(err: AdapterError) -> Self {
    EngineError::AdapterConnection(err)
  }
}

/// Identifies the topology node (or adapter) a failure happened in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentInfo {
  /// Node or adapter name, e.g. `"count-0004"`.
  pub name: String,
  /// Kind of component, e.g. `"Count"` or `"Sink"`.
  pub type_name: String,
}

impl ComponentInfo {
  /// Creates component information from a name and a type name.
  pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      type_name: type_name.into(),
    }
  }
}

impl fmt::Display for ComponentInfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ({})", self.name, self.type_name)
  }
}

/// When and on what a failure happened.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorContext {
  /// Time the failure was observed.
  pub timestamp: DateTime<Utc>,
  /// The record being processed, as it arrived at the failing node.
  pub record: Option<Record>,
}

impl ErrorContext {
  /// Context for a failure on `record`, stamped now.
  pub fn for_record(record: &Record) -> Self {
    Self {
      timestamp: Utc::now(),
      record: Some(record.clone()),
    }
  }
}

impl Default for ErrorContext {
  fn default() -> Self {
    Self {
      timestamp: Utc::now(),
      record: None,
    }
  }
}

/// A failure confined to one record in one node.
#[derive(Debug, Clone, Error)]
#[error("record processing failed in {component}: {message}")]
pub struct RecordProcessingError {
  /// When and on which record.
  pub context: ErrorContext,
  /// Which node.
  pub component: ComponentInfo,
  /// What went wrong.
  pub message: String,
}

impl RecordProcessingError {
  /// Creates a record-level error for `record` in `component`.
  pub fn new(record: &Record, component: ComponentInfo, message: impl Into<String>) -> Self {
    Self {
      context: ErrorContext::for_record(record),
      component,
      message: message.into(),
    }
  }

  /// The record that failed, if known.
  pub fn record(&self) -> Option<&Record> {
    self.context.record.as_ref()
  }
}
