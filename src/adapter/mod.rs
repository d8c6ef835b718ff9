//! # Adapters
//!
//! The engine talks to transports only through these two traits.
//!
//! - [`SourceAdapter`] reads one topic partition. Each source is owned by a
//!   single worker, so its methods take `&mut self`.
//! - [`SinkAdapter`] writes to any declared sink topic. One sink is shared by
//!   all workers, so its methods take `&self` and implementations synchronize
//!   internally.
//!
//! [`memory`] provides an in-process broker implementing both.
//!
//! ## Errors
//!
//! [`AdapterError::Rejected`] concerns a single record and is reported like
//! any other per-record failure. Every other variant is fatal for the run.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::{Record, TopicPartition};
use crate::node::Produced;
use crate::offset::{Offset, StartPosition};

pub mod memory;

/// Error type for adapter operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
  /// The transport is unreachable.
  #[error("connection to {endpoint} failed: {reason}")]
  Connection {
    /// Broker address.
    endpoint: String,
    /// Failure description.
    reason: String,
  },
  /// The transport refused one record.
  #[error("record rejected by topic {topic}: {reason}")]
  Rejected {
    /// Destination topic.
    topic: String,
    /// Why it was refused.
    reason: String,
  },
  /// The adapter was closed (or never opened).
  #[error("adapter is closed")]
  Closed,
  /// Local IO failure.
  #[error("adapter IO error: {0}")]
  Io(String),
}

impl AdapterError {
  /// Whether the error ends the run. Only a rejected record is recoverable.
  pub fn is_fatal(&self) -> bool {
    !matches!(self, AdapterError::Rejected { .. })
  }
}

/// Acknowledgement of a record accepted by a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
  /// Topic partition the record was appended to.
  pub topic_partition: TopicPartition,
  /// Offset it was assigned.
  pub offset: Offset,
}

/// Reads records from one topic partition.
#[async_trait]
pub trait SourceAdapter: Send {
  /// The partition this source reads.
  fn topic_partition(&self) -> TopicPartition;

  /// Connects and positions the source.
  async fn open(&mut self, start: StartPosition) -> Result<(), AdapterError>;

  /// Returns the next batch of records, or an empty batch once `timeout`
  /// elapses without new data.
  async fn poll(&mut self, timeout: Duration) -> Result<Vec<Record>, AdapterError>;

  /// Records `next` (the next offset to consume) as committed.
  async fn commit(&mut self, next: Offset) -> Result<(), AdapterError>;

  /// Releases the source.
  async fn close(&mut self) -> Result<(), AdapterError>;

  /// Whether a bounded source has delivered all of its input.
  fn is_exhausted(&self) -> bool {
    false
  }
}

/// Writes records to sink topics.
#[async_trait]
pub trait SinkAdapter: Send + Sync {
  /// Encodes `record` with `produced` and appends it to `topic`.
  async fn send(&self, topic: &str, record: Record, produced: Produced) -> Result<Ack, AdapterError>;

  /// Waits until every sent record is durable on the transport.
  async fn flush(&self) -> Result<(), AdapterError>;

  /// Flushes and releases the sink.
  async fn close(&self) -> Result<(), AdapterError>;
}
