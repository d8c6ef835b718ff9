//! Records, payloads and topics.
//!
//! A [`Record`] is the unit that flows through a topology. It is created by a
//! source adapter (or by a stage deriving a new record from an upstream one)
//! and never mutated afterwards: stages that change the key or value build a
//! new record with [`Record::with_key`] / [`Record::with_value`].
//!
//! # Example
//!
//! ```rust
//! use countweave::message::{Payload, Record};
//!
//! let a = Record::of("inputTopic", None, "the fox");
//! let b = Record::new("inputTopic", 3, 17, None, Payload::from("the fox"));
//!
//! // Equality ignores partition and offset.
//! assert_eq!(a, b);
//! ```

use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Value carried by a record.
///
/// Text flows out of sources and text transforms; counts flow out of
/// aggregate nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Payload {
  /// A text value.
  Text(String),
  /// A 64-bit unsigned count.
  Count(u64),
}

impl Payload {
  /// Returns the text value, if this is a text payload.
  pub fn as_text(&self) -> Option<&str> {
    match self {
      Payload::Text(s) => Some(s),
      Payload::Count(_) => None,
    }
  }

  /// Returns the count, if this is a count payload.
  pub fn as_count(&self) -> Option<u64> {
    match self {
      Payload::Count(n) => Some(*n),
      Payload::Text(_) => None,
    }
  }

  /// Short type name used in error messages.
  pub fn kind(&self) -> &'static str {
    match self {
      Payload::Text(_) => "text",
      Payload::Count(_) => "count",
    }
  }
}

impl Display for Payload {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Payload::Text(s) => write!(f, "{}", s),
      Payload::Count(n) => write!(f, "{}", n),
    }
  }
}

impl From<String> for Payload {
  fn from(s: String) -> Self {
    Payload::Text(s)
  }
}

impl From<&str> for Payload {
  fn from(s: &str) -> Self {
    Payload::Text(s.to_string())
  }
}

impl From<u64> for Payload {
  fn from(n: u64) -> Self {
    Payload::Count(n)
  }
}

/// A named logical channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
  /// Creates a topic, rejecting empty (or whitespace-only) names.
  pub fn new(name: impl Into<String>) -> Result<Self, EngineError> {
    let name = name.into();
    if name.trim().is_empty() {
      return Err(EngineError::InvalidTopology(
        "topic names must be non-empty".to_string(),
      ));
    }
    Ok(Self(name))
  }

  /// Returns the topic name.
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl Display for Topic {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl AsRef<str> for Topic {
  fn as_ref(&self) -> &str {
    &self.0
  }
}

/// A single partition of a topic: the unit of offset bookkeeping and of
/// worker assignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
  /// Topic name.
  pub topic: String,
  /// Partition index within the topic.
  pub partition: u32,
}

impl TopicPartition {
  /// Creates a topic partition.
  pub fn new(topic: impl Into<String>, partition: u32) -> Self {
    Self {
      topic: topic.into(),
      partition,
    }
  }
}

impl Display for TopicPartition {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "{}-{}", self.topic, self.partition)
  }
}

/// An immutable key-value record.
///
/// Equality and hashing use `(topic, key, value)` only; partition and offset
/// are positional metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
  topic: String,
  partition: u32,
  offset: u64,
  key: Option<String>,
  value: Payload,
}

impl Record {
  /// Creates a record on partition 0 at offset 0.
  pub fn of(topic: impl Into<String>, key: Option<&str>, value: impl Into<Payload>) -> Self {
    Self::new(topic, 0, 0, key.map(str::to_string), value.into())
  }

  /// Creates a record with full positional metadata.
  pub fn new(
    topic: impl Into<String>,
    partition: u32,
    offset: u64,
    key: Option<String>,
    value: Payload,
  ) -> Self {
    Self {
      topic: topic.into(),
      partition,
      offset,
      key,
      value,
    }
  }

  /// Topic the record was read from or is addressed to.
  pub fn topic(&self) -> &str {
    &self.topic
  }

  /// Partition within the topic.
  pub fn partition(&self) -> u32 {
    self.partition
  }

  /// Position of the record within its partition.
  pub fn offset(&self) -> u64 {
    self.offset
  }

  /// The record key, if any.
  pub fn key(&self) -> Option<&str> {
    self.key.as_deref()
  }

  /// The record value.
  pub fn value(&self) -> &Payload {
    &self.value
  }

  /// The topic partition this record belongs to.
  pub fn topic_partition(&self) -> TopicPartition {
    TopicPartition::new(self.topic.clone(), self.partition)
  }

  /// Derives a record with the same position and key but a new value.
  #[must_use]
  pub fn with_value(&self, value: impl Into<Payload>) -> Self {
    Self {
      topic: self.topic.clone(),
      partition: self.partition,
      offset: self.offset,
      key: self.key.clone(),
      value: value.into(),
    }
  }

  /// Derives a record with the same position and value but a new key.
  #[must_use]
  pub fn with_key(&self, key: impl Into<String>) -> Self {
    Self {
      topic: self.topic.clone(),
      partition: self.partition,
      offset: self.offset,
      key: Some(key.into()),
      value: self.value.clone(),
    }
  }

  /// Readdresses the record to another topic, keeping key and value.
  #[must_use]
  pub fn with_topic(&self, topic: impl Into<String>) -> Self {
    Self {
      topic: topic.into(),
      partition: self.partition,
      offset: self.offset,
      key: self.key.clone(),
      value: self.value.clone(),
    }
  }
}

impl PartialEq for Record {
  fn eq(&self, other: &Self) -> bool {
    self.topic == other.topic && self.key == other.key && self.value == other.value
  }
}

impl Eq for Record {}

impl Hash for Record {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.topic.hash(state);
    self.key.hash(state);
    self.value.hash(state);
  }
}

impl Display for Record {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}@{}: ({}, {})",
      self.topic_partition(),
      self.offset,
      self.key.as_deref().unwrap_or("<none>"),
      self.value
    )
  }
}
