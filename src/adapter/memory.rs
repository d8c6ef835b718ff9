//! # In-process broker
//!
//! [`MemoryBroker`] keeps topics as partitioned logs of encoded messages and
//! remembers the offsets each consumer group committed. [`MemorySource`] and
//! [`MemorySink`] implement the adapter traits on top of it using the same
//! codecs a network client would, so topologies exercised here see exactly
//! the bytes they would see on a real transport.
//!
//! A broker can be [disconnected](MemoryBroker::disconnect) to simulate a lost
//! connection: every adapter call then fails with
//! [`AdapterError::Connection`].

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::{Ack, AdapterError, SinkAdapter, SourceAdapter};
use crate::codec::{Codec, CodecError};
use crate::config::RunConfig;
use crate::message::{Record, TopicPartition};
use crate::node::Produced;
use crate::offset::{Offset, StartPosition};

/// Largest batch a single poll returns.
pub const MAX_POLL_RECORDS: usize = 500;

/// A message as stored on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
  /// Encoded key.
  pub key: Option<Vec<u8>>,
  /// Encoded value.
  pub value: Vec<u8>,
}

#[derive(Debug)]
struct BrokerInner {
  endpoint: String,
  topics: Mutex<HashMap<String, Vec<Vec<StoredMessage>>>>,
  group_offsets: Mutex<HashMap<(String, TopicPartition), Offset>>,
  connected: AtomicBool,
  appended: Notify,
}

/// An in-process, partitioned message log.
///
/// Clones share the same broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
  inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryBroker {
  /// Creates an empty, connected broker.
  pub fn new() -> Self {
    Self::with_endpoint("memory://local")
  }

  /// Creates a broker reporting `endpoint` in connection errors.
  pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
    Self {
      inner: Arc::new(BrokerInner {
        endpoint: endpoint.into(),
        topics: Mutex::new(HashMap::new()),
        group_offsets: Mutex::new(HashMap::new()),
        connected: AtomicBool::new(true),
        appended: Notify::new(),
      }),
    }
  }

  fn topics(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<Vec<StoredMessage>>>>, AdapterError> {
    self
      .inner
      .topics
      .lock()
      .map_err(|_| AdapterError::Io("broker lock poisoned".to_string()))
  }

  fn ensure_connected(&self) -> Result<(), AdapterError> {
    if self.inner.connected.load(Ordering::Acquire) {
      Ok(())
    } else {
      Err(AdapterError::Connection {
        endpoint: self.inner.endpoint.clone(),
        reason: "broker unreachable".to_string(),
      })
    }
  }

  /// Creates `topic` with `partitions` partitions. Existing topics are only
  /// ever grown.
  pub fn create_topic(&self, topic: &str, partitions: u32) {
    if let Ok(mut topics) = self.topics() {
      let logs = topics.entry(topic.to_string()).or_default();
      while logs.len() < partitions.max(1) as usize {
        logs.push(Vec::new());
      }
    }
  }

  /// Number of partitions of `topic`, 0 if it does not exist.
  pub fn partitions(&self, topic: &str) -> u32 {
    self
      .topics()
      .map(|t| t.get(topic).map_or(0, |p| p.len() as u32))
      .unwrap_or(0)
  }

  /// Appends an encoded message. Unknown topics are created with one
  /// partition.
  pub fn produce(
    &self,
    topic: &str,
    partition: u32,
    key: Option<Vec<u8>>,
    value: Vec<u8>,
  ) -> Result<Offset, AdapterError> {
    self.ensure_connected()?;
    let offset = {
      let mut topics = self.topics()?;
      let logs = topics
        .entry(topic.to_string())
        .or_insert_with(|| vec![Vec::new()]);
      let log = logs
        .get_mut(partition as usize)
        .ok_or_else(|| AdapterError::Rejected {
          topic: topic.to_string(),
          reason: format!("partition {} does not exist", partition),
        })?;
      log.push(StoredMessage { key, value });
      Offset((log.len() - 1) as u64)
    };
    self.inner.appended.notify_waiters();
    Ok(offset)
  }

  /// Appends a string-encoded text record to partition 0.
  pub fn produce_text(
    &self,
    topic: &str,
    key: Option<&str>,
    value: &str,
  ) -> Result<Offset, AdapterError> {
    self.produce(
      topic,
      0,
      key.map(|k| k.as_bytes().to_vec()),
      value.as_bytes().to_vec(),
    )
  }

  /// Raw messages of one partition.
  pub fn messages(&self, topic: &str, partition: u32) -> Vec<StoredMessage> {
    self
      .topics()
      .ok()
      .and_then(|t| t.get(topic).and_then(|p| p.get(partition as usize).cloned()))
      .unwrap_or_default()
  }

  /// Up to `max` messages of a partition starting at offset `from`, plus the
  /// partition's end offset. Copies only the requested slice.
  pub fn fetch(&self, topic: &str, partition: u32, from: u64, max: usize) -> (Vec<StoredMessage>, u64) {
    let Ok(topics) = self.topics() else {
      return (Vec::new(), 0);
    };
    let Some(log) = topics.get(topic).and_then(|p| p.get(partition as usize)) else {
      return (Vec::new(), 0);
    };
    let start = (from as usize).min(log.len());
    let end = start.saturating_add(max).min(log.len());
    (log[start..end].to_vec(), log.len() as u64)
  }

  /// Offset the next message of a partition will get.
  pub fn end_offset(&self, topic: &str, partition: u32) -> Offset {
    Offset(self.fetch(topic, partition, u64::MAX, 0).1)
  }

  /// Decodes every message of `topic`, partition by partition.
  pub fn read(
    &self,
    topic: &str,
    key_codec: Codec,
    value_codec: Codec,
  ) -> Result<Vec<Record>, CodecError> {
    let mut records = Vec::new();
    for partition in 0..self.partitions(topic) {
      for (offset, msg) in self.messages(topic, partition).iter().enumerate() {
        records.push(decode(topic, partition, offset as u64, msg, key_codec, value_codec)?);
      }
    }
    Ok(records)
  }

  /// Latest count per key of a count topic (string keys, long values).
  pub fn latest_counts(&self, topic: &str) -> Result<HashMap<String, u64>, CodecError> {
    let mut latest = HashMap::new();
    for record in self.read(topic, Codec::String, Codec::Long)? {
      if let (Some(key), Some(count)) = (record.key(), record.value().as_count()) {
        latest.insert(key.to_string(), count);
      }
    }
    Ok(latest)
  }

  /// Offset committed by `group` for a partition.
  pub fn committed(&self, group: &str, tp: &TopicPartition) -> Option<Offset> {
    self
      .inner
      .group_offsets
      .lock()
      .ok()
      .and_then(|g| g.get(&(group.to_string(), tp.clone())).copied())
  }

  /// Makes every adapter call fail with a connection error.
  pub fn disconnect(&self) {
    self.inner.connected.store(false, Ordering::Release);
    self.inner.appended.notify_waiters();
  }

  /// Restores connectivity.
  pub fn reconnect(&self) {
    self.inner.connected.store(true, Ordering::Release);
  }

  /// Whether the broker is reachable.
  pub fn is_connected(&self) -> bool {
    self.inner.connected.load(Ordering::Acquire)
  }

  /// A source for one partition of `topic`, consuming as the configured
  /// application with the configured codecs.
  pub fn source(&self, config: &RunConfig, topic: &str, partition: u32) -> MemorySource {
    MemorySource {
      broker: self.clone(),
      tp: TopicPartition::new(topic, partition),
      group: config.application_id().to_string(),
      key_codec: config.key_codec(),
      value_codec: config.value_codec(),
      position: None,
      bounded: false,
      exhausted: false,
    }
  }

  /// A sink writing to this broker.
  pub fn sink(&self) -> MemorySink {
    MemorySink {
      broker: self.clone(),
      closed: AtomicBool::new(false),
    }
  }
}

fn decode(
  topic: &str,
  partition: u32,
  offset: u64,
  msg: &StoredMessage,
  key_codec: Codec,
  value_codec: Codec,
) -> Result<Record, CodecError> {
  let key = msg
    .key
    .as_deref()
    .map(|k| key_codec.decode_key(k))
    .transpose()?;
  let value = value_codec.decode(&msg.value)?;
  Ok(Record::new(topic, partition, offset, key, value))
}

/// Reads one partition of a [`MemoryBroker`] topic.
#[derive(Debug)]
pub struct MemorySource {
  broker: MemoryBroker,
  tp: TopicPartition,
  group: String,
  key_codec: Codec,
  value_codec: Codec,
  position: Option<u64>,
  bounded: bool,
  exhausted: bool,
}

impl MemorySource {
  /// Ends the input once the source has caught up with the partition, as if
  /// the topic were a finite file.
  #[must_use]
  pub fn bounded(mut self) -> Self {
    self.bounded = true;
    self
  }

  /// Next offset this source will read, once opened.
  pub fn position(&self) -> Option<Offset> {
    self.position.map(Offset)
  }

  fn fetch(&mut self) -> Result<Vec<Record>, AdapterError> {
    self.broker.ensure_connected()?;
    let mut position = self.position.ok_or(AdapterError::Closed)?;
    let (messages, end) = self
      .broker
      .fetch(&self.tp.topic, self.tp.partition, position, MAX_POLL_RECORDS);

    let mut batch = Vec::with_capacity(messages.len());
    for msg in &messages {
      match decode(
        &self.tp.topic,
        self.tp.partition,
        position,
        msg,
        self.key_codec,
        self.value_codec,
      ) {
        Ok(record) => batch.push(record),
        Err(e) => warn!(
          topic = %self.tp,
          offset = position,
          error = %e,
          "skipping undecodable message"
        ),
      }
      position += 1;
    }
    self.position = Some(position);
    if self.bounded && position >= end && batch.is_empty() {
      self.exhausted = true;
    }
    Ok(batch)
  }
}

#[async_trait]
impl SourceAdapter for MemorySource {
  fn topic_partition(&self) -> TopicPartition {
    self.tp.clone()
  }

  async fn open(&mut self, start: StartPosition) -> Result<(), AdapterError> {
    self.broker.ensure_connected()?;
    if self.broker.partitions(&self.tp.topic) <= self.tp.partition {
      self.broker.create_topic(&self.tp.topic, self.tp.partition + 1);
    }
    let end = self.broker.end_offset(&self.tp.topic, self.tp.partition).value();
    let position = match start {
      StartPosition::Earliest => 0,
      StartPosition::Latest => end,
      StartPosition::At(offset) => offset.value().min(end),
    };
    debug!(topic = %self.tp, group = %self.group, position, "memory source opened");
    self.position = Some(position);
    self.exhausted = false;
    Ok(())
  }

  async fn poll(&mut self, timeout: Duration) -> Result<Vec<Record>, AdapterError> {
    let inner = Arc::clone(&self.broker.inner);
    // Registered before the first fetch so an append in between is not missed.
    let appended = inner.appended.notified();

    let batch = self.fetch()?;
    if !batch.is_empty() || self.bounded {
      return Ok(batch);
    }
    let _ = tokio::time::timeout(timeout, appended).await;
    self.fetch()
  }

  async fn commit(&mut self, next: Offset) -> Result<(), AdapterError> {
    self.broker.ensure_connected()?;
    let mut offsets = self
      .broker
      .inner
      .group_offsets
      .lock()
      .map_err(|_| AdapterError::Io("broker lock poisoned".to_string()))?;
    offsets.insert((self.group.clone(), self.tp.clone()), next);
    Ok(())
  }

  async fn close(&mut self) -> Result<(), AdapterError> {
    self.position = None;
    Ok(())
  }

  fn is_exhausted(&self) -> bool {
    self.exhausted
  }
}

/// Writes to a [`MemoryBroker`]. Records are spread over a topic's
/// partitions by key hash.
#[derive(Debug)]
pub struct MemorySink {
  broker: MemoryBroker,
  closed: AtomicBool,
}

impl MemorySink {
  fn partition_for(&self, topic: &str, key: Option<&str>) -> u32 {
    let partitions = self.broker.partitions(topic).max(1);
    match key {
      Some(key) => {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % partitions as u64) as u32
      }
      None => 0,
    }
  }
}

#[async_trait]
impl SinkAdapter for MemorySink {
  async fn send(&self, topic: &str, record: Record, produced: Produced) -> Result<Ack, AdapterError> {
    if self.closed.load(Ordering::Acquire) {
      return Err(AdapterError::Closed);
    }
    self.broker.ensure_connected()?;
    let rejected = |e: CodecError| AdapterError::Rejected {
      topic: topic.to_string(),
      reason: e.to_string(),
    };
    let key = record
      .key()
      .map(|k| produced.key_codec.encode_key(k))
      .transpose()
      .map_err(rejected)?;
    let value = produced.value_codec.encode(record.value()).map_err(rejected)?;

    let partition = self.partition_for(topic, record.key());
    let offset = self.broker.produce(topic, partition, key, value)?;
    Ok(Ack {
      topic_partition: TopicPartition::new(topic, partition),
      offset,
    })
  }

  async fn flush(&self) -> Result<(), AdapterError> {
    if self.closed.load(Ordering::Acquire) {
      return Err(AdapterError::Closed);
    }
    self.broker.ensure_connected()
  }

  async fn close(&self) -> Result<(), AdapterError> {
    self.closed.store(true, Ordering::Release);
    Ok(())
  }
}
