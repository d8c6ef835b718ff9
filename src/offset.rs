//! Offset tracking for resumable processing.
//!
//! Every record a worker finishes is recorded here as *pending*; on each
//! commit interval the pending positions are written to an [`OffsetStore`]
//! (after the state store was flushed), which is where a restarted engine
//! resumes from. Committed offsets follow broker convention: the stored value
//! is the next offset to consume, i.e. last processed + 1.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::TopicPartition;
use crate::state::atomic_write;

/// A position within a topic partition.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Offset(pub u64);

impl Offset {
  /// Creates an offset from a sequence number.
  pub fn sequence(n: u64) -> Self {
    Offset(n)
  }

  /// The raw sequence number.
  pub fn value(self) -> u64 {
    self.0
  }

  /// The offset immediately after this one.
  #[must_use]
  pub fn next(self) -> Self {
    Offset(self.0 + 1)
  }
}

impl Display for Offset {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "seq:{}", self.0)
  }
}

/// Where to start reading when no committed offset exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetResetPolicy {
  /// Start from the beginning of the partition.
  Earliest,
  /// Start after the last record present when the source opens.
  #[default]
  Latest,
}

/// Resolved starting position handed to a source adapter when it opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
  /// The beginning of the partition.
  Earliest,
  /// The end of the partition at open time.
  Latest,
  /// A committed offset (next offset to consume).
  At(Offset),
}

/// Error type for offset operations.
#[derive(Debug, Error)]
pub enum OffsetError {
  /// IO error during persistence.
  #[error("IO error: {0}")]
  Io(#[from] io::Error),
  /// Serialization/deserialization error.
  #[error("Serialization error: {0}")]
  Serialization(String),
  /// Lock acquisition failed.
  #[error("Lock error: {0}")]
  Lock(String),
}

/// Result type for offset operations.
pub type OffsetResult<T> = Result<T, OffsetError>;

/// Trait for offset storage backends.
pub trait OffsetStore: Send + Sync + std::fmt::Debug {
  /// Get the committed offset for a partition.
  fn get(&self, tp: &TopicPartition) -> OffsetResult<Option<Offset>>;

  /// Commit a batch of offsets. Either all are stored or none.
  fn commit(&self, offsets: &HashMap<TopicPartition, Offset>) -> OffsetResult<()>;

  /// Get all committed offsets.
  fn get_all(&self) -> OffsetResult<HashMap<TopicPartition, Offset>>;
}

#[derive(Serialize, Deserialize)]
struct OffsetEntry {
  topic: String,
  partition: u32,
  offset: u64,
}

/// File-based offset store.
///
/// Persists all offsets as one JSON document, replaced atomically on every
/// commit.
#[derive(Debug, Clone)]
pub struct FileOffsetStore {
  path: PathBuf,
  cache: Arc<RwLock<HashMap<TopicPartition, Offset>>>,
}

impl FileOffsetStore {
  /// Opens (or creates on first commit) the offset file at `path`.
  pub fn new<P: AsRef<Path>>(path: P) -> OffsetResult<Self> {
    let path = path.as_ref().to_path_buf();

    let cache = if path.exists() {
      let data = fs::read_to_string(&path)?;
      if data.trim().is_empty() {
        HashMap::new()
      } else {
        let entries: Vec<OffsetEntry> = serde_json::from_str(&data)
          .map_err(|e| OffsetError::Serialization(e.to_string()))?;
        entries
          .into_iter()
          .map(|e| (TopicPartition::new(e.topic, e.partition), Offset(e.offset)))
          .collect()
      }
    } else {
      HashMap::new()
    };

    Ok(Self {
      path,
      cache: Arc::new(RwLock::new(cache)),
    })
  }

  fn persist(&self, offsets: &HashMap<TopicPartition, Offset>) -> OffsetResult<()> {
    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent)?;
    }

    let mut entries: Vec<OffsetEntry> = offsets
      .iter()
      .map(|(tp, o)| OffsetEntry {
        topic: tp.topic.clone(),
        partition: tp.partition,
        offset: o.0,
      })
      .collect();
    entries.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));

    let data = serde_json::to_vec_pretty(&entries)
      .map_err(|e| OffsetError::Serialization(e.to_string()))?;
    atomic_write(&self.path, &data)?;
    Ok(())
  }

  /// Returns the path to the offset file.
  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl OffsetStore for FileOffsetStore {
  fn get(&self, tp: &TopicPartition) -> OffsetResult<Option<Offset>> {
    let cache = self
      .cache
      .read()
      .map_err(|e| OffsetError::Lock(e.to_string()))?;
    Ok(cache.get(tp).copied())
  }

  fn commit(&self, batch: &HashMap<TopicPartition, Offset>) -> OffsetResult<()> {
    let mut cache = self
      .cache
      .write()
      .map_err(|e| OffsetError::Lock(e.to_string()))?;
    let mut next = cache.clone();
    next.extend(batch.iter().map(|(tp, o)| (tp.clone(), *o)));
    self.persist(&next)?;
    *cache = next;
    Ok(())
  }

  fn get_all(&self) -> OffsetResult<HashMap<TopicPartition, Offset>> {
    let cache = self
      .cache
      .read()
      .map_err(|e| OffsetError::Lock(e.to_string()))?;
    Ok(cache.clone())
  }
}

/// Tracks processed positions and commits them on request.
#[derive(Debug)]
pub struct OffsetTracker {
  store: Box<dyn OffsetStore>,
  reset_policy: OffsetResetPolicy,
  pending: RwLock<HashMap<TopicPartition, Offset>>,
}

impl OffsetTracker {
  /// Creates a tracker over `store` with the default reset policy.
  pub fn new(store: Box<dyn OffsetStore>) -> Self {
    Self {
      store,
      reset_policy: OffsetResetPolicy::default(),
      pending: RwLock::new(HashMap::new()),
    }
  }

  /// Sets the offset reset policy.
  #[must_use]
  pub fn with_reset_policy(mut self, policy: OffsetResetPolicy) -> Self {
    self.reset_policy = policy;
    self
  }

  /// Where a source for `tp` should start: its committed offset, or the
  /// reset policy when nothing was committed yet.
  pub fn start_position(&self, tp: &TopicPartition) -> OffsetResult<StartPosition> {
    Ok(match self.store.get(tp)? {
      Some(offset) => StartPosition::At(offset),
      None => match self.reset_policy {
        OffsetResetPolicy::Earliest => StartPosition::Earliest,
        OffsetResetPolicy::Latest => StartPosition::Latest,
      },
    })
  }

  /// Records that the record at `processed` has been fully handled.
  pub fn record(&self, tp: &TopicPartition, processed: Offset) -> OffsetResult<()> {
    let mut pending = self
      .pending
      .write()
      .map_err(|e| OffsetError::Lock(e.to_string()))?;
    let next = processed.next();
    let entry = pending.entry(tp.clone()).or_insert(next);
    if next > *entry {
      *entry = next;
    }
    Ok(())
  }

  /// Commits the pending offsets of the given partitions and returns what
  /// was committed. Partitions with nothing pending are skipped.
  pub fn commit(&self, partitions: &[TopicPartition]) -> OffsetResult<HashMap<TopicPartition, Offset>> {
    let batch: HashMap<TopicPartition, Offset> = {
      let pending = self
        .pending
        .read()
        .map_err(|e| OffsetError::Lock(e.to_string()))?;
      partitions
        .iter()
        .filter_map(|tp| pending.get(tp).map(|o| (tp.clone(), *o)))
        .collect()
    };
    if batch.is_empty() {
      return Ok(batch);
    }

    self.store.commit(&batch)?;

    let mut pending = self
      .pending
      .write()
      .map_err(|e| OffsetError::Lock(e.to_string()))?;
    for (tp, committed) in &batch {
      // Only drop the entry if nothing newer was recorded meanwhile.
      if pending.get(tp) == Some(committed) {
        pending.remove(tp);
      }
    }
    Ok(batch)
  }

  /// Commits every pending offset.
  pub fn commit_all(&self) -> OffsetResult<HashMap<TopicPartition, Offset>> {
    let partitions: Vec<TopicPartition> = {
      let pending = self
        .pending
        .read()
        .map_err(|e| OffsetError::Lock(e.to_string()))?;
      pending.keys().cloned().collect()
    };
    self.commit(&partitions)
  }

  /// Returns the current reset policy.
  pub fn reset_policy(&self) -> OffsetResetPolicy {
    self.reset_policy
  }

  /// Gets all committed offsets.
  pub fn committed(&self) -> OffsetResult<HashMap<TopicPartition, Offset>> {
    self.store.get_all()
  }

  /// Gets all pending offsets (not yet committed).
  pub fn pending(&self) -> OffsetResult<HashMap<TopicPartition, Offset>> {
    let pending = self
      .pending
      .read()
      .map_err(|e| OffsetError::Lock(e.to_string()))?;
    Ok(pending.clone())
  }
}
