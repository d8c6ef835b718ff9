//! Durable, namespaced counter store backing aggregations.
//!
//! A [`StateStore`] owns one directory (`<state_dir>/<application_id>`) and
//! any number of counter namespaces, one per aggregate node. Each namespace is
//! persisted as a single segment file `<namespace>.counters` holding one JSON
//! line per counter, in order of first observation.
//!
//! **Concurrency:** keys are spread over a fixed set of lock shards. Distinct
//! keys in distinct shards are incremented in parallel; increments of the same
//! key are serialized by its shard lock, so totals are exact.
//!
//! **Durability:** [`StateStore::flush`] rewrites dirty segments through a
//! temporary file, `fsync` and an atomic rename, so a crash leaves either the
//! previous or the new segment on disk, never a torn one. Temporary files left
//! behind by an interrupted flush are removed on the next open.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Number of lock shards per namespace.
pub const DEFAULT_SHARDS: usize = 16;

const SEGMENT_EXTENSION: &str = "counters";
const TMP_SUFFIX: &str = ".tmp";

/// Error type for state store operations.
#[derive(Debug, Error)]
pub enum StateError {
  /// The directory or a segment could not be created, read or written.
  #[error("cannot use {}: {source}", .path.display())]
  Unavailable {
    /// Path that failed.
    path: PathBuf,
    /// Underlying IO error.
    #[source]
    source: io::Error,
  },
  /// A segment file is not in the expected format.
  #[error("corrupt segment {} at line {line}: {reason}", .path.display())]
  Corrupt {
    /// Segment path.
    path: PathBuf,
    /// 1-based line number.
    line: usize,
    /// Parser message.
    reason: String,
  },
  /// Namespace names must be usable as file names.
  #[error("invalid namespace '{0}': use letters, digits, '-', '_' or '.'")]
  InvalidNamespace(String),
  /// The store was closed.
  #[error("state store is closed")]
  Closed,
  /// A shard lock was poisoned by a panicking writer.
  #[error("state lock is poisoned")]
  LockPoisoned,
}

impl StateError {
  /// The path involved in the failure, if any.
  pub fn path(&self) -> Option<&Path> {
    match self {
      StateError::Unavailable { path, .. } | StateError::Corrupt { path, .. } => Some(path),
      _ => None,
    }
  }
}

fn unavailable(path: &Path) -> impl FnOnce(io::Error) -> StateError + '_ {
  move |source| StateError::Unavailable {
    path: path.to_path_buf(),
    source,
  }
}

/// A counter: how many records were observed for a group key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Counter {
  /// The group key.
  pub key: String,
  /// Number of increments observed.
  pub count: u64,
}

impl Counter {
  /// Creates a counter.
  pub fn new(key: impl Into<String>, count: u64) -> Self {
    Self {
      key: key.into(),
      count,
    }
  }
}

/// Point-in-time view of a namespace, in insertion order of first observation.
///
/// Iterating does not consume the snapshot; [`Snapshot::iter`] can be called
/// any number of times.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
  counters: Vec<Counter>,
}

impl Snapshot {
  /// Iterates the counters in insertion order.
  pub fn iter(&self) -> std::slice::Iter<'_, Counter> {
    self.counters.iter()
  }

  /// Number of distinct keys.
  pub fn len(&self) -> usize {
    self.counters.len()
  }

  /// Whether no key has been observed.
  pub fn is_empty(&self) -> bool {
    self.counters.is_empty()
  }

  /// The count for `key`, if observed.
  pub fn get(&self, key: &str) -> Option<u64> {
    self.counters.iter().find(|c| c.key == key).map(|c| c.count)
  }

  /// Sum of all counts.
  pub fn total(&self) -> u64 {
    self.counters.iter().map(|c| c.count).sum()
  }

  /// Key -> count map.
  pub fn to_map(&self) -> HashMap<String, u64> {
    self
      .counters
      .iter()
      .map(|c| (c.key.clone(), c.count))
      .collect()
  }
}

impl IntoIterator for Snapshot {
  type Item = Counter;
  type IntoIter = std::vec::IntoIter<Counter>;

  fn into_iter(self) -> Self::IntoIter {
    self.counters.into_iter()
  }
}

impl<'a> IntoIterator for &'a Snapshot {
  type Item = &'a Counter;
  type IntoIter = std::slice::Iter<'a, Counter>;

  fn into_iter(self) -> Self::IntoIter {
    self.counters.iter()
  }
}

#[derive(Debug)]
struct Entry {
  count: u64,
  first_seen: u64,
}

#[derive(Serialize, Deserialize)]
struct SegmentLine {
  key: String,
  count: u64,
}

/// Counters of a single aggregate node.
#[derive(Debug)]
pub struct CounterNamespace {
  name: String,
  shards: Vec<Mutex<HashMap<String, Entry>>>,
  sequence: AtomicU64,
  dirty: AtomicBool,
  closed: Arc<AtomicBool>,
}

impl CounterNamespace {
  fn new(name: String, closed: Arc<AtomicBool>) -> Self {
    Self {
      name,
      shards: (0..DEFAULT_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
      sequence: AtomicU64::new(0),
      dirty: AtomicBool::new(false),
      closed,
    }
  }

  /// The namespace name.
  pub fn name(&self) -> &str {
    &self.name
  }

  fn shard(&self, key: &str) -> &Mutex<HashMap<String, Entry>> {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    &self.shards[(hasher.finish() % self.shards.len() as u64) as usize]
  }

  fn ensure_open(&self) -> Result<(), StateError> {
    if self.closed.load(Ordering::Acquire) {
      return Err(StateError::Closed);
    }
    Ok(())
  }

  /// Adds one to the counter for `key` (starting from 0) and returns the
  /// updated counter.
  pub fn increment(&self, key: &str) -> Result<Counter, StateError> {
    self.ensure_open()?;
    let mut shard = self
      .shard(key)
      .lock()
      .map_err(|_| StateError::LockPoisoned)?;
    let count = match shard.get_mut(key) {
      Some(entry) => {
        entry.count += 1;
        entry.count
      }
      None => {
        let first_seen = self.sequence.fetch_add(1, Ordering::Relaxed);
        shard.insert(key.to_string(), Entry { count: 1, first_seen });
        1
      }
    };
    self.dirty.store(true, Ordering::Release);
    Ok(Counter::new(key, count))
  }

  /// The current counter for `key`, if it was ever incremented.
  pub fn get(&self, key: &str) -> Result<Option<Counter>, StateError> {
    let shard = self
      .shard(key)
      .lock()
      .map_err(|_| StateError::LockPoisoned)?;
    Ok(shard.get(key).map(|e| Counter::new(key, e.count)))
  }

  /// Number of distinct keys.
  pub fn len(&self) -> usize {
    self
      .shards
      .iter()
      .map(|s| s.lock().map(|g| g.len()).unwrap_or(0))
      .sum()
  }

  /// Whether no key was observed yet.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// All counters in insertion order of first observation.
  pub fn snapshot(&self) -> Result<Snapshot, StateError> {
    let mut ordered: Vec<(u64, Counter)> = Vec::new();
    for shard in &self.shards {
      let guard = shard.lock().map_err(|_| StateError::LockPoisoned)?;
      ordered.extend(
        guard
          .iter()
          .map(|(k, e)| (e.first_seen, Counter::new(k.clone(), e.count))),
      );
    }
    ordered.sort_by_key(|(seq, _)| *seq);
    Ok(Snapshot {
      counters: ordered.into_iter().map(|(_, c)| c).collect(),
    })
  }

  fn segment_path(&self, dir: &Path) -> PathBuf {
    dir.join(format!("{}.{}", self.name, SEGMENT_EXTENSION))
  }

  fn load(&self, path: &Path) -> Result<usize, StateError> {
    let file = fs::File::open(path).map_err(unavailable(path))?;
    let mut loaded = 0;
    for (idx, line) in io::BufReader::new(file).lines().enumerate() {
      let line = line.map_err(unavailable(path))?;
      if line.trim().is_empty() {
        continue;
      }
      let parsed: SegmentLine =
        serde_json::from_str(&line).map_err(|e| StateError::Corrupt {
          path: path.to_path_buf(),
          line: idx + 1,
          reason: e.to_string(),
        })?;
      let first_seen = self.sequence.fetch_add(1, Ordering::Relaxed);
      let mut shard = self
        .shard(&parsed.key)
        .lock()
        .map_err(|_| StateError::LockPoisoned)?;
      shard.insert(
        parsed.key,
        Entry {
          count: parsed.count,
          first_seen,
        },
      );
      loaded += 1;
    }
    Ok(loaded)
  }

  /// Writes the segment if anything changed since the last flush.
  fn flush_to(&self, dir: &Path) -> Result<bool, StateError> {
    if !self.dirty.swap(false, Ordering::AcqRel) {
      return Ok(false);
    }
    let write = || -> Result<(), StateError> {
      let mut buf = Vec::new();
      for counter in self.snapshot()?.iter() {
        let line = SegmentLine {
          key: counter.key.clone(),
          count: counter.count,
        };
        serde_json::to_writer(&mut buf, &line).map_err(|e| StateError::Corrupt {
          path: self.segment_path(dir),
          line: 0,
          reason: e.to_string(),
        })?;
        buf.push(b'\n');
      }
      let path = self.segment_path(dir);
      atomic_write(&path, &buf).map_err(unavailable(&path))
    };
    if let Err(e) = write() {
      self.dirty.store(true, Ordering::Release);
      return Err(e);
    }
    Ok(true)
  }
}

/// Whether `name` can be used as a namespace (and therefore as a file name).
pub(crate) fn is_valid_namespace(name: &str) -> bool {
  !name.is_empty()
    && !name.starts_with('.')
    && name
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Replaces `path` with `data` atomically: temp file, fsync, rename.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
  let mut tmp_name = path
    .file_name()
    .map(|n| n.to_os_string())
    .unwrap_or_else(|| "state".into());
  tmp_name.push(TMP_SUFFIX);
  let tmp = path.with_file_name(tmp_name);

  let guard = scopeguard::guard(tmp, |tmp| {
    let _ = fs::remove_file(tmp);
  });
  {
    let mut file = fs::File::create(&*guard)?;
    file.write_all(data)?;
    file.sync_all()?;
  }
  fs::rename(&*guard, path)?;
  // Renamed into place; nothing left to clean up.
  let _ = scopeguard::ScopeGuard::into_inner(guard);

  if let Some(parent) = path.parent() {
    if let Ok(dir) = fs::File::open(parent) {
      let _ = dir.sync_all();
    }
  }
  Ok(())
}

/// Durable keyed counter store scoped to one directory.
///
/// Shared between workers behind an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct StateStore {
  dir: PathBuf,
  ephemeral: bool,
  namespaces: RwLock<HashMap<String, Arc<CounterNamespace>>>,
  closed: Arc<AtomicBool>,
  /// Held for a whole flush, so writers never share a temp file and a
  /// flush returns only once everything dirty before it is on disk.
  flush_lock: Mutex<()>,
}

impl StateStore {
  /// Opens (creating if needed) the store at `path` and loads every
  /// persisted segment.
  pub fn open(path: impl AsRef<Path>) -> Result<Self, StateError> {
    Self::open_with(path, false)
  }

  /// Like [`StateStore::open`], but the directory is removed on close.
  pub fn open_ephemeral(path: impl AsRef<Path>) -> Result<Self, StateError> {
    Self::open_with(path, true)
  }

  /// Opens the store at `path`; when `ephemeral` is set the directory is
  /// removed on close.
  pub fn open_with(path: impl AsRef<Path>, ephemeral: bool) -> Result<Self, StateError> {
    let dir = path.as_ref();
    fs::create_dir_all(dir).map_err(unavailable(dir))?;

    let probe = dir.join(".probe");
    fs::write(&probe, b"").map_err(unavailable(dir))?;
    fs::remove_file(&probe).map_err(unavailable(dir))?;

    let closed = Arc::new(AtomicBool::new(false));
    let mut namespaces = HashMap::new();
    for entry in fs::read_dir(dir).map_err(unavailable(dir))? {
      let path = entry.map_err(unavailable(dir))?.path();
      let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        continue;
      };
      if file_name.ends_with(TMP_SUFFIX) {
        warn!(path = %path.display(), "removing leftover temporary file from an interrupted flush");
        fs::remove_file(&path).map_err(unavailable(&path))?;
        continue;
      }
      if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
        continue;
      }
      let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
        continue;
      };
      let namespace = CounterNamespace::new(name.to_string(), closed.clone());
      let loaded = namespace.load(&path)?;
      debug!(namespace = %name, keys = loaded, "loaded counter segment");
      namespaces.insert(name.to_string(), Arc::new(namespace));
    }

    info!(
      path = %dir.display(),
      namespaces = namespaces.len(),
      ephemeral,
      "state store opened"
    );
    Ok(Self {
      dir: dir.to_path_buf(),
      ephemeral,
      namespaces: RwLock::new(namespaces),
      closed,
      flush_lock: Mutex::new(()),
    })
  }

  /// The store directory.
  pub fn path(&self) -> &Path {
    &self.dir
  }

  /// Whether [`StateStore::close`] has run.
  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  /// Returns the namespace handle, creating the namespace on first use.
  pub fn counters(&self, namespace: &str) -> Result<Arc<CounterNamespace>, StateError> {
    if self.is_closed() {
      return Err(StateError::Closed);
    }
    if !is_valid_namespace(namespace) {
      return Err(StateError::InvalidNamespace(namespace.to_string()));
    }
    {
      let map = self
        .namespaces
        .read()
        .map_err(|_| StateError::LockPoisoned)?;
      if let Some(ns) = map.get(namespace) {
        return Ok(ns.clone());
      }
    }
    let mut map = self
      .namespaces
      .write()
      .map_err(|_| StateError::LockPoisoned)?;
    Ok(
      map
        .entry(namespace.to_string())
        .or_insert_with(|| Arc::new(CounterNamespace::new(namespace.to_string(), self.closed.clone())))
        .clone(),
    )
  }

  /// Increments `key` in `namespace`.
  pub fn increment(&self, namespace: &str, key: &str) -> Result<Counter, StateError> {
    self.counters(namespace)?.increment(key)
  }

  /// Snapshot of `namespace`; empty if the namespace does not exist.
  pub fn snapshot(&self, namespace: &str) -> Result<Snapshot, StateError> {
    let map = self
      .namespaces
      .read()
      .map_err(|_| StateError::LockPoisoned)?;
    match map.get(namespace) {
      Some(ns) => ns.snapshot(),
      None => Ok(Snapshot::default()),
    }
  }

  /// Names of all known namespaces, sorted.
  pub fn namespaces(&self) -> Vec<String> {
    let mut names: Vec<String> = self
      .namespaces
      .read()
      .map(|m| m.keys().cloned().collect())
      .unwrap_or_default();
    names.sort();
    names
  }

  /// Persists every namespace changed since the last flush. Returns the
  /// number of segments written.
  ///
  /// Concurrent callers are serialized: when this returns, every increment
  /// made before the call is durable, whichever caller wrote it.
  pub fn flush(&self) -> Result<usize, StateError> {
    let _flushing = self.flush_lock.lock().map_err(|_| StateError::LockPoisoned)?;
    if self.is_closed() {
      return Err(StateError::Closed);
    }
    self.flush_locked()
  }

  /// Caller holds `flush_lock`.
  fn flush_locked(&self) -> Result<usize, StateError> {
    let namespaces: Vec<Arc<CounterNamespace>> = self
      .namespaces
      .read()
      .map_err(|_| StateError::LockPoisoned)?
      .values()
      .cloned()
      .collect();
    let mut written = 0;
    for ns in namespaces {
      if ns.flush_to(&self.dir)? {
        written += 1;
      }
    }
    if written > 0 {
      debug!(path = %self.dir.display(), segments = written, "state store flushed");
    }
    Ok(written)
  }

  /// Flushes pending writes and releases the directory. Idempotent.
  ///
  /// Ephemeral stores remove their directory here.
  pub fn close(&self) -> Result<(), StateError> {
    if self.closed.swap(true, Ordering::AcqRel) {
      return Ok(());
    }
    let _flushing = self.flush_lock.lock().map_err(|_| StateError::LockPoisoned)?;
    let flushed = self.flush_locked();
    if self.ephemeral {
      match fs::remove_dir_all(&self.dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(unavailable(&self.dir)(e)),
      }
    }
    flushed?;
    info!(path = %self.dir.display(), "state store closed");
    Ok(())
  }
}

impl Drop for StateStore {
  fn drop(&mut self) {
    if !self.is_closed() {
      if let Err(e) = self.close() {
        warn!(path = %self.dir.display(), error = %e, "failed to close state store on drop");
      }
    }
  }
}
