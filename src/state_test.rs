//! # StateStore Test Suite
//!
//! Restart safety, concurrency and on-disk format of the counter store.

use crate::state::{atomic_write, Counter, StateError, StateStore};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn counts(store: &StateStore, namespace: &str) -> Vec<(String, u64)> {
  store
    .snapshot(namespace)
    .unwrap()
    .iter()
    .map(|c| (c.key.clone(), c.count))
    .collect()
}

#[test]
fn test_increment_starts_at_one() {
  let dir = TempDir::new().unwrap();
  let store = StateStore::open(dir.path().join("app")).unwrap();
  let words = store.counters("word-counts").unwrap();

  assert_eq!(words.increment("the").unwrap(), Counter::new("the", 1));
  assert_eq!(words.increment("the").unwrap(), Counter::new("the", 2));
  assert_eq!(words.get("the").unwrap(), Some(Counter::new("the", 2)));
  assert_eq!(words.get("fox").unwrap(), None);
}

#[test]
fn test_snapshot_keeps_insertion_order() {
  let dir = TempDir::new().unwrap();
  let store = StateStore::open(dir.path()).unwrap();
  for key in ["the", "fox", "the", "dog", "fox", "the"] {
    store.increment("word-counts", key).unwrap();
  }

  let snapshot = store.snapshot("word-counts").unwrap();
  let first: Vec<&str> = snapshot.iter().map(|c| c.key.as_str()).collect();
  let second: Vec<&str> = snapshot.iter().map(|c| c.key.as_str()).collect();
  assert_eq!(first, vec!["the", "fox", "dog"]);
  assert_eq!(first, second);
  assert_eq!(snapshot.get("the"), Some(3));
  assert_eq!(snapshot.total(), 6);
}

#[test]
fn test_namespaces_are_isolated() {
  let dir = TempDir::new().unwrap();
  let store = StateStore::open(dir.path()).unwrap();
  store.increment("word-counts", "the").unwrap();
  store.increment("letter-counts", "t").unwrap();

  assert_eq!(counts(&store, "word-counts"), vec![("the".to_string(), 1)]);
  assert_eq!(counts(&store, "letter-counts"), vec![("t".to_string(), 1)]);
  assert!(store.snapshot("missing").unwrap().is_empty());
  assert_eq!(store.namespaces(), vec!["letter-counts", "word-counts"]);
}

#[test]
fn test_reopen_preserves_flushed_counters() {
  let dir = TempDir::new().unwrap();
  let path = dir.path().join("wordcount");
  {
    let store = StateStore::open(&path).unwrap();
    for key in ["the", "fox", "the"] {
      store.increment("word-counts", key).unwrap();
    }
    store.close().unwrap();
  }

  let store = StateStore::open(&path).unwrap();
  assert_eq!(
    counts(&store, "word-counts"),
    vec![("the".to_string(), 2), ("fox".to_string(), 1)]
  );
  // Counting continues from the persisted value.
  assert_eq!(store.increment("word-counts", "fox").unwrap().count, 2);
}

#[test]
fn test_drop_flushes_pending_writes() {
  let dir = TempDir::new().unwrap();
  {
    let store = StateStore::open(dir.path()).unwrap();
    store.increment("letter-counts", "d").unwrap();
  }
  let store = StateStore::open(dir.path()).unwrap();
  assert_eq!(store.snapshot("letter-counts").unwrap().get("d"), Some(1));
}

#[test]
fn test_segment_is_json_lines() {
  let dir = TempDir::new().unwrap();
  let store = StateStore::open(dir.path()).unwrap();
  store.increment("word-counts", "the").unwrap();
  store.increment("word-counts", "fox").unwrap();
  assert_eq!(store.flush().unwrap(), 1);
  // Nothing changed since the last flush.
  assert_eq!(store.flush().unwrap(), 0);

  let content = fs::read_to_string(dir.path().join("word-counts.counters")).unwrap();
  assert_eq!(
    content,
    "{\"key\":\"the\",\"count\":1}\n{\"key\":\"fox\",\"count\":1}\n"
  );
}

#[test]
fn test_concurrent_increments_are_exact() {
  let dir = TempDir::new().unwrap();
  let store = StateStore::open(dir.path()).unwrap();
  let words = store.counters("word-counts").unwrap();
  const THREADS: usize = 8;
  const PER_THREAD: usize = 500;

  std::thread::scope(|scope| {
    for t in 0..THREADS {
      let words = Arc::clone(&words);
      scope.spawn(move || {
        for i in 0..PER_THREAD {
          words.increment("the").unwrap();
          words.increment(&format!("w{}-{}", t, i % 10)).unwrap();
        }
      });
    }
  });

  assert_eq!(
    words.get("the").unwrap().unwrap().count,
    (THREADS * PER_THREAD) as u64
  );
  assert_eq!(words.len(), 1 + THREADS * 10);
  assert_eq!(words.snapshot().unwrap().total(), (2 * THREADS * PER_THREAD) as u64);
}

/// Sum of the counts in a namespace's segment file, read straight from disk.
fn persisted_total(dir: &std::path::Path, namespace: &str) -> u64 {
  let content = fs::read_to_string(dir.join(format!("{}.counters", namespace))).unwrap();
  content
    .lines()
    .map(|line| {
      let value: serde_json::Value = serde_json::from_str(line).unwrap();
      value["count"].as_u64().unwrap()
    })
    .sum()
}

#[test]
fn test_concurrent_flushes_never_fail_or_lose_counts() {
  let dir = TempDir::new().unwrap();
  let store = StateStore::open(dir.path()).unwrap();
  const THREADS: usize = 4;
  const PER_THREAD: usize = 300;
  let path = dir.path();

  std::thread::scope(|scope| {
    for t in 0..THREADS {
      let store = &store;
      scope.spawn(move || {
        for i in 0..PER_THREAD {
          store.increment("word-counts", "the").unwrap();
          store.increment("letter-counts", &format!("{}", (t + i) % 5)).unwrap();
          store.flush().unwrap();
          // What this thread counted is on disk once its flush returns.
          let persisted = persisted_total(path, "word-counts");
          assert!(persisted >= (i + 1) as u64);
        }
      });
    }
  });
  store.close().unwrap();

  let reopened = StateStore::open(dir.path()).unwrap();
  let expected = (THREADS * PER_THREAD) as u64;
  assert_eq!(reopened.snapshot("word-counts").unwrap().get("the"), Some(expected));
  assert_eq!(reopened.snapshot("letter-counts").unwrap().total(), expected);
  let leftovers: Vec<_> = fs::read_dir(dir.path())
    .unwrap()
    .filter_map(|e| e.ok())
    .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
    .collect();
  assert!(leftovers.is_empty());
}

#[test]
fn test_close_is_idempotent_and_blocks_writes() {
  let dir = TempDir::new().unwrap();
  let store = StateStore::open(dir.path()).unwrap();
  let words = store.counters("word-counts").unwrap();
  store.close().unwrap();
  store.close().unwrap();

  assert!(store.is_closed());
  assert!(matches!(words.increment("the"), Err(StateError::Closed)));
  assert!(matches!(store.counters("x"), Err(StateError::Closed)));
  assert!(matches!(store.flush(), Err(StateError::Closed)));
}

#[test]
fn test_ephemeral_store_removes_directory() {
  let dir = TempDir::new().unwrap();
  let path = dir.path().join("ephemeral");
  let store = StateStore::open_with(&path, true).unwrap();
  store.increment("word-counts", "the").unwrap();
  assert!(path.exists());

  store.close().unwrap();
  assert!(!path.exists());
}

#[test]
fn test_open_fails_when_path_is_a_file() {
  let dir = TempDir::new().unwrap();
  let file = dir.path().join("not-a-dir");
  fs::write(&file, b"x").unwrap();

  let err = StateStore::open(&file).unwrap_err();
  assert!(matches!(err, StateError::Unavailable { .. }));
  assert!(err.path().is_some());
}

#[test]
fn test_corrupt_segment_is_reported() {
  let dir = TempDir::new().unwrap();
  fs::write(
    dir.path().join("word-counts.counters"),
    "{\"key\":\"the\",\"count\":1}\nnot json\n",
  )
  .unwrap();

  match StateStore::open(dir.path()) {
    Err(StateError::Corrupt { line, .. }) => assert_eq!(line, 2),
    other => panic!("expected a corrupt segment error, got {:?}", other),
  }
}

#[test]
fn test_open_removes_leftover_temp_files() {
  let dir = TempDir::new().unwrap();
  let leftover = dir.path().join("word-counts.counters.tmp");
  fs::write(&leftover, b"partial").unwrap();

  let store = StateStore::open(dir.path()).unwrap();
  assert!(!leftover.exists());
  assert!(store.snapshot("word-counts").unwrap().is_empty());
}

#[test]
fn test_invalid_namespace_is_rejected() {
  let dir = TempDir::new().unwrap();
  let store = StateStore::open(dir.path()).unwrap();
  assert!(matches!(
    store.counters("../escape"),
    Err(StateError::InvalidNamespace(_))
  ));
  assert!(matches!(store.counters(""), Err(StateError::InvalidNamespace(_))));
}

#[test]
fn test_atomic_write_replaces_content() {
  let dir = TempDir::new().unwrap();
  let path = dir.path().join("offsets.json");
  atomic_write(&path, b"[1]").unwrap();
  atomic_write(&path, b"[2]").unwrap();

  assert_eq!(fs::read(&path).unwrap(), b"[2]");
  assert!(!dir.path().join("offsets.json.tmp").exists());
}
