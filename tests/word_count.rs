use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use countweave::adapter::memory::MemoryBroker;
use countweave::state::StateStore;
use countweave::{
  wordcount, Engine, EngineError, EngineState, OffsetResetPolicy, RecordProcessingError, RunConfig,
  TopologyBuilder,
};
use tempfile::TempDir;

const INPUT: &str = "inputTopic";
const WORDS: &str = "wordCountTopic";
const LETTERS: &str = "letterCountTopic";

fn config(dir: &TempDir) -> RunConfig {
  RunConfig::builder("wordcount-live-test")
    .with_bootstrap_endpoint("memory://local")
    .with_state_directory(dir.path())
    .with_offset_reset(OffsetResetPolicy::Earliest)
    .with_commit_interval(Duration::from_millis(50))
    .with_poll_timeout(Duration::from_millis(10))
    .build()
    .unwrap()
}

fn produce_lines(broker: &MemoryBroker, lines: &[&str]) {
  for line in lines {
    broker.produce_text(INPUT, None, line).unwrap();
  }
}

fn word_count_engine(broker: &MemoryBroker, config: &RunConfig) -> Engine {
  Engine::builder(
    wordcount::topology(INPUT, WORDS, LETTERS).unwrap(),
    config.clone(),
  )
  .source(broker.source(config, INPUT, 0).bounded())
  .sink(broker.sink())
  .build()
  .unwrap()
}

fn word_count_engine_unbounded(broker: &MemoryBroker, config: &RunConfig) -> Engine {
  Engine::builder(
    wordcount::topology(INPUT, WORDS, LETTERS).unwrap(),
    config.clone(),
  )
  .source(broker.source(config, INPUT, 0))
  .sink(broker.sink())
  .build()
  .unwrap()
}

/// Runs the word-count topology over whatever `broker` holds.
async fn count(broker: &MemoryBroker, config: &RunConfig) {
  let mut engine = word_count_engine(broker, config);
  engine.run_for(Duration::from_secs(10)).await.unwrap();
  assert_eq!(engine.state(), EngineState::Stopped);
}

fn expected(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
  pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

#[tokio::test]
async fn test_the_fox_the_dog() {
  let dir = TempDir::new().unwrap();
  let broker = MemoryBroker::new();
  produce_lines(&broker, &["the fox", "the dog"]);

  count(&broker, &config(&dir)).await;

  assert_eq!(
    broker.latest_counts(WORDS).unwrap(),
    expected(&[("the", 2), ("fox", 1), ("dog", 1)])
  );
  assert_eq!(
    broker.latest_counts(LETTERS).unwrap(),
    expected(&[("t", 2), ("f", 1), ("d", 1)])
  );
}

#[tokio::test]
async fn test_every_update_is_emitted_in_order() {
  let dir = TempDir::new().unwrap();
  let broker = MemoryBroker::new();
  produce_lines(&broker, &["the the"]);

  count(&broker, &config(&dir)).await;

  let counts: Vec<u64> = broker
    .read(WORDS, countweave::Codec::String, countweave::Codec::Long)
    .unwrap()
    .iter()
    .filter_map(|r| r.value().as_count())
    .collect();
  assert_eq!(counts, vec![1, 2]);
}

#[tokio::test]
async fn test_counts_are_conserved() {
  let lines = [
    "The quick brown fox jumps over the lazy dog",
    "",
    "  ...  ",
    "A fox, a dog; and THE end!",
    "über straße über",
  ];
  let dir = TempDir::new().unwrap();
  let broker = MemoryBroker::new();
  produce_lines(&broker, &lines);

  count(&broker, &config(&dir)).await;

  let tokens: u64 = lines
    .iter()
    .map(|l| wordcount::split_words(l).len() as u64)
    .sum();
  let words: u64 = broker.latest_counts(WORDS).unwrap().values().sum();
  let letters: u64 = broker.latest_counts(LETTERS).unwrap().values().sum();
  assert_eq!(words, tokens);
  assert_eq!(letters, words);
  assert_eq!(broker.latest_counts(WORDS).unwrap()["über"], 2);
}

#[tokio::test]
async fn test_replay_into_fresh_store_is_identical() {
  let lines = ["one two three", "two three", "three"];
  let mut results = Vec::new();
  for _ in 0..2 {
    let dir = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    produce_lines(&broker, &lines);
    count(&broker, &config(&dir)).await;
    results.push(broker.latest_counts(WORDS).unwrap());
  }
  assert_eq!(results[0], results[1]);
  assert_eq!(results[0], expected(&[("one", 1), ("two", 2), ("three", 3)]));
}

#[tokio::test]
async fn test_restart_resumes_from_committed_offsets() {
  let dir = TempDir::new().unwrap();
  let config = config(&dir);
  let broker = MemoryBroker::new();

  produce_lines(&broker, &["the fox"]);
  count(&broker, &config).await;

  produce_lines(&broker, &["the dog"]);
  count(&broker, &config).await;

  // Without resuming, "the fox" would be counted twice.
  assert_eq!(
    broker.latest_counts(WORDS).unwrap(),
    expected(&[("the", 2), ("fox", 1), ("dog", 1)])
  );

  let store = StateStore::open(config.state_path()).unwrap();
  let words = store.snapshot(wordcount::WORD_COUNTS).unwrap();
  let keys: Vec<&str> = words.iter().map(|c| c.key.as_str()).collect();
  assert_eq!(keys, vec!["the", "fox", "dog"]);
  assert_eq!(words.get("the"), Some(2));
}

#[tokio::test]
async fn test_latest_policy_skips_existing_input() {
  let dir = TempDir::new().unwrap();
  let config = RunConfig::builder("wordcount-latest")
    .with_state_directory(dir.path())
    .with_poll_timeout(Duration::from_millis(10))
    .build()
    .unwrap();
  let broker = MemoryBroker::new();
  produce_lines(&broker, &["the fox"]);

  count(&broker, &config).await;

  assert!(broker.latest_counts(WORDS).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partitions_spread_over_workers() {
  const LINES: usize = 300;
  let dir = TempDir::new().unwrap();
  // Commits far more often than the run lasts, so both workers flush the
  // shared store concurrently many times.
  let config = RunConfig::builder("wordcount-partitioned")
    .with_state_directory(dir.path())
    .with_offset_reset(OffsetResetPolicy::Earliest)
    .with_commit_interval(Duration::from_millis(1))
    .with_poll_timeout(Duration::from_millis(10))
    .with_num_workers(2)
    .build()
    .unwrap();
  let broker = MemoryBroker::new();
  broker.create_topic(INPUT, 2);
  for _ in 0..LINES {
    broker.produce(INPUT, 0, None, b"the fox".to_vec()).unwrap();
    broker.produce(INPUT, 1, None, b"the dog".to_vec()).unwrap();
  }

  let mut engine = Engine::builder(wordcount::topology(INPUT, WORDS, LETTERS).unwrap(), config.clone())
    .source(broker.source(&config, INPUT, 0).bounded())
    .source(broker.source(&config, INPUT, 1).bounded())
    .sink(broker.sink())
    .build()
    .unwrap();
  engine.run_for(Duration::from_secs(30)).await.unwrap();
  assert_eq!(engine.state(), EngineState::Stopped);

  let n = LINES as u64;
  assert_eq!(
    broker.latest_counts(WORDS).unwrap(),
    expected(&[("the", 2 * n), ("fox", n), ("dog", n)])
  );
  assert_eq!(broker.latest_counts(LETTERS).unwrap()["t"], 2 * n);

  let store = StateStore::open(config.state_path()).unwrap();
  assert_eq!(store.snapshot(wordcount::WORD_COUNTS).unwrap().get("the"), Some(2 * n));
  assert_eq!(store.snapshot(wordcount::LETTER_COUNTS).unwrap().total(), 4 * n);
}

#[tokio::test]
async fn test_sink_to_undeclared_topic_is_invalid() {
  let builder = TopologyBuilder::new();
  builder
    .source(INPUT)
    .flat_map_values(wordcount::split_words)
    .group_by(|_, w| w.to_string())
    .count()
    .to_stream()
    .to(WORDS);
  assert!(matches!(builder.build(), Err(EngineError::InvalidTopology(_))));
}

#[tokio::test]
async fn test_stop_before_start_is_a_noop_and_start_twice_fails() {
  let dir = TempDir::new().unwrap();
  let config = config(&dir);
  let broker = MemoryBroker::new();
  let mut engine = Engine::builder(wordcount::topology(INPUT, WORDS, LETTERS).unwrap(), config.clone())
    .source(broker.source(&config, INPUT, 0))
    .sink(broker.sink())
    .build()
    .unwrap();

  engine.stop().await.unwrap();
  assert_eq!(engine.state(), EngineState::Created);

  engine.start().await.unwrap();
  assert_eq!(engine.state(), EngineState::Running);
  match engine.start().await {
    Err(EngineError::IllegalState { operation, state }) => {
      assert_eq!(operation, "start");
      assert_eq!(state, EngineState::Running);
    }
    other => panic!("expected IllegalState, got {:?}", other),
  }

  engine.stop().await.unwrap();
  assert_eq!(engine.state(), EngineState::Stopped);
  engine.stop().await.unwrap();
  assert!(matches!(
    engine.start().await,
    Err(EngineError::IllegalState { .. })
  ));
}

#[tokio::test]
async fn test_poisoned_record_is_reported_and_skipped() {
  let dir = TempDir::new().unwrap();
  let config = config(&dir);
  let broker = MemoryBroker::new();
  produce_lines(&broker, &["the fox", "poison pill", "the dog"]);

  let builder = TopologyBuilder::new();
  builder.sink_topic(WORDS);
  builder
    .source(INPUT)
    .try_flat_map_values(|line| {
      if line.contains("poison") {
        Err(format!("cannot split '{}'", line))
      } else {
        Ok(wordcount::split_words(line))
      }
    })
    .group_by(|_, w| w.to_string())
    .count()
    .to_stream()
    .to(WORDS);

  let errors: Arc<Mutex<Vec<RecordProcessingError>>> = Arc::new(Mutex::new(Vec::new()));
  let seen = errors.clone();
  let mut engine = Engine::builder(builder.build().unwrap(), config.clone())
    .source(broker.source(&config, INPUT, 0).bounded())
    .sink(broker.sink())
    .on_record_error(move |e| seen.lock().unwrap().push(e.clone()))
    .build()
    .unwrap();
  engine.run_for(Duration::from_secs(10)).await.unwrap();

  assert_eq!(
    broker.latest_counts(WORDS).unwrap(),
    expected(&[("the", 2), ("fox", 1), ("dog", 1)])
  );
  let errors = errors.lock().unwrap();
  assert_eq!(errors.len(), 1);
  assert_eq!(errors[0].component.type_name, "FlatMapValues");
  assert_eq!(
    errors[0].record().and_then(|r| r.value().as_text()),
    Some("poison pill")
  );
}

#[tokio::test]
async fn test_lost_connection_stops_engine() {
  let dir = TempDir::new().unwrap();
  let config = config(&dir);
  let broker = MemoryBroker::new();
  let mut engine = Engine::builder(wordcount::topology(INPUT, WORDS, LETTERS).unwrap(), config.clone())
    .source(broker.source(&config, INPUT, 0))
    .sink(broker.sink())
    .build()
    .unwrap();

  engine.start().await.unwrap();
  broker.disconnect();

  let result = tokio::time::timeout(Duration::from_secs(10), engine.wait())
    .await
    .unwrap();
  assert!(matches!(result, Err(EngineError::AdapterConnection(_))));
  assert_eq!(engine.state(), EngineState::Stopped);
}

#[tokio::test]
async fn test_restart_after_lost_connection_does_not_recount() {
  let dir = TempDir::new().unwrap();
  let config = config(&dir);
  let broker = MemoryBroker::new();
  produce_lines(&broker, &["the fox"]);

  // Long commit interval: nothing is committed before the connection drops.
  let slow_commits = RunConfig::builder("wordcount-live-test")
    .with_state_directory(dir.path())
    .with_offset_reset(OffsetResetPolicy::Earliest)
    .with_poll_timeout(Duration::from_millis(10))
    .build()
    .unwrap();
  let mut engine = word_count_engine_unbounded(&broker, &slow_commits);
  engine.start().await.unwrap();
  tokio::time::timeout(Duration::from_secs(10), async {
    while !broker.latest_counts(LETTERS).unwrap().contains_key("f") {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  })
  .await
  .unwrap();

  broker.disconnect();
  let result = tokio::time::timeout(Duration::from_secs(10), engine.wait())
    .await
    .unwrap();
  assert!(matches!(result, Err(EngineError::AdapterConnection(_))));

  broker.reconnect();
  count(&broker, &config).await;

  let store = StateStore::open(config.state_path()).unwrap();
  let words = store.snapshot(wordcount::WORD_COUNTS).unwrap();
  assert_eq!(words.get("the"), Some(1));
  assert_eq!(words.get("fox"), Some(1));
  assert_eq!(
    broker.latest_counts(WORDS).unwrap(),
    expected(&[("the", 1), ("fox", 1)])
  );
}

#[tokio::test]
async fn test_unusable_state_directory_fails_start() {
  let dir = TempDir::new().unwrap();
  let blocker = dir.path().join("not-a-directory");
  std::fs::write(&blocker, b"x").unwrap();
  let config = RunConfig::builder("wordcount")
    .with_state_directory(&blocker)
    .build()
    .unwrap();
  let broker = MemoryBroker::new();
  let mut engine = word_count_engine(&broker, &config);

  assert!(matches!(
    engine.start().await,
    Err(EngineError::StorageUnavailable { .. })
  ));
  assert_eq!(engine.state(), EngineState::Stopped);
}

#[tokio::test]
async fn test_missing_source_adapter_is_a_config_error() {
  let dir = TempDir::new().unwrap();
  let config = config(&dir);
  let broker = MemoryBroker::new();
  let result = Engine::builder(wordcount::topology(INPUT, WORDS, LETTERS).unwrap(), config)
    .sink(broker.sink())
    .build();
  assert!(matches!(result, Err(EngineError::Config(_))));
}
