//! Word count over an in-process broker.
//!
//! ```text
//! cargo run --example word_count
//! ```

use std::time::Duration;

use countweave::adapter::memory::MemoryBroker;
use countweave::{wordcount, Engine, OffsetResetPolicy, RunConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt::init();

  let state_dir = tempfile::tempdir()?;
  let config = RunConfig::builder("wordcount-live-test")
    .with_bootstrap_endpoint("memory://local")
    .with_state_directory(state_dir.path())
    .with_offset_reset(OffsetResetPolicy::Earliest)
    .with_commit_interval(Duration::from_millis(500))
    .with_ephemeral_state(true)
    .build()?;

  let broker = MemoryBroker::new();
  for line in [
    "the quick brown fox",
    "jumps over the lazy dog",
    "The Dog barks; the fox runs!",
  ] {
    broker.produce_text("inputTopic", None, line)?;
  }

  let topology = wordcount::topology("inputTopic", "wordCountTopic", "letterCountTopic")?;
  println!("{}", topology.describe());

  let mut engine = Engine::builder(topology, config.clone())
    .source(broker.source(&config, "inputTopic", 0).bounded())
    .sink(broker.sink())
    .build()?;
  engine.run_for(Duration::from_secs(5)).await?;

  for topic in ["wordCountTopic", "letterCountTopic"] {
    let mut counts: Vec<(String, u64)> = broker.latest_counts(topic)?.into_iter().collect();
    counts.sort();
    println!("{}:", topic);
    for (key, count) in counts {
      println!("  {:<8} {}", key, count);
    }
  }
  Ok(())
}
