//! # countweave
//!
//! A single-process stream processing core: records flow from source adapters
//! through a declared topology of transform, group and count stages into sink
//! adapters, with aggregation state kept in a local durable counter store.
//!
//! ## Key pieces
//!
//! - **Topology**: built with [`TopologyBuilder`] from typed stream handles,
//!   validated once and immutable afterwards
//! - **State store**: sharded, namespaced counters persisted to one segment
//!   file per aggregate node
//! - **Engine**: worker tasks that poll sources, traverse the topology per
//!   record and commit state and offsets on an interval
//! - **Adapters**: [`adapter::SourceAdapter`] / [`adapter::SinkAdapter`]
//!   traits, plus an in-process broker for tests and demos
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use countweave::{wordcount, Engine, RunConfig};
//! use countweave::adapter::memory::MemoryBroker;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RunConfig::builder("wordcount-live-test")
//!   .with_bootstrap_endpoint("memory://local")
//!   .with_state_directory("/tmp/countweave")
//!   .build()?;
//! let topology = wordcount::topology("inputTopic", "wordCountTopic", "letterCountTopic")?;
//!
//! let broker = MemoryBroker::new();
//! broker.create_topic("inputTopic", 1);
//! let mut engine = Engine::builder(topology, config.clone())
//!   .source(broker.source(&config, "inputTopic", 0))
//!   .sink(broker.sink())
//!   .build()?;
//! engine.run_for(std::time::Duration::from_secs(60)).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Source and sink adapter contracts, plus the in-process broker.
pub mod adapter;
/// String / long serialization of keys and values at adapter boundaries.
pub mod codec;
/// Immutable run configuration.
pub mod config;
/// Execution engine and its lifecycle.
pub mod engine;
/// Error taxonomy.
pub mod error;
/// Validated, immutable topology graph.
pub mod graph;
/// Fluent topology builder with typed stream handles.
pub mod graph_builder;
/// Records, payloads and topics.
pub mod message;
/// Topology node definitions.
pub mod node;
/// Consumed-offset bookkeeping.
pub mod offset;
/// Durable, namespaced counter store.
pub mod state;
/// The word-count / letter-count example topology.
pub mod wordcount;

#[cfg(test)]
mod graph_builder_test;
#[cfg(test)]
mod state_test;

pub use codec::Codec;
pub use config::{RunConfig, RunConfigBuilder};
pub use engine::{Engine, EngineBuilder, EngineState};
pub use error::{EngineError, RecordProcessingError, Result};
pub use graph::Topology;
pub use graph_builder::{KGroupedStream, KStream, KTable, Produced, TopologyBuilder};
pub use message::{Payload, Record, Topic, TopicPartition};
pub use offset::{Offset, OffsetResetPolicy};
pub use state::{Counter, StateStore};
