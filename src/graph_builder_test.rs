//! # TopologyBuilder Test Suite
//!
//! Declaration through the fluent API and the validation performed by
//! `build()`.

use crate::codec::Codec;
use crate::error::EngineError;
use crate::graph_builder::{Produced, TopologyBuilder};
use crate::node::NodeKind;

fn words(line: &str) -> Vec<String> {
  line.split(' ').map(str::to_string).collect()
}

fn assert_invalid(result: crate::Result<crate::Topology>, fragment: &str) {
  match result {
    Err(EngineError::InvalidTopology(msg)) => {
      assert!(msg.contains(fragment), "'{}' does not mention '{}'", msg, fragment)
    }
    Err(other) => panic!("expected InvalidTopology, got {}", other),
    Ok(t) => panic!("expected InvalidTopology, got topology:\n{}", t.describe()),
  }
}

// ============================================================================
// Construction
// ============================================================================

#[test]
fn test_fan_out_shares_one_flat_map() {
  let builder = TopologyBuilder::new();
  builder.sink_topic("wordCountTopic").sink_topic("letterCountTopic");
  let tokens = builder.source("inputTopic").flat_map_values(words);
  tokens
    .group_by(|_, w| w.to_string())
    .count_as("word-counts")
    .to_stream()
    .to("wordCountTopic");
  tokens
    .group_by(|_, w| w[..1].to_string())
    .count_as("letter-counts")
    .to_stream()
    .to("letterCountTopic");
  let flat_map = tokens.id();

  let topology = builder.build().unwrap();
  assert_eq!(topology.nodes().len(), 8);
  assert_eq!(topology.node(flat_map).unwrap().successors().len(), 2);
  assert_eq!(topology.namespaces(), vec!["word-counts", "letter-counts"]);
  assert_eq!(topology.source_topics(), vec!["inputTopic"]);
  assert_eq!(
    topology.sink_topics(),
    &["wordCountTopic".to_string(), "letterCountTopic".to_string()]
  );
  assert_eq!(topology.source_for("inputTopic").unwrap().name(), "source-0000");
}

#[test]
fn test_count_namespace_defaults_to_node_name() {
  let builder = TopologyBuilder::new();
  builder.sink_topic("out");
  let counts = builder
    .source("in")
    .group_by(|_, v| v.to_string())
    .count();
  counts.to_stream().to("out");
  let count_id = counts.id();

  let topology = builder.build().unwrap();
  let node = topology.node(count_id).unwrap();
  assert_eq!(node.name(), "count-0002");
  assert_eq!(topology.namespaces(), vec!["count-0002"]);
}

#[test]
fn test_count_stream_sinks_with_long_values() {
  let builder = TopologyBuilder::new();
  builder.sink_topic("out");
  let sink = builder
    .source("in")
    .group_by(|_, v| v.to_string())
    .count()
    .to_stream()
    .to("out");

  let topology = builder.build().unwrap();
  match topology.node(sink).unwrap().kind() {
    NodeKind::Sink { produced, .. } => assert_eq!(*produced, Produced::counts()),
    other => panic!("expected a sink, got {:?}", other),
  }
}

#[test]
fn test_topological_order_starts_at_source() {
  let builder = TopologyBuilder::new();
  builder.sink_topic("out");
  builder
    .source("in")
    .filter(|_, v| !v.is_empty())
    .map_values(str::to_uppercase)
    .to("out");

  let topology = builder.build().unwrap();
  let order: Vec<&str> = topology
    .topological_order()
    .iter()
    .map(|id| topology.node(*id).unwrap().name())
    .collect();
  assert_eq!(order, vec!["source-0000", "filter-0001", "map-values-0002", "sink-0003"]);
  assert!(topology.describe().contains("filter-0001 Filter --> map-values-0002"));
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn test_no_source_is_rejected() {
  let builder = TopologyBuilder::new();
  builder.sink_topic("out");
  assert_invalid(builder.build(), "no source");
}

#[test]
fn test_sink_to_undeclared_topic_is_rejected() {
  let builder = TopologyBuilder::new();
  builder.source("in").to("nowhere");
  assert_invalid(builder.build(), "undeclared topic 'nowhere'");
}

#[test]
fn test_duplicate_topics_are_rejected() {
  let builder = TopologyBuilder::new();
  builder.source("in");
  builder.source("in");
  assert_invalid(builder.build(), "declared twice");

  let builder = TopologyBuilder::new();
  builder.sink_topic("out").sink_topic("out");
  builder.source("in").to("out");
  assert_invalid(builder.build(), "declared twice");
}

#[test]
fn test_empty_topic_names_are_rejected() {
  let builder = TopologyBuilder::new();
  builder.source("");
  assert_invalid(builder.build(), "non-empty");

  let builder = TopologyBuilder::new();
  builder.sink_topic(" ");
  builder.source("in");
  assert_invalid(builder.build(), "non-empty");
}

#[test]
fn test_duplicate_namespace_is_rejected() {
  let builder = TopologyBuilder::new();
  let grouped = builder.source("in").group_by(|_, v| v.to_string());
  grouped.count_as("counts");
  grouped.count_as("counts");
  assert_invalid(builder.build(), "used twice");
}

#[test]
fn test_invalid_namespace_is_rejected() {
  let builder = TopologyBuilder::new();
  builder
    .source("in")
    .group_by(|_, v| v.to_string())
    .count_as("../counts");
  assert_invalid(builder.build(), "invalid namespace");
}

#[test]
fn test_cycle_is_rejected() {
  let builder = TopologyBuilder::new();
  let a = builder.source("in").map_values(str::to_lowercase);
  let b = a.map_values(str::to_uppercase);
  builder.connect(b.id(), a.id());
  assert_invalid(builder.build(), "cycle");
}

#[test]
fn test_edge_into_source_is_rejected() {
  let builder = TopologyBuilder::new();
  let first = builder.source("a");
  let second = builder.source("b");
  builder.connect(first.id(), second.id());
  assert_invalid(builder.build(), "edge into source");
}

#[test]
fn test_value_codec_mismatch_is_rejected() {
  let builder = TopologyBuilder::new();
  builder.sink_topic("out");
  builder
    .source("in")
    .to_with("out", Produced::with(Codec::String, Codec::Long));
  assert_invalid(builder.build(), "long value codec");
}

#[test]
fn test_counts_cannot_feed_text_stages() {
  let builder = TopologyBuilder::new();
  let counts = builder
    .source("in")
    .group_by(|_, v| v.to_string())
    .count();
  let text = builder.source("other").map_values(str::to_string);
  builder.connect(counts.id(), text.id());
  assert_invalid(builder.build(), "cannot consume count values");
}
