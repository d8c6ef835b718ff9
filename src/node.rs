//! # Topology nodes
//!
//! A topology is a set of [`Node`]s with explicit ids and explicit successor
//! edges. Fan-out is nothing more than a node with several successors.
//!
//! Stateless stages (`FlatMapValues`, `MapValues`, `Filter`, `GroupBy`) are
//! evaluated here by [`Node::transform`]. `Count` and `Sink` need the state
//! store and the sink adapter and are driven by the engine.

use std::fmt;
use std::sync::Arc;

use crate::codec::Codec;
use crate::message::{Payload, Record};

/// Boxed error returned by user functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// `value -> values`, for `flat_map_values`.
pub type FlatMapFn = Arc<dyn Fn(&str) -> Result<Vec<String>, BoxError> + Send + Sync>;
/// `value -> value`, for `map_values`.
pub type MapFn = Arc<dyn Fn(&str) -> Result<String, BoxError> + Send + Sync>;
/// `(key, value) -> keep?`, for `filter`.
pub type PredicateFn = Arc<dyn Fn(Option<&str>, &str) -> bool + Send + Sync>;
/// `(key, value) -> group key`, for `group_by`.
pub type KeyFn = Arc<dyn Fn(Option<&str>, &str) -> Result<String, BoxError> + Send + Sync>;

/// Identity of a node within its topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
  /// Position of the node in declaration order.
  pub fn index(self) -> usize {
    self.0
  }
}

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:04}", self.0)
  }
}

/// Type of the values a stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
  /// Text values.
  Text,
  /// Count values.
  Count,
}

impl ValueType {
  /// Matches [`Payload::kind`].
  pub fn kind(self) -> &'static str {
    match self {
      ValueType::Text => "text",
      ValueType::Count => "count",
    }
  }
}

/// Serialization a sink applies to the records it emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Produced {
  /// Key codec.
  pub key_codec: Codec,
  /// Value codec.
  pub value_codec: Codec,
}

impl Produced {
  /// Explicit key and value codecs.
  pub fn with(key_codec: Codec, value_codec: Codec) -> Self {
    Self {
      key_codec,
      value_codec,
    }
  }

  /// String keys, long values: the shape of count output.
  pub fn counts() -> Self {
    Self::with(Codec::String, Codec::Long)
  }
}

/// What a node does.
#[derive(Clone)]
pub enum NodeKind {
  /// Entry point for records of a topic.
  Source {
    /// Topic read by this source.
    topic: String,
  },
  /// Replaces each record by zero or more records, one per produced value.
  FlatMapValues(FlatMapFn),
  /// Replaces the value of each record.
  MapValues(MapFn),
  /// Drops records the predicate rejects.
  Filter(PredicateFn),
  /// Re-keys each record with a derived group key.
  GroupBy(KeyFn),
  /// Counts records per key and emits `(key, count)`.
  Count {
    /// State store namespace holding the counters.
    namespace: String,
  },
  /// Hands records to the sink adapter.
  Sink {
    /// Destination topic.
    topic: String,
    /// Codecs for key and value.
    produced: Produced,
  },
}

impl NodeKind {
  /// Name of the kind, used in error reports.
  pub fn type_name(&self) -> &'static str {
    match self {
      NodeKind::Source { .. } => "Source",
      NodeKind::FlatMapValues(_) => "FlatMapValues",
      NodeKind::MapValues(_) => "MapValues",
      NodeKind::Filter(_) => "Filter",
      NodeKind::GroupBy(_) => "GroupBy",
      NodeKind::Count { .. } => "Count",
      NodeKind::Sink { .. } => "Sink",
    }
  }

  pub(crate) fn name_prefix(&self) -> &'static str {
    match self {
      NodeKind::Source { .. } => "source",
      NodeKind::FlatMapValues(_) => "flat-map-values",
      NodeKind::MapValues(_) => "map-values",
      NodeKind::Filter(_) => "filter",
      NodeKind::GroupBy(_) => "group-by",
      NodeKind::Count { .. } => "count",
      NodeKind::Sink { .. } => "sink",
    }
  }

  /// Type of the values this node emits, `None` for sinks.
  pub fn output_type(&self) -> Option<ValueType> {
    match self {
      NodeKind::Sink { .. } => None,
      NodeKind::Count { .. } => Some(ValueType::Count),
      _ => Some(ValueType::Text),
    }
  }

  /// Whether this node can consume values of `input`.
  pub fn accepts(&self, input: ValueType) -> bool {
    match self {
      NodeKind::Source { .. } => false,
      NodeKind::Count { .. } => true,
      NodeKind::Sink { produced, .. } => produced.value_codec.accepts(input.kind()),
      _ => input == ValueType::Text,
    }
  }
}

impl fmt::Debug for NodeKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      NodeKind::Source { topic } => f.debug_struct("Source").field("topic", topic).finish(),
      NodeKind::Count { namespace } => f
        .debug_struct("Count")
        .field("namespace", namespace)
        .finish(),
      NodeKind::Sink { topic, produced } => f
        .debug_struct("Sink")
        .field("topic", topic)
        .field("produced", produced)
        .finish(),
      other => f.write_str(other.type_name()),
    }
  }
}

/// A node of a topology.
#[derive(Debug, Clone)]
pub struct Node {
  pub(crate) id: NodeId,
  pub(crate) name: String,
  pub(crate) kind: NodeKind,
  pub(crate) successors: Vec<NodeId>,
}

impl Node {
  pub(crate) fn new(id: NodeId, kind: NodeKind) -> Self {
    Self {
      id,
      name: format!("{}-{}", kind.name_prefix(), id),
      kind,
      successors: Vec::new(),
    }
  }

  /// Node id.
  pub fn id(&self) -> NodeId {
    self.id
  }

  /// Node name, e.g. `count-0004`.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Node kind.
  pub fn kind(&self) -> &NodeKind {
    &self.kind
  }

  /// Downstream nodes, in declaration order.
  pub fn successors(&self) -> &[NodeId] {
    &self.successors
  }

  /// Applies a stateless stage to `record`.
  ///
  /// Sources pass records through unchanged. Calling this on a `Count` or
  /// `Sink` node is an error.
  pub fn transform(&self, record: &Record) -> Result<Vec<Record>, String> {
    match &self.kind {
      NodeKind::Source { .. } => Ok(vec![record.clone()]),
      NodeKind::FlatMapValues(f) => {
        let values = f(text_value(record)?).map_err(|e| e.to_string())?;
        Ok(values.into_iter().map(|v| record.with_value(v)).collect())
      }
      NodeKind::MapValues(f) => {
        let value = f(text_value(record)?).map_err(|e| e.to_string())?;
        Ok(vec![record.with_value(value)])
      }
      NodeKind::Filter(f) => {
        if f(record.key(), text_value(record)?) {
          Ok(vec![record.clone()])
        } else {
          Ok(Vec::new())
        }
      }
      NodeKind::GroupBy(f) => {
        let key = f(record.key(), text_value(record)?).map_err(|e| e.to_string())?;
        Ok(vec![record.with_key(key)])
      }
      NodeKind::Count { .. } | NodeKind::Sink { .. } => Err(format!(
        "{} is not a stateless stage",
        self.kind.type_name()
      )),
    }
  }
}

fn text_value(record: &Record) -> Result<&str, String> {
  match record.value() {
    Payload::Text(s) => Ok(s),
    other => Err(format!("expected a text value, got {}", other.kind())),
  }
}
