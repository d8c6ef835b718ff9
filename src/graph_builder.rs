//! # TopologyBuilder
//!
//! Fluent API for declaring a topology.
//!
//! Every declaration returns a small `Copy` handle pointing at the node it
//! added. Chaining a handle adds a successor edge, so branching is just
//! reusing a handle twice. Handles are typed by the values they carry:
//! `group_by` is only available on text streams and `to_stream` on a
//! [`KTable`] yields a `KStream<u64>`.
//!
//! Nothing is checked while declaring. [`TopologyBuilder::build`] validates
//! the whole graph at once and produces an immutable [`Topology`].
//!
//! # Example
//!
//! ```rust
//! use countweave::TopologyBuilder;
//!
//! let builder = TopologyBuilder::new();
//! builder.sink_topic("lengths");
//! builder
//!   .source("lines")
//!   .map_values(|line| line.len().to_string())
//!   .to("lengths");
//! let topology = builder.build().unwrap();
//! assert_eq!(topology.source_topics(), vec!["lines"]);
//! ```

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::Result;
use crate::graph::Topology;
use crate::node::{BoxError, Node, NodeId, NodeKind, ValueType};

pub use crate::node::Produced;

/// Value types a [`KStream`] can carry.
pub trait StreamValue: Send + Sync + 'static {
  /// Runtime value type.
  const VALUE_TYPE: ValueType;

  /// Codecs used by [`KStream::to`].
  fn default_produced() -> Produced;
}

impl StreamValue for String {
  const VALUE_TYPE: ValueType = ValueType::Text;

  fn default_produced() -> Produced {
    Produced::default()
  }
}

impl StreamValue for u64 {
  const VALUE_TYPE: ValueType = ValueType::Count;

  fn default_produced() -> Produced {
    Produced::counts()
  }
}

#[derive(Default)]
struct BuilderInner {
  nodes: Vec<Node>,
  sink_topics: Vec<String>,
}

/// Accumulates topology declarations.
#[derive(Default)]
pub struct TopologyBuilder {
  inner: RefCell<BuilderInner>,
}

impl TopologyBuilder {
  /// Creates an empty builder.
  pub fn new() -> Self {
    Self::default()
  }

  fn add(&self, upstream: Option<NodeId>, kind: NodeKind) -> NodeId {
    let mut inner = self.inner.borrow_mut();
    let id = NodeId(inner.nodes.len());
    inner.nodes.push(Node::new(id, kind));
    if let Some(up) = upstream {
      inner.nodes[up.0].successors.push(id);
    }
    id
  }

  /// Declares a source topic and returns the stream of its records.
  pub fn source(&self, topic: impl Into<String>) -> KStream<'_, String> {
    let id = self.add(None, NodeKind::Source { topic: topic.into() });
    KStream::new(self, id)
  }

  /// Declares an output topic. Sinks may only write to declared topics.
  pub fn sink_topic(&self, topic: impl Into<String>) -> &Self {
    self.inner.borrow_mut().sink_topics.push(topic.into());
    self
  }

  /// Adds an edge between two existing nodes.
  ///
  /// Edges that do not fit (into a source, forming a cycle, joining value
  /// types that do not match) are rejected by [`TopologyBuilder::build`].
  pub fn connect(&self, upstream: NodeId, downstream: NodeId) -> &Self {
    {
      let mut inner = self.inner.borrow_mut();
      if let Some(node) = inner.nodes.get_mut(upstream.0) {
        node.successors.push(downstream);
      }
    }
    self
  }

  /// Validates the declarations and freezes them into a [`Topology`].
  pub fn build(self) -> Result<Topology> {
    let inner = self.inner.into_inner();
    Topology::validate(inner.nodes, inner.sink_topics)
  }
}

/// A stream of records whose values are `V`.
pub struct KStream<'a, V> {
  builder: &'a TopologyBuilder,
  id: NodeId,
  _values: PhantomData<fn() -> V>,
}

impl<V> Clone for KStream<'_, V> {
  fn clone(&self) -> Self {
    *self
  }
}

impl<V> Copy for KStream<'_, V> {}

impl<'a, V: StreamValue> KStream<'a, V> {
  fn new(builder: &'a TopologyBuilder, id: NodeId) -> Self {
    Self {
      builder,
      id,
      _values: PhantomData,
    }
  }

  /// Id of the node producing this stream.
  pub fn id(&self) -> NodeId {
    self.id
  }

  /// Writes the stream to `topic` with the default codecs for `V`.
  pub fn to(self, topic: impl Into<String>) -> NodeId {
    self.to_with(topic, V::default_produced())
  }

  /// Writes the stream to `topic` with explicit codecs.
  pub fn to_with(self, topic: impl Into<String>, produced: Produced) -> NodeId {
    self.builder.add(
      Some(self.id),
      NodeKind::Sink {
        topic: topic.into(),
        produced,
      },
    )
  }
}

impl<'a> KStream<'a, String> {
  fn chain(self, kind: NodeKind) -> Self {
    KStream::new(self.builder, self.builder.add(Some(self.id), kind))
  }

  /// Replaces each record by one record per value `f` returns. Key and
  /// position are kept.
  pub fn flat_map_values<F, I>(self, f: F) -> Self
  where
    F: Fn(&str) -> I + Send + Sync + 'static,
    I: IntoIterator<Item = String>,
  {
    self.chain(NodeKind::FlatMapValues(Arc::new(move |v: &str| {
      Ok::<_, BoxError>(f(v).into_iter().collect::<Vec<String>>())
    })))
  }

  /// Like [`KStream::flat_map_values`] for functions that can fail.
  pub fn try_flat_map_values<F, E>(self, f: F) -> Self
  where
    F: Fn(&str) -> std::result::Result<Vec<String>, E> + Send + Sync + 'static,
    E: Into<BoxError>,
  {
    self.chain(NodeKind::FlatMapValues(Arc::new(move |v: &str| {
      f(v).map_err(Into::<BoxError>::into)
    })))
  }

  /// Replaces each value.
  pub fn map_values<F>(self, f: F) -> Self
  where
    F: Fn(&str) -> String + Send + Sync + 'static,
  {
    self.chain(NodeKind::MapValues(Arc::new(move |v: &str| Ok::<_, BoxError>(f(v)))))
  }

  /// Keeps records for which `f(key, value)` holds.
  pub fn filter<F>(self, f: F) -> Self
  where
    F: Fn(Option<&str>, &str) -> bool + Send + Sync + 'static,
  {
    self.chain(NodeKind::Filter(Arc::new(f)))
  }

  /// Re-keys each record with `f(key, value)`.
  pub fn group_by<F>(self, f: F) -> KGroupedStream<'a>
  where
    F: Fn(Option<&str>, &str) -> String + Send + Sync + 'static,
  {
    let stream = self.chain(NodeKind::GroupBy(Arc::new(move |k: Option<&str>, v: &str| {
      Ok::<_, BoxError>(f(k, v))
    })));
    KGroupedStream {
      builder: stream.builder,
      id: stream.id,
    }
  }

  /// Like [`KStream::group_by`] for key functions that can fail.
  pub fn try_group_by<F, E>(self, f: F) -> KGroupedStream<'a>
  where
    F: Fn(Option<&str>, &str) -> std::result::Result<String, E> + Send + Sync + 'static,
    E: Into<BoxError>,
  {
    let stream = self.chain(NodeKind::GroupBy(Arc::new(move |k: Option<&str>, v: &str| {
      f(k, v).map_err(Into::<BoxError>::into)
    })));
    KGroupedStream {
      builder: stream.builder,
      id: stream.id,
    }
  }
}

/// A re-keyed stream, ready for aggregation.
#[derive(Clone, Copy)]
pub struct KGroupedStream<'a> {
  builder: &'a TopologyBuilder,
  id: NodeId,
}

impl<'a> KGroupedStream<'a> {
  /// Id of the group-by node.
  pub fn id(&self) -> NodeId {
    self.id
  }

  /// Counts records per key in a namespace named after the count node.
  pub fn count(self) -> KTable<'a> {
    let next = NodeId(self.builder.inner.borrow().nodes.len());
    self.count_as(format!("count-{}", next))
  }

  /// Counts records per key in the namespace `name`.
  pub fn count_as(self, name: impl Into<String>) -> KTable<'a> {
    let id = self.builder.add(
      Some(self.id),
      NodeKind::Count {
        namespace: name.into(),
      },
    );
    KTable {
      builder: self.builder,
      id,
    }
  }
}

/// The changelog of an aggregation: one `(key, count)` per update.
#[derive(Clone, Copy)]
pub struct KTable<'a> {
  builder: &'a TopologyBuilder,
  id: NodeId,
}

impl<'a> KTable<'a> {
  /// Id of the count node.
  pub fn id(&self) -> NodeId {
    self.id
  }

  /// Every update as a stream of counts keyed by group key.
  pub fn to_stream(self) -> KStream<'a, u64> {
    KStream::new(self.builder, self.id)
  }
}
