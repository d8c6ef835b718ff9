//! # Topology
//!
//! The validated, immutable processing graph. A [`Topology`] is only created
//! by [`TopologyBuilder::build`](crate::TopologyBuilder::build), which rejects
//! anything the engine could not execute:
//!
//! - no source, empty or duplicated topic declarations
//! - sinks writing to topics never declared with `sink_topic`
//! - invalid or duplicated aggregate namespaces
//! - edges into sources or to unknown nodes
//! - cycles, and nodes no source can reach
//! - a stage fed values it cannot handle (e.g. counts into a string codec)
//!
//! Once built, the topology is shared read-only between worker tasks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write;

use crate::error::{EngineError, Result};
use crate::node::{Node, NodeId, NodeKind, ValueType};
use crate::state::is_valid_namespace;

/// A validated processing graph.
#[derive(Debug, Clone)]
pub struct Topology {
  nodes: Vec<Node>,
  sources: HashMap<String, NodeId>,
  sink_topics: Vec<String>,
  order: Vec<NodeId>,
}

fn invalid(msg: impl Into<String>) -> EngineError {
  EngineError::InvalidTopology(msg.into())
}

impl Topology {
  pub(crate) fn validate(nodes: Vec<Node>, sink_topics: Vec<String>) -> Result<Self> {
    let mut sources = HashMap::new();
    for node in &nodes {
      if let NodeKind::Source { topic } = &node.kind {
        if topic.trim().is_empty() {
          return Err(invalid("source topic names must be non-empty"));
        }
        if sources.insert(topic.clone(), node.id).is_some() {
          return Err(invalid(format!("source topic '{}' is declared twice", topic)));
        }
      }
    }
    if sources.is_empty() {
      return Err(invalid("topology declares no source"));
    }

    let mut declared = HashSet::new();
    for topic in &sink_topics {
      if topic.trim().is_empty() {
        return Err(invalid("sink topic names must be non-empty"));
      }
      if !declared.insert(topic.as_str()) {
        return Err(invalid(format!("sink topic '{}' is declared twice", topic)));
      }
    }

    let mut namespaces = HashSet::new();
    for node in &nodes {
      match &node.kind {
        NodeKind::Sink { topic, .. } if !declared.contains(topic.as_str()) => {
          return Err(invalid(format!(
            "{} writes to undeclared topic '{}'",
            node.name, topic
          )));
        }
        NodeKind::Count { namespace } => {
          if !is_valid_namespace(namespace) {
            return Err(invalid(format!(
              "{} uses invalid namespace '{}'",
              node.name, namespace
            )));
          }
          if !namespaces.insert(namespace.as_str()) {
            return Err(invalid(format!("namespace '{}' is used twice", namespace)));
          }
        }
        _ => {}
      }
      for succ in &node.successors {
        match nodes.get(succ.0) {
          None => {
            return Err(invalid(format!(
              "{} has an edge to unknown node {}",
              node.name, succ
            )))
          }
          Some(target) if matches!(target.kind, NodeKind::Source { .. }) => {
            return Err(invalid(format!(
              "{} has an edge into source {}",
              node.name, target.name
            )))
          }
          Some(_) => {}
        }
      }
    }

    let order = topological_sort(&nodes)?;
    check_reachable(&nodes, sources.values().copied())?;
    check_value_types(&nodes, &order)?;

    Ok(Self {
      nodes,
      sources,
      sink_topics,
      order,
    })
  }

  /// All nodes, indexed by [`NodeId::index`].
  pub fn nodes(&self) -> &[Node] {
    &self.nodes
  }

  /// The node with `id`.
  pub fn node(&self, id: NodeId) -> Option<&Node> {
    self.nodes.get(id.0)
  }

  /// The source node reading `topic`.
  pub fn source_for(&self, topic: &str) -> Option<&Node> {
    self.sources.get(topic).and_then(|id| self.node(*id))
  }

  /// Declared source topics, sorted.
  pub fn source_topics(&self) -> Vec<&str> {
    let mut topics: Vec<&str> = self.sources.keys().map(String::as_str).collect();
    topics.sort_unstable();
    topics
  }

  /// Declared sink topics, in declaration order.
  pub fn sink_topics(&self) -> &[String] {
    &self.sink_topics
  }

  /// Aggregate namespaces, in declaration order.
  pub fn namespaces(&self) -> Vec<&str> {
    self
      .nodes
      .iter()
      .filter_map(|n| match &n.kind {
        NodeKind::Count { namespace } => Some(namespace.as_str()),
        _ => None,
      })
      .collect()
  }

  /// Nodes in topological order.
  pub fn topological_order(&self) -> &[NodeId] {
    &self.order
  }

  /// Human-readable listing of nodes and edges.
  pub fn describe(&self) -> String {
    let mut out = String::new();
    for id in &self.order {
      let node = &self.nodes[id.0];
      let _ = write!(out, "{} {:?}", node.name, node.kind);
      if !node.successors.is_empty() {
        let next: Vec<&str> = node
          .successors
          .iter()
          .map(|s| self.nodes[s.0].name.as_str())
          .collect();
        let _ = write!(out, " --> {}", next.join(", "));
      }
      out.push('\n');
    }
    out
  }
}

/// Kahn's algorithm. Nodes left with a non-zero in-degree lie on a cycle.
fn topological_sort(nodes: &[Node]) -> Result<Vec<NodeId>> {
  let mut in_degree = vec![0usize; nodes.len()];
  for node in nodes {
    for succ in &node.successors {
      in_degree[succ.0] += 1;
    }
  }

  let mut queue: VecDeque<NodeId> = nodes
    .iter()
    .filter(|n| in_degree[n.id.0] == 0)
    .map(|n| n.id)
    .collect();
  let mut order = Vec::with_capacity(nodes.len());
  while let Some(id) = queue.pop_front() {
    order.push(id);
    for succ in &nodes[id.0].successors {
      in_degree[succ.0] -= 1;
      if in_degree[succ.0] == 0 {
        queue.push_back(*succ);
      }
    }
  }

  if order.len() != nodes.len() {
    let cyclic: Vec<&str> = nodes
      .iter()
      .filter(|n| in_degree[n.id.0] > 0)
      .map(|n| n.name.as_str())
      .collect();
    return Err(invalid(format!(
      "topology contains a cycle through {}",
      cyclic.join(", ")
    )));
  }
  Ok(order)
}

fn check_reachable(nodes: &[Node], sources: impl Iterator<Item = NodeId>) -> Result<()> {
  let mut seen = vec![false; nodes.len()];
  let mut stack: Vec<NodeId> = sources.collect();
  while let Some(id) = stack.pop() {
    if std::mem::replace(&mut seen[id.0], true) {
      continue;
    }
    stack.extend(nodes[id.0].successors.iter().copied());
  }
  match nodes.iter().find(|n| !seen[n.id.0]) {
    Some(orphan) => Err(invalid(format!(
      "{} is not reachable from any source",
      orphan.name
    ))),
    None => Ok(()),
  }
}

fn check_value_types(nodes: &[Node], order: &[NodeId]) -> Result<()> {
  for id in order {
    let node = &nodes[id.0];
    let Some(output) = node.kind.output_type() else {
      continue;
    };
    for succ in &node.successors {
      let target = &nodes[succ.0];
      if !target.kind.accepts(output) {
        return Err(invalid(describe_mismatch(node, target, output)));
      }
    }
  }
  Ok(())
}

fn describe_mismatch(from: &Node, to: &Node, output: ValueType) -> String {
  match &to.kind {
    NodeKind::Sink { produced, .. } => format!(
      "{} cannot write {} values from {} with the {} value codec",
      to.name,
      output.kind(),
      from.name,
      produced.value_codec
    ),
    _ => format!(
      "{} cannot consume {} values from {}",
      to.name,
      output.kind(),
      from.name
    ),
  }
}
