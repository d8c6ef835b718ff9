//! Worker task: polls its sources, walks each record through the topology
//! and commits on the commit interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::RecordErrorCallback;
use crate::adapter::{SinkAdapter, SourceAdapter};
use crate::error::{ComponentInfo, EngineError, RecordProcessingError, Result};
use crate::graph::Topology;
use crate::message::{Record, TopicPartition};
use crate::node::{Node, NodeId, NodeKind};
use crate::offset::{Offset, OffsetTracker};
use crate::state::{CounterNamespace, StateStore};

/// Everything workers share. Read-only apart from the store and the tracker,
/// which synchronize internally.
pub(crate) struct WorkerContext {
  pub(crate) topology: Arc<Topology>,
  pub(crate) store: Arc<StateStore>,
  pub(crate) counters: HashMap<String, Arc<CounterNamespace>>,
  pub(crate) tracker: Arc<OffsetTracker>,
  pub(crate) sink: Option<Arc<dyn SinkAdapter>>,
  pub(crate) on_record_error: RecordErrorCallback,
  pub(crate) commit_interval: Duration,
  pub(crate) poll_timeout: Duration,
  pub(crate) cancel: CancellationToken,
}

pub(crate) struct Worker {
  id: usize,
  ctx: Arc<WorkerContext>,
  sources: Vec<Box<dyn SourceAdapter>>,
  last_commit: Instant,
}

impl Worker {
  pub(crate) fn new(id: usize, ctx: Arc<WorkerContext>, sources: Vec<Box<dyn SourceAdapter>>) -> Self {
    Self {
      id,
      ctx,
      sources,
      last_commit: Instant::now(),
    }
  }

  pub(crate) async fn run(mut self) -> Result<()> {
    let partitions: Vec<String> = self
      .sources
      .iter()
      .map(|s| s.topic_partition().to_string())
      .collect();
    info!(worker = self.id, partitions = ?partitions, "worker started");

    let outcome = self.poll_loop().await;
    // After a fatal adapter error the broker cannot take a commit, but the
    // records fully processed so far are still persisted together with
    // their offsets, so a restart neither loses nor re-counts them.
    let committed = match &outcome {
      Ok(()) => self.commit().await,
      Err(e) => {
        warn!(worker = self.id, error = %e, "committing processed offsets locally only");
        self.commit_local().await.map(|_| ())
      }
    };
    for source in self.sources.iter_mut() {
      if let Err(e) = source.close().await {
        warn!(worker = self.id, topic = %source.topic_partition(), error = %e, "failed to close source");
      }
    }
    info!(worker = self.id, "worker stopped");
    outcome.and(committed)
  }

  fn poll_timeout(&self) -> Duration {
    let live = self.sources.iter().filter(|s| !s.is_exhausted()).count().max(1);
    (self.ctx.poll_timeout / live as u32).max(Duration::from_millis(1))
  }

  async fn poll_loop(&mut self) -> Result<()> {
    let cancel = self.ctx.cancel.clone();
    loop {
      if cancel.is_cancelled() {
        return Ok(());
      }
      if self.sources.iter().all(|s| s.is_exhausted()) {
        debug!(worker = self.id, "all sources exhausted");
        return Ok(());
      }

      let timeout = self.poll_timeout();
      for i in 0..self.sources.len() {
        if self.sources[i].is_exhausted() {
          continue;
        }
        let batch = tokio::select! {
          _ = cancel.cancelled() => return Ok(()),
          polled = self.sources[i].poll(timeout) => polled?,
        };
        if batch.is_empty() {
          continue;
        }
        let tp = self.sources[i].topic_partition();
        for record in batch {
          self.process(&record).await?;
          self.ctx.tracker.record(&tp, Offset(record.offset()))?;
          self.maybe_commit().await?;
          if cancel.is_cancelled() {
            return Ok(());
          }
        }
      }
      self.maybe_commit().await?;
    }
  }

  /// Depth-first traversal from the record's source node. A failing stage
  /// abandons only its own path; returns `Err` only for fatal failures.
  async fn process(&mut self, record: &Record) -> Result<()> {
    let ctx = Arc::clone(&self.ctx);
    let Some(source) = ctx.topology.source_for(record.topic()) else {
      warn!(topic = %record.topic(), "no source node for record topic");
      return Ok(());
    };

    let mut stack: Vec<(NodeId, Record)> = Vec::new();
    push_successors(&mut stack, source, record);
    while let Some((id, current)) = stack.pop() {
      let Some(node) = ctx.topology.node(id) else {
        continue;
      };
      match node.kind() {
        NodeKind::Count { namespace } => {
          let Some(key) = current.key() else {
            report(&ctx, node, &current, "cannot count a record without a key");
            continue;
          };
          let Some(counters) = ctx.counters.get(namespace) else {
            report(&ctx, node, &current, format!("unknown namespace '{}'", namespace));
            continue;
          };
          let counter = counters.increment(key)?;
          trace!(node = %node.name(), key = %counter.key, count = counter.count, "counted");
          push_successors(&mut stack, node, &current.with_value(counter.count));
        }
        NodeKind::Sink { topic, produced } => {
          let Some(sink) = &ctx.sink else {
            return Err(EngineError::Config("no sink adapter".to_string()));
          };
          match sink.send(topic, current.with_topic(topic.as_str()), *produced).await {
            Ok(ack) => trace!(node = %node.name(), topic = %ack.topic_partition, offset = %ack.offset, "sent"),
            Err(e) if !e.is_fatal() => report(&ctx, node, &current, e.to_string()),
            Err(e) => return Err(e.into()),
          }
        }
        _ => match node.transform(&current) {
          Ok(outputs) => {
            for output in outputs.iter().rev() {
              push_successors(&mut stack, node, output);
            }
          }
          Err(message) => report(&ctx, node, &current, message),
        },
      }
    }
    Ok(())
  }

  async fn maybe_commit(&mut self) -> Result<()> {
    if self.last_commit.elapsed() < self.ctx.commit_interval {
      return Ok(());
    }
    self.commit().await
  }

  /// State first, offsets second: a crash in between replays records
  /// instead of losing counts.
  async fn commit(&mut self) -> Result<()> {
    let committed = self.commit_local().await?;
    for source in self.sources.iter_mut() {
      if let Some(next) = committed.get(&source.topic_partition()) {
        source.commit(*next).await?;
      }
    }
    if !committed.is_empty() {
      debug!(worker = self.id, partitions = committed.len(), "committed offsets");
    }
    Ok(())
  }

  /// Flushes the state store and commits pending offsets to the offset
  /// store. Both fsync, so they run on the blocking pool.
  async fn commit_local(&mut self) -> Result<HashMap<TopicPartition, Offset>> {
    self.last_commit = Instant::now();
    let partitions: Vec<TopicPartition> = self.sources.iter().map(|s| s.topic_partition()).collect();
    let store = Arc::clone(&self.ctx.store);
    let tracker = Arc::clone(&self.ctx.tracker);

    tokio::task::spawn_blocking(move || -> Result<HashMap<TopicPartition, Offset>> {
      store.flush()?;
      Ok(tracker.commit(&partitions)?)
    })
    .await
    .map_err(|e| EngineError::Worker(format!("commit task failed: {}", e)))?
  }
}

/// Pushes `(successor, record)` so that successors pop in declaration order.
fn push_successors(stack: &mut Vec<(NodeId, Record)>, node: &Node, record: &Record) {
  for succ in node.successors().iter().rev() {
    stack.push((*succ, record.clone()));
  }
}

fn report(ctx: &WorkerContext, node: &Node, record: &Record, message: impl Into<String>) {
  let err = RecordProcessingError::new(
    record,
    ComponentInfo::new(node.name(), node.kind().type_name()),
    message,
  );
  (ctx.on_record_error)(&err);
}
