//! # Execution engine
//!
//! An [`Engine`] runs one [`Topology`] against a set of source adapters and
//! one sink adapter.
//!
//! ## Lifecycle
//!
//! ```text
//! CREATED --start()--> RUNNING --stop()--> STOPPING --> STOPPED
//!                         |                                ^
//!                         +---- input exhausted / fatal ---+
//! ```
//!
//! `start()` opens the state store, positions every source from its committed
//! offset (or the reset policy) and spawns the worker tasks. `stop()` cancels
//! them cooperatively: each finishes its in-flight record, commits, and closes
//! its sources, after which the sink is flushed and closed and the store is
//! closed. A fatal adapter failure takes the same path on its own and is
//! returned by the next `stop()`, `wait()` or `run_for()`.
//!
//! ## Commits
//!
//! Every commit flushes the state store *before* writing offsets. After a
//! crash a restarted engine may therefore re-process records whose counts
//! were already persisted (at-least-once), but never loses counts.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{SinkAdapter, SourceAdapter};
use crate::config::RunConfig;
use crate::error::{EngineError, RecordProcessingError, Result};
use crate::graph::Topology;
use crate::offset::{FileOffsetStore, OffsetTracker};
use crate::state::StateStore;

mod worker;

use worker::{Worker, WorkerContext};

/// Name of the committed-offsets file inside the state directory.
pub const OFFSETS_FILE: &str = "offsets.json";

/// Callback invoked for every record-level failure.
pub type RecordErrorCallback = Arc<dyn Fn(&RecordProcessingError) + Send + Sync>;

/// Lifecycle state of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
  /// Built, not started.
  Created,
  /// Workers are processing records.
  Running,
  /// Workers are finishing up.
  Stopping,
  /// Everything is closed.
  Stopped,
}

impl fmt::Display for EngineState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      EngineState::Created => "CREATED",
      EngineState::Running => "RUNNING",
      EngineState::Stopping => "STOPPING",
      EngineState::Stopped => "STOPPED",
    };
    f.write_str(name)
  }
}

fn log_record_error(err: &RecordProcessingError) {
  warn!(
    node = %err.component,
    record = ?err.record().map(ToString::to_string),
    error = %err.message,
    "record processing failed"
  );
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
  topology: Topology,
  config: RunConfig,
  sources: Vec<Box<dyn SourceAdapter>>,
  sink: Option<Arc<dyn SinkAdapter>>,
  on_record_error: RecordErrorCallback,
}

impl EngineBuilder {
  /// Adds the source adapter for one topic partition.
  pub fn source(mut self, source: impl SourceAdapter + 'static) -> Self {
    self.sources.push(Box::new(source));
    self
  }

  /// Sets the sink adapter shared by every sink node.
  pub fn sink(mut self, sink: impl SinkAdapter + 'static) -> Self {
    self.sink = Some(Arc::new(sink));
    self
  }

  /// Replaces the default record-error handler, which logs at `warn`.
  pub fn on_record_error<F>(mut self, callback: F) -> Self
  where
    F: Fn(&RecordProcessingError) + Send + Sync + 'static,
  {
    self.on_record_error = Arc::new(callback);
    self
  }

  /// Checks that the adapters cover the topology and builds the engine.
  pub fn build(self) -> Result<Engine> {
    let topics: HashSet<&str> = self.topology.source_topics().into_iter().collect();
    let mut partitions = HashSet::new();
    for source in &self.sources {
      let tp = source.topic_partition();
      if !topics.contains(tp.topic.as_str()) {
        return Err(EngineError::Config(format!(
          "source adapter for {} does not match any source topic",
          tp
        )));
      }
      if !partitions.insert(tp.clone()) {
        return Err(EngineError::Config(format!(
          "more than one source adapter for {}",
          tp
        )));
      }
    }
    for topic in &topics {
      if !partitions.iter().any(|tp| tp.topic == *topic) {
        return Err(EngineError::Config(format!(
          "no source adapter for topic '{}'",
          topic
        )));
      }
    }
    if self.sink.is_none() && !self.topology.sink_topics().is_empty() {
      return Err(EngineError::Config(
        "topology writes to sink topics but no sink adapter is set".to_string(),
      ));
    }

    let (state, _) = watch::channel(EngineState::Created);
    Ok(Engine {
      topology: Arc::new(self.topology),
      config: self.config,
      sources: self.sources,
      sink: self.sink,
      on_record_error: self.on_record_error,
      state: Arc::new(state),
      cancel: CancellationToken::new(),
      driver: None,
      store: None,
    })
  }
}

/// Runs a topology.
pub struct Engine {
  topology: Arc<Topology>,
  config: RunConfig,
  sources: Vec<Box<dyn SourceAdapter>>,
  sink: Option<Arc<dyn SinkAdapter>>,
  on_record_error: RecordErrorCallback,
  state: Arc<watch::Sender<EngineState>>,
  cancel: CancellationToken,
  driver: Option<JoinHandle<Result<()>>>,
  store: Option<Arc<StateStore>>,
}

impl Engine {
  /// Starts building an engine for `topology`.
  pub fn builder(topology: Topology, config: RunConfig) -> EngineBuilder {
    EngineBuilder {
      topology,
      config,
      sources: Vec::new(),
      sink: None,
      on_record_error: Arc::new(log_record_error),
    }
  }

  /// Current lifecycle state.
  pub fn state(&self) -> EngineState {
    *self.state.borrow()
  }

  /// The topology being run.
  pub fn topology(&self) -> &Topology {
    &self.topology
  }

  /// The run configuration.
  pub fn config(&self) -> &RunConfig {
    &self.config
  }

  /// The state store of the current (or last) run.
  pub fn store(&self) -> Option<&Arc<StateStore>> {
    self.store.as_ref()
  }

  /// Opens state and sources and spawns the workers.
  ///
  /// Fails with `IllegalState` unless the engine is `CREATED`. Any other
  /// failure rolls back what was opened and leaves the engine `STOPPED`.
  pub async fn start(&mut self) -> Result<()> {
    let current = self.state();
    if current != EngineState::Created {
      return Err(EngineError::IllegalState {
        operation: "start",
        state: current,
      });
    }
    match self.launch().await {
      Ok(()) => Ok(()),
      Err(e) => {
        error!(application_id = %self.config.application_id(), error = %e, "engine failed to start");
        self.state.send_replace(EngineState::Stopped);
        Err(e)
      }
    }
  }

  async fn launch(&mut self) -> Result<()> {
    let state_path = self.config.state_path();
    let store = Arc::new(StateStore::open_with(
      &state_path,
      self.config.ephemeral_state(),
    )?);
    self.store = Some(store.clone());

    let prepared = self.prepare(&store).await;
    let (counters, tracker) = match prepared {
      Ok(parts) => parts,
      Err(e) => {
        let _ = store.close();
        return Err(e);
      }
    };

    let mut opened: Vec<Box<dyn SourceAdapter>> = Vec::with_capacity(self.sources.len());
    let sources = std::mem::take(&mut self.sources);
    let open_all = async {
      for mut source in sources {
        let tp = source.topic_partition();
        let start = tracker.start_position(&tp)?;
        source.open(start).await?;
        debug!(topic = %tp, start = ?start, "source opened");
        opened.push(source);
      }
      Ok::<(), EngineError>(())
    };
    if let Err(e) = open_all.await {
      for source in opened.iter_mut() {
        let _ = source.close().await;
      }
      let _ = store.close();
      return Err(e);
    }

    let ctx = Arc::new(WorkerContext {
      topology: self.topology.clone(),
      store,
      counters,
      tracker,
      sink: self.sink.clone(),
      on_record_error: self.on_record_error.clone(),
      commit_interval: self.config.commit_interval(),
      poll_timeout: self.config.poll_timeout(),
      cancel: self.cancel.clone(),
    });

    let worker_count = self.config.num_workers().min(opened.len()).max(1);
    let mut assignments: Vec<Vec<Box<dyn SourceAdapter>>> =
      (0..worker_count).map(|_| Vec::new()).collect();
    for (i, source) in opened.into_iter().enumerate() {
      assignments[i % worker_count].push(source);
    }
    let workers: Vec<JoinHandle<Result<()>>> = assignments
      .into_iter()
      .enumerate()
      .map(|(id, sources)| tokio::spawn(Worker::new(id, ctx.clone(), sources).run()))
      .collect();

    self.state.send_replace(EngineState::Running);
    info!(
      application_id = %self.config.application_id(),
      workers = worker_count,
      state_path = %state_path.display(),
      "engine started"
    );
    self.driver = Some(tokio::spawn(supervise(
      workers,
      ctx,
      self.state.clone(),
      self.cancel.clone(),
    )));
    Ok(())
  }

  #[allow(clippy::type_complexity)]
  async fn prepare(
    &self,
    store: &StateStore,
  ) -> Result<(HashMap<String, Arc<crate::state::CounterNamespace>>, Arc<OffsetTracker>)> {
    let mut counters = HashMap::new();
    for namespace in self.topology.namespaces() {
      counters.insert(namespace.to_string(), store.counters(namespace)?);
    }
    let offsets = FileOffsetStore::new(store.path().join(OFFSETS_FILE))?;
    let tracker =
      OffsetTracker::new(Box::new(offsets)).with_reset_policy(self.config.offset_reset());
    Ok((counters, Arc::new(tracker)))
  }

  /// Stops a running engine and waits for teardown.
  ///
  /// A no-op on an engine that was never started or is already stopped.
  /// Returns the fatal error that ended the run, if any.
  pub async fn stop(&mut self) -> Result<()> {
    let Some(driver) = self.driver.take() else {
      return Ok(());
    };
    if self.state() == EngineState::Running {
      self.state.send_replace(EngineState::Stopping);
      info!(application_id = %self.config.application_id(), "stopping engine");
    }
    self.cancel.cancel();
    join(driver).await
  }

  /// Waits for the run to end on its own: every source exhausted, or a
  /// fatal error.
  pub async fn wait(&mut self) -> Result<()> {
    match self.driver.take() {
      Some(driver) => join(driver).await,
      None if self.state() == EngineState::Created => Err(EngineError::IllegalState {
        operation: "wait for",
        state: EngineState::Created,
      }),
      None => Ok(()),
    }
  }

  /// Starts the engine, lets it run for at most `duration`, then stops it.
  pub async fn run_for(&mut self, duration: Duration) -> Result<()> {
    self.start().await?;
    let finished = match self.driver.as_mut() {
      Some(driver) => tokio::time::timeout(duration, driver).await.ok(),
      None => None,
    };
    match finished {
      Some(joined) => {
        self.driver = None;
        flatten(joined)
      }
      None => self.stop().await,
    }
  }
}

impl Drop for Engine {
  fn drop(&mut self) {
    // Workers notice and the spawned supervisor still tears down.
    self.cancel.cancel();
  }
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
  joined.map_err(|e| EngineError::Worker(e.to_string()))?
}

async fn join(driver: JoinHandle<Result<()>>) -> Result<()> {
  flatten(driver.await)
}

/// Waits for every worker, then tears down the sink and the store.
async fn supervise(
  workers: Vec<JoinHandle<Result<()>>>,
  ctx: Arc<WorkerContext>,
  state: Arc<watch::Sender<EngineState>>,
  cancel: CancellationToken,
) -> Result<()> {
  let mut fatal: Option<EngineError> = None;
  let mut pending: FuturesUnordered<_> = workers.into_iter().collect();
  while let Some(joined) = pending.next().await {
    if let Err(e) = flatten(joined) {
      if fatal.is_none() {
        error!(error = %e, "worker failed, stopping engine");
        cancel.cancel();
        fatal = Some(e);
      }
    }
  }
  state.send_if_modified(|s| {
    if *s == EngineState::Running {
      *s = EngineState::Stopping;
      true
    } else {
      false
    }
  });

  if let Some(sink) = &ctx.sink {
    let closed = match sink.flush().await {
      Ok(()) => sink.close().await,
      Err(e) => Err(e),
    };
    if let Err(e) = closed {
      warn!(error = %e, "failed to flush sink");
      fatal.get_or_insert(e.into());
    }
  }
  let store = Arc::clone(&ctx.store);
  let closed = tokio::task::spawn_blocking(move || store.close())
    .await
    .map_err(|e| EngineError::Worker(format!("store close task failed: {}", e)))
    .and_then(|r| r.map_err(EngineError::from));
  if let Err(e) = closed {
    error!(error = %e, "failed to close state store");
    fatal.get_or_insert(e);
  }

  state.send_replace(EngineState::Stopped);
  match fatal {
    Some(e) => Err(e),
    None => {
      info!("engine stopped");
      Ok(())
    }
  }
}
