//! Run session - the explicit per-run state object.
//!
//! A session owns one dispatch task and everything the run needs: registry,
//! worker pool, event bus, command channel. Nothing is ambient or global, so
//! several independent sessions can coexist in one process. Headless callers
//! drive `run_to_stop` / `shutdown_and_wait`; an interactive collaborator
//! keeps the session alive, subscribes to the bus, and issues `retest` /
//! `start` until it decides to shut down.

use specter_common::{Error, Result, RunPhase, TestDescriptor, WorkerState};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bus::{EventBus, RunEvent, Subscription};
use crate::config::RunnerConfig;
use crate::registry::{Snapshot, TestRegistry};
use crate::scheduler::{Command, Dispatcher, SharedState};
use crate::worker::{ProcessSpawner, WorkerSpawner};

/// One orchestrated run: registry, worker pool, and lifecycle events
pub struct RunSession {
    bus: EventBus,
    commands: mpsc::UnboundedSender<Command>,
    dispatch: JoinHandle<()>,
    shared: SharedState,
}

impl RunSession {
    /// Create a session over real worker processes. Seeding happens here and
    /// is all-or-nothing: a duplicate identifier fails the whole session
    /// before any task is spawned.
    pub fn new(
        config: RunnerConfig,
        descriptors: &[TestDescriptor],
        bus: EventBus,
    ) -> Result<Self> {
        Self::with_spawner(config, descriptors, bus, ProcessSpawner)
    }

    pub(crate) fn with_spawner<S: WorkerSpawner>(
        config: RunnerConfig,
        descriptors: &[TestDescriptor],
        bus: EventBus,
        spawner: S,
    ) -> Result<Self> {
        config.validate()?;
        let mut registry = TestRegistry::new();
        registry.seed(descriptors)?;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let shared = SharedState::new();
        let dispatcher = Dispatcher::new(
            config,
            registry,
            bus.clone(),
            spawner,
            commands_rx,
            shared.clone(),
        );
        let dispatch = tokio::spawn(dispatcher.run());
        debug!("session created with {} tests", descriptors.len());

        Ok(Self {
            bus,
            commands,
            dispatch,
            shared,
        })
    }

    /// The lifecycle event bus this session publishes on
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Subscribe to lifecycle events
    pub fn events(&self) -> broadcast::Receiver<RunEvent> {
        self.bus.subscribe()
    }

    /// Begin (or resume, after a stop) dispatching pending tests
    pub fn start(&self) -> Result<()> {
        self.send(Command::Start)
    }

    /// Move failed tests back to pending, clearing their errors
    pub fn retest(&self, test_ids: Vec<String>) -> Result<()> {
        self.send(Command::Retest { test_ids })
    }

    /// Drain in-flight tests and terminate all workers
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::SessionClosed)
    }

    /// Point-in-time copy of every test record
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Aggregate run phase
    pub fn phase(&self) -> RunPhase {
        *self.shared.phase.read()
    }

    /// Observable state of every worker
    pub fn workers(&self) -> Vec<WorkerState> {
        let mut workers: Vec<WorkerState> =
            self.shared.workers.read().values().cloned().collect();
        workers.sort_by_key(|w| w.id);
        workers
    }

    /// Headless convenience: subscribe for `stop`, start, and return the
    /// final snapshot. The subscription is registered before the start
    /// command, so the stop event cannot be missed.
    pub async fn run_to_stop(&self) -> Result<Snapshot> {
        let stop = self.subscribe_stop();
        self.start()?;
        match stop.wait().await? {
            RunEvent::Stop { snapshot } => Ok(snapshot),
            _ => Err(Error::Internal("stop subscription yielded a non-stop event".into())),
        }
    }

    /// Single-shot subscription for the next `stop` event
    pub fn subscribe_stop(&self) -> Subscription {
        self.bus
            .subscribe_once(|event| matches!(event, RunEvent::Stop { .. }))
    }

    /// Drain, wait until every worker has terminated, and return the final
    /// snapshot carried by the `shutdown` event.
    pub async fn shutdown_and_wait(&self) -> Result<Snapshot> {
        let done = self
            .bus
            .subscribe_once(|event| matches!(event, RunEvent::Shutdown { .. }));
        self.shutdown()?;
        match done.wait().await? {
            RunEvent::Shutdown { snapshot } => Ok(snapshot),
            _ => Err(Error::Internal(
                "shutdown subscription yielded a non-shutdown event".into(),
            )),
        }
    }

    /// Wait for the dispatch task to finish. Meaningful after a shutdown.
    pub async fn join(self) -> Result<()> {
        self.dispatch
            .await
            .map_err(|e| Error::Internal(format!("dispatch task panicked: {}", e)))
    }
}
