//! Dispatch scheduler
//!
//! A single task owns the registry and the worker pool and mutates them only
//! in response to discrete inbound events: session commands, worker
//! messages, worker exits, and the shutdown grace timer. Messages from one
//! worker arrive in send order; interleaving across workers is arbitrary and
//! nothing here assumes otherwise.

use parking_lot::RwLock;
use specter_common::{Message, RunPhase, WorkerPhase, WorkerState};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, RunEvent};
use crate::config::RunnerConfig;
use crate::registry::{Snapshot, TestRegistry};
use crate::worker::{SignalSender, WorkerHandle, WorkerSignal, WorkerSpawner};

/// Commands accepted by the dispatch task
#[derive(Debug)]
pub enum Command {
    /// Spawn worker pools (first time) and dispatch everything pending
    Start,
    /// `failed -> pending` for the listed tests; takes effect on the next
    /// start in a stopped session, immediately in a running one
    Retest { test_ids: Vec<String> },
    /// Drain in-flight tests and terminate every worker
    Shutdown,
    /// Point-in-time registry copy
    Snapshot { reply: oneshot::Sender<Snapshot> },
}

/// Observable state shared with collaborators outside the dispatch task
#[derive(Clone)]
pub(crate) struct SharedState {
    pub(crate) phase: Arc<RwLock<RunPhase>>,
    pub(crate) workers: Arc<RwLock<HashMap<u32, WorkerState>>>,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        Self {
            phase: Arc::new(RwLock::new(RunPhase::Initializing)),
            workers: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

enum Step {
    Command(Command),
    Signal(WorkerSignal),
    GraceExpired,
    CommandsClosed,
}

pub(crate) struct Dispatcher<S: WorkerSpawner> {
    config: RunnerConfig,
    registry: TestRegistry,
    workers: HashMap<u32, WorkerHandle>,
    bus: EventBus,
    spawner: S,
    commands: mpsc::UnboundedReceiver<Command>,
    signals: mpsc::UnboundedReceiver<WorkerSignal>,
    pub(crate) signal_tx: SignalSender,
    shared: SharedState,
    next_worker_id: u32,
    stop_emitted: bool,
    commands_closed: bool,
    finished: bool,
    grace_timer: Pin<Box<Sleep>>,
    grace_armed: bool,
}

impl<S: WorkerSpawner> Dispatcher<S> {
    pub(crate) fn new(
        config: RunnerConfig,
        registry: TestRegistry,
        bus: EventBus,
        spawner: S,
        commands: mpsc::UnboundedReceiver<Command>,
        shared: SharedState,
    ) -> Self {
        let (signal_tx, signals) = mpsc::unbounded_channel();
        Self {
            config,
            registry,
            workers: HashMap::new(),
            bus,
            spawner,
            commands,
            signals,
            signal_tx,
            shared,
            next_worker_id: 0,
            stop_emitted: false,
            commands_closed: false,
            finished: false,
            grace_timer: Box::pin(tokio::time::sleep(Duration::from_secs(0))),
            grace_armed: false,
        }
    }

    /// Event loop. Runs until shutdown has fully drained.
    pub(crate) async fn run(mut self) {
        loop {
            let step = {
                let commands = &mut self.commands;
                let signals = &mut self.signals;
                let commands_open = !self.commands_closed;
                let grace_armed = self.grace_armed;
                let grace_timer = &mut self.grace_timer;
                tokio::select! {
                    command = commands.recv(), if commands_open => match command {
                        Some(command) => Step::Command(command),
                        None => Step::CommandsClosed,
                    },
                    signal = signals.recv() => match signal {
                        Some(signal) => Step::Signal(signal),
                        // The dispatcher holds a sender itself, so this
                        // cannot happen; treat it like a dropped session.
                        None => Step::CommandsClosed,
                    },
                    () = grace_timer.as_mut(), if grace_armed => Step::GraceExpired,
                }
            };

            match step {
                Step::Command(Command::Start) => self.handle_start(),
                Step::Command(Command::Retest { test_ids }) => self.handle_retest(test_ids),
                Step::Command(Command::Snapshot { reply }) => {
                    let _ = reply.send(self.registry.snapshot());
                }
                Step::Command(Command::Shutdown) => self.begin_drain(),
                Step::CommandsClosed => {
                    // Session dropped; drain and terminate.
                    self.commands_closed = true;
                    self.begin_drain();
                }
                Step::Signal(WorkerSignal::Message { worker_id, message }) => {
                    self.handle_worker_message(worker_id, message).await;
                }
                Step::Signal(WorkerSignal::Exited { worker_id }) => {
                    self.handle_worker_exit(worker_id).await;
                }
                Step::GraceExpired => self.handle_grace_expired().await,
            }

            if self.finished {
                break;
            }
        }
    }

    fn phase(&self) -> RunPhase {
        *self.shared.phase.read()
    }

    fn set_phase(&self, phase: RunPhase) {
        *self.shared.phase.write() = phase;
    }

    fn handle_start(&mut self) {
        match self.phase() {
            RunPhase::Initializing | RunPhase::Stopped => {}
            phase => {
                warn!("start ignored while {}", phase);
                return;
            }
        }
        self.set_phase(RunPhase::Running);
        self.stop_emitted = false;
        self.bus.publish(RunEvent::Start);
        if self.workers.is_empty() {
            self.spawn_pools();
        }
        info!(
            "run started: {} tests across {} workers",
            self.registry.len(),
            self.workers.len()
        );
        self.dispatch_pending();
        self.check_completion();
    }

    /// Spawn `limit` workers per configured browser. Browser names are
    /// walked in sorted order so worker ids are stable.
    fn spawn_pools(&mut self) {
        let mut names: Vec<String> = self.config.browsers.keys().cloned().collect();
        names.sort();
        for name in names {
            let limit = self.config.browsers[&name].limit;
            for _ in 0..limit {
                let id = self.next_worker_id;
                self.next_worker_id += 1;
                self.shared.workers.write().insert(
                    id,
                    WorkerState {
                        id,
                        browser: name.clone(),
                        phase: WorkerPhase::Starting,
                        assigned: None,
                        consecutive_crashes: 0,
                    },
                );
                match self
                    .spawner
                    .spawn(id, &name, &self.config, self.signal_tx.clone())
                {
                    Ok(worker) => {
                        self.shared.workers.write().insert(id, worker.state());
                        self.workers.insert(id, worker);
                    }
                    Err(e) => {
                        error!("failed to spawn {} worker: {}", name, e);
                        self.shared.workers.write().remove(&id);
                    }
                }
            }
            if !self.workers.values().any(|w| w.browser == name) {
                self.fail_pending_for_browser(&name, "no worker available");
            }
        }
    }

    fn handle_retest(&mut self, test_ids: Vec<String>) {
        for test_id in test_ids {
            match self.registry.retest(&test_id) {
                Ok(()) => self.publish_update(&test_id),
                Err(e) => warn!("retest {}: {}", test_id, e),
            }
        }
        self.dispatch_pending();
        self.sync_workers();
    }

    /// Assign pending tests, in seeding order, to idle workers of the
    /// matching browser. A worker never carries more than one test.
    fn dispatch_pending(&mut self) {
        if self.phase() != RunPhase::Running {
            return;
        }
        for test_id in self.registry.pending_in_order() {
            let Some(record) = self.registry.get(&test_id) else {
                continue;
            };
            let descriptor = record.descriptor.clone();
            let Some(worker) = self
                .workers
                .values_mut()
                .find(|w| w.phase == WorkerPhase::Idle && w.browser == descriptor.browser)
            else {
                continue;
            };
            let worker_id = worker.id;
            match worker.assign(&descriptor) {
                Ok(()) => {
                    if let Err(e) = self.registry.mark_running(&test_id) {
                        error!("mark_running {}: {}", test_id, e);
                    }
                    debug!("assigned {} to worker {}", test_id, worker_id);
                    self.publish_update(&test_id);
                }
                Err(e) => warn!("assign {} to worker {}: {}", test_id, worker_id, e),
            }
        }
        self.sync_workers();
    }

    async fn handle_worker_message(&mut self, worker_id: u32, message: Message) {
        match message {
            Message::Result {
                test_id,
                status,
                images,
                error,
                duration_ms,
            } => {
                let Some(worker) = self.workers.get_mut(&worker_id) else {
                    debug!("result from unknown worker {}", worker_id);
                    return;
                };
                if worker.assigned.as_deref() != Some(test_id.as_str()) {
                    warn!(
                        "worker {} reported a result for unassigned test {}",
                        worker_id, test_id
                    );
                    return;
                }
                worker.complete_assignment();
                match self
                    .registry
                    .record_outcome(&test_id, status, images, error, duration_ms)
                {
                    Ok(()) => self.publish_update(&test_id),
                    Err(e) => error!("dropping result for {}: {}", test_id, e),
                }
                self.sync_workers();
                if self.phase() != RunPhase::Draining {
                    self.dispatch_pending();
                    self.check_completion();
                }
            }
            Message::Crash { .. } => {
                warn!("worker {} reported an unrecoverable crash", worker_id);
                self.handle_crash(worker_id).await;
            }
            other => warn!("unexpected message from worker {}: {:?}", worker_id, other),
        }
    }

    async fn handle_worker_exit(&mut self, worker_id: u32) {
        if !self.workers.contains_key(&worker_id) {
            // already handled, e.g. via an explicit crash message
            return;
        }

        if self.phase() == RunPhase::Draining {
            if let Some(mut worker) = self.workers.remove(&worker_id) {
                worker.reap().await;
                if let Some(test_id) = worker.assigned.take() {
                    // died during drain without delivering its result
                    if self.registry.fail(&test_id, "terminated").is_ok() {
                        self.publish_update(&test_id);
                    }
                }
            }
            self.shared.workers.write().remove(&worker_id);
            if self.workers.is_empty() {
                self.finish_shutdown();
            }
            return;
        }

        let terminating = self
            .workers
            .get(&worker_id)
            .map(|w| w.phase == WorkerPhase::Terminating)
            .unwrap_or(false);
        if terminating {
            // exit we asked for
            if let Some(mut worker) = self.workers.remove(&worker_id) {
                worker.reap().await;
            }
            self.shared.workers.write().remove(&worker_id);
            return;
        }

        self.handle_crash(worker_id).await;
    }

    /// A worker died or reported itself broken: surface the in-flight test
    /// per the retry rule, then respawn the worker unless its crash streak
    /// exceeds the restart limit.
    async fn handle_crash(&mut self, worker_id: u32) {
        let Some(mut worker) = self.workers.remove(&worker_id) else {
            return;
        };
        worker.force_kill().await;
        let crashes = worker.consecutive_crashes + 1;
        let browser = worker.browser.clone();
        self.shared.workers.write().remove(&worker_id);

        if let Some(test_id) = worker.assigned.take() {
            let budget = self
                .registry
                .get(&test_id)
                .and_then(|r| r.descriptor.retries)
                .unwrap_or(self.config.max_retries);
            let attempts = self.registry.get(&test_id).map(|r| r.attempts).unwrap_or(0);
            if attempts <= budget {
                info!(
                    "worker {} crashed; re-queueing {} (attempt {} of {})",
                    worker_id,
                    test_id,
                    attempts,
                    budget + 1
                );
                let _ = self.registry.requeue(&test_id);
            } else {
                warn!("worker {} crashed; {} exhausted retries", worker_id, test_id);
                let _ = self.registry.fail(&test_id, "exhausted retries");
            }
            self.publish_update(&test_id);
        }

        if crashes <= self.config.worker_restart_limit {
            // The replacement gets a fresh id so stale signals from the dead
            // process cannot be attributed to it; the crash streak carries
            // over to the pool slot.
            let fresh_id = self.next_worker_id;
            self.next_worker_id += 1;
            match self
                .spawner
                .spawn(fresh_id, &browser, &self.config, self.signal_tx.clone())
            {
                Ok(mut fresh) => {
                    fresh.consecutive_crashes = crashes;
                    self.shared.workers.write().insert(fresh_id, fresh.state());
                    self.workers.insert(fresh_id, fresh);
                }
                Err(e) => error!("failed to respawn worker {}: {}", fresh_id, e),
            }
        } else {
            error!(
                "worker {} crashed {} times in a row; not respawning",
                worker_id, crashes
            );
        }

        if !self.workers.values().any(|w| w.browser == browser) {
            warn!("browser {} has no workers left", browser);
            self.fail_pending_for_browser(&browser, "no worker available");
        }

        self.dispatch_pending();
        self.check_completion();
    }

    /// Terminal failure for tests whose browser pool is gone. The scheduler
    /// charges the attempt it is giving up on, keeping the state machine and
    /// the attempt invariant intact.
    fn fail_pending_for_browser(&mut self, browser: &str, reason: &str) {
        for test_id in self.registry.pending_in_order() {
            let matches_browser = self
                .registry
                .get(&test_id)
                .map(|r| r.descriptor.browser == browser)
                .unwrap_or(false);
            if !matches_browser {
                continue;
            }
            let _ = self.registry.mark_running(&test_id);
            let _ = self.registry.fail(&test_id, reason);
            self.publish_update(&test_id);
        }
    }

    fn begin_drain(&mut self) {
        if self.phase() == RunPhase::Draining {
            return;
        }
        info!("shutdown requested; draining {} workers", self.workers.len());
        self.set_phase(RunPhase::Draining);
        for worker in self.workers.values_mut() {
            worker.send_shutdown();
        }
        self.sync_workers();
        if self.workers.is_empty() {
            self.finish_shutdown();
            return;
        }
        self.grace_timer
            .as_mut()
            .reset(Instant::now() + self.config.shutdown_grace());
        self.grace_armed = true;
    }

    async fn handle_grace_expired(&mut self) {
        self.grace_armed = false;
        if self.phase() != RunPhase::Draining {
            return;
        }
        warn!(
            "shutdown grace expired; force-terminating {} workers",
            self.workers.len()
        );
        let ids: Vec<u32> = self.workers.keys().copied().collect();
        for worker_id in ids {
            if let Some(mut worker) = self.workers.remove(&worker_id) {
                if let Some(test_id) = worker.assigned.take() {
                    if self.registry.fail(&test_id, "terminated").is_ok() {
                        self.publish_update(&test_id);
                    }
                }
                worker.force_kill().await;
            }
            self.shared.workers.write().remove(&worker_id);
        }
        self.finish_shutdown();
    }

    fn finish_shutdown(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.grace_armed = false;
        self.set_phase(RunPhase::Stopped);
        info!("all workers terminated");
        self.bus.publish(RunEvent::Shutdown {
            snapshot: self.registry.snapshot(),
        });
    }

    /// Emit `stop` exactly once per run cycle, at the instant pending +
    /// running reaches zero.
    fn check_completion(&mut self) {
        if self.phase() == RunPhase::Running
            && !self.stop_emitted
            && self.registry.open_count() == 0
        {
            self.stop_emitted = true;
            self.set_phase(RunPhase::Stopped);
            info!("run complete");
            self.bus.publish(RunEvent::Stop {
                snapshot: self.registry.snapshot(),
            });
        }
    }

    fn publish_update(&self, test_id: &str) {
        if let Some(record) = self.registry.get(test_id) {
            self.bus.publish(RunEvent::TestUpdated {
                test_id: test_id.to_string(),
                status: record.status,
            });
        }
    }

    fn sync_workers(&self) {
        let mut map = self.shared.workers.write();
        map.clear();
        for worker in self.workers.values() {
            map.insert(worker.id, worker.state());
        }
    }
}
