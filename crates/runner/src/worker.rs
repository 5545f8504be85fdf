//! Worker handles - orchestrator-side proxies for worker processes.
//!
//! Each handle owns one spawned `specter-worker` process exclusively: its
//! stdio pipes, its lifecycle, and the single test it currently executes.
//! The wire is newline-delimited JSON. A reader task forwards every inbound
//! message to the dispatch task; stdout EOF is forwarded as an exit signal,
//! so a busy worker dying can never silently lose its assignment.

use futures::{SinkExt, StreamExt};
use specter_common::{Error, Message, Result, TestDescriptor, WorkerPhase, WorkerState};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

use crate::config::RunnerConfig;

/// Signals flowing from worker IO tasks into the dispatch task
#[derive(Debug)]
pub enum WorkerSignal {
    /// A message arrived on the worker's stdout
    Message { worker_id: u32, message: Message },
    /// The worker's stdout closed: the process exited
    Exited { worker_id: u32 },
}

pub type SignalSender = mpsc::UnboundedSender<WorkerSignal>;

/// How the scheduler obtains workers. The process spawner is the production
/// implementation; tests plug in detached handles.
pub trait WorkerSpawner: Send + 'static {
    fn spawn(
        &mut self,
        id: u32,
        browser: &str,
        config: &RunnerConfig,
        signals: SignalSender,
    ) -> Result<WorkerHandle>;
}

/// Spawns real worker processes
pub struct ProcessSpawner;

impl WorkerSpawner for ProcessSpawner {
    fn spawn(
        &mut self,
        id: u32,
        browser: &str,
        config: &RunnerConfig,
        signals: SignalSender,
    ) -> Result<WorkerHandle> {
        WorkerHandle::spawn_process(id, browser, config, signals)
    }
}

/// Orchestrator-side proxy for one worker process
pub struct WorkerHandle {
    pub(crate) id: u32,
    pub(crate) browser: String,
    pub(crate) phase: WorkerPhase,
    /// Test id currently executing; absent unless busy
    pub(crate) assigned: Option<String>,
    pub(crate) consecutive_crashes: u32,
    outbox: mpsc::UnboundedSender<Message>,
    child: Option<Child>,
}

impl WorkerHandle {
    /// Spawn a worker process for `browser` and wire its stdio.
    pub fn spawn_process(
        id: u32,
        browser: &str,
        config: &RunnerConfig,
        signals: SignalSender,
    ) -> Result<Self> {
        let browser_config = config.browsers.get(browser).ok_or_else(|| {
            Error::InvalidConfig(format!("browser {} is not configured", browser))
        })?;

        let mut command = Command::new(&config.worker_binary);
        command
            .arg("--worker-id")
            .arg(id.to_string())
            .arg("--browser")
            .arg(browser)
            .env("SPECTER_SCREEN_DIR", &config.screen_dir)
            .env("SPECTER_REPORT_DIR", &config.report_dir)
            .env("SPECTER_BROWSER_KIND", browser_config.kind.as_str())
            .env("SPECTER_STORYBOOK_URL", &browser_config.storybook_url)
            .env(
                "SPECTER_VIEWPORT_WIDTH",
                browser_config.viewport.width.to_string(),
            )
            .env(
                "SPECTER_VIEWPORT_HEIGHT",
                browser_config.viewport.height.to_string(),
            )
            .env("SPECTER_DIFF_THRESHOLD", config.diff_threshold.to_string())
            .env("SPECTER_PIXEL_TOLERANCE", config.pixel_tolerance.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            Error::WorkerSpawn(format!("{}: {}", config.worker_binary.display(), e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::WorkerSpawn("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::WorkerSpawn("worker stdout unavailable".into()))?;

        let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Message>();

        // Writer task: one JSON document per line
        tokio::spawn(async move {
            let mut sink = FramedWrite::new(stdin, LinesCodec::new());
            while let Some(message) = outbox_rx.recv().await {
                let line = match message.encode() {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("worker {}: failed to encode message: {}", id, e);
                        continue;
                    }
                };
                if sink.send(line).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: forward messages in send order; EOF means the
        // process is gone
        tokio::spawn(async move {
            let mut lines = FramedRead::new(stdout, LinesCodec::new());
            while let Some(next) = lines.next().await {
                match next {
                    Ok(line) => match Message::decode(&line) {
                        Ok(message) => {
                            if signals
                                .send(WorkerSignal::Message { worker_id: id, message })
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(e) => warn!("worker {}: {}", id, e),
                    },
                    Err(e) => {
                        warn!("worker {}: stdout read error: {}", id, e);
                        break;
                    }
                }
            }
            debug!("worker {} stdout closed", id);
            let _ = signals.send(WorkerSignal::Exited { worker_id: id });
        });

        Ok(Self {
            id,
            browser: browser.to_string(),
            phase: WorkerPhase::Idle,
            assigned: None,
            consecutive_crashes: 0,
            outbox,
            child: Some(child),
        })
    }

    /// Hand the worker a test. Precondition: the handle is idle.
    pub fn assign(&mut self, test: &TestDescriptor) -> Result<()> {
        if self.phase != WorkerPhase::Idle {
            return Err(Error::WorkerNotIdle { worker_id: self.id });
        }
        self.outbox
            .send(Message::Assign { test: test.clone() })
            .map_err(|_| Error::WorkerCrash { worker_id: self.id })?;
        self.phase = WorkerPhase::Busy;
        self.assigned = Some(test.id());
        Ok(())
    }

    /// The assigned test finished; back to idle (a worker already told to
    /// shut down stays terminating). Resets the crash streak and returns the
    /// test id the worker was executing.
    pub(crate) fn complete_assignment(&mut self) -> Option<String> {
        if self.phase == WorkerPhase::Busy {
            self.phase = WorkerPhase::Idle;
        }
        self.consecutive_crashes = 0;
        self.assigned.take()
    }

    /// Ask the worker to finish up and exit.
    pub(crate) fn send_shutdown(&mut self) {
        self.phase = WorkerPhase::Terminating;
        let _ = self.outbox.send(Message::Shutdown);
    }

    /// Terminate without further grace: SIGTERM, a short pause, then kill.
    pub(crate) async fn force_kill(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Ok(Some(_)) = child.try_wait() {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }

        let _ = child.start_kill();
        let _ = child.wait().await;
    }

    /// Collect the exit status of a worker that already died.
    pub(crate) async fn reap(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.wait().await;
        }
    }

    /// Observable state copy for collaborators
    pub fn state(&self) -> WorkerState {
        WorkerState {
            id: self.id,
            browser: self.browser.clone(),
            phase: self.phase,
            assigned: self.assigned.clone(),
            consecutive_crashes: self.consecutive_crashes,
        }
    }

    /// Handle with no underlying process; scheduler tests drive it through
    /// the returned outbox receiver.
    #[cfg(test)]
    pub(crate) fn detached(id: u32, browser: &str) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        (
            Self {
                id,
                browser: browser.to_string(),
                phase: WorkerPhase::Idle,
                assigned: None,
                consecutive_crashes: 0,
                outbox,
                child: None,
            },
            rx,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_descriptor() -> TestDescriptor {
        TestDescriptor {
            story: "s".into(),
            test: "t".into(),
            browser: "chromium".into(),
            skip: false,
            retries: None,
        }
    }

    #[tokio::test]
    async fn test_assign_requires_idle() {
        let (mut worker, mut outbox) = WorkerHandle::detached(1, "chromium");
        worker.assign(&test_descriptor()).unwrap();
        assert_eq!(worker.phase, WorkerPhase::Busy);
        assert_eq!(worker.assigned.as_deref(), Some("s/t/chromium"));
        assert!(matches!(
            outbox.recv().await,
            Some(Message::Assign { .. })
        ));

        // a busy handle rejects a second assignment
        assert!(matches!(
            worker.assign(&test_descriptor()),
            Err(Error::WorkerNotIdle { worker_id: 1 })
        ));
    }

    #[tokio::test]
    async fn test_complete_assignment_resets() {
        let (mut worker, _outbox) = WorkerHandle::detached(1, "chromium");
        worker.consecutive_crashes = 2;
        worker.assign(&test_descriptor()).unwrap();

        let finished = worker.complete_assignment();
        assert_eq!(finished.as_deref(), Some("s/t/chromium"));
        assert_eq!(worker.phase, WorkerPhase::Idle);
        assert_eq!(worker.consecutive_crashes, 0);
        assert!(worker.assigned.is_none());
    }

    #[tokio::test]
    async fn test_send_shutdown_writes_message() {
        let (mut worker, mut outbox) = WorkerHandle::detached(1, "chromium");
        worker.send_shutdown();
        assert_eq!(worker.phase, WorkerPhase::Terminating);
        assert!(matches!(outbox.recv().await, Some(Message::Shutdown)));
    }
}
