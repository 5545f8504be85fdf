//! Core types for Specter

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single discoverable test: one story rendered and screenshotted in one
/// browser. Descriptors are produced by the extraction step and are immutable
/// for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDescriptor {
    /// Story path, e.g. `forms/button/primary`
    pub story: String,

    /// Test name within the story
    pub test: String,

    /// Browser this test is bound to (key into the browsers config map)
    pub browser: String,

    /// Seed directly into `skipped`; the scheduler never touches the test
    #[serde(default)]
    pub skip: bool,

    /// Per-test retry budget; falls back to the run-level `max_retries`
    #[serde(default)]
    pub retries: Option<u32>,
}

impl TestDescriptor {
    /// Stable identifier, identical across runs for the same
    /// story/test/browser combination.
    pub fn id(&self) -> String {
        format!("{}/{}/{}", self.story, self.test, self.browser)
    }
}

/// Test status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl TestStatus {
    /// Whether the scheduler may move a record from `self` to `to`.
    ///
    /// `running -> pending` is the crash re-queue; `failed -> pending` is the
    /// user-triggered retest. `skipped` neither enters nor leaves.
    pub fn can_transition(self, to: TestStatus) -> bool {
        use TestStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Pending)
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TestStatus::Success | TestStatus::Failed | TestStatus::Skipped)
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestStatus::Pending => write!(f, "pending"),
            TestStatus::Running => write!(f, "running"),
            TestStatus::Success => write!(f, "success"),
            TestStatus::Failed => write!(f, "failed"),
            TestStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Paths for one named screenshot of a test. All paths are relative to the
/// screens directory (expected) or the report directory (actual, diff).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub expected: String,
    pub actual: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

/// Mutable per-test state, owned exclusively by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    pub descriptor: TestDescriptor,
    pub status: TestStatus,

    /// Number of times the test has been started
    #[serde(default)]
    pub attempts: u32,

    /// Present only while the record is failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Screenshots collected across attempts, keyed by image name
    #[serde(default)]
    pub images: BTreeMap<String, ImageRef>,

    /// Wall-clock duration of the last completed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl TestRecord {
    pub fn new(descriptor: TestDescriptor) -> Self {
        let status = if descriptor.skip {
            TestStatus::Skipped
        } else {
            TestStatus::Pending
        };
        Self {
            descriptor,
            status,
            attempts: 0,
            error: None,
            images: BTreeMap::new(),
            duration_ms: None,
        }
    }

    pub fn id(&self) -> String {
        self.descriptor.id()
    }
}

/// Worker lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Starting,
    Idle,
    Busy,
    Crashed,
    Terminating,
}

impl std::fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerPhase::Starting => write!(f, "starting"),
            WorkerPhase::Idle => write!(f, "idle"),
            WorkerPhase::Busy => write!(f, "busy"),
            WorkerPhase::Crashed => write!(f, "crashed"),
            WorkerPhase::Terminating => write!(f, "terminating"),
        }
    }
}

/// Observable state of one worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub id: u32,
    pub browser: String,
    pub phase: WorkerPhase,
    /// Test id currently executing; absent unless busy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned: Option<String>,
    #[serde(default)]
    pub consecutive_crashes: u32,
}

/// Aggregate phase of a run session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Initializing,
    Running,
    Draining,
    Stopped,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunPhase::Initializing => write!(f, "initializing"),
            RunPhase::Running => write!(f, "running"),
            RunPhase::Draining => write!(f, "draining"),
            RunPhase::Stopped => write!(f, "stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_id_is_stable() {
        let d = TestDescriptor {
            story: "forms/button".to_string(),
            test: "hover".to_string(),
            browser: "chrome".to_string(),
            skip: false,
            retries: None,
        };
        assert_eq!(d.id(), "forms/button/hover/chrome");
        assert_eq!(d.id(), d.clone().id());
    }

    #[test]
    fn test_skip_seeds_skipped() {
        let d = TestDescriptor {
            story: "s".into(),
            test: "t".into(),
            browser: "b".into(),
            skip: true,
            retries: None,
        };
        assert_eq!(TestRecord::new(d).status, TestStatus::Skipped);
    }

    #[test]
    fn test_transition_table() {
        use TestStatus::*;
        // Valid paths through the state machine
        assert!(Pending.can_transition(Running));
        assert!(Running.can_transition(Success));
        assert!(Running.can_transition(Failed));
        assert!(Running.can_transition(Pending));
        assert!(Failed.can_transition(Pending));

        // pending never jumps straight to a terminal status
        assert!(!Pending.can_transition(Success));
        assert!(!Pending.can_transition(Failed));

        // skipped neither enters nor leaves
        for s in [Pending, Running, Success, Failed] {
            assert!(!s.can_transition(Skipped));
            assert!(!Skipped.can_transition(s));
        }
        // terminal success stays terminal
        assert!(!Success.can_transition(Pending));
        assert!(!Success.can_transition(Running));
    }
}
