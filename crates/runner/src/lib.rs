//! Specter Orchestrator
//!
//! The master side of the visual-regression platform: it owns the canonical
//! test registry, dispatches tests across a pool of isolated worker
//! processes, tolerates worker failure, and produces a deterministic
//! terminal result plus a portable report artifact.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      RunSession                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Dispatcher (single task, owns all mutation)                 │
//! │    ├── TestRegistry     pending/running/success/failed       │
//! │    ├── WorkerHandle*    one per spawned specter-worker       │
//! │    │     └── stdio, newline-delimited JSON messages          │
//! │    └── EventBus         start / test-updated / stop /        │
//! │                         shutdown / extract-*                 │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Inventory (tests.json from the extraction step)             │
//! │  Report (static viewer + data.js, orphan reconciliation)     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Workers are separate OS processes, never threads: a browser crash or
//! hang cannot corrupt orchestrator state, and the only thing crossing the
//! boundary is serialized messages.

pub mod bus;
pub mod config;
pub mod inventory;
pub mod registry;
pub mod report;
pub mod scheduler;
pub mod session;
pub mod worker;

pub use bus::{EventBus, RunEvent, Subscription};
pub use config::{BrowserConfig, BrowserKind, RunnerConfig, Viewport};
pub use registry::{snapshot_success, Snapshot, TestRegistry};
pub use scheduler::Command;
pub use session::RunSession;
pub use worker::{ProcessSpawner, WorkerHandle, WorkerSpawner};
