// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication state and bookkeeping types.
//!
//! # Task Lifecycle
//!
//! ```text
//!            start()                 (resume position found,
//! Stopped ───────────► Starting ─────  loop spawned) ──────► Running
//!    ▲                    │                                     │
//!    │  (start failed)    │                              stop() │
//!    └────────────────────┘                                     ▼
//!    └──────────────────────────────────────────────────── Stopping
//!                     (loop exited or aborted)
//! ```
//!
//! # Reconciler Lifecycle
//!
//! ```text
//! Created ──start()──► Running ──shutdown()──► ShuttingDown ──► Stopped
//!    │                                                             ▲
//!    └─────────────────────────shutdown()──────────────────────────┘
//! ```

use std::fmt;

/// State of one replication task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Stopped => write!(f, "Stopped"),
            TaskState::Starting => write!(f, "Starting"),
            TaskState::Running => write!(f, "Running"),
            TaskState::Stopping => write!(f, "Stopping"),
        }
    }
}

/// State of the reconciler itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    /// Constructed; no triggers armed yet.
    Created,
    /// Watch armed, tick running, passes being served.
    Running,
    /// Draining jobs and stopping every task.
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ReconcilerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcilerState::Created => write!(f, "Created"),
            ReconcilerState::Running => write!(f, "Running"),
            ReconcilerState::ShuttingDown => write!(f, "ShuttingDown"),
            ReconcilerState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Registry key of a replication task.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskKey {
    /// Single-peer replication into `channel`.
    Channel(String),
    /// Global forwarding of `channel` to one satellite.
    Global { channel: String, satellite: String },
}

impl TaskKey {
    pub fn channel(&self) -> &str {
        match self {
            TaskKey::Channel(channel) => channel,
            TaskKey::Global { channel, .. } => channel,
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, TaskKey::Global { .. })
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKey::Channel(channel) => write!(f, "{}", channel),
            TaskKey::Global { channel, satellite } => write!(f, "{}->{}", channel, satellite),
        }
    }
}

/// What a task does. Two tasks with the same key but different kinds are
/// different tasks: the old one must be stopped before the new one starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Pull from the upstream channel at `source`.
    Channel { source: String },
    /// Forward local content to `satellite`.
    Global { satellite: String },
}

/// Category of desired tasks. Each category is computed and applied
/// independently so a metadata failure in one leaves the other alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Global,
    Channel,
}

impl Category {
    pub fn contains(&self, key: &TaskKey) -> bool {
        match self {
            Category::Global => key.is_global(),
            Category::Channel => !key.is_global(),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Global => write!(f, "global"),
            Category::Channel => write!(f, "channel"),
        }
    }
}

/// What one pass did to one category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// New tasks registered and dispatched to start.
    pub started: usize,
    /// Tasks replaced because their source changed.
    pub restarted: usize,
    /// Unchanged tasks re-asserted as running.
    pub ensured: usize,
    /// Tasks deregistered and dispatched to stop.
    pub stopped: usize,
    /// Channels left out of the desired set because their metadata is invalid.
    pub skipped: usize,
}

impl PassReport {
    /// `true` if the pass neither started nor stopped anything.
    pub fn is_steady(&self) -> bool {
        self.started == 0 && self.restarted == 0 && self.stopped == 0
    }
}

/// Per-category reports of one pass.
///
/// A category is `None` when its channel metadata could not be fetched and
/// it was left untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassOutcome {
    pub global: Option<PassReport>,
    pub channels: Option<PassReport>,
}

/// Why a pass ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    Watch,
    Tick,
    /// Called directly through `ReplicationReconciler::run_pass`.
    Manual,
}
