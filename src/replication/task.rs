// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One replication task: a channel's pull loop, or a global channel's
//! forward loop to one satellite.
//!
//! The task owns at most one spawned loop at a time. `start` and `stop` are
//! serialized by a per-task async mutex, and both are idempotent, so the
//! reconciler can dispatch them freely from concurrent jobs.
//!
//! # Loop Driver
//!
//! Both loop kinds share one driver: run a step, then pause for
//! `poll_interval` if the step found nothing to do, not at all if it moved
//! items (more may be waiting), or for an exponential backoff if it failed.
//! The stop signal is checked at every iteration boundary and interrupts any
//! pause.

use super::forward::ForwardLoop;
use super::pull::PullLoop;
use super::types::{TaskKey, TaskKind, TaskState};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::TaskConfig;
use crate::content_store::ContentStore;
use crate::counter::{VersionedCounter, START_VALUE};
use crate::error::Result;
use crate::feed::RemoteFeed;
use crate::resilience::RateLimiter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// Collaborators shared by every task of one reconciler.
pub struct TaskContext {
    pub feed: Arc<dyn RemoteFeed>,
    pub content: Arc<dyn ContentStore>,
    pub counter: Arc<VersionedCounter>,
    pub config: TaskConfig,
    /// Shared across tasks so a mass start cannot stampede the peers.
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

impl TaskContext {
    pub(crate) async fn throttle(&self) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }
    }
}

struct RunningLoop {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ReplicationTask {
    channel: String,
    kind: TaskKind,
    ctx: Arc<TaskContext>,
    circuit: Arc<CircuitBreaker>,
    state_tx: watch::Sender<TaskState>,
    state_rx: watch::Receiver<TaskState>,
    running: Mutex<Option<RunningLoop>>,
    /// Set once the reconciler has deregistered this task. A retired task
    /// never starts again, so a start job that loses a race with the stop
    /// job for the same task cannot leave an orphan loop behind.
    retired: AtomicBool,
    /// Earlier task for the same key. Cleared once it is seen stopped.
    predecessor: std::sync::Mutex<Option<Arc<ReplicationTask>>>,
}

impl ReplicationTask {
    pub fn new(channel: impl Into<String>, kind: TaskKind, ctx: Arc<TaskContext>) -> Self {
        let channel = channel.into();
        let (state_tx, state_rx) = watch::channel(TaskState::Stopped);
        let key = key_for(&channel, &kind);
        let circuit = Arc::new(CircuitBreaker::new(
            format!("replication:{}", key),
            ctx.config.circuit_config(),
        ));

        Self {
            channel,
            kind,
            ctx,
            circuit,
            state_tx,
            state_rx,
            running: Mutex::new(None),
            retired: AtomicBool::new(false),
            predecessor: std::sync::Mutex::new(None),
        }
    }

    /// Single-peer task pulling `channel` from `source`.
    pub fn pulling(channel: impl Into<String>, source: impl Into<String>, ctx: Arc<TaskContext>) -> Self {
        Self::new(channel, TaskKind::Channel { source: source.into() }, ctx)
    }

    /// Global task forwarding `channel` to `satellite`.
    pub fn forwarding(channel: impl Into<String>, satellite: impl Into<String>, ctx: Arc<TaskContext>) -> Self {
        Self::new(
            channel,
            TaskKind::Global {
                satellite: satellite.into(),
            },
            ctx,
        )
    }

    pub fn key(&self) -> TaskKey {
        key_for(&self.channel, &self.kind)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn state(&self) -> TaskState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<TaskState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    pub fn circuit(&self) -> &Arc<CircuitBreaker> {
        &self.circuit
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Make this task wait for `previous` to stop before its loop starts.
    pub(crate) fn follow(&self, previous: Arc<ReplicationTask>) {
        *self.predecessor.lock().unwrap_or_else(|e| e.into_inner()) = Some(previous);
    }

    fn predecessor(&self) -> Option<Arc<ReplicationTask>> {
        self.predecessor.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Wait until no earlier task for this key has a loop.
    ///
    /// Follows the whole chain: a predecessor that never ran may itself be
    /// waiting on an older task that is still stopping.
    pub(crate) async fn wait_for_predecessors(&self) {
        let mut next = self.predecessor();
        if next.is_none() {
            return;
        }

        while let Some(previous) = next {
            if !previous.has_exited().await {
                debug!(task = %self.key(), "Waiting for previous task to stop");
                let mut state_rx = previous.state_receiver();
                while !previous.has_exited().await {
                    if state_rx.changed().await.is_err() {
                        break;
                    }
                }
            }
            next = previous.predecessor();
        }

        *self.predecessor.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// `true` once this retired task has no loop and never will again.
    ///
    /// Taking the loop lock orders this after any `start` already under way
    /// and after any `stop` that is still draining.
    async fn has_exited(&self) -> bool {
        let running = self.running.lock().await;
        running.is_none() && self.is_retired()
    }

    /// Start the loop if it is not already running.
    ///
    /// On failure the task is left `Stopped` and the error returned.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;

        if self.is_retired() {
            debug!(task = %self.key(), "Task retired, not starting");
            return Ok(());
        }

        if running.is_none() {
            drop(running);
            self.wait_for_predecessors().await;
            running = self.running.lock().await;
            if self.is_retired() {
                debug!(task = %self.key(), "Task retired while waiting, not starting");
                return Ok(());
            }
        }

        match running.as_ref() {
            Some(current) if !current.handle.is_finished() => {
                debug!(task = %self.key(), "Task already running");
                return Ok(());
            }
            Some(_) => {
                warn!(task = %self.key(), "Task loop exited unexpectedly, restarting");
                running.take();
            }
            None => {}
        }

        self.state_tx.send_replace(TaskState::Starting);

        let position = match self.resume_position().await {
            Ok(position) => position,
            Err(e) => {
                self.state_tx.send_replace(TaskState::Stopped);
                return Err(e);
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = match &self.kind {
            TaskKind::Channel { source } => {
                let worker = PullLoop::new(
                    self.channel.clone(),
                    source.clone(),
                    Arc::clone(&self.ctx),
                    Arc::clone(&self.circuit),
                    position,
                );
                let span = info_span!("pull", channel = %self.channel, source = %source);
                tokio::spawn(drive(Worker::Pull(worker), self.ctx.config.clone(), stop_rx).instrument(span))
            }
            TaskKind::Global { satellite } => {
                let worker = ForwardLoop::new(
                    self.channel.clone(),
                    satellite.clone(),
                    Arc::clone(&self.ctx),
                    Arc::clone(&self.circuit),
                    position,
                );
                let span = info_span!("forward", channel = %self.channel, satellite = %satellite);
                tokio::spawn(drive(Worker::Forward(worker), self.ctx.config.clone(), stop_rx).instrument(span))
            }
        };

        *running = Some(RunningLoop { stop_tx, handle });
        self.state_tx.send_replace(TaskState::Running);
        info!(task = %self.key(), position, "Replication task started");
        Ok(())
    }

    /// Stop the loop and wait for it to exit.
    ///
    /// Waits at most `stop_timeout`; a loop still running after that is
    /// aborted.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;

        let Some(RunningLoop { stop_tx, mut handle }) = running.take() else {
            self.state_tx.send_replace(TaskState::Stopped);
            return;
        };

        self.state_tx.send_replace(TaskState::Stopping);
        let _ = stop_tx.send(true);

        let stop_timeout = self.ctx.config.stop_timeout_duration();
        match tokio::time::timeout(stop_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(task = %self.key(), error = %e, "Replication loop panicked");
            }
            Err(_) => {
                warn!(task = %self.key(), timeout = ?stop_timeout, "Replication loop did not stop in time, aborting");
                handle.abort();
            }
        }

        self.state_tx.send_replace(TaskState::Stopped);
        info!(task = %self.key(), "Replication task stopped");
    }

    /// Where the loop picks up.
    ///
    /// A pulling task resumes from its channel's counter (seeded if absent).
    /// A forwarding task resumes from whatever the satellite already holds.
    async fn resume_position(&self) -> Result<i64> {
        match &self.kind {
            TaskKind::Channel { .. } => {
                self.ctx.counter.initialize(&self.channel).await?;
                Ok(self.ctx.counter.get(&self.channel).await)
            }
            TaskKind::Global { satellite } => {
                self.ctx.throttle().await;
                let latest = self
                    .circuit
                    .call(|| self.ctx.feed.latest_sequence(satellite, &self.channel))
                    .await
                    .map_err(|e| e.into_hub_error("latest_sequence"))?;
                Ok(latest.unwrap_or(START_VALUE))
            }
        }
    }
}

impl std::fmt::Debug for ReplicationTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationTask")
            .field("key", &self.key())
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

fn key_for(channel: &str, kind: &TaskKind) -> TaskKey {
    match kind {
        TaskKind::Channel { .. } => TaskKey::Channel(channel.to_string()),
        TaskKind::Global { satellite } => TaskKey::Global {
            channel: channel.to_string(),
            satellite: satellite.clone(),
        },
    }
}

enum Worker {
    Pull(PullLoop),
    Forward(ForwardLoop),
}

impl Worker {
    /// Run one iteration. Returns how many items moved.
    async fn step(&mut self) -> Result<usize> {
        match self {
            Worker::Pull(pull) => pull.step().await,
            Worker::Forward(forward) => forward.step().await,
        }
    }

    fn position(&self) -> i64 {
        match self {
            Worker::Pull(pull) => pull.position(),
            Worker::Forward(forward) => forward.cursor(),
        }
    }
}

async fn drive(mut worker: Worker, config: TaskConfig, mut stop_rx: watch::Receiver<bool>) {
    let poll_interval = config.poll_interval_duration();
    let retry = config.retry_config();
    let mut consecutive_failures = 0u32;

    debug!(position = worker.position(), "Replication loop running");

    loop {
        if *stop_rx.borrow_and_update() {
            break;
        }

        let pause = match worker.step().await {
            Ok(0) => {
                consecutive_failures = 0;
                poll_interval
            }
            Ok(moved) => {
                consecutive_failures = 0;
                debug!(moved, position = worker.position(), "Replication step moved items");
                Duration::ZERO
            }
            Err(e) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                let backoff = retry.delay_for_attempt(consecutive_failures);
                warn!(
                    error = %e,
                    consecutive_failures,
                    backoff_ms = backoff.as_millis() as u64,
                    "Replication step failed, backing off"
                );
                backoff
            }
        };

        if pause.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    // Owning task dropped without stopping us.
                    break;
                }
            }
            _ = tokio::time::sleep(pause) => {}
        }
    }

    debug!(position = worker.position(), "Replication loop exited");
}
