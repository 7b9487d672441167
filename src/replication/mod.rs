// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication reconciler.
//!
//! Keeps the set of running replication tasks equal to what channel metadata
//! asks for. Whenever something may have changed it recomputes the desired
//! set and diffs it against its registry:
//!
//! ```text
//!  watch fired ─┐
//!  tick ────────┼──► trigger queue ──► worker ──► pass (pass lock held)
//!  startup ─────┘                                   │
//!                           ┌───────────────────────┴──────────────┐
//!                     global category                    single-peer category
//!                           │                                      │
//!                desired set vs registry  ──►  start / ensure / replace / stop jobs
//!                                                          │
//!                                                 bounded job pool (Bulkhead)
//! ```
//!
//! # Categories
//!
//! - **Single-peer**: every channel tagged `replicated` with a replication
//!   source gets one task pulling from that source.
//! - **Global**: every channel tagged `global` whose master is this node gets
//!   one forwarding task per satellite.
//!
//! Each category is fetched and applied on its own. If the metadata fetch
//! for one fails, that category keeps its current tasks for this pass.
//!
//! # Jobs
//!
//! The registry is updated synchronously during a pass; the slow part
//! (starting and stopping tasks) is handed to background jobs. A pass never
//! waits for its jobs, so [`ReplicationReconciler::wait_idle`] exists for
//! callers that need to observe the result.

pub mod task;
pub mod types;

mod forward;
mod pull;

#[cfg(test)]
pub(crate) mod fixtures;

pub use task::{ReplicationTask, TaskContext};
pub use types::{Category, PassOutcome, PassReport, ReconcilerState, TaskKey, TaskKind, TaskState, Trigger};

use crate::channel::{ChannelDescriptor, ChannelService, GLOBAL_TAG, REPLICATED_TAG};
use crate::config::{HubConfig, ReconcilerConfig};
use crate::content_store::ContentStore;
use crate::coordination::{CoordinationStore, CreateOutcome};
use crate::counter::VersionedCounter;
use crate::error::{HubError, Result};
use crate::feed::RemoteFeed;
use crate::resilience::{Bulkhead, RateLimiter};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

/// Compute the desired tasks of one category from its channels' metadata.
///
/// Returns the desired tasks and the number of channels skipped because
/// their configuration is unusable.
pub fn desired_tasks(
    category: Category,
    channels: &[ChannelDescriptor],
    local_node_id: &str,
) -> (BTreeMap<TaskKey, TaskKind>, usize) {
    let mut desired = BTreeMap::new();
    let mut skipped = 0;

    for channel in channels {
        match category {
            Category::Channel => {
                if !channel.has_tag(REPLICATED_TAG) {
                    continue;
                }
                match channel.replication_source.as_deref().filter(|s| !s.is_empty()) {
                    Some(source) => {
                        desired.insert(
                            TaskKey::Channel(channel.name.clone()),
                            TaskKind::Channel {
                                source: source.to_string(),
                            },
                        );
                    }
                    None => {
                        warn!(channel = %channel.name, "Replicated channel has no source, skipping");
                        skipped += 1;
                    }
                }
            }
            Category::Global => {
                if !channel.has_tag(GLOBAL_TAG) {
                    continue;
                }
                let Some(global) = &channel.global else {
                    warn!(channel = %channel.name, "Global channel has no global config, skipping");
                    skipped += 1;
                    continue;
                };
                if global.master != local_node_id {
                    continue;
                }
                if let Err(e) = global.validate() {
                    warn!(channel = %channel.name, error = %e, "Invalid global config, skipping");
                    skipped += 1;
                    continue;
                }
                for satellite in &global.satellites {
                    desired.insert(
                        TaskKey::Global {
                            channel: channel.name.clone(),
                            satellite: satellite.clone(),
                        },
                        TaskKind::Global {
                            satellite: satellite.clone(),
                        },
                    );
                }
            }
        }
    }

    (desired, skipped)
}

enum Job {
    Start(Arc<ReplicationTask>),
    Ensure(Arc<ReplicationTask>),
    /// Stop `old` completely, then start `new`.
    Replace {
        old: Arc<ReplicationTask>,
        new: Arc<ReplicationTask>,
    },
    Stop(Arc<ReplicationTask>),
}

struct Inner {
    node_id: String,
    config: ReconcilerConfig,
    channels: Arc<dyn ChannelService>,
    store: Arc<dyn CoordinationStore>,
    ctx: Arc<TaskContext>,

    registry: Mutex<HashMap<TaskKey, Arc<ReplicationTask>>>,
    /// Deregistered tasks whose stop job has not finished. A task registered
    /// again under the same key follows the one found here.
    retiring: Mutex<HashMap<TaskKey, Arc<ReplicationTask>>>,
    /// Held for the whole of a pass.
    pass_lock: tokio::sync::Mutex<()>,
    bulkhead: Bulkhead,
    /// Number of dispatched jobs not yet finished.
    pending_tx: watch::Sender<usize>,
    stopping: AtomicBool,

    trigger_tx: mpsc::UnboundedSender<Trigger>,
    watch_armed: AtomicBool,
}

/// Decrements the pending job count when a job ends, however it ends.
struct PendingGuard(Arc<Inner>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.pending_tx.send_modify(|pending| *pending = pending.saturating_sub(1));
    }
}

impl Inner {
    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<TaskKey, Arc<ReplicationTask>>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn retiring(&self) -> std::sync::MutexGuard<'_, HashMap<TaskKey, Arc<ReplicationTask>>> {
        self.retiring.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn new_task(&self, key: &TaskKey, kind: TaskKind) -> Arc<ReplicationTask> {
        Arc::new(ReplicationTask::new(key.channel(), kind, Arc::clone(&self.ctx)))
    }

    /// Register a one-shot watch on the watch path unless one is pending.
    async fn arm_watch(self: &Arc<Self>) {
        if self.watch_armed.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak: Weak<Inner> = Arc::downgrade(self);
        let on_change = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.watch_armed.store(false, Ordering::SeqCst);
                let _ = inner.trigger_tx.send(Trigger::Watch);
            }
        });

        match self.store.watch(&self.config.watch_path, on_change).await {
            Ok(()) => debug!(path = %self.config.watch_path, "Watch armed"),
            Err(e) => {
                self.watch_armed.store(false, Ordering::SeqCst);
                warn!(path = %self.config.watch_path, error = %e, "Failed to arm watch, relying on tick");
            }
        }
    }

    async fn run_pass(self: &Arc<Self>, trigger: Trigger) -> Result<PassOutcome> {
        let _pass = self.pass_lock.lock().await;
        if self.is_stopping() {
            return Err(HubError::Shutdown);
        }

        let outcome = PassOutcome {
            global: self.reconcile_category(Category::Global).await,
            channels: self.reconcile_category(Category::Channel).await,
        };

        let changed = [outcome.global, outcome.channels]
            .iter()
            .flatten()
            .any(|report| !report.is_steady());
        if changed {
            info!(?trigger, global = ?outcome.global, channels = ?outcome.channels, "Reconcile pass applied changes");
        } else {
            debug!(?trigger, "Reconcile pass found nothing to change");
        }
        Ok(outcome)
    }

    async fn reconcile_category(self: &Arc<Self>, category: Category) -> Option<PassReport> {
        let tag = match category {
            Category::Global => GLOBAL_TAG,
            Category::Channel => REPLICATED_TAG,
        };

        let channels = match self.channels.get_channels(tag).await {
            Ok(channels) => channels,
            Err(e) => {
                warn!(%category, error = %e, "Channel metadata unavailable, leaving category untouched");
                return None;
            }
        };

        let (desired, skipped) = desired_tasks(category, &channels, &self.node_id);
        let mut report = PassReport {
            skipped,
            ..Default::default()
        };

        let mut jobs = Vec::new();
        {
            let mut registry = self.registry();

            for (key, kind) in &desired {
                match registry.get(key) {
                    None => {
                        let task = self.new_task(key, kind.clone());
                        if let Some(previous) = self.retiring().get(key) {
                            task.follow(Arc::clone(previous));
                        }
                        registry.insert(key.clone(), Arc::clone(&task));
                        jobs.push(Job::Start(task));
                        report.started += 1;
                    }
                    Some(existing) if existing.kind() != kind => {
                        let old = Arc::clone(existing);
                        let new = self.new_task(key, kind.clone());
                        old.retire();
                        new.follow(Arc::clone(&old));
                        registry.insert(key.clone(), Arc::clone(&new));
                        info!(task = %key, "Replication source changed, replacing task");
                        jobs.push(Job::Replace { old, new });
                        report.restarted += 1;
                    }
                    Some(existing) => {
                        jobs.push(Job::Ensure(Arc::clone(existing)));
                        report.ensured += 1;
                    }
                }
            }

            let obsolete: Vec<TaskKey> = registry
                .keys()
                .filter(|key| category.contains(key) && !desired.contains_key(*key))
                .cloned()
                .collect();
            for key in obsolete {
                if let Some(task) = registry.remove(&key) {
                    task.retire();
                    self.retiring().insert(key, Arc::clone(&task));
                    jobs.push(Job::Stop(task));
                    report.stopped += 1;
                }
            }
        }

        for job in jobs {
            self.dispatch(job);
        }
        Some(report)
    }

    fn dispatch(self: &Arc<Self>, job: Job) {
        self.pending_tx.send_modify(|pending| *pending += 1);
        let guard = PendingGuard(Arc::clone(self));

        tokio::spawn(async move {
            let inner = Arc::clone(&guard.0);
            // Wait outside the pool so the stop job being waited on can get
            // a slot.
            if let Job::Start(task) | Job::Ensure(task) = &job {
                task.wait_for_predecessors().await;
            }
            // A closed pool means shutdown: stops still run, starts are skipped
            // in `run_job`.
            let _permit = inner.bulkhead.acquire().await.ok();
            inner.run_job(job).await;
            drop(guard);
        });
    }

    async fn run_job(&self, job: Job) {
        match job {
            Job::Start(task) | Job::Ensure(task) => self.start_task(&task).await,
            Job::Replace { old, new } => {
                old.stop().await;
                self.start_task(&new).await;
            }
            Job::Stop(task) => {
                task.stop().await;
                let key = task.key();
                let mut retiring = self.retiring();
                if retiring.get(&key).is_some_and(|current| Arc::ptr_eq(current, &task)) {
                    retiring.remove(&key);
                }
            }
        }
    }

    async fn start_task(&self, task: &Arc<ReplicationTask>) {
        if self.is_stopping() {
            debug!(task = %task.key(), "Shutting down, not starting task");
            return;
        }
        if let Err(e) = task.start().await {
            warn!(task = %task.key(), error = %e, "Replication task failed to start, will retry next pass");
            self.forget_if_same(task);
        }
    }

    /// Deregister `task` unless its key has since been taken by another task.
    fn forget_if_same(&self, task: &Arc<ReplicationTask>) {
        let key = task.key();
        let mut registry = self.registry();
        if registry.get(&key).is_some_and(|current| Arc::ptr_eq(current, task)) {
            registry.remove(&key);
            task.retire();
        }
    }

    async fn wait_idle(&self) {
        let mut pending = self.pending_tx.subscribe();
        let _ = pending.wait_for(|count| *count == 0).await;
    }
}

/// The replication reconciler.
///
/// Created in [`ReconcilerState::Created`]. Call [`start()`](Self::start) to
/// arm the triggers, and [`shutdown()`](Self::shutdown) to stop every task.
pub struct ReplicationReconciler {
    inner: Arc<Inner>,

    state_tx: watch::Sender<ReconcilerState>,
    state_rx: watch::Receiver<ReconcilerState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    trigger_rx: Option<mpsc::UnboundedReceiver<Trigger>>,
    drain_timeout: Duration,
    interval: Duration,

    /// Worker and timer handles
    handles: RwLock<Vec<JoinHandle<()>>>,
}

impl ReplicationReconciler {
    /// Create a reconciler for this node.
    ///
    /// Fails if `config` does not validate.
    pub fn new(
        config: HubConfig,
        channels: Arc<dyn ChannelService>,
        store: Arc<dyn CoordinationStore>,
        feed: Arc<dyn RemoteFeed>,
        content: Arc<dyn ContentStore>,
    ) -> Result<Self> {
        config.validate()?;

        let settings = config.settings;
        let counter = Arc::new(VersionedCounter::new(Arc::clone(&store), &settings.counter));
        let rate_limiter = settings
            .task
            .rate_limit_config()
            .map(|limits| Arc::new(RateLimiter::new(limits)));
        let ctx = Arc::new(TaskContext {
            feed,
            content,
            counter,
            config: settings.task,
            rate_limiter,
        });

        let (state_tx, state_rx) = watch::channel(ReconcilerState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (pending_tx, _) = watch::channel(0usize);

        let drain_timeout = settings.reconciler.drain_timeout_duration();
        let interval = settings.reconciler.interval_duration();
        let inner = Arc::new(Inner {
            node_id: config.local_node_id,
            bulkhead: Bulkhead::new(settings.reconciler.max_concurrent_ops),
            config: settings.reconciler,
            channels,
            store,
            ctx,
            registry: Mutex::new(HashMap::new()),
            retiring: Mutex::new(HashMap::new()),
            pass_lock: tokio::sync::Mutex::new(()),
            pending_tx,
            stopping: AtomicBool::new(false),
            trigger_tx,
            watch_armed: AtomicBool::new(false),
        });

        Ok(Self {
            inner,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            trigger_rx: Some(trigger_rx),
            drain_timeout,
            interval,
            handles: RwLock::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Counter shared by this reconciler's pull tasks.
    pub fn counter(&self) -> &Arc<VersionedCounter> {
        &self.inner.ctx.counter
    }

    pub fn state(&self) -> ReconcilerState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ReconcilerState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ReconcilerState::Running
    }

    /// Keys of every registered task, sorted.
    pub fn registered(&self) -> Vec<TaskKey> {
        let mut keys: Vec<TaskKey> = self.inner.registry().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn task(&self, key: &TaskKey) -> Option<Arc<ReplicationTask>> {
        self.inner.registry().get(key).cloned()
    }

    /// Number of start/stop jobs still in flight.
    pub fn pending_jobs(&self) -> usize {
        *self.inner.pending_tx.borrow()
    }

    /// Arm the watch and the periodic tick, and run a start-up pass.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != ReconcilerState::Created {
            return Err(HubError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }
        let Some(trigger_rx) = self.trigger_rx.take() else {
            return Err(HubError::Internal("trigger queue already taken".to_string()));
        };

        info!(
            node_id = %self.inner.node_id,
            watch_path = %self.inner.config.watch_path,
            interval = ?self.interval,
            "Starting replication reconciler"
        );

        let worker = tokio::spawn(
            run_worker(Arc::clone(&self.inner), trigger_rx, self.shutdown_rx.clone())
                .instrument(info_span!("reconciler", node_id = %self.inner.node_id)),
        );
        let timer = tokio::spawn(run_timer(
            self.inner.trigger_tx.clone(),
            self.interval,
            self.shutdown_rx.clone(),
        ));
        self.handles.write().await.extend([worker, timer]);

        let _ = self.inner.trigger_tx.send(Trigger::Startup);
        self.state_tx.send_replace(ReconcilerState::Running);
        Ok(())
    }

    /// Run one pass now, on the calling task.
    ///
    /// Serialized with passes started by triggers.
    pub async fn run_pass(&self) -> Result<PassOutcome> {
        self.inner.run_pass(Trigger::Manual).await
    }

    /// Wait until every dispatched start/stop job has finished.
    pub async fn wait_idle(&self) {
        self.inner.wait_idle().await
    }

    /// Touch the watch path so every reconciler watching it runs a pass.
    pub async fn notify_watchers(&self) -> Result<()> {
        let store = &self.inner.store;
        let path = &self.inner.config.watch_path;
        let stamp = self.inner.node_id.as_bytes().to_vec();

        if store.create_path(path, stamp.clone(), true).await? == CreateOutcome::Created {
            debug!(path = %path, "Watch path created");
            return Ok(());
        }

        let Some(node) = store.read(path).await? else {
            store.create_path(path, stamp, true).await?;
            return Ok(());
        };
        match store.conditional_write(path, stamp, node.version).await {
            Ok(()) => {
                debug!(path = %path, version = node.version + 1, "Watchers notified");
                Ok(())
            }
            // Another writer touched it in between, which notifies just as well.
            Err(e) if e.is_version_conflict() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop triggers, drain in-flight jobs, and stop every task.
    ///
    /// Works from any state; a second call is a no-op.
    pub async fn shutdown(&mut self) {
        if self.state() == ReconcilerState::Stopped {
            return;
        }

        info!(node_id = %self.inner.node_id, "Shutting down replication reconciler");
        self.state_tx.send_replace(ReconcilerState::ShuttingDown);
        self.inner.stopping.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        self.inner.bulkhead.close();

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(self.drain_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Reconciler loop panicked"),
                Err(_) => warn!(timeout = ?self.drain_timeout, "Reconciler loop did not exit in time"),
            }
        }

        if tokio::time::timeout(self.drain_timeout, self.inner.wait_idle())
            .await
            .is_err()
        {
            warn!(pending = self.pending_jobs(), "Jobs still running after drain timeout");
        }

        // No pass can be mid-apply while the registry is emptied.
        let _pass = self.inner.pass_lock.lock().await;
        let tasks: Vec<Arc<ReplicationTask>> = self.inner.registry().drain().map(|(_, task)| task).collect();
        self.inner.retiring().clear();
        for task in &tasks {
            task.retire();
        }
        let count = tasks.len();
        futures::future::join_all(tasks.iter().map(|task| task.stop())).await;

        self.state_tx.send_replace(ReconcilerState::Stopped);
        info!(stopped_tasks = count, "Replication reconciler stopped");
    }
}

impl Drop for ReplicationReconciler {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn run_worker(
    inner: Arc<Inner>,
    mut triggers: mpsc::UnboundedReceiver<Trigger>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let trigger = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            trigger = triggers.recv() => match trigger {
                Some(trigger) => trigger,
                None => break,
            },
        };

        // Triggers that queued up while the last pass ran need one pass, not
        // one each.
        let mut coalesced = 0usize;
        while triggers.try_recv().is_ok() {
            coalesced += 1;
        }
        if *shutdown_rx.borrow() {
            break;
        }

        // Re-arm first so a change made during the pass is not missed.
        inner.arm_watch().await;

        let span = info_span!("reconcile_pass", ?trigger, coalesced);
        match inner.run_pass(trigger).instrument(span).await {
            Ok(_) => {}
            Err(HubError::Shutdown) => break,
            Err(e) => warn!(error = %e, "Reconcile pass failed"),
        }
    }
    debug!("Reconciler worker exited");
}

async fn run_timer(
    trigger_tx: mpsc::UnboundedSender<Trigger>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {
                if trigger_tx.send(Trigger::Tick).is_err() {
                    break;
                }
            }
        }
    }
    debug!("Reconciler timer exited");
}
