// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Parallel fan-out with all-or-nothing aggregation.
//!
//! A tag query touches every member channel. [`ParallelQueryExecutor`] runs
//! one sub-query per target concurrently, waits for all of them until a
//! deadline, and either returns the union of every target's ordered result
//! or fails the whole query. Partial answers are never returned: a tag read
//! that silently misses one channel looks exactly like a correct one.
//!
//! ```text
//!             ┌─► target A ─┐
//! query ──────┼─► target B ─┼──► all Succeeded? ──► union
//!             └─► target C ─┘         │
//!                                     └─ any Failed / deadline ──► QueryFailed
//! ```
//!
//! Every sub-query runs inside the caller's `tracing` span, so logs emitted
//! on behalf of one request stay correlated across the fan-out.

use crate::config::QueryConfig;
use crate::content_store::ServiceResult;
use crate::error::{HubError, Result};
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn, Instrument, Span};

/// Progress of one target within a fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetStatus {
    Pending,
    /// Finished with this many results.
    Succeeded(usize),
    Failed(String),
}

/// Per-target bookkeeping for one fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    statuses: BTreeMap<String, TargetStatus>,
}

impl QueryResult {
    pub fn new<'a>(targets: impl IntoIterator<Item = &'a String>) -> Self {
        Self {
            statuses: targets
                .into_iter()
                .map(|target| (target.clone(), TargetStatus::Pending))
                .collect(),
        }
    }

    pub fn record_success(&mut self, target: &str, count: usize) {
        self.statuses.insert(target.to_string(), TargetStatus::Succeeded(count));
    }

    pub fn record_failure(&mut self, target: &str, message: impl Into<String>) {
        self.statuses
            .insert(target.to_string(), TargetStatus::Failed(message.into()));
    }

    pub fn status(&self, target: &str) -> Option<&TargetStatus> {
        self.statuses.get(target)
    }

    /// `true` once every target succeeded.
    pub fn is_complete(&self) -> bool {
        self.statuses
            .values()
            .all(|status| matches!(status, TargetStatus::Succeeded(_)))
    }

    pub fn pending(&self) -> usize {
        self.count(|status| matches!(status, TargetStatus::Pending))
    }

    pub fn failed(&self) -> usize {
        self.count(|status| matches!(status, TargetStatus::Failed(_)))
    }

    fn count(&self, predicate: impl Fn(&TargetStatus) -> bool) -> usize {
        self.statuses.values().filter(|status| predicate(status)).count()
    }
}

impl fmt::Display for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} targets, {} succeeded, {} failed, {} pending",
            self.statuses.len(),
            self.statuses.len() - self.failed() - self.pending(),
            self.failed(),
            self.pending()
        )?;
        for (target, status) in &self.statuses {
            match status {
                TargetStatus::Failed(message) => write!(f, "; {}: {}", target, message)?,
                TargetStatus::Pending => write!(f, "; {}: no answer", target)?,
                TargetStatus::Succeeded(_) => {}
            }
        }
        Ok(())
    }
}

/// Runs one sub-query per target and combines the results.
#[derive(Debug, Clone)]
pub struct ParallelQueryExecutor {
    timeout: Duration,
}

impl ParallelQueryExecutor {
    pub fn new(config: &QueryConfig) -> Self {
        Self::with_timeout(config.timeout_duration())
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `operation(target)` for every distinct target and return the
    /// union of their results.
    ///
    /// Fails with [`HubError::QueryFailed`] as soon as any target fails or
    /// panics, or when the deadline passes first. Sub-queries still running
    /// at that point are aborted.
    pub async fn query<K, F, Fut>(&self, targets: &[String], operation: F) -> Result<BTreeSet<K>>
    where
        K: Ord + Send + 'static,
        F: Fn(String) -> Fut,
        Fut: Future<Output = ServiceResult<BTreeSet<K>>> + Send + 'static,
    {
        let targets: BTreeSet<&String> = targets.iter().collect();
        if targets.is_empty() {
            return Ok(BTreeSet::new());
        }

        let deadline = Instant::now() + self.timeout;
        let mut progress = QueryResult::new(targets.iter().copied());
        let mut tasks = JoinSet::new();

        for target in &targets {
            let target = (*target).clone();
            let sub_query = AssertUnwindSafe(operation(target.clone())).catch_unwind();
            tasks.spawn(
                async move {
                    let outcome = match sub_query.await {
                        Ok(result) => result.map_err(|e| e.0),
                        Err(_) => Err("sub-query panicked".to_string()),
                    };
                    (target, outcome)
                }
                .instrument(Span::current()),
            );
        }

        let mut merged = BTreeSet::new();
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(None) => break,
                Ok(Some(Ok((target, Ok(keys))))) => {
                    progress.record_success(&target, keys.len());
                    merged.extend(keys);
                }
                Ok(Some(Ok((target, Err(message))))) => {
                    progress.record_failure(&target, message);
                    return Err(self.fail(tasks, &progress));
                }
                Ok(Some(Err(join_error))) => {
                    return Err(HubError::Internal(format!("sub-query task lost: {}", join_error)));
                }
                Err(_elapsed) => {
                    warn!(timeout = ?self.timeout, "Fan-out query deadline passed");
                    return Err(self.fail(tasks, &progress));
                }
            }
        }

        debug!(targets = targets.len(), results = merged.len(), "Fan-out query complete");
        Ok(merged)
    }

    fn fail<T: 'static>(&self, mut tasks: JoinSet<T>, progress: &QueryResult) -> HubError {
        tasks.abort_all();
        warn!(summary = %progress, "Fan-out query failed");
        HubError::QueryFailed(progress.to_string())
    }
}
