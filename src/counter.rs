// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Versioned monotonic counter.
//!
//! Each channel has one counter node at `/{root}/{channel}` holding the
//! highest sequence replicated so far, as an 8-byte big-endian `i64`. Many
//! writers may race to advance it; the value only ever moves forward.
//!
//! # Update Protocol
//!
//! ```text
//! ┌──────────┐   read (value, version)   ┌────────────┐
//! │  update  │──────────────────────────►│   decide   │ (pure)
//! └──────────┘                           └─────┬──────┘
//!       ▲                 Skip ◄───────────────┤ candidate <= value
//!       │                                      │
//!       │   VersionConflict /           WriteAt(version)
//!       │   lost create race                   │
//!       └──────────────────────────────── conditional write / create
//! ```
//!
//! Retries are bounded by `max_attempts`. When they run out the update is
//! dropped with a warning and reported as [`UpdateOutcome::Exhausted`]; the
//! next successful update from the same task carries a higher value anyway.

use crate::config::CounterConfig;
use crate::coordination::{child_path, CoordinationStore, CreateOutcome};
use crate::error::StoreError;
use std::sync::Arc;
use tracing::{debug, warn};

/// Value reported for a channel that has never been written.
pub const START_VALUE: i64 = 0;

/// A counter value and the node version it was read at.
///
/// `version` is `None` when no node exists yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: i64,
    pub version: Option<u32>,
}

impl VersionedValue {
    /// The value of a counter that does not exist.
    pub const ABSENT: Self = Self {
        value: START_VALUE,
        version: None,
    };
}

/// What an update should do given the current stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Candidate does not advance the counter.
    Skip,
    /// Write the candidate conditionally at this version, or create the node
    /// when `None`.
    WriteAt(Option<u32>),
}

/// Decide whether `candidate` advances `current`.
pub fn decide(current: VersionedValue, candidate: i64) -> Decision {
    if current.version.is_some() && candidate <= current.value {
        return Decision::Skip;
    }
    if current.version.is_none() && candidate <= START_VALUE {
        return Decision::Skip;
    }
    Decision::WriteAt(current.version)
}

/// How an [`update`](VersionedCounter::update) ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The candidate was stored.
    Written { attempts: u32 },
    /// The stored value was already at or past the candidate.
    Skipped { current: i64 },
    /// Every attempt lost a race. The candidate was dropped.
    Exhausted { attempts: u32 },
    /// The store failed with something other than a version conflict.
    Failed(StoreError),
}

impl UpdateOutcome {
    /// `true` if the stored value is now at least the candidate.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Written { .. } | Self::Skipped { .. })
    }
}

pub fn encode(value: i64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// Decode a stored value. Anything that is not exactly 8 bytes is `None`.
pub fn decode(data: &[u8]) -> Option<i64> {
    let bytes: [u8; 8] = data.try_into().ok()?;
    Some(i64::from_be_bytes(bytes))
}

/// Per-channel monotonic counter over a [`CoordinationStore`].
pub struct VersionedCounter {
    store: Arc<dyn CoordinationStore>,
    root: String,
    max_attempts: u32,
}

impl VersionedCounter {
    pub fn new(store: Arc<dyn CoordinationStore>, config: &CounterConfig) -> Self {
        Self {
            store,
            root: config.root.clone(),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Node path of `channel`'s counter.
    pub fn path(&self, channel: &str) -> String {
        child_path(&self.root, channel)
    }

    /// Read the current value and version.
    ///
    /// A node whose contents cannot be decoded reads as [`START_VALUE`] at its
    /// real version, so the next update overwrites it.
    pub async fn read(&self, channel: &str) -> Result<VersionedValue, StoreError> {
        let path = self.path(channel);
        let node = match self.store.read(&path).await? {
            Some(node) => node,
            None => return Ok(VersionedValue::ABSENT),
        };
        let value = decode(&node.data).unwrap_or_else(|| {
            warn!(path = %path, len = node.data.len(), "Undecodable counter value, treating as start");
            START_VALUE
        });
        Ok(VersionedValue {
            value,
            version: Some(node.version),
        })
    }

    /// Advance `channel`'s counter to `candidate` if that moves it forward.
    pub async fn update(&self, channel: &str, candidate: i64) -> UpdateOutcome {
        let path = self.path(channel);

        for attempt in 1..=self.max_attempts {
            let current = match self.read(channel).await {
                Ok(current) => current,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Counter read failed");
                    return UpdateOutcome::Failed(e);
                }
            };

            let result = match decide(current, candidate) {
                Decision::Skip => {
                    return UpdateOutcome::Skipped {
                        current: current.value,
                    };
                }
                Decision::WriteAt(Some(version)) => self
                    .store
                    .conditional_write(&path, encode(candidate), version)
                    .await
                    .map(|_| true),
                Decision::WriteAt(None) => self
                    .store
                    .create_path(&path, encode(candidate), true)
                    .await
                    .map(|outcome| outcome == CreateOutcome::Created),
            };

            match result {
                Ok(true) => {
                    debug!(channel = %channel, value = candidate, attempt, "Counter advanced");
                    return UpdateOutcome::Written { attempts: attempt };
                }
                // Lost the create race: someone else made the node first.
                Ok(false) => {}
                Err(e) if e.is_version_conflict() || e.is_no_node() => {
                    debug!(channel = %channel, attempt, error = %e, "Counter write raced, retrying");
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Counter write failed");
                    return UpdateOutcome::Failed(e);
                }
            }
        }

        warn!(
            channel = %channel,
            candidate,
            attempts = self.max_attempts,
            "Counter update exhausted retries, dropping"
        );
        UpdateOutcome::Exhausted {
            attempts: self.max_attempts,
        }
    }

    /// Current value, or [`START_VALUE`] when absent or unreadable.
    pub async fn get(&self, channel: &str) -> i64 {
        match self.read(channel).await {
            Ok(current) => current.value,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Counter unavailable, using start value");
                START_VALUE
            }
        }
    }

    /// Seed the counter with [`START_VALUE`] if it does not exist.
    ///
    /// An existing node is left untouched; losing the creation race to
    /// another node is not an error.
    pub async fn initialize(&self, channel: &str) -> Result<CreateOutcome, StoreError> {
        let outcome = self
            .store
            .create_path(&self.path(channel), encode(START_VALUE), true)
            .await?;
        if outcome == CreateOutcome::Created {
            debug!(channel = %channel, "Counter initialized");
        }
        Ok(outcome)
    }

    /// Remove `channel`'s counter. A missing node is fine.
    pub async fn delete(&self, channel: &str) {
        match self.store.delete_recursive(&self.path(channel)).await {
            Ok(()) => debug!(channel = %channel, "Counter deleted"),
            Err(e) if e.is_no_node() => {}
            Err(e) => warn!(channel = %channel, error = %e, "Counter delete failed"),
        }
    }
}
