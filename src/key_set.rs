// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Distributed membership set of content keys.
//!
//! Tracks which keys of a group are "in flight" across the cluster. Each
//! member is an empty node `/{root}/{group}/{segment}`, where the segment is
//! [`ContentKey::to_path_segment`]; the node name is the whole record.

use crate::config::KeySetConfig;
use crate::content::ContentKey;
use crate::coordination::{child_path, CoordinationStore, CreateOutcome};
use crate::error::StoreError;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct DistributedKeySet {
    store: Arc<dyn CoordinationStore>,
    root: String,
}

impl DistributedKeySet {
    pub fn new(store: Arc<dyn CoordinationStore>, config: &KeySetConfig) -> Self {
        Self {
            store,
            root: config.root.clone(),
        }
    }

    fn group_path(&self, group: &str) -> String {
        child_path(&self.root, group)
    }

    fn member_path(&self, group: &str, key: &ContentKey) -> String {
        format!("{}/{}", self.group_path(group), key.to_path_segment())
    }

    /// Add `key` to `group`. Adding an existing member succeeds.
    pub async fn add(&self, group: &str, key: &ContentKey) -> Result<(), StoreError> {
        let outcome = self
            .store
            .create_path(&self.member_path(group, key), Vec::new(), true)
            .await
            .map_err(|e| {
                warn!(group = %group, key = %key, error = %e, "Key set add failed");
                e
            })?;
        if outcome == CreateOutcome::AlreadyExists {
            debug!(group = %group, key = %key, "Key already in set");
        }
        Ok(())
    }

    /// Remove `key` from `group`. Removing a non-member succeeds.
    pub async fn remove(&self, group: &str, key: &ContentKey) -> Result<(), StoreError> {
        match self.store.delete_recursive(&self.member_path(group, key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_no_node() => Ok(()),
            Err(e) => {
                warn!(group = %group, key = %key, error = %e, "Key set remove failed");
                Err(e)
            }
        }
    }

    /// Current members of `group`.
    ///
    /// An absent group and an unreachable store both read as empty. Child
    /// names that do not decode as keys are skipped.
    pub async fn snapshot(&self, group: &str) -> BTreeSet<ContentKey> {
        let children = match self.store.list_children(&self.group_path(group)).await {
            Ok(children) => children,
            Err(e) => {
                warn!(group = %group, error = %e, "Key set unavailable, reading as empty");
                return BTreeSet::new();
            }
        };

        children
            .iter()
            .filter_map(|name| {
                let key = ContentKey::from_path_segment(name);
                if key.is_none() {
                    warn!(group = %group, node = %name, "Skipping undecodable key set member");
                }
                key
            })
            .collect()
    }

    /// Drop `group` and all its members. An absent group is fine.
    pub async fn delete(&self, group: &str) -> Result<(), StoreError> {
        match self.store.delete_recursive(&self.group_path(group)).await {
            Ok(()) => {
                debug!(group = %group, "Key set deleted");
                Ok(())
            }
            Err(e) if e.is_no_node() => Ok(()),
            Err(e) => {
                warn!(group = %group, error = %e, "Key set delete failed");
                Err(e)
            }
        }
    }
}
