// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Hierarchical coordination store contract.
//!
//! The hub keeps its shared state (replication counters, in-flight key sets,
//! the reconciler's watch node) in an external tree-shaped store with
//! per-node versions and one-shot change notifications. This module defines
//! the narrow contract the rest of the crate codes against, and an in-memory
//! implementation used by standalone mode and the tests.
//!
//! # Semantics
//!
//! ```text
//! create_path        ──► Created | AlreadyExists   (never an error on exists)
//! read               ──► Some(NodeData) | None
//! conditional_write  ──► Ok | VersionConflict | NoNode | Unavailable
//! list_children      ──► names (empty when the parent is absent)
//! delete_recursive   ──► Ok | NoNode
//! watch              ──► callback fires once on the next change, then is gone
//! ```
//!
//! Versions start at 0 when a node is created and increase by one on every
//! successful write.

use crate::error::StoreError;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, trace};

/// Boxed future returned by [`CoordinationStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// One-shot change callback.
///
/// Runs on whatever thread applied the change, so it must not block. Send a
/// message somewhere and return.
pub type WatchCallback = Box<dyn FnOnce() + Send + 'static>;

/// Result of [`CoordinationStore::create_path`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// This call created the node.
    Created,
    /// The node was already there; its data was left alone.
    AlreadyExists,
}

/// Node contents together with the version they were read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub data: Vec<u8>,
    pub version: u32,
}

/// The external coordination store.
pub trait CoordinationStore: Send + Sync + 'static {
    /// Create `path` holding `data`.
    ///
    /// With `create_parents`, missing ancestors are created empty; without
    /// it a missing parent is [`StoreError::NoNode`].
    fn create_path(&self, path: &str, data: Vec<u8>, create_parents: bool) -> StoreFuture<'_, CreateOutcome>;

    fn read(&self, path: &str) -> StoreFuture<'_, Option<NodeData>>;

    /// Replace the node's data only if its version still equals
    /// `expected_version`.
    fn conditional_write(&self, path: &str, data: Vec<u8>, expected_version: u32) -> StoreFuture<'_, ()>;

    /// Names (not full paths) of the direct children of `path`.
    fn list_children(&self, path: &str) -> StoreFuture<'_, Vec<String>>;

    /// Delete `path` and everything beneath it.
    fn delete_recursive(&self, path: &str) -> StoreFuture<'_, ()>;

    /// Register a one-shot callback for the next create, write or delete of
    /// `path`. The node does not have to exist yet.
    fn watch(&self, path: &str, on_change: WatchCallback) -> StoreFuture<'_, ()>;
}

/// Join a root and a child name into an absolute node path.
///
/// `root` may be given with or without its leading slash.
///
/// ```
/// use channel_hub::coordination::child_path;
///
/// assert_eq!(child_path("lastUpdated", "orders"), "/lastUpdated/orders");
/// assert_eq!(child_path("/GroupInFlight", "g"), "/GroupInFlight/g");
/// ```
pub fn child_path(root: &str, child: &str) -> String {
    let root = root.trim_end_matches('/');
    if root.starts_with('/') {
        format!("{}/{}", root, child)
    } else {
        format!("/{}/{}", root, child)
    }
}

fn validate_path(path: &str) -> Result<(), StoreError> {
    let valid = path == "/"
        || (path.starts_with('/') && !path.ends_with('/') && !path[1..].split('/').any(str::is_empty));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidPath { path: path.to_string() })
    }
}

/// Parent of an absolute path; `None` for the root.
fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    }
}

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    version: u32,
}

/// In-process [`CoordinationStore`].
///
/// Nodes live in a sorted map keyed by absolute path, which makes subtree
/// scans a range query. The root `/` always exists implicitly.
pub struct InMemoryCoordinationStore {
    nodes: Mutex<BTreeMap<String, Node>>,
    watches: Mutex<HashMap<String, Vec<WatchCallback>>>,
    available: AtomicBool,
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(BTreeMap::new()),
            watches: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate losing (or regaining) the connection to the store.
    ///
    /// While unavailable every operation fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of nodes currently stored (the implicit root excluded).
    pub fn node_count(&self) -> usize {
        self.lock_nodes().len()
    }

    /// Number of callbacks armed on `path`.
    pub fn watch_count(&self, path: &str) -> usize {
        self.lock_watches().get(path).map_or(0, Vec::len)
    }

    fn lock_nodes(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Node>> {
        // A panic while holding the lock cannot leave the map half-updated:
        // every mutation is a single insert/remove.
        self.nodes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_watches(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<WatchCallback>>> {
        self.watches.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store switched off".to_string()))
        }
    }

    /// Fire and drop every callback registered on `paths`.
    ///
    /// Called with no store lock held so callbacks may re-arm immediately.
    fn fire(&self, paths: &[String]) {
        let callbacks: Vec<WatchCallback> = {
            let mut watches = self.lock_watches();
            paths
                .iter()
                .filter_map(|path| watches.remove(path))
                .flatten()
                .collect()
        };
        if !callbacks.is_empty() {
            trace!(count = callbacks.len(), "Firing coordination watches");
        }
        for callback in callbacks {
            callback();
        }
    }

    fn do_create(&self, path: &str, data: Vec<u8>, create_parents: bool) -> Result<(CreateOutcome, Vec<String>), StoreError> {
        self.check_available()?;
        validate_path(path)?;
        if path == "/" {
            return Ok((CreateOutcome::AlreadyExists, Vec::new()));
        }

        let mut nodes = self.lock_nodes();
        if nodes.contains_key(path) {
            return Ok((CreateOutcome::AlreadyExists, Vec::new()));
        }

        let mut missing = Vec::new();
        let mut cursor = parent_of(path);
        while let Some(ancestor) = cursor {
            if ancestor == "/" || nodes.contains_key(ancestor) {
                break;
            }
            missing.push(ancestor.to_string());
            cursor = parent_of(ancestor);
        }
        if !missing.is_empty() && !create_parents {
            return Err(StoreError::NoNode {
                path: missing[0].clone(),
            });
        }

        let mut created = Vec::with_capacity(missing.len() + 1);
        for ancestor in missing.into_iter().rev() {
            nodes.insert(ancestor.clone(), Node { data: Vec::new(), version: 0 });
            created.push(ancestor);
        }
        nodes.insert(path.to_string(), Node { data, version: 0 });
        created.push(path.to_string());
        Ok((CreateOutcome::Created, created))
    }

    fn do_read(&self, path: &str) -> Result<Option<NodeData>, StoreError> {
        self.check_available()?;
        validate_path(path)?;
        Ok(self.lock_nodes().get(path).map(|node| NodeData {
            data: node.data.clone(),
            version: node.version,
        }))
    }

    fn do_write(&self, path: &str, data: Vec<u8>, expected_version: u32) -> Result<(), StoreError> {
        self.check_available()?;
        validate_path(path)?;
        let mut nodes = self.lock_nodes();
        let node = nodes.get_mut(path).ok_or_else(|| StoreError::NoNode {
            path: path.to_string(),
        })?;
        if node.version != expected_version {
            return Err(StoreError::VersionConflict {
                path: path.to_string(),
                expected: expected_version,
                actual: Some(node.version),
            });
        }
        node.data = data;
        node.version = node.version.wrapping_add(1);
        Ok(())
    }

    fn do_list(&self, path: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        validate_path(path)?;
        let prefix = child_prefix(path);
        let nodes = self.lock_nodes();
        Ok(nodes
            .range(prefix.clone()..)
            .take_while(|(candidate, _)| candidate.starts_with(&prefix))
            .map(|(candidate, _)| &candidate[prefix.len()..])
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    fn do_delete(&self, path: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        validate_path(path)?;
        let mut nodes = self.lock_nodes();
        if path != "/" && !nodes.contains_key(path) {
            return Err(StoreError::NoNode { path: path.to_string() });
        }
        let prefix = child_prefix(path);
        let mut doomed: Vec<String> = nodes
            .range(prefix.clone()..)
            .take_while(|(candidate, _)| candidate.starts_with(&prefix))
            .map(|(candidate, _)| candidate.clone())
            .collect();
        if path != "/" {
            doomed.push(path.to_string());
        }
        for victim in &doomed {
            nodes.remove(victim);
        }
        Ok(doomed)
    }
}

impl CoordinationStore for InMemoryCoordinationStore {
    fn create_path(&self, path: &str, data: Vec<u8>, create_parents: bool) -> StoreFuture<'_, CreateOutcome> {
        let result = self.do_create(path, data, create_parents).map(|(outcome, created)| {
            self.fire(&created);
            outcome
        });
        Box::pin(async move { result })
    }

    fn read(&self, path: &str) -> StoreFuture<'_, Option<NodeData>> {
        let result = self.do_read(path);
        Box::pin(async move { result })
    }

    fn conditional_write(&self, path: &str, data: Vec<u8>, expected_version: u32) -> StoreFuture<'_, ()> {
        let result = self.do_write(path, data, expected_version);
        if result.is_ok() {
            self.fire(&[path.to_string()]);
        }
        Box::pin(async move { result })
    }

    fn list_children(&self, path: &str) -> StoreFuture<'_, Vec<String>> {
        let result = self.do_list(path);
        Box::pin(async move { result })
    }

    fn delete_recursive(&self, path: &str) -> StoreFuture<'_, ()> {
        let result = self.do_delete(path).map(|deleted| {
            debug!(path = %path, count = deleted.len(), "Deleted coordination subtree");
            self.fire(&deleted);
        });
        Box::pin(async move { result })
    }

    fn watch(&self, path: &str, on_change: WatchCallback) -> StoreFuture<'_, ()> {
        let result = self
            .check_available()
            .and_then(|_| validate_path(path))
            .map(|_| {
                self.lock_watches()
                    .entry(path.to_string())
                    .or_default()
                    .push(on_change);
            });
        Box::pin(async move { result })
    }
}
