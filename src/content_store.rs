// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local content storage integration.
//!
//! The byte storage engine lives outside this crate. Replication tasks only
//! need to write items that arrived from an upstream peer and read local
//! items to forward to satellites, so that is all this trait asks for.
//!
//! # Example
//!
//! ```rust,no_run
//! use channel_hub::content::ContentItem;
//! use channel_hub::content_store::{BoxFuture, ContentStore};
//!
//! struct MyStore { /* ... */ }
//!
//! impl ContentStore for MyStore {
//!     fn insert(&self, _channel: &str, _item: ContentItem) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!
//!     fn read_after(&self, _channel: &str, _after: i64, _limit: usize) -> BoxFuture<'_, Vec<ContentItem>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//! }
//! ```

use crate::content::ContentItem;
use crate::error::ServiceError;
use std::future::Future;
use std::pin::Pin;

/// Result type for collaborator operations.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Boxed future returned by every collaborator trait in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = ServiceResult<T>> + Send + 'a>>;

/// What replication needs from local content storage.
pub trait ContentStore: Send + Sync + 'static {
    /// Backpressure check.
    ///
    /// Pull loops pause while this returns `false` instead of fetching
    /// content that would be rejected.
    fn should_accept_writes(&self) -> bool {
        true
    }

    /// Store one replicated item in `channel`.
    ///
    /// Must be idempotent: replication is at-least-once and an item can be
    /// delivered again after a restart.
    fn insert(&self, channel: &str, item: ContentItem) -> BoxFuture<'_, ()>;

    /// Items of `channel` with a sequence strictly greater than `after`,
    /// ascending, at most `limit`.
    fn read_after(&self, channel: &str, after: i64, limit: usize) -> BoxFuture<'_, Vec<ContentItem>>;
}

/// A no-op store for standalone mode.
///
/// Logs writes but keeps nothing, so global forwarding never finds anything
/// to send.
#[derive(Clone, Default)]
pub struct NoOpContentStore;

impl ContentStore for NoOpContentStore {
    fn insert(&self, channel: &str, item: ContentItem) -> BoxFuture<'_, ()> {
        let channel = channel.to_string();
        Box::pin(async move {
            tracing::debug!(
                channel = %channel,
                key = %item.key,
                len = item.data.len(),
                "NoOp: would insert item"
            );
            Ok(())
        })
    }

    fn read_after(&self, _channel: &str, _after: i64, _limit: usize) -> BoxFuture<'_, Vec<ContentItem>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}
