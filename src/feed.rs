// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote content feed.
//!
//! The peer-to-peer wire protocol is outside this crate. Replication tasks
//! see a remote peer only through [`RemoteFeed`]: single-peer tasks pull
//! from an upstream source, global tasks push to a satellite.

use crate::content::ContentItem;
use crate::content_store::BoxFuture;

/// Access to content held by other hubs.
pub trait RemoteFeed: Send + Sync + 'static {
    /// Items of the upstream channel at `source` with a sequence strictly
    /// greater than `after`, ascending, at most `limit`.
    fn fetch_after(&self, source: &str, after: i64, limit: usize) -> BoxFuture<'_, Vec<ContentItem>>;

    /// Deliver `items` of `channel` to `satellite`.
    ///
    /// Items are sent in order; the call succeeds only if all were accepted.
    fn forward(&self, satellite: &str, channel: &str, items: Vec<ContentItem>) -> BoxFuture<'_, ()>;

    /// Highest sequence `peer` holds for `channel`, if any.
    fn latest_sequence(&self, peer: &str, channel: &str) -> BoxFuture<'_, Option<i64>>;
}

/// A feed with no peers behind it.
///
/// Every pull comes back empty and every forward is dropped. Used in
/// standalone mode.
#[derive(Clone, Default)]
pub struct DisconnectedFeed;

impl RemoteFeed for DisconnectedFeed {
    fn fetch_after(&self, source: &str, after: i64, _limit: usize) -> BoxFuture<'_, Vec<ContentItem>> {
        tracing::trace!(source = %source, after, "Disconnected feed: nothing to fetch");
        Box::pin(async { Ok(Vec::new()) })
    }

    fn forward(&self, satellite: &str, channel: &str, items: Vec<ContentItem>) -> BoxFuture<'_, ()> {
        tracing::debug!(
            satellite = %satellite,
            channel = %channel,
            count = items.len(),
            "Disconnected feed: dropping forwarded items"
        );
        Box::pin(async { Ok(()) })
    }

    fn latest_sequence(&self, _peer: &str, _channel: &str) -> BoxFuture<'_, Option<i64>> {
        Box::pin(async { Ok(None) })
    }
}
