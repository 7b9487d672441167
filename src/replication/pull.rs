// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Single-peer pull loop: copy an upstream channel into the local one.
//!
//! Each step fetches the next batch after the last written position, writes
//! the items in sequence order, and advances the channel's counter to the
//! last sequence written. Delivery is at-least-once: a restart resumes from
//! the counter, which may trail what was actually written.

use super::task::TaskContext;
use crate::circuit_breaker::CircuitBreaker;
use crate::error::{HubError, Result};
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub(crate) struct PullLoop {
    channel: String,
    source: String,
    ctx: Arc<TaskContext>,
    circuit: Arc<CircuitBreaker>,
    position: i64,
}

impl PullLoop {
    pub(crate) fn new(
        channel: String,
        source: String,
        ctx: Arc<TaskContext>,
        circuit: Arc<CircuitBreaker>,
        position: i64,
    ) -> Self {
        Self {
            channel,
            source,
            ctx,
            circuit,
            position,
        }
    }

    /// Highest sequence written so far.
    pub(crate) fn position(&self) -> i64 {
        self.position
    }

    /// Fetch and write one batch. Returns the number of items written.
    pub(crate) async fn step(&mut self) -> Result<usize> {
        if !self.ctx.content.should_accept_writes() {
            trace!(channel = %self.channel, "Content store applying backpressure, skipping pull");
            return Ok(0);
        }

        self.ctx.throttle().await;
        let batch_size = self.ctx.config.batch_size;
        let mut items = self
            .circuit
            .call(|| self.ctx.feed.fetch_after(&self.source, self.position, batch_size))
            .await
            .map_err(|e| e.into_hub_error("fetch_after"))?;

        items.sort_by(|a, b| a.key.cmp(&b.key));

        let mut written = 0usize;
        let mut failure = None;
        for item in items {
            let sequence = item.key.sequence;
            if sequence <= self.position {
                trace!(channel = %self.channel, sequence, "Skipping already replicated item");
                continue;
            }
            if let Err(e) = self.ctx.content.insert(&self.channel, item).await {
                failure = Some(HubError::service("insert", e));
                break;
            }
            self.position = sequence;
            written += 1;
        }

        // Record partial progress before surfacing a write failure.
        if written > 0 {
            let outcome = self.ctx.counter.update(&self.channel, self.position).await;
            if !outcome.is_settled() {
                warn!(channel = %self.channel, position = self.position, ?outcome, "Counter not advanced");
            }
            debug!(channel = %self.channel, written, position = self.position, "Pulled batch");
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{ContentItem, ContentKey};
    use crate::counter::START_VALUE;
    use crate::replication::fixtures::{context, MemoryContent, ScriptedFeed};

    fn item(sequence: i64) -> ContentItem {
        ContentItem::new(ContentKey::from_sequence(sequence), vec![sequence as u8])
    }

    fn pull(ctx: &Arc<TaskContext>, position: i64) -> PullLoop {
        PullLoop::new(
            "orders".to_string(),
            "http://up/channel/orders".to_string(),
            Arc::clone(ctx),
            Arc::new(CircuitBreaker::new("test", ctx.config.circuit_config())),
            position,
        )
    }

    #[tokio::test]
    async fn test_pull_writes_and_advances_counter() {
        let feed = Arc::new(ScriptedFeed::new());
        feed.publish("http://up/channel/orders", (1..=3).map(item));
        let content = Arc::new(MemoryContent::new());
        let ctx = context(feed.clone(), content.clone());

        let mut worker = pull(&ctx, START_VALUE);
        assert_eq!(worker.step().await.unwrap(), 3);
        assert_eq!(worker.position(), 3);
        assert_eq!(content.sequences("orders"), vec![1, 2, 3]);
        assert_eq!(ctx.counter.get("orders").await, 3);

        assert_eq!(worker.step().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pull_respects_batch_size() {
        let feed = Arc::new(ScriptedFeed::new());
        feed.publish("http://up/channel/orders", (1..=25).map(item));
        let content = Arc::new(MemoryContent::new());
        let ctx = context(feed, content.clone());

        let mut worker = pull(&ctx, START_VALUE);
        assert_eq!(worker.step().await.unwrap(), 10);
        assert_eq!(worker.step().await.unwrap(), 10);
        assert_eq!(worker.step().await.unwrap(), 5);
        assert_eq!(content.sequences("orders").len(), 25);
        assert_eq!(ctx.counter.get("orders").await, 25);
    }

    #[tokio::test]
    async fn test_pull_resumes_after_position() {
        let feed = Arc::new(ScriptedFeed::new());
        feed.publish("http://up/channel/orders", (1..=5).map(item));
        let content = Arc::new(MemoryContent::new());
        let ctx = context(feed, content.clone());

        let mut worker = pull(&ctx, 3);
        assert_eq!(worker.step().await.unwrap(), 2);
        assert_eq!(content.sequences("orders"), vec![4, 5]);
    }

    #[tokio::test]
    async fn test_pull_pauses_under_backpressure() {
        let feed = Arc::new(ScriptedFeed::new());
        feed.publish("http://up/channel/orders", (1..=3).map(item));
        let content = Arc::new(MemoryContent::new());
        content.set_accepting(false);
        let ctx = context(feed.clone(), content.clone());

        let mut worker = pull(&ctx, START_VALUE);
        assert_eq!(worker.step().await.unwrap(), 0);
        assert_eq!(feed.fetch_calls(), 0);

        content.set_accepting(true);
        assert_eq!(worker.step().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_fetch_failure_surfaces_service_error() {
        let feed = Arc::new(ScriptedFeed::new());
        feed.fail_fetches(true);
        let ctx = context(feed, Arc::new(MemoryContent::new()));

        let err = pull(&ctx, START_VALUE).step().await.unwrap_err();
        assert!(matches!(err, HubError::Service { ref operation, .. } if operation == "fetch_after"));
        assert_eq!(ctx.counter.get("orders").await, START_VALUE);
    }

    #[tokio::test]
    async fn test_insert_failure_keeps_partial_progress() {
        let feed = Arc::new(ScriptedFeed::new());
        feed.publish("http://up/channel/orders", (1..=4).map(item));
        let content = Arc::new(MemoryContent::new());
        content.fail_at_sequence(3);
        let ctx = context(feed, content.clone());

        let mut worker = pull(&ctx, START_VALUE);
        let err = worker.step().await.unwrap_err();
        assert!(matches!(err, HubError::Service { ref operation, .. } if operation == "insert"));
        assert_eq!(worker.position(), 2);
        assert_eq!(ctx.counter.get("orders").await, 2);
    }
}
