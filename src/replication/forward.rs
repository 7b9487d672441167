// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Global forward loop: push a master channel's local content to one
//! satellite.

use super::task::TaskContext;
use crate::circuit_breaker::CircuitBreaker;
use crate::error::{HubError, Result};
use std::sync::Arc;
use tracing::debug;

pub(crate) struct ForwardLoop {
    channel: String,
    satellite: String,
    ctx: Arc<TaskContext>,
    circuit: Arc<CircuitBreaker>,
    cursor: i64,
}

impl ForwardLoop {
    pub(crate) fn new(
        channel: String,
        satellite: String,
        ctx: Arc<TaskContext>,
        circuit: Arc<CircuitBreaker>,
        cursor: i64,
    ) -> Self {
        Self {
            channel,
            satellite,
            ctx,
            circuit,
            cursor,
        }
    }

    /// Highest sequence the satellite is known to hold.
    pub(crate) fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Forward one batch. The cursor only moves once the satellite accepted
    /// the whole batch.
    pub(crate) async fn step(&mut self) -> Result<usize> {
        let items = self
            .ctx
            .content
            .read_after(&self.channel, self.cursor, self.ctx.config.batch_size)
            .await
            .map_err(|e| HubError::service("read_after", e))?;

        let Some(last) = items.iter().map(|item| item.key.sequence).max() else {
            return Ok(0);
        };
        let count = items.len();

        self.ctx.throttle().await;
        self.circuit
            .call(|| self.ctx.feed.forward(&self.satellite, &self.channel, items))
            .await
            .map_err(|e| e.into_hub_error("forward"))?;

        self.cursor = self.cursor.max(last);
        debug!(channel = %self.channel, satellite = %self.satellite, count, cursor = self.cursor, "Forwarded batch");
        Ok(count)
    }
}
