// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tag queries across member channels.
//!
//! A tag groups channels; reading "by tag" means asking every member the same
//! question and merging the answers into one ordered stream. Keys are merged
//! as [`ChannelContentKey`]s so two channels holding the same key both show
//! up, ordered by channel name.
//!
//! The per-channel limit is applied again after the merge: each member
//! returns up to `count` keys, and the merged result keeps the `count`
//! globally closest to the start point.

use crate::channel::{ChannelDescriptor, ChannelService};
use crate::content::{ChannelContentKey, ContentItem, ContentKey, DirectionQuery};
use crate::error::{HubError, Result, ServiceError};
use crate::query::ParallelQueryExecutor;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info_span, Instrument};

pub struct CrossPartitionMerger {
    channels: Arc<dyn ChannelService>,
    executor: ParallelQueryExecutor,
}

impl CrossPartitionMerger {
    pub fn new(channels: Arc<dyn ChannelService>, executor: ParallelQueryExecutor) -> Self {
        Self { channels, executor }
    }

    /// Channels carrying `tag`, in name order.
    pub async fn get_channels(&self, tag: &str) -> Result<Vec<ChannelDescriptor>> {
        let mut members = self
            .channels
            .get_channels(tag)
            .await
            .map_err(|e| HubError::service("get_channels", e))?;
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members.dedup_by(|a, b| a.name == b.name);
        Ok(members)
    }

    pub async fn get_tags(&self) -> Result<BTreeSet<String>> {
        self.channels
            .get_tags()
            .await
            .map_err(|e| HubError::service("get_tags", e))
    }

    async fn member_names(&self, tag: &str) -> Result<Vec<String>> {
        Ok(self
            .get_channels(tag)
            .await?
            .into_iter()
            .map(|descriptor| descriptor.name)
            .collect())
    }

    /// Keys of every channel tagged `query.name`, walking from
    /// `query.start_key` in the query's direction.
    ///
    /// Ascending queries keep the `count` smallest merged keys, descending
    /// ones the `count` largest. Either way the result is in ascending order.
    pub async fn get_keys(&self, query: &DirectionQuery) -> Result<Vec<ChannelContentKey>> {
        let span = info_span!("tag_keys", tag = %query.name, next = query.next, count = query.count);
        self.merged_keys(query).instrument(span).await
    }

    async fn merged_keys(&self, query: &DirectionQuery) -> Result<Vec<ChannelContentKey>> {
        if query.count == 0 {
            return Ok(Vec::new());
        }
        let members = self.member_names(&query.name).await?;
        let merged = self
            .executor
            .query(&members, |channel| {
                let service = Arc::clone(&self.channels);
                let per_channel = query.with_channel(&channel);
                async move {
                    let keys = service.get_keys(&per_channel).await?;
                    Ok::<_, ServiceError>(tag_keys(&channel, keys))
                }
            })
            .await?;

        let selected = select_window(merged, query.next, query.count);
        debug!(members = members.len(), returned = selected.len(), "Tag keys merged");
        Ok(selected)
    }

    /// The most recent key across every channel tagged `tag`.
    pub async fn get_latest(&self, tag: &str) -> Result<Option<ChannelContentKey>> {
        let members = self.member_names(tag).await?;
        let latest = self
            .executor
            .query(&members, |channel| {
                let service = Arc::clone(&self.channels);
                async move {
                    let latest = service.get_latest(&channel).await?;
                    Ok::<_, ServiceError>(
                        latest
                            .map(|key| ChannelContentKey::new(channel, key))
                            .into_iter()
                            .collect::<BTreeSet<_>>(),
                    )
                }
            })
            .instrument(info_span!("tag_latest", tag = %tag))
            .await?;
        Ok(latest.into_iter().next_back())
    }

    /// The `count` oldest keys across every channel tagged `tag`, ascending.
    pub async fn get_earliest(&self, tag: &str, count: usize) -> Result<Vec<ChannelContentKey>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let members = self.member_names(tag).await?;
        let merged = self
            .executor
            .query(&members, |channel| {
                let service = Arc::clone(&self.channels);
                async move {
                    let keys = service.get_earliest(&channel, count).await?;
                    Ok::<_, ServiceError>(tag_keys(&channel, keys))
                }
            })
            .instrument(info_span!("tag_earliest", tag = %tag, count))
            .await?;
        Ok(select_window(merged, true, count))
    }

    /// Content stored under `key` in the first channel tagged `tag`, by
    /// channel name, that holds it.
    pub async fn get_value(&self, tag: &str, key: &ContentKey) -> Result<Option<(String, ContentItem)>> {
        for channel in self.member_names(tag).await? {
            let found = self
                .channels
                .get_content(&channel, key)
                .await
                .map_err(|e| HubError::service("get_content", e))?;
            if let Some(item) = found {
                return Ok(Some((channel, item)));
            }
        }
        Ok(None)
    }
}

fn tag_keys(channel: &str, keys: Vec<ContentKey>) -> BTreeSet<ChannelContentKey> {
    keys.into_iter()
        .map(|key| ChannelContentKey::new(channel, key))
        .collect()
}

/// Keep the `count` smallest (ascending) or largest (descending) keys,
/// returned ascending.
pub fn select_window<K: Ord>(merged: BTreeSet<K>, ascending: bool, count: usize) -> Vec<K> {
    if ascending {
        merged.into_iter().take(count).collect()
    } else {
        let skip = merged.len().saturating_sub(count);
        merged.into_iter().skip(skip).collect()
    }
}
