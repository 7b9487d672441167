// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Channel metadata and the channel service contract.
//!
//! Channel configuration is owned by an external service; this crate only
//! reads it. [`ChannelService`] is the narrow interface the reconciler and
//! the merger consume. [`StaticChannelService`] is an in-memory
//! implementation for standalone use and tests.

use crate::content::{ContentItem, ContentKey, DirectionQuery};
use crate::content_store::BoxFuture;
use crate::error::{HubError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

/// Tag marking channels that mirror a single upstream source.
pub const REPLICATED_TAG: &str = "replicated";

/// Tag marking channels with a one-master, many-satellites topology.
pub const GLOBAL_TAG: &str = "global";

/// Global replication topology of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Identity of the node that owns writes for the channel.
    pub master: String,
    /// Identities of the nodes the master forwards to.
    #[serde(default)]
    pub satellites: BTreeSet<String>,
}

impl GlobalConfig {
    pub fn new<I, S>(master: impl Into<String>, satellites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            master: master.into(),
            satellites: satellites.into_iter().map(Into::into).collect(),
        }
    }

    /// Reject topologies the reconciler cannot act on.
    pub fn validate(&self) -> Result<()> {
        if self.master.is_empty() {
            return Err(HubError::Config("a global master must exist".to_string()));
        }
        if self.satellites.is_empty() {
            return Err(HubError::Config(
                "at least one global satellite must exist".to_string(),
            ));
        }
        if self.satellites.contains(&self.master) {
            return Err(HubError::Config(format!(
                "global master {} is also listed as a satellite",
                self.master
            )));
        }
        Ok(())
    }
}

/// Configuration of one channel, as seen by this core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub name: String,
    /// Upstream channel this channel mirrors, if replicated.
    #[serde(default)]
    pub replication_source: Option<String>,
    #[serde(default)]
    pub global: Option<GlobalConfig>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl ChannelDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replication_source: None,
            global: None,
            tags: BTreeSet::new(),
        }
    }

    /// Builder: add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Builder: mirror `source`, tagging the channel as replicated.
    pub fn replicating(mut self, source: impl Into<String>) -> Self {
        self.replication_source = Some(source.into());
        self.with_tag(REPLICATED_TAG)
    }

    /// Builder: set a global topology, tagging the channel as global.
    pub fn global(mut self, global: GlobalConfig) -> Self {
        self.global = Some(global);
        self.with_tag(GLOBAL_TAG)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Whether `node_id` is the declared global master of this channel.
    pub fn is_global_master(&self, node_id: &str) -> bool {
        self.global
            .as_ref()
            .map(|g| g.master == node_id)
            .unwrap_or(false)
    }
}

/// What this core needs from the channel metadata and query service.
pub trait ChannelService: Send + Sync + 'static {
    /// Channels carrying `tag`.
    fn get_channels(&self, tag: &str) -> BoxFuture<'_, Vec<ChannelDescriptor>>;

    /// Every tag in use by at least one channel.
    fn get_tags(&self) -> BoxFuture<'_, BTreeSet<String>>;

    /// Keys of the single channel named by `query.name`, ascending.
    fn get_keys(&self, query: &DirectionQuery) -> BoxFuture<'_, Vec<ContentKey>>;

    /// Most recent key of `channel`.
    fn get_latest(&self, channel: &str) -> BoxFuture<'_, Option<ContentKey>>;

    /// The `count` oldest keys of `channel`, ascending.
    fn get_earliest(&self, channel: &str, count: usize) -> BoxFuture<'_, Vec<ContentKey>>;

    /// Content stored under `key` in `channel`.
    fn get_content(&self, channel: &str, key: &ContentKey) -> BoxFuture<'_, Option<ContentItem>>;
}

#[derive(Debug, Clone)]
struct ChannelEntry {
    descriptor: ChannelDescriptor,
    content: BTreeMap<ContentKey, Vec<u8>>,
}

/// In-memory [`ChannelService`].
///
/// Channels are returned in name order.
#[derive(Debug, Default)]
pub struct StaticChannelService {
    channels: RwLock<BTreeMap<String, ChannelEntry>>,
}

impl StaticChannelService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a channel's descriptor, keeping its content.
    pub fn upsert_channel(&self, descriptor: ChannelDescriptor) {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        match channels.get_mut(&descriptor.name) {
            Some(entry) => entry.descriptor = descriptor,
            None => {
                channels.insert(
                    descriptor.name.clone(),
                    ChannelEntry {
                        descriptor,
                        content: BTreeMap::new(),
                    },
                );
            }
        }
    }

    /// Remove a channel and its content. Returns whether it existed.
    pub fn remove_channel(&self, name: &str) -> bool {
        self.channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    /// Store content in an existing channel. Returns `false` if the channel
    /// does not exist.
    pub fn insert(&self, channel: &str, key: ContentKey, data: Vec<u8>) -> bool {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        match channels.get_mut(channel) {
            Some(entry) => {
                entry.content.insert(key, data);
                true
            }
            None => false,
        }
    }

    fn with_channel<T>(&self, channel: &str, f: impl FnOnce(&ChannelEntry) -> T) -> Option<T> {
        let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
        channels.get(channel).map(f)
    }
}

fn keys_in_direction(content: &BTreeMap<ContentKey, Vec<u8>>, query: &DirectionQuery) -> Vec<ContentKey> {
    let mut keys: Vec<ContentKey> = if query.next {
        content
            .keys()
            .filter(|k| query.start_key.as_ref().map_or(true, |start| *k > start))
            .take(query.count)
            .cloned()
            .collect()
    } else {
        content
            .keys()
            .rev()
            .filter(|k| query.start_key.as_ref().map_or(true, |start| *k < start))
            .take(query.count)
            .cloned()
            .collect()
    };
    keys.sort();
    keys
}

impl ChannelService for StaticChannelService {
    fn get_channels(&self, tag: &str) -> BoxFuture<'_, Vec<ChannelDescriptor>> {
        let channels: Vec<ChannelDescriptor> = self
            .channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|entry| entry.descriptor.has_tag(tag))
            .map(|entry| entry.descriptor.clone())
            .collect();
        Box::pin(async move { Ok(channels) })
    }

    fn get_tags(&self) -> BoxFuture<'_, BTreeSet<String>> {
        let tags: BTreeSet<String> = self
            .channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .flat_map(|entry| entry.descriptor.tags.iter().cloned())
            .collect();
        Box::pin(async move { Ok(tags) })
    }

    fn get_keys(&self, query: &DirectionQuery) -> BoxFuture<'_, Vec<ContentKey>> {
        let keys = self
            .with_channel(&query.name, |entry| keys_in_direction(&entry.content, query))
            .unwrap_or_default();
        Box::pin(async move { Ok(keys) })
    }

    fn get_latest(&self, channel: &str) -> BoxFuture<'_, Option<ContentKey>> {
        let latest = self
            .with_channel(channel, |entry| entry.content.keys().next_back().cloned())
            .flatten();
        Box::pin(async move { Ok(latest) })
    }

    fn get_earliest(&self, channel: &str, count: usize) -> BoxFuture<'_, Vec<ContentKey>> {
        let keys = self
            .with_channel(channel, |entry| {
                entry.content.keys().take(count).cloned().collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Box::pin(async move { Ok(keys) })
    }

    fn get_content(&self, channel: &str, key: &ContentKey) -> BoxFuture<'_, Option<ContentItem>> {
        let item = self
            .with_channel(channel, |entry| {
                entry
                    .content
                    .get(key)
                    .map(|data| ContentItem::new(key.clone(), data.clone()))
            })
            .flatten();
        Box::pin(async move { Ok(item) })
    }
}
