// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-crate test doubles for replication.

use super::task::TaskContext;
use crate::channel::{ChannelDescriptor, ChannelService, StaticChannelService};
use crate::config::{CounterConfig, TaskConfig};
use crate::content::{ContentItem, ContentKey, DirectionQuery};
use crate::content_store::{BoxFuture, ContentStore};
use crate::coordination::{CoordinationStore, InMemoryCoordinationStore};
use crate::counter::VersionedCounter;
use crate::error::ServiceError;
use crate::feed::RemoteFeed;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) fn context(feed: Arc<ScriptedFeed>, content: Arc<MemoryContent>) -> Arc<TaskContext> {
    let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
    Arc::new(TaskContext {
        feed,
        content,
        counter: Arc::new(VersionedCounter::new(store, &CounterConfig::default())),
        config: TaskConfig::for_testing(),
        rate_limiter: None,
    })
}

/// Feed over in-memory upstream channels that records forwards.
#[derive(Default)]
pub(crate) struct ScriptedFeed {
    upstream: Mutex<HashMap<String, Vec<ContentItem>>>,
    forwarded: Mutex<HashMap<(String, String), Vec<i64>>>,
    latest: Mutex<HashMap<(String, String), i64>>,
    fail_fetches: AtomicBool,
    fail_forwards: AtomicBool,
    fail_latest: AtomicBool,
    fetch_calls: AtomicUsize,
    fetch_delay: Mutex<Duration>,
}

impl ScriptedFeed {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn publish(&self, source: &str, items: impl IntoIterator<Item = ContentItem>) {
        let mut upstream = self.upstream.lock().unwrap();
        upstream.entry(source.to_string()).or_default().extend(items);
    }

    pub(crate) fn set_latest(&self, peer: &str, channel: &str, sequence: i64) {
        self.latest
            .lock()
            .unwrap()
            .insert((peer.to_string(), channel.to_string()), sequence);
    }

    pub(crate) fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_forwards(&self, fail: bool) {
        self.fail_forwards.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_latest(&self, fail: bool) {
        self.fail_latest.store(fail, Ordering::SeqCst);
    }

    /// Make every fetch take `delay` before answering.
    pub(crate) fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    pub(crate) fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn forwarded(&self, satellite: &str, channel: &str) -> Vec<i64> {
        self.forwarded
            .lock()
            .unwrap()
            .get(&(satellite.to_string(), channel.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

impl RemoteFeed for ScriptedFeed {
    fn fetch_after(&self, source: &str, after: i64, limit: usize) -> BoxFuture<'_, Vec<ContentItem>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail_fetches.load(Ordering::SeqCst) {
            Err(ServiceError::from("upstream unreachable"))
        } else {
            let upstream = self.upstream.lock().unwrap();
            let mut items: Vec<ContentItem> = upstream
                .get(source)
                .map(|items| items.iter().filter(|i| i.key.sequence > after).cloned().collect())
                .unwrap_or_default();
            items.sort_by(|a, b| a.key.cmp(&b.key));
            items.truncate(limit);
            Ok(items)
        };
        let delay = *self.fetch_delay.lock().unwrap();
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            result
        })
    }

    fn forward(&self, satellite: &str, channel: &str, items: Vec<ContentItem>) -> BoxFuture<'_, ()> {
        let result = if self.fail_forwards.load(Ordering::SeqCst) {
            Err(ServiceError::from("satellite unreachable"))
        } else {
            self.forwarded
                .lock()
                .unwrap()
                .entry((satellite.to_string(), channel.to_string()))
                .or_default()
                .extend(items.iter().map(|item| item.key.sequence));
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn latest_sequence(&self, peer: &str, channel: &str) -> BoxFuture<'_, Option<i64>> {
        let result = if self.fail_latest.load(Ordering::SeqCst) {
            Err(ServiceError::from("peer unreachable"))
        } else {
            Ok(self
                .latest
                .lock()
                .unwrap()
                .get(&(peer.to_string(), channel.to_string()))
                .copied())
        };
        Box::pin(async move { result })
    }
}

/// Content store keeping items per channel in sequence order.
pub(crate) struct MemoryContent {
    channels: Mutex<HashMap<String, BTreeMap<i64, ContentItem>>>,
    accepting: AtomicBool,
    fail_at: Mutex<Option<i64>>,
}

impl MemoryContent {
    pub(crate) fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            fail_at: Mutex::new(None),
        }
    }

    pub(crate) fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Reject inserts of this sequence.
    pub(crate) fn fail_at_sequence(&self, sequence: i64) {
        *self.fail_at.lock().unwrap() = Some(sequence);
    }

    pub(crate) fn sequences(&self, channel: &str) -> Vec<i64> {
        self.channels
            .lock()
            .unwrap()
            .get(channel)
            .map(|items| items.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl ContentStore for MemoryContent {
    fn should_accept_writes(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn insert(&self, channel: &str, item: ContentItem) -> BoxFuture<'_, ()> {
        let result = if *self.fail_at.lock().unwrap() == Some(item.key.sequence) {
            Err(ServiceError::from("disk full"))
        } else {
            self.channels
                .lock()
                .unwrap()
                .entry(channel.to_string())
                .or_default()
                .insert(item.key.sequence, item);
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn read_after(&self, channel: &str, after: i64, limit: usize) -> BoxFuture<'_, Vec<ContentItem>> {
        let items = self
            .channels
            .lock()
            .unwrap()
            .get(channel)
            .map(|items| {
                items
                    .range(after.saturating_add(1)..)
                    .take(limit)
                    .map(|(_, item)| item.clone())
                    .collect()
            })
            .unwrap_or_default();
        Box::pin(async move { Ok(items) })
    }
}

/// Channel service whose metadata reads can be made to fail per tag.
pub(crate) struct FlakyChannels {
    pub(crate) inner: StaticChannelService,
    failing: Mutex<HashSet<String>>,
}

impl FlakyChannels {
    pub(crate) fn new() -> Self {
        Self {
            inner: StaticChannelService::new(),
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn fail_tag(&self, tag: &str, fail: bool) {
        let mut failing = self.failing.lock().unwrap();
        if fail {
            failing.insert(tag.to_string());
        } else {
            failing.remove(tag);
        }
    }
}

impl ChannelService for FlakyChannels {
    fn get_channels(&self, tag: &str) -> BoxFuture<'_, Vec<ChannelDescriptor>> {
        if self.failing.lock().unwrap().contains(tag) {
            return Box::pin(async { Err(ServiceError::from("channel metadata unavailable")) });
        }
        self.inner.get_channels(tag)
    }

    fn get_tags(&self) -> BoxFuture<'_, BTreeSet<String>> {
        self.inner.get_tags()
    }

    fn get_keys(&self, query: &DirectionQuery) -> BoxFuture<'_, Vec<ContentKey>> {
        self.inner.get_keys(query)
    }

    fn get_latest(&self, channel: &str) -> BoxFuture<'_, Option<ContentKey>> {
        self.inner.get_latest(channel)
    }

    fn get_earliest(&self, channel: &str, count: usize) -> BoxFuture<'_, Vec<ContentKey>> {
        self.inner.get_earliest(channel, count)
    }

    fn get_content(&self, channel: &str, key: &ContentKey) -> BoxFuture<'_, Option<ContentItem>> {
        self.inner.get_content(channel, key)
    }
}
