//! Mock ContentStore for testing.
//!
//! Keeps items per channel and records every insert, including repeats, so
//! tests can check delivery order and duplicates.

use channel_hub::content::ContentItem;
use channel_hub::content_store::{BoxFuture, ContentStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub struct MockContentStore {
    items: Mutex<HashMap<String, BTreeMap<i64, ContentItem>>>,
    /// Every insert as (channel, sequence), in call order
    inserts: Mutex<Vec<(String, i64)>>,
    accepting: AtomicBool,
}

impl Default for MockContentStore {
    fn default() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            inserts: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
        }
    }
}

impl MockContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Store an item directly, as a local write would.
    pub fn put(&self, channel: &str, item: ContentItem) {
        self.items
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .insert(item.key.sequence, item);
    }

    /// Sequences currently held for `channel`, ascending.
    pub fn sequences(&self, channel: &str) -> Vec<i64> {
        self.items
            .lock()
            .unwrap()
            .get(channel)
            .map(|items| items.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Sequences inserted into `channel`, in call order.
    pub fn inserted(&self, channel: &str) -> Vec<i64> {
        self.inserts
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, sequence)| *sequence)
            .collect()
    }
}

impl ContentStore for MockContentStore {
    fn should_accept_writes(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn insert(&self, channel: &str, item: ContentItem) -> BoxFuture<'_, ()> {
        self.inserts
            .lock()
            .unwrap()
            .push((channel.to_string(), item.key.sequence));
        self.put(channel, item);
        Box::pin(async { Ok(()) })
    }

    fn read_after(&self, channel: &str, after: i64, limit: usize) -> BoxFuture<'_, Vec<ContentItem>> {
        let items = self
            .items
            .lock()
            .unwrap()
            .get(channel)
            .map(|items| {
                items
                    .values()
                    .filter(|item| item.key.sequence > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Box::pin(async move { Ok(items) })
    }
}
