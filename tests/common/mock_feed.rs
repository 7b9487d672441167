//! Mock RemoteFeed for testing.
//!
//! Serves pulls from in-memory upstream channels and records every call.
//! Failures can be switched on per operation.

use channel_hub::content::ContentItem;
use channel_hub::content_store::BoxFuture;
use channel_hub::error::ServiceError;
use channel_hub::feed::RemoteFeed;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// A recorded forward() call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardCall {
    pub satellite: String,
    pub channel: String,
    pub sequences: Vec<i64>,
}

/// Mock implementation of RemoteFeed that records all calls.
#[derive(Default)]
pub struct MockFeed {
    /// Upstream content by source
    upstream: Mutex<HashMap<String, Vec<ContentItem>>>,
    /// Latest sequence by (peer, channel)
    latest: Mutex<HashMap<(String, String), i64>>,
    /// Recorded fetch_after() calls as (source, after)
    fetches: Mutex<Vec<(String, i64)>>,
    /// Recorded forward() calls
    forwards: Mutex<Vec<ForwardCall>>,
    fail_fetch: AtomicBool,
    fail_forward: AtomicBool,
    /// Added latency on every fetch_after()
    fetch_delay: Mutex<Duration>,
}

impl MockFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append items to the upstream channel at `source`.
    pub fn publish(&self, source: &str, items: impl IntoIterator<Item = ContentItem>) {
        self.upstream
            .lock()
            .unwrap()
            .entry(source.to_string())
            .or_default()
            .extend(items);
    }

    pub fn set_latest(&self, peer: &str, channel: &str, sequence: i64) {
        self.latest
            .lock()
            .unwrap()
            .insert((peer.to_string(), channel.to_string()), sequence);
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    pub fn set_fail_forward(&self, fail: bool) {
        self.fail_forward.store(fail, Ordering::SeqCst);
    }

    /// Every fetch_after() call as (source, after), in call order.
    pub fn fetches(&self) -> Vec<(String, i64)> {
        self.fetches.lock().unwrap().clone()
    }

    /// Sources fetched from, in call order.
    pub fn fetched_sources(&self) -> Vec<String> {
        self.fetches.lock().unwrap().iter().map(|(source, _)| source.clone()).collect()
    }

    pub fn forwards(&self) -> Vec<ForwardCall> {
        self.forwards.lock().unwrap().clone()
    }

    /// Every sequence forwarded to `satellite` for `channel`, in order.
    pub fn forwarded_sequences(&self, satellite: &str, channel: &str) -> Vec<i64> {
        self.forwards()
            .into_iter()
            .filter(|call| call.satellite == satellite && call.channel == channel)
            .flat_map(|call| call.sequences)
            .collect()
    }
}

impl RemoteFeed for MockFeed {
    fn fetch_after(&self, source: &str, after: i64, limit: usize) -> BoxFuture<'_, Vec<ContentItem>> {
        self.fetches.lock().unwrap().push((source.to_string(), after));
        let result = if self.fail_fetch.load(Ordering::SeqCst) {
            Err(ServiceError::from("mock fetch failure"))
        } else {
            let mut items: Vec<ContentItem> = self
                .upstream
                .lock()
                .unwrap()
                .get(source)
                .map(|items| items.iter().filter(|i| i.key.sequence > after).cloned().collect())
                .unwrap_or_default();
            items.sort_by(|a, b| a.key.cmp(&b.key));
            items.truncate(limit);
            Ok(items)
        };
        let delay = *self.fetch_delay.lock().unwrap();
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            result
        })
    }

    fn forward(&self, satellite: &str, channel: &str, items: Vec<ContentItem>) -> BoxFuture<'_, ()> {
        let result = if self.fail_forward.load(Ordering::SeqCst) {
            Err(ServiceError::from("mock forward failure"))
        } else {
            self.forwards.lock().unwrap().push(ForwardCall {
                satellite: satellite.to_string(),
                channel: channel.to_string(),
                sequences: items.iter().map(|item| item.key.sequence).collect(),
            });
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn latest_sequence(&self, peer: &str, channel: &str) -> BoxFuture<'_, Option<i64>> {
        let latest = self
            .latest
            .lock()
            .unwrap()
            .get(&(peer.to_string(), channel.to_string()))
            .copied();
        Box::pin(async move { Ok(latest) })
    }
}
