//! Shared test utilities for integration and property tests.
//!
//! This module provides:
//! - Recording RemoteFeed mock with programmable failures
//! - Recording ContentStore mock with backpressure control
//! - Builders for a reconciler wired to in-memory collaborators

#![allow(dead_code)]

pub mod mock_content;
pub mod mock_feed;

pub use mock_content::*;
pub use mock_feed::*;

use channel_hub::channel::StaticChannelService;
use channel_hub::config::HubConfig;
use channel_hub::content::{ContentItem, ContentKey};
use channel_hub::coordination::InMemoryCoordinationStore;
use channel_hub::replication::ReplicationReconciler;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A reconciler together with handles on every collaborator it was given.
pub struct TestHub {
    pub channels: Arc<StaticChannelService>,
    pub store: Arc<InMemoryCoordinationStore>,
    pub feed: Arc<MockFeed>,
    pub content: Arc<MockContentStore>,
    pub reconciler: ReplicationReconciler,
}

impl TestHub {
    pub fn new(node_id: &str) -> Self {
        Self::sharing(node_id, Arc::new(InMemoryCoordinationStore::new()))
    }

    /// A hub using an existing coordination store, as a second node would.
    pub fn sharing(node_id: &str, store: Arc<InMemoryCoordinationStore>) -> Self {
        Self::with_config(HubConfig::for_testing(node_id), store)
    }

    pub fn with_config(config: HubConfig, store: Arc<InMemoryCoordinationStore>) -> Self {
        let channels = Arc::new(StaticChannelService::new());
        let feed = Arc::new(MockFeed::new());
        let content = Arc::new(MockContentStore::new());
        let reconciler = ReplicationReconciler::new(
            config,
            channels.clone(),
            store.clone(),
            feed.clone(),
            content.clone(),
        )
        .expect("valid test config");

        Self {
            channels,
            store,
            feed,
            content,
            reconciler,
        }
    }
}

pub fn item(sequence: i64) -> ContentItem {
    ContentItem::new(ContentKey::from_sequence(sequence), sequence.to_be_bytes().to_vec())
}

/// Poll `condition` until it holds, failing the test after `timeout`.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(timeout, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not met within {:?}", timeout);
}
