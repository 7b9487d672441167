//! # Channel Hub
//!
//! Core of a multi-channel content hub: replication reconciliation,
//! coordination primitives, and cross-channel tag queries.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                               channel-hub                                 │
//! │                                                                           │
//! │  ┌────────────────────────┐       ┌──────────────────────────────────┐    │
//! │  │ ReplicationReconciler  │──────►│ ReplicationTask (per key)        │    │
//! │  │ (watch / tick / start) │       │ pull from source | forward to    │    │
//! │  └────────────────────────┘       │ satellite                        │    │
//! │         │                         └──────────────────────────────────┘    │
//! │         │                                        │                        │
//! │         ▼                                        ▼                        │
//! │  ┌────────────────────┐            ┌───────────────────────────┐          │
//! │  │ CoordinationStore  │◄───────────│ VersionedCounter          │          │
//! │  │ (watch path)       │            │ DistributedKeySet         │          │
//! │  └────────────────────┘            └───────────────────────────┘          │
//! │                                                                           │
//! │  ┌──────────────────────┐    ┌───────────────────────────────────────┐    │
//! │  │ CrossPartitionMerger │───►│ ParallelQueryExecutor (all-or-nothing)│    │
//! │  │ (tag queries)        │    │ one sub-query per member channel      │    │
//! │  └──────────────────────┘    └───────────────────────────────────────┘    │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Channel metadata, content bytes and peers are external. They are reached
//! through [`ChannelService`], [`ContentStore`] and [`RemoteFeed`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use channel_hub::{
//!     DisconnectedFeed, HubConfig, InMemoryCoordinationStore, NoOpContentStore,
//!     ReplicationReconciler, StaticChannelService,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> channel_hub::Result<()> {
//!     let mut reconciler = ReplicationReconciler::new(
//!         HubConfig::for_testing("hub-1"),
//!         Arc::new(StaticChannelService::new()),
//!         Arc::new(InMemoryCoordinationStore::new()),
//!         Arc::new(DisconnectedFeed),
//!         Arc::new(NoOpContentStore),
//!     )?;
//!     reconciler.start().await?;
//!
//!     // Runs until shutdown
//!     reconciler.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod circuit_breaker;
pub mod config;
pub mod content;
pub mod content_store;
pub mod coordination;
pub mod counter;
pub mod error;
pub mod feed;
pub mod key_set;
pub mod merger;
pub mod query;
pub mod replication;
pub mod resilience;

// Re-exports for convenience
pub use channel::{ChannelDescriptor, ChannelService, GlobalConfig, StaticChannelService};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use config::{HubConfig, HubSettings};
pub use content::{ChannelContentKey, ContentItem, ContentKey, DirectionQuery};
pub use content_store::{ContentStore, NoOpContentStore};
pub use coordination::{CoordinationStore, InMemoryCoordinationStore};
pub use counter::{UpdateOutcome, VersionedCounter};
pub use error::{HubError, Result, ServiceError, StoreError};
pub use feed::{DisconnectedFeed, RemoteFeed};
pub use key_set::DistributedKeySet;
pub use merger::CrossPartitionMerger;
pub use query::ParallelQueryExecutor;
pub use replication::{PassOutcome, PassReport, ReplicationReconciler, ReplicationTask, TaskKey};
