//! # dcpstream - Couchbase DCP stream coordinator
//!
//! Per-node coordinator for a Couchbase change-data-capture client. It
//! consumes the live DCP mutation stream of a bucket, partitioned across
//! vBuckets, and delivers ordered, at-least-once events to a downstream
//! consumer while maintaining durable resume points.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   raw callbacks   ┌──────────────┐
//! │  Transport   │ ────────────────► │  Observer    │  one per vBucket
//! │  (DcpClient) │                   │              │
//! └──────────────┘                   └──────┬───────┘
//!                                           │ typed events
//!                                           ▼
//!                                  ┌──────────────────┐
//!                                  │ StreamCoordinator│  range + monotonic
//!                                  │  listen / ack    │  guards, dispatch
//!                                  └──────┬───────────┘
//!                                         │ synchronous call
//!                                         ▼
//!                                  ┌──────────────┐      ┌──────────────┐
//!                                  │   Consumer   │ ack  │  Checkpoint  │
//!                                  │              │ ───► │  scheduler   │
//!                                  └──────────────┘      └──────┬───────┘
//!                                                               ▼
//!                                                        MetadataStore
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> dcpstream::Result<()> {
//! use dcpstream::{
//!     DcpConfig, MemoryMetadataStore, NoopEventHandler, StaticVBucketDiscovery,
//!     StreamCoordinator, StreamDeps,
//! };
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! # let client: Arc<dyn dcpstream::DcpClient> = unimplemented!();
//! # let consumer: Arc<dyn dcpstream::Consumer> = unimplemented!();
//! let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
//!
//! let coordinator = StreamCoordinator::new(StreamDeps {
//!     client,
//!     metadata: Arc::new(MemoryMetadataStore::new()),
//!     config: DcpConfig::default(),
//!     server_version: "7.2.0".parse()?,
//!     bucket_info: dcpstream::BucketInfo::new("membase"),
//!     discovery: Arc::new(StaticVBucketDiscovery::new(1024, 1, 1)),
//!     consumer,
//!     collection_ids: HashMap::new(),
//!     event_handler: Arc::new(NoopEventHandler),
//!     rollback_mitigation: None,
//!     stop_tx,
//! });
//!
//! coordinator.open().await?;
//! stop_rx.changed().await.ok();
//! coordinator.close(true).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod couchbase;
pub mod error;
pub mod membership;
pub mod metadata;
pub mod models;
pub mod stream;

pub use config::{
    CheckpointAutoReset, CheckpointConfig, CheckpointType, DcpConfig, DcpConfigBuilder,
    GroupConfig, MembershipConfig, RollbackMitigationConfig,
};
pub use couchbase::{
    BucketInfo, DcpClient, EventSink, Observer, PersistSeqNoDispatcher, RollbackMitigation,
    ServerVersion, SRV_VER_5_5_0,
};
pub use error::{DcpError, ErrorCategory, Result};
pub use membership::{MembershipType, StaticVBucketDiscovery, VBucketDiscovery};
pub use metadata::{FileMetadataStore, MemoryMetadataStore, MetadataStore};
pub use models::{
    Consumer, DcpEvent, DcpStreamEndContext, Deletion, EventHandler, Expiration, ListenerArgs,
    ListenerContext, Mutation, NoopEventHandler, Offset, OffsetSink, PersistSeqNo, SnapshotMarker,
    VbIdRange,
};
pub use stream::{Checkpoint, CheckpointMetric, Metric, OffsetTable, StreamCoordinator, StreamDeps};
