//! Rollback mitigation contract
//!
//! The rollback-mitigation subsystem polls the cluster for per-vBucket
//! persisted sequence numbers and feeds them back as watermarks. The
//! coordinator wires the dispatcher to the matching observer so consumers
//! can avoid acknowledging beyond what the cluster has durably written.

use crate::error::Result;
use crate::models::PersistSeqNo;
use async_trait::async_trait;
use std::sync::Arc;

/// Callback invoked for every persisted-sequence-number observation.
pub type PersistSeqNoDispatcher = Arc<dyn Fn(PersistSeqNo) + Send + Sync>;

/// Persisted-watermark tracking for the owned vBuckets.
///
/// Started at stream open (unless disabled by config or the bucket is
/// ephemeral), stopped at stream close.
#[async_trait]
pub trait RollbackMitigation: Send + Sync {
    /// Begin observing the given vBuckets, reporting through `dispatcher`.
    async fn start(&self, vb_ids: Vec<u16>, dispatcher: PersistSeqNoDispatcher) -> Result<()>;

    /// Stop observing. Idempotent.
    async fn stop(&self);
}
