//! Per-vBucket transport boundary wrapper
//!
//! One observer exists per open sub-stream. It receives the transport's raw
//! callbacks, packages them into typed [`DcpEvent`]s with the resume point
//! they advance to, and forwards them to the coordinator. It also carries the
//! persisted-sequence-number watermark from rollback mitigation so consumers
//! can avoid acknowledging past what the cluster has durably written.

use crate::models::{
    DcpEvent, DcpStreamEndContext, Deletion, Expiration, ListenerArgs, Mutation, Offset,
    SnapshotMarker,
};
use crate::error::DcpError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::info_span;

/// Receiver of multiplexed observer output. Implemented by the stream
/// coordinator.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// One typed event from a sub-stream.
    async fn listen(&self, args: ListenerArgs);

    /// A sub-stream ended.
    async fn listen_end(&self, end: DcpStreamEndContext);
}

/// Per-sub-stream observer. Lifetime is one open-to-end of the sub-stream.
pub struct Observer {
    vb_id: u16,
    vb_uuid: AtomicU64,
    latest_seq_no: AtomicU64,
    persist_seq_no: AtomicU64,
    snapshot: Mutex<SnapshotMarker>,
    collection_ids: Arc<HashMap<u32, String>>,
    sink: Weak<dyn EventSink>,
    /// Set by close(): stop delivering data events
    closed: AtomicBool,
    /// Set by close_end(): end path drained, drop everything
    end_closed: AtomicBool,
}

impl Observer {
    /// Create an observer seeded from the loaded offset for its vBucket.
    pub fn new(
        vb_id: u16,
        offset: &Offset,
        collection_ids: Arc<HashMap<u32, String>>,
        sink: Weak<dyn EventSink>,
    ) -> Self {
        Self {
            vb_id,
            vb_uuid: AtomicU64::new(offset.vb_uuid),
            latest_seq_no: AtomicU64::new(offset.latest_seq_no),
            persist_seq_no: AtomicU64::new(0),
            snapshot: Mutex::new(offset.snapshot),
            collection_ids,
            sink,
            closed: AtomicBool::new(false),
            end_closed: AtomicBool::new(false),
        }
    }

    pub fn vb_id(&self) -> u16 {
        self.vb_id
    }

    /// Highest sequence number observed on this sub-stream.
    pub fn latest_seq_no(&self) -> u64 {
        self.latest_seq_no.load(Ordering::Acquire)
    }

    /// Cluster-persisted watermark from rollback mitigation.
    pub fn persist_seq_no(&self) -> u64 {
        self.persist_seq_no.load(Ordering::Acquire)
    }

    pub fn set_persist_seq_no(&self, seq_no: u64) {
        self.persist_seq_no.store(seq_no, Ordering::Release);
    }

    /// Stop delivering data events. Idempotent; returns synchronously. End
    /// notifications still flow so shutdown can drain.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Release remaining internal state after all end callbacks drained.
    pub fn close_end(&self) {
        self.closed.store(true, Ordering::Release);
        self.end_closed.store(true, Ordering::Release);
        let mut snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        *snapshot = SnapshotMarker::default();
    }

    fn offset_at(&self, seq_no: u64) -> Offset {
        self.latest_seq_no.fetch_max(seq_no, Ordering::AcqRel);
        let snapshot = *self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        Offset {
            vb_uuid: self.vb_uuid.load(Ordering::Acquire),
            seq_no,
            latest_seq_no: self.latest_seq_no.load(Ordering::Acquire),
            snapshot,
        }
    }

    fn collection_name(&self, collection_id: u32) -> Option<String> {
        self.collection_ids.get(&collection_id).cloned()
    }

    async fn forward(&self, event: DcpEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(sink) = self.sink.upgrade() else {
            return;
        };
        let span = info_span!("dcp_event", vb_id = self.vb_id);
        sink.listen(ListenerArgs { event, span }).await;
    }

    // Transport-facing callbacks.

    /// New snapshot window for this vBucket.
    pub fn snapshot_marker(&self, marker: SnapshotMarker) {
        let mut snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        *snapshot = marker;
    }

    /// Failover-log UUID update.
    pub fn failover_log(&self, vb_uuid: u64) {
        self.vb_uuid.store(vb_uuid, Ordering::Release);
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn mutation(
        &self,
        seq_no: u64,
        cas: u64,
        collection_id: u32,
        key: Vec<u8>,
        value: Vec<u8>,
        event_time: DateTime<Utc>,
    ) {
        let offset = self.offset_at(seq_no);
        self.forward(DcpEvent::Mutation(Mutation {
            vb_id: self.vb_id,
            key,
            value,
            cas,
            collection_name: self.collection_name(collection_id),
            event_time,
            offset,
        }))
        .await;
    }

    pub async fn deletion(
        &self,
        seq_no: u64,
        cas: u64,
        collection_id: u32,
        key: Vec<u8>,
        event_time: DateTime<Utc>,
    ) {
        let offset = self.offset_at(seq_no);
        self.forward(DcpEvent::Deletion(Deletion {
            vb_id: self.vb_id,
            key,
            cas,
            collection_name: self.collection_name(collection_id),
            event_time,
            offset,
        }))
        .await;
    }

    pub async fn expiration(
        &self,
        seq_no: u64,
        cas: u64,
        collection_id: u32,
        key: Vec<u8>,
        event_time: DateTime<Utc>,
    ) {
        let offset = self.offset_at(seq_no);
        self.forward(DcpEvent::Expiration(Expiration {
            vb_id: self.vb_id,
            key,
            cas,
            collection_name: self.collection_name(collection_id),
            event_time,
            offset,
        }))
        .await;
    }

    pub async fn seq_no_advanced(&self, seq_no: u64) {
        let offset = self.offset_at(seq_no);
        self.forward(DcpEvent::SeqNoAdvanced {
            vb_id: self.vb_id,
            offset,
        })
        .await;
    }

    pub async fn collection_created(&self, seq_no: u64, collection_id: u32) {
        let offset = self.offset_at(seq_no);
        let name = self.collection_name(collection_id);
        self.forward(DcpEvent::CollectionCreation {
            vb_id: self.vb_id,
            offset,
            collection_id,
            name,
        })
        .await;
    }

    pub async fn collection_deleted(&self, seq_no: u64, collection_id: u32) {
        let offset = self.offset_at(seq_no);
        self.forward(DcpEvent::CollectionDeletion {
            vb_id: self.vb_id,
            offset,
            collection_id,
        })
        .await;
    }

    pub async fn collection_flushed(&self, seq_no: u64, collection_id: u32) {
        let offset = self.offset_at(seq_no);
        self.forward(DcpEvent::CollectionFlush {
            vb_id: self.vb_id,
            offset,
            collection_id,
        })
        .await;
    }

    pub async fn collection_modified(&self, seq_no: u64, collection_id: u32) {
        let offset = self.offset_at(seq_no);
        self.forward(DcpEvent::CollectionModification {
            vb_id: self.vb_id,
            offset,
            collection_id,
        })
        .await;
    }

    pub async fn scope_created(&self, seq_no: u64, scope_id: u32) {
        let offset = self.offset_at(seq_no);
        self.forward(DcpEvent::ScopeCreation {
            vb_id: self.vb_id,
            offset,
            scope_id,
        })
        .await;
    }

    pub async fn scope_deleted(&self, seq_no: u64, scope_id: u32) {
        let offset = self.offset_at(seq_no);
        self.forward(DcpEvent::ScopeDeletion {
            vb_id: self.vb_id,
            offset,
            scope_id,
        })
        .await;
    }

    /// The sub-stream ended; `error` is None for a clean end.
    pub async fn end(&self, error: Option<DcpError>) {
        if self.end_closed.load(Ordering::Acquire) {
            return;
        }
        let Some(sink) = self.sink.upgrade() else {
            return;
        };
        sink.listen_end(DcpStreamEndContext {
            vb_id: self.vb_id,
            error,
        })
        .await;
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("vb_id", &self.vb_id)
            .field("latest_seq_no", &self.latest_seq_no())
            .field("persist_seq_no", &self.persist_seq_no())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<DcpEvent>>,
        ends: AtomicUsize,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn listen(&self, args: ListenerArgs) {
            self.events.lock().unwrap().push(args.event);
        }

        async fn listen_end(&self, _end: DcpStreamEndContext) {
            self.ends.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn observer_with_sink() -> (Arc<RecordingSink>, Arc<Observer>) {
        let sink = Arc::new(RecordingSink::default());
        let weak: Weak<dyn EventSink> = Arc::downgrade(&sink) as Weak<dyn EventSink>;
        let offset = Offset::new(0x11, 0, SnapshotMarker::default()).with_latest_seq_no(5);
        let collections = Arc::new(HashMap::from([(8u32, "orders".to_string())]));
        let observer = Arc::new(Observer::new(3, &offset, collections, weak));
        (sink, observer)
    }

    #[tokio::test]
    async fn test_mutation_carries_snapshot_window() {
        let (sink, observer) = observer_with_sink();

        observer.snapshot_marker(SnapshotMarker::new(10, 20));
        observer
            .mutation(15, 1, 8, b"user::1".to_vec(), b"{}".to_vec(), Utc::now())
            .await;

        let events = sink.events.lock().unwrap();
        let DcpEvent::Mutation(mutation) = &events[0] else {
            panic!("expected mutation");
        };
        assert_eq!(mutation.offset.seq_no, 15);
        assert_eq!(mutation.offset.snapshot, SnapshotMarker::new(10, 20));
        assert_eq!(mutation.offset.vb_uuid, 0x11);
        assert_eq!(mutation.collection_name.as_deref(), Some("orders"));
    }

    #[tokio::test]
    async fn test_latest_seq_no_tracks_high_watermark() {
        let (_sink, observer) = observer_with_sink();
        observer.seq_no_advanced(9).await;
        // Seeded latest was 5, event 9 is higher.
        assert_eq!(observer.latest_seq_no(), 9);
        observer.seq_no_advanced(7).await;
        assert_eq!(observer.latest_seq_no(), 9);
    }

    #[tokio::test]
    async fn test_close_drops_events_but_not_end() {
        let (sink, observer) = observer_with_sink();

        observer.close();
        observer.close();
        observer
            .mutation(1, 1, 0, b"k".to_vec(), b"v".to_vec(), Utc::now())
            .await;
        assert!(sink.events.lock().unwrap().is_empty());

        observer.end(Some(DcpError::DcpStreamClosed)).await;
        assert_eq!(sink.ends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_end_drops_everything() {
        let (sink, observer) = observer_with_sink();
        observer.close_end();
        observer.end(None).await;
        assert_eq!(sink.ends.load(Ordering::SeqCst), 0);
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persist_seq_no() {
        let (_sink, observer) = observer_with_sink();
        assert_eq!(observer.persist_seq_no(), 0);
        observer.set_persist_seq_no(123);
        assert_eq!(observer.persist_seq_no(), 123);
    }
}
