//! Stream coordinator
//!
//! Owns the lifecycle of the multiplexed DCP stream: discovers the owned
//! vBuckets, opens one sub-stream per vBucket, dispatches inbound events to
//! the downstream consumer while enforcing per-vBucket monotonicity, keeps
//! the checkpoint schedule running, recovers retryable sub-stream failures,
//! and arbitrates the two termination paths (local close vs. every
//! sub-stream ending remotely) so that exactly one wins.

use crate::config::DcpConfig;
use crate::couchbase::{
    BucketInfo, DcpClient, EventSink, Observer, PersistSeqNoDispatcher, RollbackMitigation,
    ServerVersion, SRV_VER_5_5_0,
};
use crate::error::{DcpError, Result};
use crate::membership::VBucketDiscovery;
use crate::metadata::MetadataStore;
use crate::models::{
    Consumer, DcpEvent, DcpStreamEndContext, EventHandler, ListenerArgs, ListenerContext, Offset,
    OffsetSink, PersistSeqNo, VbIdRange,
};
use crate::stream::checkpoint::{Checkpoint, CheckpointMetric};
use crate::stream::offsets::OffsetTable;
use crate::stream::supervisor::SubStreamSupervisor;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Stream-level counters, readable as a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metric {
    /// Milliseconds the consumer spent on the most recent event
    pub process_latency_ms: i64,
    /// Milliseconds between server event time and delivery
    pub dcp_latency_ms: i64,
    /// Completed rebalances since construction
    pub rebalance: u64,
}

#[derive(Debug, Default)]
struct MetricInner {
    process_latency_ms: AtomicI64,
    dcp_latency_ms: AtomicI64,
    rebalance: AtomicU64,
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Everything the coordinator is wired to at construction.
pub struct StreamDeps {
    pub client: Arc<dyn DcpClient>,
    pub metadata: Arc<dyn MetadataStore>,
    pub config: DcpConfig,
    pub server_version: ServerVersion,
    pub bucket_info: BucketInfo,
    pub discovery: Arc<dyn VBucketDiscovery>,
    pub consumer: Arc<dyn Consumer>,
    pub collection_ids: HashMap<u32, String>,
    pub event_handler: Arc<dyn EventHandler>,
    pub rollback_mitigation: Option<Arc<dyn RollbackMitigation>>,
    /// Signaled once when the stream finishes and no rebalance is in flight
    pub stop_tx: watch::Sender<bool>,
}

/// Per-node DCP stream coordinator.
pub struct StreamCoordinator {
    client: Arc<dyn DcpClient>,
    config: DcpConfig,
    bucket_info: BucketInfo,
    metadata: Arc<dyn MetadataStore>,
    discovery: Arc<dyn VBucketDiscovery>,
    consumer: Arc<dyn Consumer>,
    event_handler: Arc<dyn EventHandler>,
    rollback_mitigation: Option<Arc<dyn RollbackMitigation>>,

    table: Arc<OffsetTable>,
    observers: Arc<DashMap<u16, Arc<Observer>>>,
    supervisor: Arc<SubStreamSupervisor>,
    checkpoint: RwLock<Option<Arc<Checkpoint>>>,
    collection_ids: Arc<HashMap<u32, String>>,
    vb_id_range: RwLock<Option<VbIdRange>>,

    metric: MetricInner,
    active_streams: AtomicI32,

    // Termination latches. Whichever path fires first is latched by the
    // waiter; the opposing flag is checked before every send.
    finish_close_tx: mpsc::Sender<()>,
    finish_close_rx: Mutex<mpsc::Receiver<()>>,
    finish_end_tx: mpsc::Sender<()>,
    finish_end_rx: Mutex<mpsc::Receiver<()>>,
    finished_by_close: AtomicBool,
    finished_by_end_event: AtomicBool,
    stop_tx: watch::Sender<bool>,

    rebalance_lock: Arc<Mutex<()>>,
    rebalance_guard: Mutex<Option<OwnedMutexGuard<()>>>,
    rebalance_timer: Mutex<Option<JoinHandle<()>>>,
    balancing: AtomicBool,

    close_with_cancel: AtomicBool,
    open: AtomicBool,
    fatal: StdMutex<Option<DcpError>>,

    weak_self: Weak<StreamCoordinator>,
}

impl StreamCoordinator {
    /// Build the coordinator. The stream is constructed closed; call
    /// [`open`](Self::open) to start it.
    pub fn new(deps: StreamDeps) -> Arc<Self> {
        let (finish_close_tx, finish_close_rx) = mpsc::channel(1);
        let (finish_end_tx, finish_end_rx) = mpsc::channel(1);

        let table = Arc::new(OffsetTable::new());
        let observers: Arc<DashMap<u16, Arc<Observer>>> =
            Arc::new(DashMap::with_capacity(1024));
        let collection_ids = Arc::new(deps.collection_ids);
        let stream_end_supported = !deps.server_version.lower(SRV_VER_5_5_0);

        let supervisor = Arc::new(SubStreamSupervisor::new(
            Arc::clone(&deps.client),
            Arc::clone(&collection_ids),
            Arc::clone(&table),
            Arc::clone(&observers),
            stream_end_supported,
        ));

        Arc::new_cyclic(|weak_self| Self {
            client: deps.client,
            config: deps.config,
            bucket_info: deps.bucket_info,
            metadata: deps.metadata,
            discovery: deps.discovery,
            consumer: deps.consumer,
            event_handler: deps.event_handler,
            rollback_mitigation: deps.rollback_mitigation,
            table,
            observers,
            supervisor,
            checkpoint: RwLock::new(None),
            collection_ids,
            vb_id_range: RwLock::new(None),
            metric: MetricInner::default(),
            active_streams: AtomicI32::new(0),
            finish_close_tx,
            finish_close_rx: Mutex::new(finish_close_rx),
            finish_end_tx,
            finish_end_rx: Mutex::new(finish_end_rx),
            finished_by_close: AtomicBool::new(false),
            finished_by_end_event: AtomicBool::new(false),
            stop_tx: deps.stop_tx,
            rebalance_lock: Arc::new(Mutex::new(())),
            rebalance_guard: Mutex::new(None),
            rebalance_timer: Mutex::new(None),
            balancing: AtomicBool::new(false),
            close_with_cancel: AtomicBool::new(false),
            open: AtomicBool::new(false),
            fatal: StdMutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// Open the stream: discover ownership, load checkpoints, open every
    /// sub-stream. All-or-nothing; any failure here is fatal to the stream.
    pub async fn open(self: &Arc<Self>) -> Result<()> {
        self.finished_by_close.store(false, Ordering::Release);
        self.finished_by_end_event.store(false, Ordering::Release);
        self.drain_latches().await;

        self.event_handler.before_stream_start().await;

        let vb_ids = self.discovery.get();
        let range = VbIdRange::from_vb_ids(&vb_ids)
            .ok_or_else(|| DcpError::invalid_state("no vBuckets assigned to this member"))?;
        *write_lock(&self.vb_id_range) = Some(range);

        if !self.config.rollback_mitigation.disabled {
            if self.bucket_info.is_ephemeral() {
                info!("rollback mitigation is disabled for ephemeral bucket");
            } else if let Some(mitigation) = &self.rollback_mitigation {
                let weak = self.weak_self.clone();
                let dispatcher: PersistSeqNoDispatcher = Arc::new(move |persist_seq_no| {
                    if let Some(this) = weak.upgrade() {
                        this.dispatch_persist_seq_no(persist_seq_no);
                    }
                });
                mitigation.start(vb_ids.clone(), dispatcher).await?;
            }
        }

        self.active_streams
            .store(vb_ids.len() as i32, Ordering::Release);

        let checkpoint = Arc::new(Checkpoint::new(
            Arc::clone(&self.table),
            Arc::clone(&self.client),
            Arc::clone(&self.metadata),
            self.config.checkpoint.clone(),
            vb_ids.clone(),
        ));
        checkpoint.load().await?;
        *write_lock(&self.checkpoint) = Some(Arc::clone(&checkpoint));

        self.observers.clear();
        let sink = self.weak_self.clone() as Weak<dyn EventSink>;
        self.table.range(|vb_id, offset| {
            self.observers.insert(
                vb_id,
                Arc::new(Observer::new(
                    vb_id,
                    offset,
                    Arc::clone(&self.collection_ids),
                    sink.clone(),
                )),
            );
            true
        });

        self.supervisor.open_all(&vb_ids).await?;

        info!(vb_count = vb_ids.len(), "stream started");
        self.event_handler.after_stream_start().await;

        checkpoint.start_schedule();
        self.spawn_wait();
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    /// Whether the stream is currently open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Close the stream. `close_with_cancel` suppresses noisy end-error
    /// logging and per-vBucket reopens during an intentional shutdown.
    pub async fn close(self: &Arc<Self>, close_with_cancel: bool) {
        self.close_with_cancel
            .store(close_with_cancel, Ordering::Release);

        self.event_handler.before_stream_stop().await;

        if !self.config.rollback_mitigation.disabled && !self.bucket_info.is_ephemeral() {
            if let Some(mitigation) = &self.rollback_mitigation {
                mitigation.stop().await;
            }
        }

        for observer in self.observers.iter() {
            observer.close();
        }

        if let Some(checkpoint) = read_lock(&self.checkpoint).clone() {
            checkpoint.stop_schedule();
        }

        let range = *read_lock(&self.vb_id_range);
        self.supervisor.close_all(range).await;

        for observer in self.observers.iter() {
            observer.close_end();
        }
        self.observers.clear();

        self.table.reset();

        info!("stream stopped");
        self.event_handler.after_stream_stop().await;
        self.open.store(false, Ordering::Release);

        if !self.finished_by_end_event.load(Ordering::Acquire) {
            let _ = self.finish_close_tx.try_send(());
        }
    }

    /// React to a cluster-membership change: close, wait out the configured
    /// quiet window (debounced), then reopen with freshly discovered
    /// ownership.
    pub async fn rebalance(self: &Arc<Self>) {
        {
            let mut timer = self.rebalance_timer.lock().await;
            if self.balancing.load(Ordering::Acquire) {
                if let Some(handle) = timer.take() {
                    handle.abort();
                    *timer =
                        Some(self.spawn_rebalance_timer(self.config.effective_rebalance_delay()));
                    info!("latest rebalance timer is reset");
                    return;
                }
            }
        }

        info!("rebalance starting");
        let guard = Arc::clone(&self.rebalance_lock).lock_owned().await;

        self.event_handler.before_rebalance_start().await;
        if !self.balancing.swap(true, Ordering::AcqRel) {
            self.close(false).await;
        }
        self.event_handler.after_rebalance_start().await;

        *self.rebalance_guard.lock().await = Some(guard);

        let delay = self.config.effective_rebalance_delay();
        if delay.is_zero() {
            info!("rebalance delay is disabled on dynamic membership");
        } else {
            info!(?delay, "rebalance will start after delay");
        }
        *self.rebalance_timer.lock().await = Some(self.spawn_rebalance_timer(delay));
    }

    /// Force an immediate checkpoint flush.
    pub async fn save(&self) -> Result<()> {
        let checkpoint = read_lock(&self.checkpoint).clone();
        match checkpoint {
            Some(checkpoint) => checkpoint.save().await,
            None => Ok(()),
        }
    }

    /// Per-entry-consistent snapshots of the offset table, the dirty set and
    /// the any-dirty flag.
    pub fn get_offsets(&self) -> (HashMap<u16, Offset>, HashMap<u16, bool>, bool) {
        (
            self.table.snapshot(),
            self.table.dirty_snapshot(),
            self.table.any_dirty(),
        )
    }

    /// Live observers keyed by vBucket ID.
    pub fn get_observers(&self) -> HashMap<u16, Arc<Observer>> {
        self.observers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect()
    }

    /// Stream counters plus the active sub-stream count.
    pub fn get_metric(&self) -> (Metric, i32) {
        (
            Metric {
                process_latency_ms: self.metric.process_latency_ms.load(Ordering::Relaxed),
                dcp_latency_ms: self.metric.dcp_latency_ms.load(Ordering::Relaxed),
                rebalance: self.metric.rebalance.load(Ordering::Relaxed),
            },
            self.active_streams.load(Ordering::Acquire),
        )
    }

    /// Flush counters of the current checkpoint epoch.
    pub fn get_checkpoint_metric(&self) -> CheckpointMetric {
        read_lock(&self.checkpoint)
            .as_ref()
            .map(|checkpoint| checkpoint.metric())
            .unwrap_or_default()
    }

    /// Drop every dirty marker. For external offset publishers that drained
    /// the dirty set themselves; single-writer by contract.
    pub fn unmark_dirty_offsets(&self) {
        self.table.unmark_all();
    }

    /// The error that forced the stream down, if any. Taking it clears the
    /// slot.
    pub fn fatal_error(&self) -> Option<DcpError> {
        self.fatal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    // Internal.

    /// Remove stale latch messages left by a lost termination race in the
    /// previous epoch.
    async fn drain_latches(&self) {
        let mut close_rx = self.finish_close_rx.lock().await;
        while close_rx.try_recv().is_ok() {}
        drop(close_rx);
        let mut end_rx = self.finish_end_rx.lock().await;
        while end_rx.try_recv().is_ok() {}
    }

    /// Store an offset if it passes the range and monotonicity guards.
    fn set_offset(&self, vb_id: u16, offset: Offset, dirty: bool) {
        let range = *read_lock(&self.vb_id_range);
        let in_range = range.is_some_and(|range| range.contains(vb_id));
        if !in_range {
            warn!(vb_id, "vbID does not belong to our vbID range");
            return;
        }

        if let Some(current) = self.table.load(vb_id) {
            if current.seq_no > offset.seq_no {
                return;
            }
        }

        self.table.store(vb_id, offset);
        self.consumer.track_offset(vb_id, &offset);
        if dirty {
            self.table.conditional_mark_dirty(vb_id);
        }
    }

    async fn wait_and_forward(&self, event: DcpEvent, span: tracing::Span) {
        let vb_id = event.vb_id();
        let offset = event.offset();

        if event.is_metadata() {
            self.set_offset(vb_id, offset, false);
            return;
        }

        if let Some(event_time) = event.event_time() {
            let dcp_latency = Utc::now()
                .signed_duration_since(event_time)
                .num_milliseconds();
            self.metric
                .dcp_latency_ms
                .store(dcp_latency, Ordering::Relaxed);
        }

        let ctx = ListenerContext::new(event, span, self.weak_self.clone() as Weak<dyn OffsetSink>);

        let start = Instant::now();
        self.consumer.consume_event(ctx).await;
        self.metric
            .process_latency_ms
            .store(start.elapsed().as_millis() as i64, Ordering::Relaxed);
    }

    fn dispatch_persist_seq_no(&self, persist_seq_no: PersistSeqNo) {
        if let Some(observer) = self.observers.get(&persist_seq_no.vb_id) {
            observer.set_persist_seq_no(persist_seq_no.seq_no);
        }
    }

    async fn handle_stream_end(&self, end: DcpStreamEndContext) {
        if let Some(gate) = self.supervisor.legacy_gate() {
            if gate.is_ending() {
                gate.drain().await;
            }
        }

        let vb_id = end.vb_id;
        let close_with_cancel = self.close_with_cancel.load(Ordering::Acquire);

        match &end.error {
            Some(error) if !close_with_cancel => {
                if error.is_stream_closed() {
                    debug!(vb_id, error = %error, "end stream");
                } else {
                    warn!(vb_id, error = %error, "end stream got error");
                }
            }
            None => debug!(vb_id, "end stream"),
            _ => {}
        }

        let retryable = end
            .error
            .as_ref()
            .is_some_and(|error| error.is_stream_retryable());
        if retryable && !close_with_cancel {
            if let Some(this) = self.weak_self.upgrade() {
                tokio::spawn(async move {
                    if let Err(error) = this.supervisor.reopen(vb_id).await {
                        this.report_fatal(error);
                    }
                });
            }
            return;
        }

        let remaining = self.active_streams.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && !self.finished_by_close.load(Ordering::Acquire) {
            let _ = self.finish_end_tx.try_send(());
        }
    }

    /// Record a cannot-continue error and force the stream down so the outer
    /// supervisor observes the stop signal and exits.
    fn report_fatal(&self, error: DcpError) {
        error!(error = %error, "fatal stream error");
        {
            let mut slot = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        if !self.finished_by_close.load(Ordering::Acquire)
            && !self.finished_by_end_event.load(Ordering::Acquire)
        {
            let _ = self.finish_end_tx.try_send(());
        }
    }

    /// Termination waiter: latches whichever path fires first and, outside
    /// of a rebalance, signals the outer stop channel.
    fn spawn_wait(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            {
                let mut close_rx = this.finish_close_rx.lock().await;
                let mut end_rx = this.finish_end_rx.lock().await;
                tokio::select! {
                    _ = close_rx.recv() => {
                        this.finished_by_close.store(true, Ordering::Release);
                    }
                    _ = end_rx.recv() => {
                        this.finished_by_end_event.store(true, Ordering::Release);
                    }
                }
            }
            if !this.balancing.load(Ordering::Acquire) {
                let _ = this.stop_tx.send(true);
            }
        });
    }

    fn spawn_rebalance_timer(self: &Arc<Self>, delay: std::time::Duration) -> JoinHandle<()> {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(this) = weak.upgrade() {
                this.finish_rebalance().await;
            }
        })
    }

    async fn finish_rebalance(self: &Arc<Self>) {
        info!("reassigning vbuckets and opening stream");
        let guard = self.rebalance_guard.lock().await.take();

        self.event_handler.before_rebalance_end().await;
        match self.open().await {
            Ok(()) => {
                self.metric.rebalance.fetch_add(1, Ordering::Relaxed);
                info!("rebalance is finished");
            }
            Err(error) => {
                self.report_fatal(error);
            }
        }
        self.balancing.store(false, Ordering::Release);
        self.event_handler.after_rebalance_end().await;
        drop(guard);
    }
}

#[async_trait]
impl EventSink for StreamCoordinator {
    async fn listen(&self, args: ListenerArgs) {
        let ListenerArgs { event, span } = args;
        match event {
            data @ (DcpEvent::Mutation(_) | DcpEvent::Deletion(_) | DcpEvent::Expiration(_)) => {
                self.wait_and_forward(data, span).await;
            }
            other => {
                self.set_offset(other.vb_id(), other.offset(), true);
            }
        }
    }

    async fn listen_end(&self, end: DcpStreamEndContext) {
        self.handle_stream_end(end).await;
    }
}

#[async_trait]
impl OffsetSink for StreamCoordinator {
    fn ack(&self, vb_id: u16, offset: Offset) {
        self.set_offset(vb_id, offset, true);
        self.table.set_any_dirty();
    }

    async fn commit(&self) -> Result<()> {
        self.save().await
    }
}

impl std::fmt::Debug for StreamCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCoordinator")
            .field("open", &self.is_open())
            .field("active_streams", &self.active_streams.load(Ordering::Acquire))
            .field("balancing", &self.balancing.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}
