//! Checkpoint scheduler
//!
//! Loads the offset table at stream open (seeding absent entries), flushes
//! dirty entries to the metadata store on a schedule and on demand, and
//! tracks flush metrics. Flush failures are logged and retried at the next
//! tick; they are never fatal.

use crate::config::{CheckpointAutoReset, CheckpointConfig, CheckpointType};
use crate::couchbase::DcpClient;
use crate::error::Result;
use crate::metadata::MetadataStore;
use crate::models::{Offset, SnapshotMarker};
use crate::stream::offsets::OffsetTable;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Flush counters, readable as a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointMetric {
    /// Offsets written by the most recent successful flush
    pub offset_write: u64,
    /// Duration of the most recent successful flush in milliseconds
    pub offset_write_latency_ms: u64,
}

#[derive(Debug, Default)]
struct CheckpointMetricInner {
    offset_write: AtomicU64,
    offset_write_latency_ms: AtomicU64,
}

/// Checkpoint scheduler for one open epoch.
pub struct Checkpoint {
    table: Arc<OffsetTable>,
    client: Arc<dyn DcpClient>,
    metadata: Arc<dyn MetadataStore>,
    config: CheckpointConfig,
    vb_ids: Vec<u16>,
    /// At-most-one flush in flight
    flush_lock: tokio::sync::Mutex<()>,
    schedule: Mutex<Option<JoinHandle<()>>>,
    metric: CheckpointMetricInner,
}

impl Checkpoint {
    pub fn new(
        table: Arc<OffsetTable>,
        client: Arc<dyn DcpClient>,
        metadata: Arc<dyn MetadataStore>,
        config: CheckpointConfig,
        vb_ids: Vec<u16>,
    ) -> Self {
        Self {
            table,
            client,
            metadata,
            config,
            vb_ids,
            flush_lock: tokio::sync::Mutex::new(()),
            schedule: Mutex::new(None),
            metric: CheckpointMetricInner::default(),
        }
    }

    /// Load persisted offsets into the table, seeding absent vBuckets per
    /// the auto-reset policy. Seeded entries are dirty so the next flush
    /// persists them. Returns whether anything is dirty after the load.
    pub async fn load(&self) -> Result<bool> {
        let persisted = self.metadata.load(&self.vb_ids).await?;

        let mut seeded = 0usize;
        for &vb_id in &self.vb_ids {
            let latest_seq_no = self.client.latest_seq_no(vb_id).await?;

            match persisted.get(&vb_id) {
                Some(offset) => {
                    self.table
                        .store(vb_id, offset.with_latest_seq_no(latest_seq_no));
                }
                None => {
                    let vb_uuid = self.client.vb_uuid(vb_id).await?;
                    let offset = match self.config.auto_reset {
                        CheckpointAutoReset::Latest => Offset::new(
                            vb_uuid,
                            latest_seq_no,
                            SnapshotMarker::new(latest_seq_no, latest_seq_no),
                        ),
                        CheckpointAutoReset::Earliest => {
                            Offset::new(vb_uuid, 0, SnapshotMarker::default())
                        }
                    };
                    self.table
                        .store(vb_id, offset.with_latest_seq_no(latest_seq_no));
                    self.table.conditional_mark_dirty(vb_id);
                    seeded += 1;
                }
            }
        }

        if seeded > 0 {
            info!(
                seeded,
                loaded = self.vb_ids.len() - seeded,
                auto_reset = ?self.config.auto_reset,
                "checkpoint load seeded missing offsets"
            );
        }
        Ok(self.table.any_dirty())
    }

    /// Begin the periodic flush. No-op for manual checkpointing or when a
    /// schedule is already running.
    pub fn start_schedule(self: &Arc<Self>) {
        if self.config.checkpoint_type == CheckpointType::Manual {
            debug!("manual checkpointing, schedule not started");
            return;
        }

        let mut slot = self.schedule.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }

        let this = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = this.save().await {
                    warn!(error = %e, "checkpoint flush failed, will retry next tick");
                }
            }
        }));
        debug!(interval = ?self.config.interval, "checkpoint schedule started");
    }

    /// Cancel the periodic flush. Does not perform a final flush.
    pub fn stop_schedule(&self) {
        let mut slot = self.schedule.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
            debug!("checkpoint schedule stopped");
        }
    }

    /// Flush dirty offsets as a single batch. Safe to call concurrently with
    /// the schedule; flushes serialize on an internal lock.
    pub async fn save(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;

        let dirty = self.table.dirty_vb_ids();
        if dirty.is_empty() && !self.table.any_dirty() {
            return Ok(());
        }

        let mut batch = HashMap::with_capacity(dirty.len());
        for &vb_id in &dirty {
            if let Some(offset) = self.table.load(vb_id) {
                batch.insert(vb_id, offset);
            }
        }

        let start = Instant::now();
        self.metadata.save(batch).await?;
        self.table.mark_flushed(&dirty);

        self.metric
            .offset_write
            .store(dirty.len() as u64, Ordering::Relaxed);
        self.metric
            .offset_write_latency_ms
            .store(start.elapsed().as_millis() as u64, Ordering::Relaxed);

        debug!(written = dirty.len(), "checkpoint flushed");
        Ok(())
    }

    pub fn metric(&self) -> CheckpointMetric {
        CheckpointMetric {
            offset_write: self.metric.offset_write.load(Ordering::Relaxed),
            offset_write_latency_ms: self
                .metric
                .offset_write_latency_ms
                .load(Ordering::Relaxed),
        }
    }
}

impl Drop for Checkpoint {
    fn drop(&mut self) {
        self.stop_schedule();
    }
}
