//! Sub-stream supervision
//!
//! Opens all sub-streams in parallel at stream start, reopens individual
//! vBuckets after retryable end errors with bounded retry, and closes
//! everything down: in parallel on modern servers, serially through a
//! single-slot gate on servers whose transport cannot close concurrently.

use crate::couchbase::{DcpClient, Observer};
use crate::error::{DcpError, Result};
use crate::models::VbIdRange;
use crate::stream::offsets::OffsetTable;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Reopen attempts before giving up on a vBucket.
const REOPEN_ATTEMPTS: u32 = 5;
/// Spacing between reopen attempts.
const REOPEN_BACKOFF: Duration = Duration::from_secs(1);

/// Single-slot gate serializing closes on transports without stream-end
/// support. The close loop pushes one token per vBucket; the end-event
/// handler drains one per end while the gate is in ending state.
pub(crate) struct LegacyCloseGate {
    tx: mpsc::Sender<()>,
    rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    ending: AtomicBool,
}

impl LegacyCloseGate {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            ending: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_ending(&self) -> bool {
        self.ending.load(Ordering::Acquire)
    }

    async fn push(&self) {
        let _ = self.tx.send(()).await;
    }

    /// Blocking drain of one token from the end-event path.
    pub(crate) async fn drain(&self) {
        let mut rx = self.rx.lock().await;
        let _ = rx.recv().await;
    }

    /// Reclaim the token pushed for a close that failed; no end event will
    /// drain it.
    async fn reclaim(&self) {
        let mut rx = self.rx.lock().await;
        let _ = rx.try_recv();
    }
}

/// Opens, reopens and closes the per-vBucket sub-streams.
pub(crate) struct SubStreamSupervisor {
    client: Arc<dyn DcpClient>,
    collection_ids: Arc<HashMap<u32, String>>,
    table: Arc<OffsetTable>,
    observers: Arc<DashMap<u16, Arc<Observer>>>,
    legacy_gate: Option<LegacyCloseGate>,
}

impl SubStreamSupervisor {
    pub(crate) fn new(
        client: Arc<dyn DcpClient>,
        collection_ids: Arc<HashMap<u32, String>>,
        table: Arc<OffsetTable>,
        observers: Arc<DashMap<u16, Arc<Observer>>>,
        stream_end_supported: bool,
    ) -> Self {
        Self {
            client,
            collection_ids,
            table,
            observers,
            legacy_gate: (!stream_end_supported).then(LegacyCloseGate::new),
        }
    }

    pub(crate) fn legacy_gate(&self) -> Option<&LegacyCloseGate> {
        self.legacy_gate.as_ref()
    }

    /// Open one sub-stream from its loaded offset.
    pub(crate) async fn open_stream(&self, vb_id: u16) -> Result<()> {
        let offset = self
            .table
            .load(vb_id)
            .ok_or(DcpError::OffsetNotFound { vb_id })?;
        let observer = self
            .observers
            .get(&vb_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(DcpError::OffsetNotFound { vb_id })?;
        self.client
            .open_stream(vb_id, &self.collection_ids, &offset, observer)
            .await
    }

    /// Open every sub-stream in parallel. All-or-nothing: the first failure
    /// aborts the remaining opens and fails the stream open.
    pub(crate) async fn open_all(self: &Arc<Self>, vb_ids: &[u16]) -> Result<()> {
        let mut set = JoinSet::new();
        for &vb_id in vb_ids {
            let this = Arc::clone(self);
            set.spawn(async move { (vb_id, this.open_stream(vb_id).await) });
        }

        while let Some(joined) = set.join_next().await {
            let (vb_id, result) = joined
                .map_err(|e| DcpError::other(format!("open task failed: {e}")))?;
            if let Err(e) = result {
                error!(vb_id, error = %e, "error while opening stream");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Reopen a single vBucket after a retryable end error. Bounded retry;
    /// exhaustion is fatal to the stream.
    pub(crate) async fn reopen(&self, vb_id: u16) -> Result<()> {
        let mut attempts_left = REOPEN_ATTEMPTS;
        loop {
            match self.open_stream(vb_id).await {
                Ok(()) => {
                    info!(vb_id, "re-opened stream");
                    return Ok(());
                }
                Err(e) => {
                    warn!(vb_id, error = %e, "cannot re-open stream");
                    attempts_left -= 1;
                    if attempts_left == 0 {
                        error!(vb_id, "gave up re-opening stream after retries");
                        return Err(DcpError::RetryExhausted {
                            vb_id,
                            source: Box::new(e),
                        });
                    }
                }
            }
            tokio::time::sleep(REOPEN_BACKOFF).await;
        }
    }

    /// Close every sub-stream.
    ///
    /// On modern transports, closes fan out in parallel over the tracked
    /// vBuckets. On the legacy path the transport's open-stream map is not
    /// safe for concurrent close, so closes serialize over the full owned
    /// range through the single-slot gate.
    pub(crate) async fn close_all(self: &Arc<Self>, range: Option<VbIdRange>) {
        match (&self.legacy_gate, range) {
            (Some(gate), Some(range)) => {
                gate.ending.store(true, Ordering::Release);
                for vb_id in range.start..=range.end {
                    gate.push().await;
                    if let Err(e) = self.client.close_stream(vb_id).await {
                        error!(
                            vb_id,
                            error = %e,
                            "cannot close stream on (stream end not supporting) mode"
                        );
                        gate.reclaim().await;
                    }
                }
                gate.ending.store(false, Ordering::Release);
            }
            _ => {
                let mut set = JoinSet::new();
                for vb_id in self.table.vb_ids() {
                    let this = Arc::clone(self);
                    set.spawn(async move {
                        if let Err(e) = this.client.close_stream(vb_id).await {
                            error!(vb_id, error = %e, "cannot close stream");
                        }
                    });
                }
                while set.join_next().await.is_some() {}
            }
        }
    }
}
