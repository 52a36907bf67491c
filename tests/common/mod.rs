//! Shared mocks for stream lifecycle tests: an in-process transport client,
//! a recording consumer, and a scripted vBucket discovery.

#![allow(dead_code)]

use async_trait::async_trait;
use dcpstream::{
    Consumer, DcpClient, DcpError, DcpEvent, ListenerContext, Observer, Offset, Result,
    VBucketDiscovery,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

/// Route crate logs through the test writer; `RUST_LOG` filters as usual.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Transport double. Remembers the observer registered per vBucket so tests
/// can drive raw callbacks, and counts opens/closes.
pub struct MockDcpClient {
    observers: Mutex<HashMap<u16, Arc<Observer>>>,
    pub open_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
    /// vBuckets whose open must fail
    pub fail_open_for: Mutex<HashSet<u16>>,
    /// Deliver a stream-end through the observer on every close
    pub end_on_close: AtomicBool,
    /// Latest sequence number reported for checkpoint seeding
    pub latest_seq_no: u64,
}

impl MockDcpClient {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(HashMap::new()),
            open_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            fail_open_for: Mutex::new(HashSet::new()),
            end_on_close: AtomicBool::new(false),
            latest_seq_no: 0,
        }
    }

    /// Observer registered for a vBucket by the last open.
    pub fn observer(&self, vb_id: u16) -> Arc<Observer> {
        self.observers
            .lock()
            .unwrap()
            .get(&vb_id)
            .cloned()
            .expect("no observer registered for vbID")
    }

    pub fn opens(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DcpClient for MockDcpClient {
    async fn open_stream(
        &self,
        vb_id: u16,
        _collection_ids: &HashMap<u32, String>,
        _offset: &Offset,
        observer: Arc<Observer>,
    ) -> Result<()> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_open_for.lock().unwrap().contains(&vb_id) {
            return Err(DcpError::SocketClosed);
        }
        self.observers.lock().unwrap().insert(vb_id, observer);
        Ok(())
    }

    async fn close_stream(&self, vb_id: u16) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.end_on_close.load(Ordering::SeqCst) {
            let observer = self.observers.lock().unwrap().get(&vb_id).cloned();
            if let Some(observer) = observer {
                observer.end(Some(DcpError::DcpStreamClosed)).await;
            }
        }
        Ok(())
    }

    async fn latest_seq_no(&self, _vb_id: u16) -> Result<u64> {
        Ok(self.latest_seq_no)
    }

    async fn vb_uuid(&self, _vb_id: u16) -> Result<u64> {
        Ok(0xCAFE)
    }
}

/// Consumer double. Records delivered events; acks (and optionally commits)
/// from inside the callback.
pub struct RecordingConsumer {
    pub events: Mutex<Vec<DcpEvent>>,
    pub tracked: AtomicUsize,
    pub auto_ack: AtomicBool,
    pub commit_on_consume: AtomicBool,
}

impl RecordingConsumer {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            tracked: AtomicUsize::new(0),
            auto_ack: AtomicBool::new(true),
            commit_on_consume: AtomicBool::new(false),
        }
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl Consumer for RecordingConsumer {
    async fn consume_event(&self, ctx: ListenerContext) {
        if self.auto_ack.load(Ordering::SeqCst) {
            ctx.ack();
        }
        if self.commit_on_consume.load(Ordering::SeqCst) {
            ctx.commit().await.expect("commit failed");
        }
        self.events.lock().unwrap().push(ctx.event);
    }

    fn track_offset(&self, _vb_id: u16, _offset: &Offset) {
        self.tracked.fetch_add(1, Ordering::SeqCst);
    }
}

/// Discovery double returning a fixed assignment and counting queries.
pub struct FixedDiscovery {
    vb_ids: Vec<u16>,
    pub queries: AtomicUsize,
}

impl FixedDiscovery {
    pub fn new(vb_ids: Vec<u16>) -> Self {
        Self {
            vb_ids,
            queries: AtomicUsize::new(0),
        }
    }
}

impl VBucketDiscovery for FixedDiscovery {
    fn get(&self) -> Vec<u16> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.vb_ids.clone()
    }
}
