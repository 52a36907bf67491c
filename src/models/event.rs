//! Typed DCP events
//!
//! The observer packages raw transport callbacks into [`DcpEvent`] variants.
//! Every variant carries the vBucket ID and the [`Offset`] it advances the
//! resume point to; data variants additionally carry the document payload,
//! key, CAS and event timestamp.

use crate::error::{DcpError, Result};
use crate::models::offset::Offset;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Weak;

/// Key prefix of collection-gateway bookkeeping documents.
///
/// Events for these documents advance the resume point but are never
/// delivered to the consumer.
const METADATA_KEY_PREFIX: &[u8] = b"_sync";

/// A document mutation.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub vb_id: u16,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub cas: u64,
    pub collection_name: Option<String>,
    pub event_time: DateTime<Utc>,
    pub offset: Offset,
}

/// A document deletion.
#[derive(Debug, Clone)]
pub struct Deletion {
    pub vb_id: u16,
    pub key: Vec<u8>,
    pub cas: u64,
    pub collection_name: Option<String>,
    pub event_time: DateTime<Utc>,
    pub offset: Offset,
}

/// A document expiration.
#[derive(Debug, Clone)]
pub struct Expiration {
    pub vb_id: u16,
    pub key: Vec<u8>,
    pub cas: u64,
    pub collection_name: Option<String>,
    pub event_time: DateTime<Utc>,
    pub offset: Offset,
}

/// Typed DCP event delivered from an observer.
#[derive(Debug, Clone)]
pub enum DcpEvent {
    Mutation(Mutation),
    Deletion(Deletion),
    Expiration(Expiration),
    /// Sequence number advanced without a visible document change
    SeqNoAdvanced { vb_id: u16, offset: Offset },
    CollectionCreation {
        vb_id: u16,
        offset: Offset,
        collection_id: u32,
        name: Option<String>,
    },
    CollectionDeletion {
        vb_id: u16,
        offset: Offset,
        collection_id: u32,
    },
    CollectionFlush {
        vb_id: u16,
        offset: Offset,
        collection_id: u32,
    },
    CollectionModification {
        vb_id: u16,
        offset: Offset,
        collection_id: u32,
    },
    ScopeCreation {
        vb_id: u16,
        offset: Offset,
        scope_id: u32,
    },
    ScopeDeletion {
        vb_id: u16,
        offset: Offset,
        scope_id: u32,
    },
}

impl DcpEvent {
    /// vBucket the event belongs to.
    pub fn vb_id(&self) -> u16 {
        match self {
            Self::Mutation(m) => m.vb_id,
            Self::Deletion(d) => d.vb_id,
            Self::Expiration(e) => e.vb_id,
            Self::SeqNoAdvanced { vb_id, .. }
            | Self::CollectionCreation { vb_id, .. }
            | Self::CollectionDeletion { vb_id, .. }
            | Self::CollectionFlush { vb_id, .. }
            | Self::CollectionModification { vb_id, .. }
            | Self::ScopeCreation { vb_id, .. }
            | Self::ScopeDeletion { vb_id, .. } => *vb_id,
        }
    }

    /// Resume point this event advances to.
    pub fn offset(&self) -> Offset {
        match self {
            Self::Mutation(m) => m.offset,
            Self::Deletion(d) => d.offset,
            Self::Expiration(e) => e.offset,
            Self::SeqNoAdvanced { offset, .. }
            | Self::CollectionCreation { offset, .. }
            | Self::CollectionDeletion { offset, .. }
            | Self::CollectionFlush { offset, .. }
            | Self::CollectionModification { offset, .. }
            | Self::ScopeCreation { offset, .. }
            | Self::ScopeDeletion { offset, .. } => *offset,
        }
    }

    /// Whether this is a data event (mutation, deletion, expiration).
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            Self::Mutation(_) | Self::Deletion(_) | Self::Expiration(_)
        )
    }

    /// Document key for data events.
    pub fn key(&self) -> Option<&[u8]> {
        match self {
            Self::Mutation(m) => Some(&m.key),
            Self::Deletion(d) => Some(&d.key),
            Self::Expiration(e) => Some(&e.key),
            _ => None,
        }
    }

    /// Event timestamp for data events.
    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Mutation(m) => Some(m.event_time),
            Self::Deletion(d) => Some(d.event_time),
            Self::Expiration(e) => Some(e.event_time),
            _ => None,
        }
    }

    /// Whether the payload is collection-gateway bookkeeping.
    ///
    /// Such events are offset-only: the resume point advances but the
    /// consumer is never called and the offset is not marked dirty.
    pub fn is_metadata(&self) -> bool {
        self.key()
            .is_some_and(|key| key.starts_with(METADATA_KEY_PREFIX))
    }
}

/// Arguments forwarded from an observer to the coordinator.
#[derive(Debug)]
pub struct ListenerArgs {
    pub event: DcpEvent,
    /// Tracing span covering the sub-stream delivery
    pub span: tracing::Span,
}

/// End-of-stream notification for one sub-stream.
#[derive(Debug)]
pub struct DcpStreamEndContext {
    pub vb_id: u16,
    /// None for a clean end
    pub error: Option<DcpError>,
}

/// Narrow capability handed to [`ListenerContext`] for acknowledging and
/// committing offsets.
#[async_trait]
pub trait OffsetSink: Send + Sync {
    /// Record the offset as consumed and mark it dirty.
    fn ack(&self, vb_id: u16, offset: Offset);

    /// Force an immediate checkpoint flush.
    async fn commit(&self) -> Result<()>;
}

/// Context given to the downstream consumer for each delivered event.
///
/// The consumer must call [`ack`](Self::ack) for every event it wishes to
/// mark persisted; [`commit`](Self::commit) forces an immediate checkpoint
/// flush.
pub struct ListenerContext {
    pub event: DcpEvent,
    /// Tracing span covering consumer processing of this event
    pub span: tracing::Span,
    vb_id: u16,
    offset: Offset,
    sink: Weak<dyn OffsetSink>,
}

impl ListenerContext {
    pub(crate) fn new(event: DcpEvent, span: tracing::Span, sink: Weak<dyn OffsetSink>) -> Self {
        let vb_id = event.vb_id();
        let offset = event.offset();
        Self {
            event,
            span,
            vb_id,
            offset,
            sink,
        }
    }

    /// Acknowledge the event, advancing the stored offset for its vBucket
    /// and marking it dirty for the next checkpoint flush.
    pub fn ack(&self) {
        if let Some(sink) = self.sink.upgrade() {
            sink.ack(self.vb_id, self.offset);
        }
    }

    /// Force an immediate checkpoint flush.
    pub async fn commit(&self) -> Result<()> {
        match self.sink.upgrade() {
            Some(sink) => sink.commit().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ListenerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerContext")
            .field("event", &self.event)
            .field("vb_id", &self.vb_id)
            .finish_non_exhaustive()
    }
}
