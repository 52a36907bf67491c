//! Transport client contract
//!
//! The transport client owns the connections to the cluster and delivers raw
//! DCP callbacks to the per-vBucket [`Observer`](crate::couchbase::Observer).
//! Its implementation is outside this crate; the coordinator drives it
//! through this trait.

use crate::couchbase::observer::Observer;
use crate::error::{DcpError, Result};
use crate::models::Offset;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// First server version whose transport supports DCP stream-end and safe
/// concurrent close.
pub const SRV_VER_5_5_0: ServerVersion = ServerVersion::new(5, 5, 0);

/// Transport client for DCP sub-streams.
#[async_trait]
pub trait DcpClient: Send + Sync {
    /// Open a sub-stream for one vBucket, resuming from `offset`. Raw
    /// callbacks for the sub-stream go to `observer`.
    async fn open_stream(
        &self,
        vb_id: u16,
        collection_ids: &HashMap<u32, String>,
        offset: &Offset,
        observer: Arc<Observer>,
    ) -> Result<()>;

    /// Close the sub-stream for one vBucket. The transport reports the close
    /// through the observer's end callback.
    async fn close_stream(&self, vb_id: u16) -> Result<()>;

    /// Current latest sequence number for a vBucket (checkpoint seeding).
    async fn latest_seq_no(&self, vb_id: u16) -> Result<u64>;

    /// vBucket UUID from the failover log (checkpoint seeding).
    async fn vb_uuid(&self, vb_id: u16) -> Result<u64>;
}

/// Couchbase Server version, ordered by (major, minor, patch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ServerVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether this version is strictly below `other`.
    pub fn lower(&self, other: ServerVersion) -> bool {
        *self < other
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ServerVersion {
    type Err = DcpError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('.');
        let mut next = |name: &str| -> Result<u16> {
            parts
                .next()
                .ok_or_else(|| DcpError::config(format!("missing {name} in version {s:?}")))?
                .parse()
                .map_err(|e| DcpError::config(format!("bad {name} in version {s:?}: {e}")))
        };
        Ok(Self {
            major: next("major")?,
            minor: next("minor")?,
            patch: next("patch")?,
        })
    }
}

/// Bucket facts relevant to the coordinator.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketInfo {
    /// Bucket storage type as the cluster reports it
    pub bucket_type: String,
}

impl BucketInfo {
    pub fn new(bucket_type: impl Into<String>) -> Self {
        Self {
            bucket_type: bucket_type.into(),
        }
    }

    /// Ephemeral buckets have no persistence, so rollback mitigation has
    /// nothing to watch.
    pub fn is_ephemeral(&self) -> bool {
        self.bucket_type == "ephemeral"
    }
}
