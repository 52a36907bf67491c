//! Resume coordinates for DCP sub-streams
//!
//! An [`Offset`] is the durable resume point for one vBucket: the vBucket
//! UUID from the failover log, the last observed sequence number, and the
//! snapshot window it belongs to. Offsets are mutated only by the stream
//! coordinator and persisted by the checkpoint scheduler.

use serde::{Deserialize, Serialize};

/// Snapshot window reported by the server for a vBucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMarker {
    /// First sequence number of the snapshot
    pub start_seq_no: u64,
    /// Last sequence number of the snapshot
    pub end_seq_no: u64,
}

impl SnapshotMarker {
    /// Create a new snapshot marker.
    pub fn new(start_seq_no: u64, end_seq_no: u64) -> Self {
        Self {
            start_seq_no,
            end_seq_no,
        }
    }
}

/// Per-vBucket resume point.
///
/// `latest_seq_no` is the high watermark known at stream open and is
/// runtime-only; it is not part of the persisted schema.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offset {
    /// vBucket UUID from the failover log
    pub vb_uuid: u64,
    /// Last observed sequence number
    pub seq_no: u64,
    /// Latest sequence number on the server at open time
    #[serde(skip)]
    pub latest_seq_no: u64,
    /// Snapshot window the sequence number belongs to
    #[serde(flatten)]
    pub snapshot: SnapshotMarker,
}

impl Offset {
    /// Create a new offset.
    pub fn new(vb_uuid: u64, seq_no: u64, snapshot: SnapshotMarker) -> Self {
        Self {
            vb_uuid,
            seq_no,
            latest_seq_no: 0,
            snapshot,
        }
    }

    /// Set the latest sequence number known at open time.
    pub fn with_latest_seq_no(mut self, latest_seq_no: u64) -> Self {
        self.latest_seq_no = latest_seq_no;
        self
    }
}

/// Contiguous range of vBucket IDs owned by this node for the current epoch.
///
/// Established at open, immutable within an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VbIdRange {
    pub start: u16,
    pub end: u16,
}

impl VbIdRange {
    /// Create a range from the sorted list of owned vBucket IDs.
    pub fn from_vb_ids(vb_ids: &[u16]) -> Option<Self> {
        Some(Self {
            start: *vb_ids.first()?,
            end: *vb_ids.last()?,
        })
    }

    /// Check whether a vBucket ID falls inside the owned range.
    pub fn contains(&self, vb_id: u16) -> bool {
        vb_id >= self.start && vb_id <= self.end
    }
}

/// Persisted-sequence-number watermark from rollback mitigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistSeqNo {
    pub vb_id: u16,
    pub seq_no: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_roundtrip() {
        let offset = Offset::new(0xDEAD, 42, SnapshotMarker::new(40, 50)).with_latest_seq_no(99);

        let json = serde_json::to_string(&offset).unwrap();
        let back: Offset = serde_json::from_str(&json).unwrap();

        assert_eq!(back.vb_uuid, 0xDEAD);
        assert_eq!(back.seq_no, 42);
        assert_eq!(back.snapshot, SnapshotMarker::new(40, 50));
        // Runtime-only field is not persisted.
        assert_eq!(back.latest_seq_no, 0);
    }

    #[test]
    fn test_vb_id_range() {
        let range = VbIdRange::from_vb_ids(&[4, 5, 6, 7]).unwrap();
        assert_eq!(range.start, 4);
        assert_eq!(range.end, 7);
        assert!(range.contains(4));
        assert!(range.contains(7));
        assert!(!range.contains(3));
        assert!(!range.contains(8));
    }

    #[test]
    fn test_vb_id_range_empty() {
        assert!(VbIdRange::from_vb_ids(&[]).is_none());
    }

    #[test]
    fn test_vb_id_range_single() {
        let range = VbIdRange::from_vb_ids(&[12]).unwrap();
        assert!(range.contains(12));
        assert!(!range.contains(11));
    }
}
