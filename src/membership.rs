//! vBucket ownership discovery
//!
//! The cluster-membership service decides which members exist; this module
//! turns a membership into the contiguous set of vBucket IDs this node owns
//! for the current epoch.

use serde::Deserialize;

/// Membership model for the consumer group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipType {
    /// Fixed member number and total, configured up front
    #[default]
    Static,
    /// Members come and go; rebalances fire without a quiet window
    Dynamic,
}

/// Tells the coordinator which vBuckets this node owns.
///
/// Queried once per open; a rebalance reopens the stream which re-queries.
pub trait VBucketDiscovery: Send + Sync {
    /// Sorted, contiguous vBucket IDs owned by this node.
    fn get(&self) -> Vec<u16>;
}

/// Static discovery: divides the vBucket space into contiguous chunks, one
/// per member, with earlier members absorbing the remainder.
#[derive(Debug, Clone)]
pub struct StaticVBucketDiscovery {
    num_vbuckets: u16,
    member_number: u16,
    total_members: u16,
}

impl StaticVBucketDiscovery {
    /// Create a discovery for a 1-based `member_number` out of
    /// `total_members`, over `num_vbuckets` vBuckets.
    pub fn new(num_vbuckets: u16, member_number: u16, total_members: u16) -> Self {
        Self {
            num_vbuckets,
            member_number,
            total_members,
        }
    }
}

impl VBucketDiscovery for StaticVBucketDiscovery {
    fn get(&self) -> Vec<u16> {
        divide_vbuckets(self.num_vbuckets, self.total_members, self.member_number)
    }
}

/// Contiguous chunk of `0..num_vbuckets` for the given 1-based member.
///
/// Chunk sizes differ by at most one; the first `num_vbuckets % total`
/// members get the larger size.
fn divide_vbuckets(num_vbuckets: u16, total_members: u16, member_number: u16) -> Vec<u16> {
    if total_members == 0 || member_number == 0 || member_number > total_members {
        return Vec::new();
    }

    let n = num_vbuckets as u32;
    let total = total_members as u32;
    let index = (member_number - 1) as u32;

    let base = n / total;
    let remainder = n % total;

    let start = index * base + index.min(remainder);
    let size = base + u32::from(index < remainder);

    (start..start + size).map(|vb| vb as u16).collect()
}
