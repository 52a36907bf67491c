//! Stream coordinator configuration
//!
//! ## Usage
//!
//! ```rust
//! use dcpstream::config::{CheckpointAutoReset, DcpConfig};
//! use std::time::Duration;
//!
//! let config = DcpConfig::builder()
//!     .total_members(4)
//!     .member_number(2)
//!     .rebalance_delay(Duration::from_secs(10))
//!     .checkpoint_interval(Duration::from_secs(5))
//!     .checkpoint_auto_reset(CheckpointAutoReset::Earliest)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.group.membership.total_members, 4);
//! ```

use crate::error::{DcpError, Result};
use crate::membership::MembershipType;
use serde::Deserialize;
use std::time::Duration;

/// How the checkpoint schedule is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    /// Periodic flush on the configured interval
    Auto,
    /// No schedule; an external offset publisher drives `Save` itself
    Manual,
}

/// Where to seed the resume point when no checkpoint is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointAutoReset {
    /// Start from the current latest sequence number
    Latest,
    /// Start from sequence number zero
    Earliest,
}

/// Checkpoint scheduler settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub checkpoint_type: CheckpointType,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub auto_reset: CheckpointAutoReset,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_type: CheckpointType::Auto,
            interval: Duration::from_secs(20),
            auto_reset: CheckpointAutoReset::Earliest,
        }
    }
}

/// Membership settings for vBucket ownership.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    pub membership_type: MembershipType,
    /// Quiet window between a rebalance trigger and the reopen
    #[serde(with = "humantime_serde")]
    pub rebalance_delay: Duration,
    /// 1-based index of this member
    pub member_number: u16,
    pub total_members: u16,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            membership_type: MembershipType::Static,
            rebalance_delay: Duration::from_secs(20),
            member_number: 1,
            total_members: 1,
        }
    }
}

/// Group settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub membership: MembershipConfig,
}

/// Rollback mitigation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RollbackMitigationConfig {
    pub disabled: bool,
    /// Polling interval for persisted sequence numbers
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for RollbackMitigationConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            interval: Duration::from_millis(200),
        }
    }
}

/// Top-level stream coordinator configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DcpConfig {
    pub group: GroupConfig,
    pub checkpoint: CheckpointConfig,
    pub rollback_mitigation: RollbackMitigationConfig,
}

impl DcpConfig {
    /// Create a new config builder.
    pub fn builder() -> DcpConfigBuilder {
        DcpConfigBuilder::default()
    }

    /// Effective rebalance delay: forced to zero for dynamic membership.
    pub fn effective_rebalance_delay(&self) -> Duration {
        match self.group.membership.membership_type {
            MembershipType::Dynamic => Duration::ZERO,
            MembershipType::Static => self.group.membership.rebalance_delay,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let membership = &self.group.membership;
        if membership.total_members == 0 {
            return Err(DcpError::config("total_members must be at least 1"));
        }
        if membership.member_number == 0 || membership.member_number > membership.total_members {
            return Err(DcpError::config(format!(
                "member_number {} out of range 1..={}",
                membership.member_number, membership.total_members
            )));
        }
        if self.checkpoint.interval.is_zero() {
            return Err(DcpError::config("checkpoint interval must be non-zero"));
        }
        Ok(())
    }
}

/// Builder for [`DcpConfig`].
#[derive(Debug, Default)]
pub struct DcpConfigBuilder {
    config: DcpConfig,
}

impl DcpConfigBuilder {
    pub fn membership_type(mut self, membership_type: MembershipType) -> Self {
        self.config.group.membership.membership_type = membership_type;
        self
    }

    pub fn rebalance_delay(mut self, delay: Duration) -> Self {
        self.config.group.membership.rebalance_delay = delay;
        self
    }

    pub fn member_number(mut self, member_number: u16) -> Self {
        self.config.group.membership.member_number = member_number;
        self
    }

    pub fn total_members(mut self, total_members: u16) -> Self {
        self.config.group.membership.total_members = total_members;
        self
    }

    pub fn checkpoint_type(mut self, checkpoint_type: CheckpointType) -> Self {
        self.config.checkpoint.checkpoint_type = checkpoint_type;
        self
    }

    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.config.checkpoint.interval = interval;
        self
    }

    pub fn checkpoint_auto_reset(mut self, auto_reset: CheckpointAutoReset) -> Self {
        self.config.checkpoint.auto_reset = auto_reset;
        self
    }

    pub fn rollback_mitigation_disabled(mut self, disabled: bool) -> Self {
        self.config.rollback_mitigation.disabled = disabled;
        self
    }

    pub fn rollback_mitigation_interval(mut self, interval: Duration) -> Self {
        self.config.rollback_mitigation.interval = interval;
        self
    }

    /// Validate and build the config.
    pub fn build(self) -> Result<DcpConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DcpConfig::default();
        assert_eq!(config.checkpoint.checkpoint_type, CheckpointType::Auto);
        assert_eq!(config.checkpoint.interval, Duration::from_secs(20));
        assert_eq!(config.group.membership.total_members, 1);
        assert!(!config.rollback_mitigation.disabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_builder() {
        let config = DcpConfig::builder()
            .total_members(8)
            .member_number(3)
            .checkpoint_type(CheckpointType::Manual)
            .rollback_mitigation_disabled(true)
            .build()
            .unwrap();

        assert_eq!(config.group.membership.total_members, 8);
        assert_eq!(config.group.membership.member_number, 3);
        assert_eq!(config.checkpoint.checkpoint_type, CheckpointType::Manual);
        assert!(config.rollback_mitigation.disabled);
    }

    #[test]
    fn test_validate_rejects_bad_membership() {
        assert!(DcpConfig::builder().total_members(0).build().is_err());
        assert!(DcpConfig::builder()
            .total_members(2)
            .member_number(3)
            .build()
            .is_err());
        assert!(DcpConfig::builder()
            .total_members(2)
            .member_number(0)
            .build()
            .is_err());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        assert!(DcpConfig::builder()
            .checkpoint_interval(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_dynamic_membership_forces_zero_delay() {
        let config = DcpConfig::builder()
            .membership_type(MembershipType::Dynamic)
            .rebalance_delay(Duration::from_secs(30))
            .build()
            .unwrap();
        assert_eq!(config.effective_rebalance_delay(), Duration::ZERO);

        let config = DcpConfig::builder()
            .rebalance_delay(Duration::from_secs(30))
            .build()
            .unwrap();
        assert_eq!(
            config.effective_rebalance_delay(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_deserialize() {
        let json = r#"{
            "group": { "membership": { "rebalance_delay": "5s", "member_number": 1, "total_members": 2 } },
            "checkpoint": { "checkpoint_type": "manual", "interval": "10s", "auto_reset": "latest" },
            "rollback_mitigation": { "disabled": true, "interval": "100ms" }
        }"#;
        let config: DcpConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.group.membership.rebalance_delay,
            Duration::from_secs(5)
        );
        assert_eq!(config.checkpoint.auto_reset, CheckpointAutoReset::Latest);
        assert_eq!(
            config.rollback_mitigation.interval,
            Duration::from_millis(100)
        );
    }
}
