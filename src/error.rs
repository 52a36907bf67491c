//! Error types for DCP stream operations
//!
//! Includes the transport end-error classification that decides between
//! per-vBucket reopen and termination counting.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transport-level errors (socket, DCP sub-stream state)
    Transport,
    /// Metadata store errors (checkpoint load/save)
    Metadata,
    /// Configuration errors (invalid settings)
    Configuration,
    /// Serialization errors (persisted offset blobs)
    Serialization,
    /// Other/unknown errors
    Other,
}

/// DCP stream errors
#[derive(Error, Debug)]
pub enum DcpError {
    /// Underlying connection to the node was closed
    #[error("socket closed")]
    SocketClosed,

    /// Server-side backfill for the sub-stream failed
    #[error("DCP backfill failed")]
    DcpBackfillFailed,

    /// Sub-stream state changed on the server (e.g. vBucket moved)
    #[error("DCP stream state changed")]
    DcpStreamStateChanged,

    /// Consumer could not keep up with the sub-stream
    #[error("DCP stream too slow")]
    DcpStreamTooSlow,

    /// Sub-stream was disconnected by the server
    #[error("DCP stream disconnected")]
    DcpStreamDisconnected,

    /// Sub-stream was closed on request; expected during shutdown
    #[error("DCP stream closed")]
    DcpStreamClosed,

    /// Server rejected the resume point and requires a rollback
    #[error("rollback required for vbID {vb_id} to seqNo {seq_no}")]
    RollbackRequired { vb_id: u16, seq_no: u64 },

    /// No loaded offset for the vBucket being opened
    #[error("vbID {vb_id} not found on offset table")]
    OffsetNotFound { vb_id: u16 },

    /// Reopen attempts for a vBucket were exhausted
    #[error("gave up re-opening stream for vbID {vb_id}: {source}")]
    RetryExhausted {
        vb_id: u16,
        #[source]
        source: Box<DcpError>,
    },

    /// Transport error that does not map to a known kind
    #[error("transport error: {0}")]
    Transport(String),

    /// Metadata store error
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Rollback mitigation error
    #[error("rollback mitigation error: {0}")]
    RollbackMitigation(String),

    /// Invalid state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl DcpError {
    /// Create a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a new metadata error
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new rollback mitigation error
    pub fn rollback_mitigation(msg: impl Into<String>) -> Self {
        Self::RollbackMitigation(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if a sub-stream ending with this error should be reopened.
    ///
    /// Returns true exactly for the transport kinds that indicate a
    /// recoverable per-vBucket failure. Any other end error (and a clean
    /// end) counts toward stream termination instead.
    pub fn is_stream_retryable(&self) -> bool {
        matches!(
            self,
            Self::SocketClosed
                | Self::DcpBackfillFailed
                | Self::DcpStreamStateChanged
                | Self::DcpStreamTooSlow
                | Self::DcpStreamDisconnected
        )
    }

    /// Check if this is the expected close error for an intentional shutdown.
    pub fn is_stream_closed(&self) -> bool {
        matches!(self, Self::DcpStreamClosed)
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::SocketClosed
            | Self::DcpBackfillFailed
            | Self::DcpStreamStateChanged
            | Self::DcpStreamTooSlow
            | Self::DcpStreamDisconnected
            | Self::DcpStreamClosed
            | Self::RollbackRequired { .. }
            | Self::RetryExhausted { .. }
            | Self::Transport(_) => ErrorCategory::Transport,
            Self::Metadata(_) => ErrorCategory::Metadata,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::Io(_) => ErrorCategory::Other,
            Self::OffsetNotFound { .. }
            | Self::RollbackMitigation(_)
            | Self::InvalidState(_)
            | Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::SocketClosed => "socket_closed",
            Self::DcpBackfillFailed => "dcp_backfill_failed",
            Self::DcpStreamStateChanged => "dcp_stream_state_changed",
            Self::DcpStreamTooSlow => "dcp_stream_too_slow",
            Self::DcpStreamDisconnected => "dcp_stream_disconnected",
            Self::DcpStreamClosed => "dcp_stream_closed",
            Self::RollbackRequired { .. } => "rollback_required",
            Self::OffsetNotFound { .. } => "offset_not_found",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Transport(_) => "transport_error",
            Self::Metadata(_) => "metadata_error",
            Self::Config(_) => "config_error",
            Self::RollbackMitigation(_) => "rollback_mitigation_error",
            Self::InvalidState(_) => "invalid_state",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            Self::Other(_) => "unknown",
        }
    }
}

/// Result type for DCP stream operations
pub type Result<T> = std::result::Result<T, DcpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DcpError::OffsetNotFound { vb_id: 42 };
        assert!(err.to_string().contains("vbID 42"));

        let err = DcpError::metadata("write failed");
        assert!(err.to_string().contains("metadata error"));
    }

    #[test]
    fn test_stream_retryable_kinds() {
        assert!(DcpError::SocketClosed.is_stream_retryable());
        assert!(DcpError::DcpBackfillFailed.is_stream_retryable());
        assert!(DcpError::DcpStreamStateChanged.is_stream_retryable());
        assert!(DcpError::DcpStreamTooSlow.is_stream_retryable());
        assert!(DcpError::DcpStreamDisconnected.is_stream_retryable());

        assert!(!DcpError::DcpStreamClosed.is_stream_retryable());
        assert!(!DcpError::transport("boom").is_stream_retryable());
        assert!(!DcpError::config("bad").is_stream_retryable());
        assert!(!DcpError::OffsetNotFound { vb_id: 0 }.is_stream_retryable());
    }

    #[test]
    fn test_stream_closed() {
        assert!(DcpError::DcpStreamClosed.is_stream_closed());
        assert!(!DcpError::SocketClosed.is_stream_closed());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(DcpError::SocketClosed.category(), ErrorCategory::Transport);
        assert_eq!(
            DcpError::metadata("x").category(),
            ErrorCategory::Metadata
        );
        assert_eq!(
            DcpError::config("x").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(DcpError::other("x").category(), ErrorCategory::Other);
    }

    #[test]
    fn test_error_code() {
        assert_eq!(DcpError::DcpStreamTooSlow.error_code(), "dcp_stream_too_slow");
        assert_eq!(
            DcpError::RetryExhausted {
                vb_id: 1,
                source: Box::new(DcpError::SocketClosed),
            }
            .error_code(),
            "retry_exhausted"
        );
    }

    #[test]
    fn test_retry_exhausted_source() {
        let err = DcpError::RetryExhausted {
            vb_id: 3,
            source: Box::new(DcpError::DcpStreamTooSlow),
        };
        assert!(err.to_string().contains("vbID 3"));
        assert_eq!(err.category(), ErrorCategory::Transport);
    }
}
