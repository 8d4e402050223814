//! Wire-level errors and the protocol error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol error taxonomy. Every failure surfaced to a peer or caller maps
/// onto exactly one of these codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ProtocolViolation,
    FrameTooLarge,
    AuthRequired,
    PermissionDenied,
    UnknownRecipient,
    RouteUnavailable,
    Backpressure,
    AgentUnavailable,
    Timeout,
    StreamGap,
    BudgetExceeded,
    RateLimited,
    DepthExceeded,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ProtocolViolation => "PROTOCOL_VIOLATION",
            ErrorCode::FrameTooLarge => "FRAME_TOO_LARGE",
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::UnknownRecipient => "UNKNOWN_RECIPIENT",
            ErrorCode::RouteUnavailable => "ROUTE_UNAVAILABLE",
            ErrorCode::Backpressure => "BACKPRESSURE",
            ErrorCode::AgentUnavailable => "AGENT_UNAVAILABLE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::StreamGap => "STREAM_GAP",
            ErrorCode::BudgetExceeded => "BUDGET_EXCEEDED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::DepthExceeded => "DEPTH_EXCEEDED",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// True for failures a connection cannot recover from.
    pub fn is_connection_fatal(self) -> bool {
        matches!(
            self,
            ErrorCode::ProtocolViolation | ErrorCode::FrameTooLarge | ErrorCode::AuthRequired
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {len} bytes exceeds cap of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("frame truncated: have {have} bytes, need {need}")]
    Truncated { have: usize, need: usize },
    #[error("encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("schema violation: {0}")]
    Schema(String),
}

impl WireError {
    /// Taxonomy code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            WireError::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,
            _ => ErrorCode::ProtocolViolation,
        }
    }
}
