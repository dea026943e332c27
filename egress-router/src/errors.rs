use crate::pending::RequestId;
use axum::http::StatusCode;
use repo_store::{Identity, StoreError};
use std::fmt;
use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Why a target identity could not be resolved to a live connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnresolvedReason {
    /// The identity is known from the store but no instance is connected for it.
    NotConnected,
    /// The identity has never registered or been recorded.
    Unknown,
    /// The connected instance declared a protocol version outside the accepted set.
    IncompatibleVersion,
}

impl UnresolvedReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            UnresolvedReason::NotConnected => "not_connected",
            UnresolvedReason::Unknown => "unknown",
            UnresolvedReason::IncompatibleVersion => "incompatible_version",
        }
    }
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures reported to the caller of a relay query.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("no live connection for instance {identity} ({reason})")]
    Unresolved {
        identity: Identity,
        reason: UnresolvedReason,
    },

    #[error("instance {identity} did not reply to request {request_id} in time")]
    Timeout {
        identity: Identity,
        request_id: RequestId,
    },

    #[error("instance {identity} disconnected before replying to request {request_id}")]
    Disconnected {
        identity: Identity,
        request_id: RequestId,
    },

    #[error("connection to instance {0} closed while forwarding")]
    ChannelClosed(Identity),

    #[error("request does not name a target identity")]
    MissingIdentity,

    #[error("invalid repository name {0:?}")]
    InvalidRepoName(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Unresolved {
                reason: UnresolvedReason::IncompatibleVersion,
                ..
            } => StatusCode::CONFLICT,
            RelayError::Unresolved { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Disconnected { .. } | RelayError::ChannelClosed(_) => {
                StatusCode::BAD_GATEWAY
            }
            RelayError::MissingIdentity
            | RelayError::InvalidRepoName(_)
            | RelayError::Store(StoreError::InvalidIdentity(_) | StoreError::InvalidRecord(_)) => {
                StatusCode::BAD_REQUEST
            }
            RelayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the caller may succeed by submitting the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Unresolved { reason, .. } => {
                *reason != UnresolvedReason::IncompatibleVersion
            }
            RelayError::Timeout { .. }
            | RelayError::Disconnected { .. }
            | RelayError::ChannelClosed(_) => true,
            RelayError::MissingIdentity
            | RelayError::InvalidRepoName(_)
            | RelayError::Store(_) => false,
        }
    }

    /// Short label used to tag metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            RelayError::Unresolved { reason, .. } => reason.as_str(),
            RelayError::Timeout { .. } => "timeout",
            RelayError::Disconnected { .. } => "disconnected",
            RelayError::ChannelClosed(_) => "channel_closed",
            RelayError::MissingIdentity => "missing_identity",
            RelayError::InvalidRepoName(_) => "invalid_repo_name",
            RelayError::Store(_) => "store_error",
        }
    }
}

/// Why an instance's registration attempt was refused. Terminal for that attempt only;
/// the instance may retry on the same connection.
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("protocol version {declared} is not accepted, latest is {suggested}")]
    IncompatibleVersion { declared: String, suggested: String },

    #[error("signature does not match identity {0}")]
    BadSignature(Identity),

    #[error("invalid repository name {0:?}")]
    InvalidRepoName(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl RegistrationError {
    pub fn outcome(&self) -> &'static str {
        match self {
            RegistrationError::IncompatibleVersion { .. } => "incompatible_version",
            RegistrationError::BadSignature(_) => "bad_signature",
            RegistrationError::InvalidRepoName(_) => "invalid_repo_name",
            RegistrationError::Store(_) => "store_error",
        }
    }
}
