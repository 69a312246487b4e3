//! Error types for remote invocation.
//!
//! Three layers of errors flow through the crate:
//! - [`TransportError`] is the vocabulary the underlying RPC runtime speaks.
//! - [`FailureKind`] is the retry classification every transport error is mapped to.
//! - [`InvocationError`] is the single typed failure application code observes.
use std::fmt;
use std::io;
use std::time::Duration;

/// Errors raised by the underlying transport, its factories and its channels.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The remote contract rejected the request with an application-level fault.
    #[error("remote fault {code}: {message}")]
    Fault { code: String, message: String },
    /// The channel or factory object was already disposed.
    #[error("communication object disposed")]
    Disposed,
    /// The channel or factory object was aborted.
    #[error("communication object aborted")]
    Aborted,
    /// The channel or factory object is in the faulted state.
    #[error("communication object faulted")]
    Faulted,
    /// No listener at the endpoint address.
    #[error("endpoint not found: {0}")]
    EndpointNotFound(String),
    /// The server refused the request because it is overloaded.
    #[error("server too busy: {0}")]
    ServerTooBusy(String),
    /// The server speaks a different protocol or binding.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
    /// The service could not be activated on the server.
    #[error("service activation failed: {0}")]
    ActivationFailed(String),
    /// Generic communication failure.
    #[error("communication failure: {0}")]
    Communication(String),
    /// Opening a channel or factory did not finish inside the bounded connect window.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    /// The call did not complete inside its call timeout.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    /// Socket-level failure.
    #[error("socket error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },
    /// Unrecoverable programming or contract error.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Build a remote fault.
    pub fn fault(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fault { code: code.into(), message: message.into() }
    }

    /// Build a socket-level error.
    pub fn io(kind: io::ErrorKind, message: impl Into<String>) -> Self {
        Self::Io { kind, message: message.into() }
    }

    /// Check if this is an application-level fault.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault { .. })
    }

    /// Check if this is a call or connect timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ConnectTimeout(_))
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::Io { kind: err.kind(), message: err.to_string() }
    }
}

/// Retry classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Application-level rejection. Never retried, never affects endpoint health.
    Fault,
    /// The local channel object is unusable. One free retry on the same endpoint.
    ChannelLocal,
    /// The endpoint is unreachable, overloaded or misconfigured. Triggers failover.
    EndpointDown,
    /// The call timed out. Fails over like `EndpointDown`, recorded separately.
    Timeout,
    /// Programming or contract error. Propagated immediately.
    Fatal,
}

impl FailureKind {
    /// Whether this classification says the endpoint itself is unusable.
    pub fn marks_endpoint(self) -> bool {
        matches!(self, Self::EndpointDown | Self::Timeout)
    }

    /// Whether the retry loop gives up immediately on this classification.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Fault | Self::Fatal)
    }

    /// Stable snake_case label used in logs and records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fault => "fault",
            Self::ChannelLocal => "channel_local",
            Self::EndpointDown => "endpoint_down",
            Self::Timeout => "timeout",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable numeric codes written into result envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Fault,
    EndpointUnavailable,
    Timeout,
    ChannelFailure,
    Internal,
    Codec,
    Configuration,
}

impl ErrorCode {
    /// The numeric value. These never change between releases.
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::Fault => 1000,
            Self::EndpointUnavailable => 2001,
            Self::Timeout => 2002,
            Self::ChannelFailure => 2003,
            Self::Internal => 5000,
            Self::Codec => 5001,
            Self::Configuration => 5002,
        }
    }

    /// Message safe to hand to callers: no addresses, no transport detail.
    pub const fn redacted_message(self) -> &'static str {
        match self {
            Self::Fault => "the remote service rejected the request",
            Self::EndpointUnavailable => "the remote service is unavailable",
            Self::Timeout => "the remote service did not respond in time",
            Self::ChannelFailure => "the connection to the remote service failed",
            Self::Internal => "the request could not be completed",
            Self::Codec => "the request or response could not be encoded",
            Self::Configuration => "the client is not configured for this service",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Configuration validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("contract '{contract}' has no endpoints")]
    NoEndpoints { contract: String },
    #[error("contract '{contract}' lists endpoint '{address}' more than once")]
    DuplicateEndpoint { contract: String, address: String },
    #[error("contract '{contract}': {field} must be > 0")]
    ZeroTimeout { contract: String, field: &'static str },
    #[error("configuration could not be parsed: {0}")]
    Parse(String),
}

/// The one typed failure application code sees from a proxy call.
///
/// Which endpoint served the call and how many attempts ran are only recorded in the log sink.
/// When retries are exhausted, the last transport error is carried as-is and its message may name
/// the endpoint it came from; envelopes use [`ErrorCode::redacted_message`] instead.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvocationError {
    /// The remote contract returned a business fault.
    #[error("remote fault {code}: {message}")]
    Fault { code: String, message: String },
    /// Retries and failover were exhausted; `source` is the last transport error.
    #[error("{kind} failure: {source}")]
    Transport {
        kind: FailureKind,
        #[source]
        source: TransportError,
    },
    /// No endpoint was eligible to serve the call.
    #[error("no eligible endpoint for contract '{contract}'")]
    NoEndpoint { contract: String },
    /// The configuration source has no entry for the contract.
    #[error("contract '{0}' is not configured")]
    UnknownContract(String),
    /// The contract cannot be used with the requested cache mode.
    #[error("cache mode {mode} is not supported by contract '{contract}'")]
    UnsupportedCacheMode { contract: String, mode: &'static str },
    /// The configuration snapshot is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A parameter or response could not be (de)serialized.
    #[error("payload encoding failed: {0}")]
    Codec(String),
}

impl InvocationError {
    /// Stable numeric code for result envelopes.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Fault { .. } => ErrorCode::Fault,
            Self::Transport { kind, .. } => match kind {
                FailureKind::Fault => ErrorCode::Fault,
                FailureKind::ChannelLocal => ErrorCode::ChannelFailure,
                FailureKind::EndpointDown => ErrorCode::EndpointUnavailable,
                FailureKind::Timeout => ErrorCode::Timeout,
                FailureKind::Fatal => ErrorCode::Internal,
            },
            Self::NoEndpoint { .. } => ErrorCode::EndpointUnavailable,
            Self::UnknownContract(_) | Self::UnsupportedCacheMode { .. } | Self::Config(_) => {
                ErrorCode::Configuration
            }
            Self::Codec(_) => ErrorCode::Codec,
        }
    }

    /// Caller-safe message. Remote faults keep their own message since the remote contract
    /// addressed it to the caller; everything else is replaced by a generic text.
    pub fn redacted_message(&self) -> String {
        match self {
            Self::Fault { message, .. } => message.clone(),
            other => other.code().redacted_message().to_string(),
        }
    }

    /// Retry classification when the error came from the transport.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Fault { .. } => Some(FailureKind::Fault),
            Self::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Check if this error is a remote business fault.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault { .. })
    }

    /// Borrow the last transport error, if any.
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Self::Transport { source, .. } => Some(source),
            _ => None,
        }
    }

    pub(crate) fn from_transport(kind: FailureKind, source: TransportError) -> Self {
        match source {
            TransportError::Fault { code, message } if kind == FailureKind::Fault => {
                Self::Fault { code, message }
            }
            source => Self::Transport { kind, source },
        }
    }
}

impl From<serde_json::Error> for InvocationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
