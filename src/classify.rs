//! Mapping of transport errors onto retry classifications.

use crate::error::{FailureKind, TransportError};
use std::fmt;
use std::io;
use std::sync::Arc;

type ResetPredicate = Arc<dyn Fn(&TransportError) -> bool + Send + Sync>;

/// Classifies failed attempts for the retry loop.
///
/// Socket-level errors are transport specific. An error matching the reset predicate on a
/// channel that was already open is treated as a stale channel (one free retry) rather than a
/// dead endpoint.
#[derive(Clone)]
pub struct Classifier {
    is_reset: ResetPredicate,
}

impl Default for Classifier {
    fn default() -> Self {
        Self { is_reset: Arc::new(default_reset_predicate) }
    }
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier").finish_non_exhaustive()
    }
}

/// Connection reset, connection aborted and broken pipe.
pub fn default_reset_predicate(err: &TransportError) -> bool {
    matches!(
        err,
        TransportError::Io {
            kind: io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe,
            ..
        }
    )
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the socket-reset predicate.
    pub fn with_reset_predicate<F>(predicate: F) -> Self
    where
        F: Fn(&TransportError) -> bool + Send + Sync + 'static,
    {
        Self { is_reset: Arc::new(predicate) }
    }

    /// Classify `err`. `channel_was_open` says whether the channel was already open before the
    /// failed attempt started.
    pub fn classify(&self, err: &TransportError, channel_was_open: bool) -> FailureKind {
        match err {
            TransportError::Fault { .. } => FailureKind::Fault,
            TransportError::Disposed | TransportError::Aborted | TransportError::Faulted => {
                FailureKind::ChannelLocal
            }
            TransportError::EndpointNotFound(_)
            | TransportError::ServerTooBusy(_)
            | TransportError::ProtocolMismatch(_)
            | TransportError::ActivationFailed(_)
            | TransportError::Communication(_)
            | TransportError::ConnectTimeout(_) => FailureKind::EndpointDown,
            TransportError::Timeout(_) => FailureKind::Timeout,
            TransportError::Io { .. } if channel_was_open && (self.is_reset)(err) => {
                FailureKind::ChannelLocal
            }
            TransportError::Io { .. } => FailureKind::EndpointDown,
            TransportError::Fatal(_) => FailureKind::Fatal,
        }
    }

    /// Whether an error raised while creating a channel from a shared factory proves the factory
    /// itself is bad.
    pub fn poisons_factory(&self, err: &TransportError) -> bool {
        matches!(
            self.classify(err, false),
            FailureKind::ChannelLocal | FailureKind::EndpointDown | FailureKind::Timeout
        )
    }
}
