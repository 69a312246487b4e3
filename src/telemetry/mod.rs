//! Invocation records and the sinks that receive them.
//!
//! After every logical invocation the proxy factory builds an [`InvocationRecord`] (contract,
//! operation, redacted parameters, per-attempt history, outcome, total elapsed time) and hands it
//! to the configured sink, outside any lock held by the proxy machinery.
//!
//! Sinks implement `tower::Service<InvocationRecord>` through the [`TelemetrySink`] trait, so they
//! compose like any other tower service:
//!
//! - [`NullSink`] discards records (the default).
//! - [`LogSink`] writes them through `tracing`.
//! - [`MemorySink`] keeps a bounded in-memory buffer, mostly for tests.
//! - [`NonBlockingSink`] moves delivery onto a background task.
//! - [`MulticastSink`] fans out to two sinks.

pub mod events;
pub mod sinks;

#[cfg(feature = "telemetry-json")]
pub use events::record_to_json;
pub use events::{
    render_parameters, AttemptError, AttemptRecord, InvocationOutcome, InvocationRecord,
    MAX_PARAMETER_CHARS, REDACTED,
};
pub use sinks::{
    emit_best_effort, ComposedSinkError, LogSink, MemorySink, MulticastSink, NonBlockingSink,
    NullSink, SinkHandle, TelemetrySink,
};
