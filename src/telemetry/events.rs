use crate::error::{ErrorCode, FailureKind};
use crate::invocation::Invocation;
use crate::proxy_factory::CacheMode;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// Placeholder written for redacted parameters.
pub const REDACTED: &str = "***";

/// Parameter values longer than this (in characters) are truncated in records.
pub const MAX_PARAMETER_CHARS: usize = 256;

/// Why one attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptError {
    pub kind: FailureKind,
    pub message: String,
}

/// One attempt of a logical invocation against one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// Endpoint address.
    pub endpoint: String,
    pub error: Option<AttemptError>,
    pub elapsed: Duration,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Final outcome of a logical invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    Succeeded,
    /// The remote contract rejected the call.
    Faulted { code: String },
    /// Retries were exhausted or the call could not be attempted.
    Failed { code: ErrorCode },
}

impl InvocationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Structured trace of one logical invocation, handed to the log sink after the call completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRecord {
    pub id: uuid::Uuid,
    pub contract: String,
    pub operation: String,
    pub cache_mode: CacheMode,
    /// `(name, rendered value)` after redaction.
    pub parameters: Vec<(String, String)>,
    pub attempts: Vec<AttemptRecord>,
    pub outcome: InvocationOutcome,
    pub total_elapsed: Duration,
}

impl InvocationRecord {
    /// Address of the endpoint that served the call, if any attempt succeeded.
    pub fn served_by(&self) -> Option<&str> {
        self.attempts.iter().rev().find(|a| a.succeeded()).map(|a| a.endpoint.as_str())
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }
}

/// Render an invocation's parameters for a record: redacted names become `***`, everything
/// else is compact JSON cut to [`MAX_PARAMETER_CHARS`].
pub fn render_parameters(
    invocation: &Invocation,
    redacted: &BTreeSet<String>,
) -> Vec<(String, String)> {
    invocation
        .parameters
        .iter()
        .map(|p| {
            let value = if redacted.contains(&p.name) {
                REDACTED.to_string()
            } else {
                truncate(p.value.to_string())
            };
            (p.name.clone(), value)
        })
        .collect()
}

fn truncate(mut rendered: String) -> String {
    if let Some((cut, _)) = rendered.char_indices().nth(MAX_PARAMETER_CHARS) {
        rendered.truncate(cut);
    }
    rendered
}

impl fmt::Display for InvocationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Faulted { code } => write!(f, "faulted({code})"),
            Self::Failed { code } => write!(f, "failed({code})"),
        }
    }
}

impl fmt::Display for AttemptRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            None => write!(f, "{} ok in {:?}", self.endpoint, self.elapsed),
            Some(err) => {
                write!(f, "{} {} in {:?}: {}", self.endpoint, err.kind, self.elapsed, err.message)
            }
        }
    }
}

impl fmt::Display for InvocationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} [{}] {} after {} attempt(s) in {:?}",
            self.contract,
            self.operation,
            self.cache_mode,
            self.outcome,
            self.attempts.len(),
            self.total_elapsed
        )
    }
}

#[cfg_attr(not(feature = "telemetry-json"), allow(dead_code))]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert an [`InvocationRecord`] into a JSON value for sinks.
#[cfg(feature = "telemetry-json")]
pub fn record_to_json(record: &InvocationRecord) -> serde_json::Value {
    let outcome = match &record.outcome {
        InvocationOutcome::Succeeded => json!({ "status": "succeeded" }),
        InvocationOutcome::Faulted { code } => json!({ "status": "faulted", "fault_code": code }),
        InvocationOutcome::Failed { code } => {
            json!({ "status": "failed", "error_code": code.as_u16() })
        }
    };
    let parameters: serde_json::Map<String, serde_json::Value> = record
        .parameters
        .iter()
        .map(|(name, value)| (name.clone(), serde_json::Value::String(value.clone())))
        .collect();
    let attempts: Vec<_> = record
        .attempts
        .iter()
        .map(|a| {
            json!({
                "endpoint": a.endpoint,
                "elapsed_ms": clamp_u64(a.elapsed.as_millis()),
                "error": a.error.as_ref().map(|e| json!({ "kind": e.kind.as_str(), "message": e.message })),
            })
        })
        .collect();
    json!({
        "id": record.id.to_string(),
        "contract": record.contract,
        "operation": record.operation,
        "cache_mode": record.cache_mode.as_str(),
        "parameters": parameters,
        "attempts": attempts,
        "outcome": outcome,
        "total_elapsed_ms": clamp_u64(record.total_elapsed.as_millis()),
    })
}

#[cfg(test)]
pub(crate) fn sample_record() -> InvocationRecord {
    InvocationRecord {
        id: uuid::Uuid::new_v4(),
        contract: "orders".into(),
        operation: "get_order".into(),
        cache_mode: CacheMode::PerCall,
        parameters: vec![("id".into(), "7".into())],
        attempts: vec![
            AttemptRecord {
                endpoint: "a".into(),
                error: Some(AttemptError {
                    kind: FailureKind::EndpointDown,
                    message: "endpoint not found: a".into(),
                }),
                elapsed: Duration::from_millis(3),
            },
            AttemptRecord { endpoint: "b".into(), error: None, elapsed: Duration::from_millis(9) },
        ],
        outcome: InvocationOutcome::Succeeded,
        total_elapsed: Duration::from_millis(12),
    }
}
