//! Request payloads and typed result envelopes.

use crate::error::{ErrorCode, InvocationError};
use serde::{Deserialize, Serialize};

/// One named, serialized operation argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: serde_json::Value,
}

/// A single remote operation call: operation name plus ordered arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub operation: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl Invocation {
    /// Invocation with no arguments.
    pub fn new(operation: impl Into<String>) -> Self {
        Self { operation: operation.into(), parameters: Vec::new() }
    }

    pub fn builder(operation: impl Into<String>) -> InvocationBuilder {
        InvocationBuilder { invocation: Self::new(operation), error: None }
    }

    pub fn parameter(&self, name: &str) -> Option<&serde_json::Value> {
        self.parameters.iter().find(|p| p.name == name).map(|p| &p.value)
    }
}

/// Builder for [`Invocation`]. Keeps the first serialization failure and reports it from
/// [`InvocationBuilder::build`].
#[derive(Debug)]
#[must_use]
pub struct InvocationBuilder {
    invocation: Invocation,
    error: Option<InvocationError>,
}

impl InvocationBuilder {
    pub fn param<T: Serialize + ?Sized>(mut self, name: impl Into<String>, value: &T) -> Self {
        if self.error.is_some() {
            return self;
        }
        match serde_json::to_value(value) {
            Ok(value) => self.invocation.parameters.push(Parameter { name: name.into(), value }),
            Err(err) => self.error = Some(err.into()),
        }
        self
    }

    /// Append an already-serialized argument.
    pub fn raw_param(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.invocation.parameters.push(Parameter { name: name.into(), value });
        self
    }

    pub fn build(self) -> Result<Invocation, InvocationError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.invocation),
        }
    }
}

/// A return type that carries failures in-band instead of as an `Err`.
///
/// When every retry is exhausted, a proxy call returning an envelope is populated through
/// [`ResultEnvelope::from_failure`] with a stable code and a caller-safe message.
pub trait ResultEnvelope: Sized {
    fn from_failure(code: ErrorCode, message: String) -> Self;

    /// Decode a successful response body into the envelope.
    fn from_response(value: serde_json::Value) -> Result<Self, InvocationError>;
}

/// Error half of [`ServiceResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceError {
    pub code: u16,
    pub message: String,
}

/// Standard result envelope: either the operation's value or a coded error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceResult<T> {
    Ok(T),
    Error(ServiceError),
}

impl<T> ServiceResult<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn error(&self) -> Option<&ServiceError> {
        match self {
            Self::Error(err) => Some(err),
            Self::Ok(_) => None,
        }
    }

    pub fn into_result(self) -> Result<T, ServiceError> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Error(err) => Err(err),
        }
    }
}

impl<T> ResultEnvelope for ServiceResult<T>
where
    T: serde::de::DeserializeOwned,
{
    fn from_failure(code: ErrorCode, message: String) -> Self {
        Self::Error(ServiceError { code: code.as_u16(), message })
    }

    /// Accepts either an already-enveloped body (`{"ok": ..}` / `{"error": ..}`) or a bare value.
    fn from_response(value: serde_json::Value) -> Result<Self, InvocationError> {
        if let serde_json::Value::Object(map) = &value {
            if map.len() == 1 && (map.contains_key("ok") || map.contains_key("error")) {
                if let Ok(envelope) = serde_json::from_value::<Self>(value.clone()) {
                    return Ok(envelope);
                }
            }
        }
        Ok(Self::Ok(serde_json::from_value(value)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn builder_serializes_named_parameters_in_order() {
        let inv = Invocation::builder("place_order")
            .param("sku", "A-1")
            .param("quantity", &3_u32)
            .build()
            .unwrap();
        assert_eq!(inv.operation, "place_order");
        assert_eq!(inv.parameters.len(), 2);
        assert_eq!(inv.parameters[0].name, "sku");
        assert_eq!(inv.parameter("quantity"), Some(&json!(3)));
    }

    #[test]
    fn builder_reports_first_serialization_error() {
        // Maps with non-string keys cannot become JSON objects.
        let mut bad = HashMap::new();
        bad.insert((1, 2), "x");
        let err = Invocation::builder("op").param("bad", &bad).param("ok", &1).build().unwrap_err();
        assert!(matches!(err, InvocationError::Codec(_)));
    }

    #[test]
    fn envelope_from_failure_uses_stable_code() {
        let env: ServiceResult<u32> =
            ServiceResult::from_failure(ErrorCode::Timeout, "slow".to_string());
        assert_eq!(env.error().map(|e| e.code), Some(2002));
    }

    #[test]
    fn envelope_accepts_bare_or_wrapped_responses() {
        let bare: ServiceResult<u32> = ServiceResult::from_response(json!(7)).unwrap();
        assert_eq!(bare, ServiceResult::Ok(7));

        let wrapped: ServiceResult<u32> =
            ServiceResult::from_response(json!({"error": {"code": 1000, "message": "no"}}))
                .unwrap();
        assert_eq!(wrapped.error().map(|e| e.code), Some(1000));
    }
}
