//! Client configuration: endpoint lists, timeouts, retry cap and cooldown per contract.
//!
//! Durations are written in milliseconds on the wire (`*_ms` keys):
//!
//! ```json
//! {
//!   "contracts": {
//!     "orders": {
//!       "endpoints": [
//!         { "address": "tcp://orders-a:7000", "binding": { "scheme": "tcp" } },
//!         { "address": "tcp://orders-b:7000", "binding": { "scheme": "tcp" } }
//!       ],
//!       "call_timeout_ms": 2000,
//!       "cooldown_ms": 5000,
//!       "operations": { "bulk_import": { "call_timeout_ms": 30000 } },
//!       "redacted_parameters": ["card_number"]
//!     }
//!   }
//! }
//! ```

use crate::adaptive::DynamicConfig;
use crate::endpoint::{Binding, Endpoint};
use crate::error::ConfigError;
use crate::registry::DEFAULT_MAX_RETRY_COUNT;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_PREOPEN_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod millis_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|v| v.map(Duration::from_millis))
    }
}

fn default_open_timeout() -> Duration {
    DEFAULT_OPEN_TIMEOUT
}
fn default_call_timeout() -> Duration {
    DEFAULT_CALL_TIMEOUT
}
fn default_close_timeout() -> Duration {
    DEFAULT_CLOSE_TIMEOUT
}
fn default_preopen_timeout() -> Duration {
    DEFAULT_PREOPEN_TIMEOUT
}
fn default_cooldown() -> Duration {
    DEFAULT_COOLDOWN
}
fn default_max_retry_count() -> usize {
    DEFAULT_MAX_RETRY_COUNT
}

/// One configured endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub address: String,
    #[serde(default)]
    pub binding: Binding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<BTreeMap<String, String>>,
}

impl EndpointConfig {
    pub fn new(address: impl Into<String>, binding: Binding) -> Self {
        Self { address: address.into(), binding, overrides: None }
    }

    pub fn to_endpoint(&self) -> Endpoint {
        match &self.overrides {
            Some(overrides) => {
                Endpoint::with_overrides(self.address.clone(), self.binding.clone(), overrides.clone())
            }
            None => Endpoint::new(self.address.clone(), self.binding.clone()),
        }
    }
}

/// Per-operation timeout overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationConfig {
    #[serde(rename = "open_timeout_ms", default, with = "millis_opt", skip_serializing_if = "Option::is_none")]
    pub open_timeout: Option<Duration>,
    #[serde(rename = "call_timeout_ms", default, with = "millis_opt", skip_serializing_if = "Option::is_none")]
    pub call_timeout: Option<Duration>,
}

/// Timeouts that apply to one call of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSettings {
    pub open_timeout: Duration,
    pub call_timeout: Duration,
    pub close_timeout: Duration,
    pub preopen_timeout: Duration,
}

/// Configuration for one contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractConfig {
    pub endpoints: Vec<EndpointConfig>,
    #[serde(rename = "open_timeout_ms", default = "default_open_timeout", with = "millis")]
    pub open_timeout: Duration,
    #[serde(rename = "call_timeout_ms", default = "default_call_timeout", with = "millis")]
    pub call_timeout: Duration,
    #[serde(rename = "close_timeout_ms", default = "default_close_timeout", with = "millis")]
    pub close_timeout: Duration,
    /// Bound for optimistic pre-open; failures are non-fatal.
    #[serde(rename = "preopen_timeout_ms", default = "default_preopen_timeout", with = "millis")]
    pub preopen_timeout: Duration,
    /// Endpoint-switch retries per invocation. Attempts never exceed this plus one.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: usize,
    #[serde(rename = "cooldown_ms", default = "default_cooldown", with = "millis")]
    pub cooldown: Duration,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub operations: HashMap<String, OperationConfig>,
    /// Parameter names rendered as `***` in invocation records.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub redacted_parameters: BTreeSet<String>,
}

impl ContractConfig {
    /// Contract config with default timeouts.
    pub fn new(endpoints: impl IntoIterator<Item = EndpointConfig>) -> Self {
        Self {
            endpoints: endpoints.into_iter().collect(),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            preopen_timeout: DEFAULT_PREOPEN_TIMEOUT,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            cooldown: DEFAULT_COOLDOWN,
            operations: HashMap::new(),
            redacted_parameters: BTreeSet::new(),
        }
    }

    /// Shorthand: endpoints by address, all on the same binding scheme.
    pub fn with_addresses<I, S>(scheme: &str, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(addresses.into_iter().map(|a| EndpointConfig::new(a, Binding::new(scheme))))
    }

    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn preopen_timeout(mut self, timeout: Duration) -> Self {
        self.preopen_timeout = timeout;
        self
    }

    pub fn max_retry_count(mut self, count: usize) -> Self {
        self.max_retry_count = count;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn operation(mut self, name: impl Into<String>, config: OperationConfig) -> Self {
        self.operations.insert(name.into(), config);
        self
    }

    pub fn redact(mut self, parameter: impl Into<String>) -> Self {
        self.redacted_parameters.insert(parameter.into());
        self
    }

    /// Endpoints in configured order.
    pub fn endpoint_list(&self) -> Vec<Endpoint> {
        self.endpoints.iter().map(EndpointConfig::to_endpoint).collect()
    }

    /// Effective timeouts for `operation`.
    pub fn settings_for(&self, operation: &str) -> CallSettings {
        let op = self.operations.get(operation).copied().unwrap_or_default();
        CallSettings {
            open_timeout: op.open_timeout.unwrap_or(self.open_timeout),
            call_timeout: op.call_timeout.unwrap_or(self.call_timeout),
            close_timeout: self.close_timeout,
            preopen_timeout: self.preopen_timeout,
        }
    }

    pub fn validate(&self, contract: &str) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints { contract: contract.to_string() });
        }
        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if !seen.insert(endpoint.to_endpoint()) {
                return Err(ConfigError::DuplicateEndpoint {
                    contract: contract.to_string(),
                    address: endpoint.address.clone(),
                });
            }
        }
        let zero = |field: &'static str| ConfigError::ZeroTimeout { contract: contract.to_string(), field };
        for (field, value) in [
            ("open_timeout", self.open_timeout),
            ("call_timeout", self.call_timeout),
            ("close_timeout", self.close_timeout),
            ("preopen_timeout", self.preopen_timeout),
        ] {
            if value.is_zero() {
                return Err(zero(field));
            }
        }
        for op in self.operations.values() {
            if op.open_timeout.is_some_and(|t| t.is_zero()) {
                return Err(zero("operations.open_timeout"));
            }
            if op.call_timeout.is_some_and(|t| t.is_zero()) {
                return Err(zero("operations.call_timeout"));
            }
        }
        Ok(())
    }
}

/// Configuration for every contract a client talks to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub contracts: HashMap<String, ContractConfig>,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contract(mut self, name: impl Into<String>, config: ContractConfig) -> Self {
        self.contracts.insert(name.into(), config);
        self
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names: Vec<_> = self.contracts.keys().collect();
        names.sort();
        for name in names {
            self.contracts[name].validate(name)?;
        }
        Ok(())
    }
}

/// Read-only view of client configuration. Consulted once per logical invocation.
pub trait ConfigSource: Send + Sync + std::fmt::Debug {
    fn contract(&self, name: &str) -> Option<Arc<ContractConfig>>;
}

impl ConfigSource for ClientConfig {
    fn contract(&self, name: &str) -> Option<Arc<ContractConfig>> {
        self.contracts.get(name).cloned().map(Arc::new)
    }
}

/// Live-updatable configuration: each invocation reads the latest snapshot.
impl ConfigSource for DynamicConfig<ClientConfig> {
    fn contract(&self, name: &str) -> Option<Arc<ContractConfig>> {
        self.get().contract(name)
    }
}

impl<T: ConfigSource + ?Sized> ConfigSource for Arc<T> {
    fn contract(&self, name: &str) -> Option<Arc<ContractConfig>> {
        (**self).contract(name)
    }
}
