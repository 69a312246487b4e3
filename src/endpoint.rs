//! Endpoint identity and per-endpoint health.
//!
//! An [`Endpoint`] is compared by value over `(address, binding, overrides)`; that tuple is the
//! cache key for factory sharing, proxy caching and health tracking.

use crate::clock::Clock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sentinel for "no error recorded".
const NO_ERROR: u64 = u64::MAX;

/// Transport binding descriptor for an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct Binding {
    /// Binding scheme understood by the transport, e.g. `"tcp"` or `"http"`.
    pub scheme: String,
    /// Binding settings passed through to the transport untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, String>,
}

impl Binding {
    pub fn new(scheme: impl Into<String>) -> Self {
        Self { scheme: scheme.into(), settings: BTreeMap::new() }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct EndpointInner {
    address: String,
    binding: Binding,
    overrides: Option<BTreeMap<String, String>>,
}

/// A reachable server address plus its binding configuration. Immutable and cheap to clone.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, binding: Binding) -> Self {
        Self { inner: Arc::new(EndpointInner { address: address.into(), binding, overrides: None }) }
    }

    /// Endpoint with a local override configuration.
    pub fn with_overrides(
        address: impl Into<String>,
        binding: Binding,
        overrides: BTreeMap<String, String>,
    ) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                address: address.into(),
                binding,
                overrides: Some(overrides),
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn binding(&self) -> &Binding {
        &self.inner.binding
    }

    pub fn overrides(&self) -> Option<&BTreeMap<String, String>> {
        self.inner.overrides.as_ref()
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.inner.address)
            .field("scheme", &self.inner.binding.scheme)
            .finish()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.address)
    }
}

/// Observable health of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// No error recorded, or the last error was cleared by a success.
    Healthy,
    /// Failed recently; ineligible until `remaining` elapses.
    CoolingDown { remaining: Duration },
    /// Failed, but the cooldown has elapsed; eligible again.
    Recovered,
}

impl HealthStatus {
    pub fn is_eligible(&self) -> bool {
        !matches!(self, Self::CoolingDown { .. })
    }
}

/// Health state of one endpoint: last error timestamp and cooldown window.
///
/// Writes are single-field atomic stores (last write wins); there is no cross-field
/// consistency to protect, so no lock is taken.
#[derive(Debug)]
pub struct EndpointHealth {
    last_error_millis: AtomicU64,
    cooldown_millis: AtomicU64,
}

impl EndpointHealth {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            last_error_millis: AtomicU64::new(NO_ERROR),
            cooldown_millis: AtomicU64::new(duration_millis(cooldown)),
        }
    }

    /// Timestamp (clock millis) of the last endpoint-level failure, if one is recorded.
    pub fn last_error_millis(&self) -> Option<u64> {
        match self.last_error_millis.load(Ordering::Acquire) {
            NO_ERROR => None,
            at => Some(at),
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_millis.load(Ordering::Acquire))
    }

    pub(crate) fn set_cooldown(&self, cooldown: Duration) {
        self.cooldown_millis.store(duration_millis(cooldown), Ordering::Release);
    }

    pub(crate) fn record_failure(&self, now_millis: u64) {
        // NO_ERROR is reserved; a clock that reaches it saturates one below.
        self.last_error_millis.store(now_millis.min(NO_ERROR - 1), Ordering::Release);
    }

    pub(crate) fn record_success(&self) {
        self.last_error_millis.store(NO_ERROR, Ordering::Release);
    }

    pub fn status(&self, clock: &dyn Clock) -> HealthStatus {
        let Some(failed_at) = self.last_error_millis() else {
            return HealthStatus::Healthy;
        };
        let cooldown = self.cooldown_millis.load(Ordering::Acquire);
        let elapsed = clock.now_millis().saturating_sub(failed_at);
        if elapsed >= cooldown {
            HealthStatus::Recovered
        } else {
            HealthStatus::CoolingDown { remaining: Duration::from_millis(cooldown - elapsed) }
        }
    }

    pub fn is_eligible(&self, clock: &dyn Clock) -> bool {
        self.status(clock).is_eligible()
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ManualClock;
    use std::collections::HashSet;

    #[test]
    fn endpoints_compare_by_value() {
        let a = Endpoint::new("tcp://a:1", Binding::new("tcp"));
        let b = Endpoint::new("tcp://a:1", Binding::new("tcp"));
        let c = Endpoint::new("tcp://a:1", Binding::new("tcp").with_setting("tls", "on"));
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<Endpoint> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn overrides_are_part_of_identity() {
        let plain = Endpoint::new("tcp://a:1", Binding::new("tcp"));
        let overridden = Endpoint::with_overrides(
            "tcp://a:1",
            Binding::new("tcp"),
            [("maxMessageSize".to_string(), "1048576".to_string())].into(),
        );
        assert_ne!(plain, overridden);
    }

    #[test]
    fn failure_starts_cooldown_that_expires() {
        let clock = ManualClock::new();
        let health = EndpointHealth::new(Duration::from_secs(5));
        assert_eq!(health.status(&clock), HealthStatus::Healthy);

        health.record_failure(clock.now_millis());
        assert!(!health.is_eligible(&clock));

        clock.advance(Duration::from_millis(4_999));
        assert_eq!(
            health.status(&clock),
            HealthStatus::CoolingDown { remaining: Duration::from_millis(1) }
        );

        clock.advance(Duration::from_millis(1));
        assert_eq!(health.status(&clock), HealthStatus::Recovered);
        assert!(health.is_eligible(&clock));
    }

    #[test]
    fn success_clears_error() {
        let clock = ManualClock::new();
        let health = EndpointHealth::new(Duration::from_secs(60));
        health.record_failure(0);
        assert!(health.last_error_millis().is_some());
        health.record_success();
        assert_eq!(health.last_error_millis(), None);
        assert!(health.is_eligible(&clock));
    }
}
