//! Ordered endpoint set for one contract, with health-aware selection.
//!
//! Selection semantics:
//! - Round-robin among eligible endpoints that are not excluded by the current invocation.
//! - When every remaining endpoint is cooling down, the least-recently-failed one is returned so
//!   a call can still make progress.
//! - An endpoint already tried by the invocation is only reselected when it is the registry's
//!   sole endpoint.
//! - Nothing is returned once `attempt` exceeds the configured retry cap.

use crate::clock::{Clock, MonotonicClock};
use crate::endpoint::{Endpoint, EndpointHealth, HealthStatus};
use crate::error::FailureKind;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of endpoint-switch retries per logical invocation.
pub const DEFAULT_MAX_RETRY_COUNT: usize = 10;

#[derive(Debug)]
struct Slot {
    endpoint: Endpoint,
    health: Arc<EndpointHealth>,
}

/// Known endpoints for one contract plus their health.
#[derive(Debug)]
pub struct EndpointRegistry {
    slots: Vec<Slot>,
    cursor: AtomicUsize,
    cooldown: Duration,
    max_retry_count: usize,
    clock: Arc<dyn Clock>,
}

impl EndpointRegistry {
    /// Registry over `endpoints` in configured order. Duplicates are dropped.
    pub fn new(endpoints: Vec<Endpoint>, cooldown: Duration, max_retry_count: usize) -> Self {
        Self::with_clock(endpoints, cooldown, max_retry_count, Arc::new(MonotonicClock::default()))
    }

    /// Registry with an injected clock (useful for deterministic tests).
    pub fn with_clock(
        endpoints: Vec<Endpoint>,
        cooldown: Duration,
        max_retry_count: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut seen = HashSet::new();
        let slots = endpoints
            .into_iter()
            .filter(|e| seen.insert(e.clone()))
            .map(|endpoint| Slot { endpoint, health: Arc::new(EndpointHealth::new(cooldown)) })
            .collect();
        Self { slots, cursor: AtomicUsize::new(0), cooldown, max_retry_count, clock }
    }

    /// Build a registry for a new endpoint list, carrying over the health of endpoints that
    /// remain. Cooldown windows of carried-over endpoints adopt the new `cooldown`.
    pub fn rebuild(
        &self,
        endpoints: Vec<Endpoint>,
        cooldown: Duration,
        max_retry_count: usize,
    ) -> Self {
        let mut seen = HashSet::new();
        let slots = endpoints
            .into_iter()
            .filter(|e| seen.insert(e.clone()))
            .map(|endpoint| {
                let health = match self.slot(&endpoint) {
                    Some(existing) => {
                        existing.health.set_cooldown(cooldown);
                        existing.health.clone()
                    }
                    None => Arc::new(EndpointHealth::new(cooldown)),
                };
                Slot { endpoint, health }
            })
            .collect();
        Self {
            slots,
            cursor: AtomicUsize::new(self.cursor.load(Ordering::Relaxed)),
            cooldown,
            max_retry_count,
            clock: self.clock.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.slot(endpoint).is_some()
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn max_retry_count(&self) -> usize {
        self.max_retry_count
    }

    /// Endpoints in configured order.
    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.slots.iter().map(|s| &s.endpoint)
    }

    /// Whether the registry holds exactly `endpoints`, in order.
    pub fn matches(&self, endpoints: &[Endpoint]) -> bool {
        self.slots.len() == endpoints.len()
            && self.slots.iter().zip(endpoints).all(|(s, e)| &s.endpoint == e)
    }

    /// Select the endpoint for attempt number `attempt` (0 = initial attempt).
    pub fn get_eligible_endpoint(
        &self,
        excluded: &HashSet<Endpoint>,
        attempt: usize,
    ) -> Option<Endpoint> {
        if attempt > self.max_retry_count || self.slots.is_empty() {
            return None;
        }

        let len = self.slots.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        let rotated = (0..len).map(|i| &self.slots[(start + i) % len]);

        let mut cooling: Option<(&Slot, u64)> = None;
        for slot in rotated {
            if excluded.contains(&slot.endpoint) {
                continue;
            }
            match slot.health.status(self.clock.as_ref()) {
                HealthStatus::Healthy | HealthStatus::Recovered => {
                    return Some(slot.endpoint.clone());
                }
                HealthStatus::CoolingDown { .. } => {
                    let failed_at = slot.health.last_error_millis().unwrap_or(0);
                    if cooling.map_or(true, |(_, best)| failed_at < best) {
                        cooling = Some((slot, failed_at));
                    }
                }
            }
        }

        if let Some((slot, _)) = cooling {
            debug!(endpoint = %slot.endpoint, attempt, "all remaining endpoints cooling down; using least recently failed");
            return Some(slot.endpoint.clone());
        }

        // Everything has been tried by this invocation. Only a lone endpoint is retried.
        if len == 1 {
            return Some(self.slots[0].endpoint.clone());
        }
        None
    }

    /// First eligible endpoint in configured order, without advancing the round-robin cursor.
    pub fn preferred_endpoint(&self) -> Option<Endpoint> {
        self.slots
            .iter()
            .find(|s| s.health.is_eligible(self.clock.as_ref()))
            .or_else(|| {
                self.slots.iter().min_by_key(|s| s.health.last_error_millis().unwrap_or(0))
            })
            .map(|s| s.endpoint.clone())
    }

    pub fn is_eligible(&self, endpoint: &Endpoint) -> bool {
        self.slot(endpoint).is_some_and(|s| s.health.is_eligible(self.clock.as_ref()))
    }

    /// Clear the endpoint's error state.
    pub fn report_success(&self, endpoint: &Endpoint) {
        if let Some(slot) = self.slot(endpoint) {
            if slot.health.last_error_millis().is_some() {
                debug!(endpoint = %endpoint, "endpoint healthy again");
            }
            slot.health.record_success();
        }
    }

    /// Record a failed attempt. Only endpoint-level classifications start a cooldown.
    pub fn report_failure(&self, endpoint: &Endpoint, kind: FailureKind) {
        if !kind.marks_endpoint() {
            return;
        }
        if let Some(slot) = self.slot(endpoint) {
            slot.health.record_failure(self.clock.now_millis());
            warn!(
                endpoint = %endpoint,
                kind = %kind,
                cooldown_ms = slot.health.cooldown().as_millis() as u64,
                "endpoint marked unhealthy"
            );
        }
    }

    /// Health of one endpoint.
    pub fn health(&self, endpoint: &Endpoint) -> Option<HealthStatus> {
        self.slot(endpoint).map(|s| s.health.status(self.clock.as_ref()))
    }

    /// Last recorded failure timestamp (clock millis) for an endpoint.
    pub fn last_error_millis(&self, endpoint: &Endpoint) -> Option<u64> {
        self.slot(endpoint).and_then(|s| s.health.last_error_millis())
    }

    /// Snapshot of `(address, status)` in configured order.
    pub fn snapshot(&self) -> Vec<(String, HealthStatus)> {
        self.slots
            .iter()
            .map(|s| (s.endpoint.address().to_string(), s.health.status(self.clock.as_ref())))
            .collect()
    }

    fn slot(&self, endpoint: &Endpoint) -> Option<&Slot> {
        self.slots.iter().find(|s| &s.endpoint == endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Binding;
    use crate::mock::ManualClock;

    fn ep(address: &str) -> Endpoint {
        Endpoint::new(address, Binding::new("tcp"))
    }

    fn registry(addresses: &[&str], clock: &ManualClock) -> EndpointRegistry {
        EndpointRegistry::with_clock(
            addresses.iter().map(|a| ep(a)).collect(),
            Duration::from_secs(5),
            DEFAULT_MAX_RETRY_COUNT,
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn round_robin_over_eligible_endpoints() {
        let clock = ManualClock::new();
        let reg = registry(&["a", "b", "c"], &clock);
        let none = HashSet::new();
        let picks: Vec<_> = (0..4)
            .map(|_| reg.get_eligible_endpoint(&none, 0).unwrap().address().to_string())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn skips_excluded_and_cooling_endpoints() {
        let clock = ManualClock::new();
        let reg = registry(&["a", "b", "c"], &clock);
        reg.report_failure(&ep("b"), FailureKind::EndpointDown);

        let excluded: HashSet<_> = [ep("a")].into_iter().collect();
        // Cursor starts at "a", which is excluded; "b" is cooling down.
        assert_eq!(reg.get_eligible_endpoint(&excluded, 1), Some(ep("c")));
    }

    #[test]
    fn falls_back_to_least_recently_failed_when_all_cooling() {
        let clock = ManualClock::new();
        let reg = registry(&["a", "b", "c"], &clock);
        reg.report_failure(&ep("b"), FailureKind::EndpointDown);
        clock.advance(Duration::from_millis(100));
        reg.report_failure(&ep("c"), FailureKind::Timeout);

        let excluded: HashSet<_> = [ep("a")].into_iter().collect();
        assert_eq!(reg.get_eligible_endpoint(&excluded, 1), Some(ep("b")));
    }

    #[test]
    fn never_reselects_within_invocation_unless_sole_endpoint() {
        let clock = ManualClock::new();
        let reg = registry(&["a", "b"], &clock);
        let excluded: HashSet<_> = [ep("a"), ep("b")].into_iter().collect();
        assert_eq!(reg.get_eligible_endpoint(&excluded, 2), None);

        let lone = registry(&["solo"], &clock);
        let excluded: HashSet<_> = [ep("solo")].into_iter().collect();
        assert_eq!(lone.get_eligible_endpoint(&excluded, 3), Some(ep("solo")));
    }

    #[test]
    fn attempt_beyond_cap_finds_nothing() {
        let clock = ManualClock::new();
        let reg = EndpointRegistry::with_clock(
            vec![ep("a")],
            Duration::from_secs(1),
            2,
            Arc::new(clock.clone()),
        );
        let none = HashSet::new();
        assert!(reg.get_eligible_endpoint(&none, 2).is_some());
        assert!(reg.get_eligible_endpoint(&none, 3).is_none());
    }

    #[test]
    fn request_local_failures_leave_health_untouched() {
        let clock = ManualClock::new();
        let reg = registry(&["a"], &clock);
        reg.report_failure(&ep("a"), FailureKind::Fault);
        reg.report_failure(&ep("a"), FailureKind::ChannelLocal);
        reg.report_failure(&ep("a"), FailureKind::Fatal);
        assert_eq!(reg.health(&ep("a")), Some(HealthStatus::Healthy));
    }

    #[test]
    fn cooldown_expires_with_clock() {
        let clock = ManualClock::new();
        let reg = registry(&["a", "b"], &clock);
        reg.report_failure(&ep("a"), FailureKind::EndpointDown);
        assert!(!reg.is_eligible(&ep("a")));

        clock.advance(Duration::from_millis(4_999));
        assert!(!reg.is_eligible(&ep("a")));
        clock.advance(Duration::from_millis(1));
        assert!(reg.is_eligible(&ep("a")));

        reg.report_success(&ep("a"));
        assert_eq!(reg.last_error_millis(&ep("a")), None);
    }

    #[test]
    fn rebuild_keeps_health_of_retained_endpoints() {
        let clock = ManualClock::new();
        let reg = registry(&["a", "b"], &clock);
        reg.report_failure(&ep("a"), FailureKind::EndpointDown);

        let next = reg.rebuild(vec![ep("a"), ep("c")], Duration::from_secs(10), 3);
        assert!(!next.is_eligible(&ep("a")));
        assert!(next.is_eligible(&ep("c")));
        assert!(!next.contains(&ep("b")));
        assert_eq!(next.max_retry_count(), 3);

        clock.advance(Duration::from_millis(5_000));
        assert!(!next.is_eligible(&ep("a")), "cooldown window follows the rebuilt registry");
    }

    #[test]
    fn preferred_endpoint_is_first_eligible_in_order() {
        let clock = ManualClock::new();
        let reg = registry(&["a", "b"], &clock);
        assert_eq!(reg.preferred_endpoint(), Some(ep("a")));
        reg.report_failure(&ep("a"), FailureKind::EndpointDown);
        assert_eq!(reg.preferred_endpoint(), Some(ep("b")));
        // preferred_endpoint does not move the round-robin cursor
        let none = HashSet::new();
        assert_eq!(reg.get_eligible_endpoint(&none, 0), Some(ep("b")));
    }
}
