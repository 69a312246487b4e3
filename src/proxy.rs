//! The per-call interceptor: one channel, the retry loop, failure classification and failover.
//!
//! A [`ResilientProxy`] owns at most one channel and one factory handle, both for its current
//! endpoint. Each [`ResilientProxy::invoke`] runs the retry loop:
//!
//! 1. Make sure a channel to the current endpoint is open (bounded by the open timeout).
//! 2. Invoke the operation (bounded by the call timeout).
//! 3. On failure, abort the channel and classify the error:
//!    - faults and fatal errors end the call immediately;
//!    - a channel-local error, or any non-endpoint error on a channel that was already open,
//!      earns one free retry on the same endpoint;
//!    - everything else marks the endpoint unhealthy and fails over to the next eligible
//!      endpoint, up to the configured retry cap.
//!
//! Every attempt is recorded with its endpoint, error and elapsed time.

use crate::classify::Classifier;
use crate::config::CallSettings;
use crate::endpoint::Endpoint;
use crate::error::{FailureKind, InvocationError, TransportError};
use crate::factory_cache::{ChannelFactoryCache, FactoryHandle, ReleaseMode};
use crate::invocation::Invocation;
use crate::proxy_factory::CacheMode;
use crate::registry::EndpointRegistry;
use crate::telemetry::{AttemptError, AttemptRecord};
use crate::transport::{Channel, CommunicationState, ConstructionContext};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of one logical invocation plus its attempt history.
#[derive(Debug)]
pub struct CallOutcome {
    pub result: Result<serde_json::Value, InvocationError>,
    pub attempts: Vec<AttemptRecord>,
}

/// Per-call interceptor owning one channel.
pub struct ResilientProxy {
    contract: String,
    mode: CacheMode,
    context: ConstructionContext,
    cache: ChannelFactoryCache,
    classifier: Classifier,
    endpoint: Option<Endpoint>,
    handle: Option<FactoryHandle>,
    channel: Option<Arc<dyn Channel>>,
    faulted: bool,
}

impl fmt::Debug for ResilientProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientProxy")
            .field("contract", &self.contract)
            .field("mode", &self.mode)
            .field("context", &self.context)
            .field("endpoint", &self.endpoint)
            .field("channel", &self.channel_state())
            .field("faulted", &self.faulted)
            .finish()
    }
}

impl ResilientProxy {
    pub fn new(
        contract: impl Into<String>,
        mode: CacheMode,
        context: ConstructionContext,
        cache: ChannelFactoryCache,
        classifier: Classifier,
    ) -> Self {
        Self {
            contract: contract.into(),
            mode,
            context,
            cache,
            classifier,
            endpoint: None,
            handle: None,
            channel: None,
            faulted: false,
        }
    }

    pub fn contract(&self) -> &str {
        &self.contract
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn context(&self) -> &ConstructionContext {
        &self.context
    }

    /// Endpoint of the current (or most recent) channel.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn channel_state(&self) -> Option<CommunicationState> {
        self.channel.as_ref().map(|c| c.state())
    }

    /// Whether the proxy's factory handle is a shared cache entry.
    pub fn uses_shared_factory(&self) -> Option<bool> {
        self.handle.as_ref().map(FactoryHandle::is_shared)
    }

    /// Set when a call ended in a transport failure. Faulted proxies are not reused by caches.
    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    /// Permanently stop sharing the channel factory. The current channel and handle are
    /// released; the next call builds a private factory.
    pub fn finalize_context(&mut self) {
        if !self.context.is_shareable() {
            return;
        }
        self.context = self.context.finalized();
        self.abort_channel();
        self.release_factory(ReleaseMode::Close);
        debug!(contract = %self.contract, "proxy finalized to a private channel factory");
    }

    /// Run one logical invocation.
    pub async fn invoke(
        &mut self,
        registry: &EndpointRegistry,
        settings: &CallSettings,
        request: &Invocation,
    ) -> CallOutcome {
        let mut attempts = Vec::new();
        let Some(mut endpoint) = self.starting_endpoint(registry) else {
            return CallOutcome {
                result: Err(InvocationError::NoEndpoint { contract: self.contract.clone() }),
                attempts,
            };
        };

        let mut excluded = HashSet::new();
        let mut attempt = 0usize;
        let mut same_channel_retry_used = false;

        loop {
            let started = Instant::now();
            let was_open = self.has_open_channel_to(&endpoint);
            let outcome = match self.ensure_open(&endpoint, settings).await {
                Ok(channel) => call(&channel, request, settings).await,
                Err(err) => Err(err),
            };

            let err = match outcome {
                Ok(value) => {
                    registry.report_success(&endpoint);
                    attempts.push(AttemptRecord {
                        endpoint: endpoint.address().to_string(),
                        error: None,
                        elapsed: started.elapsed(),
                    });
                    if attempts.len() > 1 {
                        info!(
                            contract = %self.contract,
                            operation = %request.operation,
                            endpoint = %endpoint,
                            attempts = attempts.len(),
                            "call recovered"
                        );
                    }
                    return CallOutcome { result: Ok(value), attempts };
                }
                Err(err) => err,
            };

            self.abort_channel();
            let kind = self.classifier.classify(&err, was_open);
            debug!(
                contract = %self.contract,
                operation = %request.operation,
                endpoint = %endpoint,
                attempt,
                was_open,
                kind = %kind,
                error = %err,
                "attempt failed"
            );
            attempts.push(AttemptRecord {
                endpoint: endpoint.address().to_string(),
                error: Some(AttemptError { kind, message: err.to_string() }),
                elapsed: started.elapsed(),
            });

            if kind.is_terminal() {
                if kind == FailureKind::Fatal {
                    self.faulted = true;
                }
                return CallOutcome { result: Err(InvocationError::from_transport(kind, err)), attempts };
            }

            if kind == FailureKind::ChannelLocal && !same_channel_retry_used {
                same_channel_retry_used = true;
                continue;
            }

            if was_open && kind != FailureKind::EndpointDown && !same_channel_retry_used {
                same_channel_retry_used = true;
                continue;
            }

            registry.report_failure(&endpoint, kind);
            attempt += 1;
            if attempt > registry.max_retry_count() {
                return self.give_up(kind, err, attempts);
            }
            excluded.insert(endpoint.clone());
            match registry.get_eligible_endpoint(&excluded, attempt) {
                Some(next) => {
                    info!(
                        contract = %self.contract,
                        from = %endpoint,
                        to = %next,
                        attempt,
                        "failing over"
                    );
                    if next != endpoint {
                        self.release_factory(ReleaseMode::Abort);
                    }
                    endpoint = next;
                    same_channel_retry_used = false;
                }
                None => return self.give_up(kind, err, attempts),
            }
        }
    }

    /// Optimistically open a channel ahead of need, bounded by `settings.preopen_timeout`.
    /// Failure is not an error and does not affect endpoint health.
    pub async fn preopen(&mut self, registry: &EndpointRegistry, settings: &CallSettings) -> bool {
        let Some(endpoint) = self.starting_endpoint(registry) else {
            return false;
        };
        let bounded = CallSettings { open_timeout: settings.preopen_timeout, ..*settings };
        match self.ensure_open(&endpoint, &bounded).await {
            Ok(_) => true,
            Err(err) => {
                debug!(contract = %self.contract, endpoint = %endpoint, error = %err, "pre-open failed");
                self.abort_channel();
                false
            }
        }
    }

    /// Point an idle proxy at `endpoint` so its next call starts there.
    pub(crate) fn target(&mut self, endpoint: &Endpoint) {
        if self.endpoint.as_ref() != Some(endpoint) {
            self.abort_channel();
            self.release_factory(ReleaseMode::Close);
            self.endpoint = Some(endpoint.clone());
        }
    }

    /// Gracefully close the channel and release the factory handle.
    pub async fn close(mut self, timeout: Duration) {
        if let Some(channel) = self.channel.take() {
            if channel.state() == CommunicationState::Opened {
                if let Err(err) = channel.close(timeout).await {
                    debug!(contract = %self.contract, error = %err, "channel close failed; aborting");
                    channel.abort();
                }
            } else {
                channel.abort();
            }
        }
        if let Some(handle) = self.handle.take() {
            if self.faulted {
                handle.release(ReleaseMode::Abort);
            } else {
                handle.close().await;
            }
        }
    }

    /// Abort the channel and release the factory handle immediately.
    pub fn abort(&mut self) {
        self.abort_channel();
        self.release_factory(ReleaseMode::Abort);
    }

    fn give_up(
        &mut self,
        kind: FailureKind,
        err: TransportError,
        attempts: Vec<AttemptRecord>,
    ) -> CallOutcome {
        self.faulted = true;
        warn!(
            contract = %self.contract,
            attempts = attempts.len(),
            kind = %kind,
            "call failed after exhausting endpoints"
        );
        CallOutcome { result: Err(InvocationError::from_transport(kind, err)), attempts }
    }

    /// Keep using the current endpoint while it is still configured and eligible.
    fn starting_endpoint(&self, registry: &EndpointRegistry) -> Option<Endpoint> {
        match &self.endpoint {
            Some(current) if registry.contains(current) && registry.is_eligible(current) => {
                Some(current.clone())
            }
            _ => registry.get_eligible_endpoint(&HashSet::new(), 0),
        }
    }

    fn has_open_channel_to(&self, endpoint: &Endpoint) -> bool {
        self.endpoint.as_ref() == Some(endpoint)
            && self.channel.as_ref().is_some_and(|c| c.state() == CommunicationState::Opened)
    }

    async fn ensure_open(
        &mut self,
        endpoint: &Endpoint,
        settings: &CallSettings,
    ) -> Result<Arc<dyn Channel>, TransportError> {
        if self.endpoint.as_ref() != Some(endpoint) {
            self.abort_channel();
            self.release_factory(ReleaseMode::Close);
            self.endpoint = Some(endpoint.clone());
        }

        if let Some(channel) = &self.channel {
            if channel.state() == CommunicationState::Opened {
                return Ok(channel.clone());
            }
            self.abort_channel();
        }

        let channel = self.create_channel(endpoint, settings).await?;
        self.channel = Some(channel.clone());
        self.cache.connector().open_channel(channel.clone(), settings.open_timeout).await?;
        Ok(channel)
    }

    async fn create_channel(
        &mut self,
        endpoint: &Endpoint,
        settings: &CallSettings,
    ) -> Result<Arc<dyn Channel>, TransportError> {
        let handle = self.factory_handle(endpoint, settings).await?;
        match handle.create_channel().await {
            Ok(channel) => Ok(channel),
            Err(err) if handle.is_shared() && self.classifier.poisons_factory(&err) => {
                warn!(
                    contract = %self.contract,
                    endpoint = %endpoint,
                    error = %err,
                    "channel creation failed on shared factory; rebuilding once"
                );
                self.cache.invalidate(&self.contract, endpoint);
                self.release_factory(ReleaseMode::Abort);
                let handle = self.factory_handle(endpoint, settings).await?;
                handle.create_channel().await
            }
            Err(err) => Err(err),
        }
    }

    /// Current factory handle, (re)acquired when missing or no longer open.
    async fn factory_handle(
        &mut self,
        endpoint: &Endpoint,
        settings: &CallSettings,
    ) -> Result<&FactoryHandle, TransportError> {
        if self.handle.as_ref().is_some_and(|h| h.state() != CommunicationState::Opened) {
            self.release_factory(ReleaseMode::Abort);
        }
        if self.handle.is_none() {
            let handle = self
                .cache
                .acquire(
                    &self.contract,
                    endpoint,
                    &self.context,
                    settings.open_timeout,
                    settings.close_timeout,
                )
                .await?;
            self.handle = Some(handle);
        }
        self.handle.as_ref().ok_or(TransportError::Disposed)
    }

    fn abort_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.abort();
        }
    }

    fn release_factory(&mut self, mode: ReleaseMode) {
        if let Some(handle) = self.handle.take() {
            handle.release(mode);
        }
    }
}

impl Drop for ResilientProxy {
    fn drop(&mut self) {
        self.abort_channel();
        let mode = if self.faulted { ReleaseMode::Abort } else { ReleaseMode::Close };
        self.release_factory(mode);
    }
}

async fn call(
    channel: &Arc<dyn Channel>,
    request: &Invocation,
    settings: &CallSettings,
) -> Result<serde_json::Value, TransportError> {
    match tokio::time::timeout(settings.call_timeout, channel.invoke(request)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(settings.call_timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::BoundedConnector;
    use crate::endpoint::Binding;
    use crate::endpoint::HealthStatus;
    use crate::mock::{ManualClock, MockTransport, Step};
    use std::io;

    const SECOND: Duration = Duration::from_secs(1);

    fn settings() -> CallSettings {
        CallSettings {
            open_timeout: SECOND,
            call_timeout: SECOND,
            close_timeout: SECOND,
            preopen_timeout: Duration::from_millis(100),
        }
    }

    fn ep(address: &str) -> Endpoint {
        Endpoint::new(address, Binding::new("mock"))
    }

    struct Harness {
        transport: MockTransport,
        cache: ChannelFactoryCache,
        clock: ManualClock,
        registry: EndpointRegistry,
    }

    fn harness(addresses: &[&str], max_retry_count: usize) -> Harness {
        let transport = MockTransport::new();
        let cache =
            ChannelFactoryCache::new(Arc::new(transport.clone()), BoundedConnector::default());
        let clock = ManualClock::new();
        let registry = EndpointRegistry::with_clock(
            addresses.iter().map(|a| ep(a)).collect(),
            Duration::from_secs(5),
            max_retry_count,
            Arc::new(clock.clone()),
        );
        Harness { transport, cache, clock, registry }
    }

    impl Harness {
        fn proxy(&self) -> ResilientProxy {
            ResilientProxy::new(
                "orders",
                CacheMode::PerCall,
                ConstructionContext::Shared,
                self.cache.clone(),
                Classifier::default(),
            )
        }
    }

    fn request() -> Invocation {
        Invocation::new("get_order")
    }

    #[tokio::test]
    async fn success_on_first_endpoint() {
        let h = harness(&["a", "b"], 10);
        let mut proxy = h.proxy();
        let outcome = proxy.invoke(&h.registry, &settings(), &request()).await;
        assert_eq!(outcome.result.unwrap()["served_by"], "a");
        assert_eq!(outcome.attempts.len(), 1);
        assert!(!proxy.is_faulted());
        assert_eq!(proxy.channel_state(), Some(CommunicationState::Opened));
    }

    #[tokio::test]
    async fn fault_is_returned_without_retry_or_health_change() {
        let h = harness(&["a", "b"], 10);
        h.transport.script_invoke("a", [Step::Fail(TransportError::fault("E7", "rejected"))]);
        let mut proxy = h.proxy();
        let outcome = proxy.invoke(&h.registry, &settings(), &request()).await;

        assert!(matches!(outcome.result, Err(InvocationError::Fault { ref code, .. }) if code == "E7"));
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(h.registry.health(&ep("a")), Some(HealthStatus::Healthy));
        assert_eq!(h.transport.stats().invocations_at("b"), 0);
        assert!(!proxy.is_faulted());
        // channel is aborted even on a fault
        assert_eq!(proxy.channel_state(), None);
    }

    #[tokio::test]
    async fn channel_local_error_retries_same_endpoint_once() {
        let h = harness(&["a", "b"], 10);
        h.transport.script_invoke("a", [Step::Fail(TransportError::Disposed)]);
        let mut proxy = h.proxy();
        let outcome = proxy.invoke(&h.registry, &settings(), &request()).await;

        assert_eq!(outcome.result.unwrap()["served_by"], "a");
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].endpoint, "a");
        assert_eq!(outcome.attempts[1].endpoint, "a");
        assert_eq!(h.registry.health(&ep("a")), Some(HealthStatus::Healthy));
    }

    #[tokio::test]
    async fn second_channel_local_error_fails_over() {
        let h = harness(&["a", "b"], 10);
        h.transport.script_invoke(
            "a",
            [Step::Fail(TransportError::Faulted), Step::Fail(TransportError::Aborted)],
        );
        let mut proxy = h.proxy();
        let outcome = proxy.invoke(&h.registry, &settings(), &request()).await;

        assert_eq!(outcome.result.unwrap()["served_by"], "b");
        let endpoints: Vec<_> = outcome.attempts.iter().map(|a| a.endpoint.as_str()).collect();
        assert_eq!(endpoints, vec!["a", "a", "b"]);
    }

    #[tokio::test]
    async fn reset_on_reused_channel_gets_free_retry() {
        let h = harness(&["a", "b"], 10);
        let mut proxy = h.proxy();
        proxy.invoke(&h.registry, &settings(), &request()).await.result.unwrap();

        h.transport.script_invoke(
            "a",
            [Step::Fail(TransportError::io(io::ErrorKind::ConnectionReset, "idle reset"))],
        );
        let outcome = proxy.invoke(&h.registry, &settings(), &request()).await;
        assert_eq!(outcome.result.unwrap()["served_by"], "a");
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].error.as_ref().unwrap().kind, FailureKind::ChannelLocal);
        assert_eq!(h.registry.health(&ep("a")), Some(HealthStatus::Healthy));
    }

    #[tokio::test]
    async fn endpoint_down_fails_over_and_marks_health() {
        let h = harness(&["a", "b", "c"], 10);
        h.transport.take_down("a");
        h.transport.take_down("b");
        let mut proxy = h.proxy();
        let outcome = proxy.invoke(&h.registry, &settings(), &request()).await;

        assert_eq!(outcome.result.unwrap()["served_by"], "c");
        assert_eq!(outcome.attempts.len(), 3);
        assert!(h.registry.last_error_millis(&ep("a")).is_some());
        assert!(h.registry.last_error_millis(&ep("b")).is_some());
        assert_eq!(h.registry.health(&ep("c")), Some(HealthStatus::Healthy));
        assert_eq!(proxy.endpoint(), Some(&ep("c")));
    }

    #[tokio::test]
    async fn attempts_never_exceed_cap_plus_one() {
        let h = harness(&["a", "b", "c", "d", "e"], 2);
        for address in ["a", "b", "c", "d", "e"] {
            h.transport.take_down(address);
        }
        let mut proxy = h.proxy();
        let outcome = proxy.invoke(&h.registry, &settings(), &request()).await;

        let err = outcome.result.unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::EndpointDown));
        assert_eq!(outcome.attempts.len(), 3);
        assert!(proxy.is_faulted());
    }

    #[tokio::test]
    async fn single_endpoint_is_retried_up_to_cap() {
        let h = harness(&["solo"], 3);
        h.transport.take_down("solo");
        let mut proxy = h.proxy();
        let outcome = proxy.invoke(&h.registry, &settings(), &request()).await;
        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts.len(), 4);
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let h = harness(&["a", "b"], 10);
        h.transport.script_invoke("a", [Step::Fail(TransportError::Fatal("bad contract".into()))]);
        let mut proxy = h.proxy();
        let outcome = proxy.invoke(&h.registry, &settings(), &request()).await;
        assert_eq!(outcome.result.unwrap_err().failure_kind(), Some(FailureKind::Fatal));
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(h.registry.health(&ep("a")), Some(HealthStatus::Healthy));
    }

    #[tokio::test]
    async fn call_timeout_fails_over_and_is_recorded_as_timeout() {
        let h = harness(&["a", "b"], 10);
        h.transport.script_invoke("a", [Step::Hang]);
        let mut proxy = h.proxy();
        let outcome = proxy.invoke(&h.registry, &settings(), &request()).await;

        assert_eq!(outcome.result.unwrap()["served_by"], "b");
        assert_eq!(outcome.attempts[0].error.as_ref().unwrap().kind, FailureKind::Timeout);
        assert!(h.registry.last_error_millis(&ep("a")).is_some());
    }

    #[tokio::test]
    async fn sticky_endpoint_until_it_cools_down() {
        let h = harness(&["a", "b"], 10);
        let mut proxy = h.proxy();
        for _ in 0..3 {
            let outcome = proxy.invoke(&h.registry, &settings(), &request()).await;
            assert_eq!(outcome.result.unwrap()["served_by"], "a");
        }
        assert_eq!(h.transport.stats().channels_created, 1);

        h.registry.report_failure(&ep("a"), FailureKind::EndpointDown);
        let outcome = proxy.invoke(&h.registry, &settings(), &request()).await;
        assert_eq!(outcome.result.unwrap()["served_by"], "b");

        h.clock.advance(Duration::from_secs(5));
        assert!(h.registry.is_eligible(&ep("a")));
    }

    #[tokio::test]
    async fn bad_shared_factory_is_invalidated_and_rebuilt_once() {
        let h = harness(&["a"], 0);
        h.transport.script_create_channel(
            "a",
            [Step::Fail(TransportError::Communication("factory went stale".into()))],
        );
        let mut proxy = h.proxy();
        let outcome = proxy.invoke(&h.registry, &settings(), &request()).await;

        assert!(outcome.result.is_ok());
        assert_eq!(outcome.attempts.len(), 1);
        let stats = h.transport.stats();
        assert_eq!(stats.factories_built, 2);
        assert_eq!(stats.factories_aborted, 1);
    }

    #[tokio::test]
    async fn finalize_context_switches_to_private_factory() {
        let h = harness(&["a"], 10);
        let mut proxy = h.proxy();
        proxy.invoke(&h.registry, &settings(), &request()).await.result.unwrap();
        assert_eq!(proxy.uses_shared_factory(), Some(true));

        proxy.finalize_context();
        assert!(!proxy.context().is_shareable());
        proxy.invoke(&h.registry, &settings(), &request()).await.result.unwrap();
        assert_eq!(proxy.uses_shared_factory(), Some(false));
        assert_eq!(h.transport.stats().factories_built, 2);
    }

    #[tokio::test]
    async fn preopen_failure_is_silent() {
        let h = harness(&["a"], 10);
        h.transport.script_channel_open("a", [Step::Delay(Duration::from_secs(2))]);
        let mut proxy = h.proxy();
        assert!(!proxy.preopen(&h.registry, &settings()).await);
        assert_eq!(h.registry.health(&ep("a")), Some(HealthStatus::Healthy));

        // the delay was consumed by the abandoned attempt
        assert!(proxy.preopen(&h.registry, &settings()).await);
    }

    #[tokio::test]
    async fn close_releases_everything() {
        let h = harness(&["a"], 10);
        let mut proxy = h.proxy();
        proxy.invoke(&h.registry, &settings(), &request()).await.result.unwrap();
        proxy.close(SECOND).await;
        let stats = h.transport.stats();
        assert_eq!(stats.channels_closed, 1);
        assert_eq!(stats.factories_closed, 1);
        assert!(h.cache.is_empty());
    }
}
