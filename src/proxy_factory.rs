//! Entry point for application code: hands out contract proxies under a cache mode.
//!
//! The cache mode decides how long a [`ResilientProxy`] (and therefore its channel) lives:
//!
//! | mode | proxy lifetime |
//! |------|----------------|
//! | [`CacheMode::PerCall`] | one invocation |
//! | [`CacheMode::PerThread`] | the calling OS thread, until a call fails |
//! | [`CacheMode::PerLogicalRequest`] | the enclosing [`RequestScope`]; per call without one |
//! | [`CacheMode::PerEndpoint`] | the factory; one proxy per contract and endpoint |
//!
//! Factory sharing underneath is decided only by the [`ChannelFactoryCache`].

use crate::classify::Classifier;
use crate::clock::{Clock, MonotonicClock};
use crate::config::{CallSettings, ClientConfig, ConfigSource, ContractConfig};
use crate::connector::{BoundedConnector, DEFAULT_CONNECT_GRACE};
use crate::contract::{Contract, Proxy};
use crate::endpoint::Endpoint;
use crate::error::InvocationError;
use crate::factory_cache::ChannelFactoryCache;
use crate::invocation::Invocation;
use crate::proxy::{CallOutcome, ResilientProxy};
use crate::registry::EndpointRegistry;
use crate::telemetry::{
    render_parameters, InvocationOutcome, InvocationRecord, SinkHandle, TelemetrySink, REDACTED,
};
use crate::transport::{ConstructionContext, ContextKey, Transport};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// How long a proxy and its channel are reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheMode {
    PerCall,
    PerThread,
    PerLogicalRequest,
    PerEndpoint,
}

impl CacheMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PerCall => "per_call",
            Self::PerThread => "per_thread",
            Self::PerLogicalRequest => "per_logical_request",
            Self::PerEndpoint => "per_endpoint",
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

tokio::task_local! {
    static REQUEST_SCOPE: RequestScope;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ScopeKey {
    factory: usize,
    contract: &'static str,
    context: ContextKey,
}

#[derive(Default)]
struct ScopeInner {
    proxies: Mutex<HashMap<ScopeKey, (ResilientProxy, Duration)>>,
}

/// A unit of work (typically one inbound request) whose proxies are reused for its duration.
///
/// Proxies obtained with [`CacheMode::PerLogicalRequest`] inside [`RequestScope::run`] are kept in
/// the scope and closed when the scope's future completes. [`RequestScope::release`] closes them
/// early.
#[derive(Clone, Default)]
pub struct RequestScope {
    inner: Arc<ScopeInner>,
}

impl fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestScope").field("proxies", &self.len()).finish()
    }
}

impl RequestScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` inside this scope, then release every proxy it cached.
    pub async fn run<F: Future>(self, fut: F) -> F::Output {
        let output = REQUEST_SCOPE.scope(self.clone(), fut).await;
        self.release().await;
        output
    }

    /// Scope of the current task, if any.
    pub fn current() -> Option<RequestScope> {
        REQUEST_SCOPE.try_with(Clone::clone).ok()
    }

    /// Close every proxy cached in this scope.
    pub async fn release(&self) {
        let drained: Vec<_> = lock(&self.inner.proxies).drain().map(|(_, v)| v).collect();
        if !drained.is_empty() {
            debug!(proxies = drained.len(), "releasing request scope");
        }
        for (proxy, close_timeout) in drained {
            proxy.close(close_timeout).await;
        }
    }

    /// Number of proxies currently held by the scope.
    pub fn len(&self) -> usize {
        lock(&self.inner.proxies).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn checkout(&self, key: &ScopeKey) -> Option<ResilientProxy> {
        lock(&self.inner.proxies).remove(key).map(|(proxy, _)| proxy)
    }

    /// Put a proxy back. Returns it when the slot was filled meanwhile.
    fn put_back(
        &self,
        key: ScopeKey,
        proxy: ResilientProxy,
        close_timeout: Duration,
    ) -> Option<ResilientProxy> {
        let mut proxies = lock(&self.inner.proxies);
        if proxies.contains_key(&key) {
            return Some(proxy);
        }
        proxies.insert(key, (proxy, close_timeout));
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ThreadSlot {
    thread: ThreadId,
    contract: &'static str,
    context: ContextKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointSlot {
    contract: &'static str,
    endpoint: Endpoint,
    context: ContextKey,
}

type SharedSlot = Arc<tokio::sync::Mutex<Option<ResilientProxy>>>;

struct FactoryInner {
    config: Arc<dyn ConfigSource>,
    cache: ChannelFactoryCache,
    classifier: Classifier,
    clock: Arc<dyn Clock>,
    sink: SinkHandle,
    registries: Mutex<HashMap<String, Arc<EndpointRegistry>>>,
    per_thread: Mutex<HashMap<ThreadSlot, (ResilientProxy, Duration)>>,
    per_endpoint: Mutex<HashMap<EndpointSlot, (SharedSlot, Duration)>>,
}

/// Creates and caches contract proxies.
#[derive(Clone)]
pub struct ProxyFactory {
    inner: Arc<FactoryInner>,
}

impl fmt::Debug for ProxyFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyFactory")
            .field("config", &self.inner.config)
            .field("cache", &self.inner.cache)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ProxyFactory`].
pub struct ProxyFactoryBuilder {
    transport: Arc<dyn Transport>,
    config: Arc<dyn ConfigSource>,
    sink: SinkHandle,
    clock: Arc<dyn Clock>,
    classifier: Classifier,
    connect_grace: Duration,
}

impl fmt::Debug for ProxyFactoryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyFactoryBuilder")
            .field("transport", &self.transport)
            .field("config", &self.config)
            .field("connect_grace", &self.connect_grace)
            .finish_non_exhaustive()
    }
}

impl ProxyFactoryBuilder {
    /// Configuration source consulted on every invocation.
    pub fn config<S: ConfigSource + 'static>(mut self, source: S) -> Self {
        self.config = Arc::new(source);
        self
    }

    /// Sink receiving one [`InvocationRecord`] per logical invocation.
    pub fn sink<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        self.sink = SinkHandle::new(sink);
        self
    }

    /// Clock for endpoint cooldowns.
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Extra time the connect worker is given beyond the caller's open timeout.
    pub fn connect_grace(mut self, grace: Duration) -> Self {
        self.connect_grace = grace;
        self
    }

    pub fn build(self) -> ProxyFactory {
        let connector = BoundedConnector::new(self.connect_grace);
        ProxyFactory {
            inner: Arc::new(FactoryInner {
                config: self.config,
                cache: ChannelFactoryCache::new(self.transport, connector),
                classifier: self.classifier,
                clock: self.clock,
                sink: self.sink,
                registries: Mutex::new(HashMap::new()),
                per_thread: Mutex::new(HashMap::new()),
                per_endpoint: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl ProxyFactory {
    pub fn builder<T: Transport + 'static>(transport: T) -> ProxyFactoryBuilder {
        ProxyFactoryBuilder {
            transport: Arc::new(transport),
            config: Arc::new(ClientConfig::default()),
            sink: SinkHandle::default(),
            clock: Arc::new(MonotonicClock::default()),
            classifier: Classifier::default(),
            connect_grace: DEFAULT_CONNECT_GRACE,
        }
    }

    /// Factory with default sink, clock and classifier.
    pub fn new<T, S>(transport: T, config: S) -> Self
    where
        T: Transport + 'static,
        S: ConfigSource + 'static,
    {
        Self::builder(transport).config(config).build()
    }

    /// Proxy for contract `C` under `mode`.
    ///
    /// Fails with [`InvocationError::UnsupportedCacheMode`] when `mode` is
    /// [`CacheMode::PerEndpoint`] and the contract is not safe to interleave on a shared channel.
    pub fn get_proxy<C: Contract>(&self, mode: CacheMode) -> Result<Proxy<C>, InvocationError> {
        if mode == CacheMode::PerEndpoint && !C::INTERLEAVE_SAFE {
            return Err(InvocationError::UnsupportedCacheMode {
                contract: C::NAME.to_string(),
                mode: mode.as_str(),
            });
        }
        Ok(Proxy::new(self.clone(), mode, ConstructionContext::Shared))
    }

    /// The shared channel factory cache.
    pub fn factory_cache(&self) -> &ChannelFactoryCache {
        &self.inner.cache
    }

    /// Endpoint registry for `contract`, once a call has built it.
    pub fn registry(&self, contract: &str) -> Option<Arc<EndpointRegistry>> {
        lock(&self.inner.registries).get(contract).cloned()
    }

    /// Number of proxies held by the per-thread and per-endpoint caches.
    pub fn cached_proxies(&self) -> usize {
        let per_thread = lock(&self.inner.per_thread).len();
        let per_endpoint = lock(&self.inner.per_endpoint).len();
        per_thread + per_endpoint
    }

    /// Close the calling thread's per-thread proxies. Call when a worker thread ends.
    pub async fn release_thread(&self) {
        let thread = std::thread::current().id();
        let released: Vec<_> = {
            let mut slots = lock(&self.inner.per_thread);
            let keys: Vec<_> = slots.keys().filter(|k| k.thread == thread).cloned().collect();
            keys.into_iter().filter_map(|k| slots.remove(&k)).collect()
        };
        for (proxy, close_timeout) in released {
            proxy.close(close_timeout).await;
        }
    }

    /// Close every cached proxy. The factory stays usable; later calls build new proxies.
    pub async fn shutdown(&self) {
        let threads: Vec<_> = lock(&self.inner.per_thread).drain().map(|(_, v)| v).collect();
        let endpoints: Vec<_> = lock(&self.inner.per_endpoint).drain().map(|(_, v)| v).collect();
        info!(
            per_thread = threads.len(),
            per_endpoint = endpoints.len(),
            "shutting down proxy factory"
        );
        for (proxy, close_timeout) in threads {
            proxy.close(close_timeout).await;
        }
        for (slot, close_timeout) in endpoints {
            if let Some(proxy) = slot.lock().await.take() {
                proxy.close(close_timeout).await;
            }
        }
    }

    /// Run one logical invocation of `contract` and report it to the sink.
    pub(crate) async fn execute(
        &self,
        contract: &'static str,
        mode: CacheMode,
        context: &ConstructionContext,
        request: &Invocation,
    ) -> Result<serde_json::Value, InvocationError> {
        let started = Instant::now();
        let config = self.inner.config.contract(contract);
        let (effective_mode, outcome) = match &config {
            None => (
                mode,
                CallOutcome {
                    result: Err(InvocationError::UnknownContract(contract.to_string())),
                    attempts: Vec::new(),
                },
            ),
            Some(config) => match config.validate(contract) {
                Err(err) => (mode, CallOutcome { result: Err(err.into()), attempts: Vec::new() }),
                Ok(()) => self.dispatch(contract, mode, context, config, request).await,
            },
        };

        let parameters = match &config {
            Some(config) => render_parameters(request, &config.redacted_parameters),
            None => request.parameters.iter().map(|p| (p.name.clone(), REDACTED.to_string())).collect(),
        };
        let record = InvocationRecord {
            id: uuid::Uuid::new_v4(),
            contract: contract.to_string(),
            operation: request.operation.clone(),
            cache_mode: effective_mode,
            parameters,
            outcome: match &outcome.result {
                Ok(_) => InvocationOutcome::Succeeded,
                Err(InvocationError::Fault { code, .. }) => {
                    InvocationOutcome::Faulted { code: code.clone() }
                }
                Err(err) => InvocationOutcome::Failed { code: err.code() },
            },
            attempts: outcome.attempts,
            total_elapsed: started.elapsed(),
        };
        self.inner.sink.emit(record).await;
        outcome.result
    }

    /// Optimistically open a cached proxy's channel. Returns whether a channel is ready.
    pub(crate) async fn warm_up(
        &self,
        contract: &'static str,
        mode: CacheMode,
        context: &ConstructionContext,
    ) -> bool {
        let Some(config) = self.inner.config.contract(contract) else {
            return false;
        };
        if config.validate(contract).is_err() {
            return false;
        }
        let registry = self.registry_for(contract, &config);
        let settings = config.settings_for("");
        match mode {
            CacheMode::PerCall => false,
            CacheMode::PerThread => {
                let key = ThreadSlot {
                    thread: std::thread::current().id(),
                    contract,
                    context: context.key(),
                };
                let mut proxy = self.checkout_thread(&key, context);
                let ready = proxy.preopen(&registry, &settings).await;
                self.return_thread(key, proxy, &settings).await;
                ready
            }
            CacheMode::PerLogicalRequest => match RequestScope::current() {
                None => false,
                Some(scope) => {
                    let key = self.scope_key(contract, context);
                    let mut proxy = scope.checkout(&key).unwrap_or_else(|| {
                        self.new_proxy(contract, CacheMode::PerLogicalRequest, context)
                    });
                    let ready = proxy.preopen(&registry, &settings).await;
                    if let Some(extra) = scope.put_back(key, proxy, settings.close_timeout) {
                        extra.close(settings.close_timeout).await;
                    }
                    ready
                }
            },
            CacheMode::PerEndpoint => {
                let Some(endpoint) = registry.preferred_endpoint() else {
                    return false;
                };
                let slot = self.endpoint_slot(contract, &endpoint, context, &settings);
                let mut guard = slot.lock().await;
                let proxy = guard.get_or_insert_with(|| {
                    let mut proxy = self.new_proxy(contract, CacheMode::PerEndpoint, context);
                    proxy.target(&endpoint);
                    proxy
                });
                proxy.preopen(&registry, &settings).await
            }
        }
    }

    async fn dispatch(
        &self,
        contract: &'static str,
        mode: CacheMode,
        context: &ConstructionContext,
        config: &ContractConfig,
        request: &Invocation,
    ) -> (CacheMode, CallOutcome) {
        let registry = self.registry_for(contract, config);
        let settings = config.settings_for(&request.operation);
        match mode {
            CacheMode::PerCall => {
                (mode, self.per_call(contract, context, &registry, &settings, request).await)
            }
            CacheMode::PerThread => {
                (mode, self.per_thread(contract, context, &registry, &settings, request).await)
            }
            CacheMode::PerLogicalRequest => match RequestScope::current() {
                Some(scope) => (
                    mode,
                    self.per_request(&scope, contract, context, &registry, &settings, request)
                        .await,
                ),
                None => (
                    CacheMode::PerCall,
                    self.per_call(contract, context, &registry, &settings, request).await,
                ),
            },
            CacheMode::PerEndpoint => {
                (mode, self.per_endpoint(contract, context, &registry, &settings, request).await)
            }
        }
    }

    async fn per_call(
        &self,
        contract: &'static str,
        context: &ConstructionContext,
        registry: &EndpointRegistry,
        settings: &CallSettings,
        request: &Invocation,
    ) -> CallOutcome {
        let mut proxy = self.new_proxy(contract, CacheMode::PerCall, context);
        let outcome = proxy.invoke(registry, settings, request).await;
        proxy.close(settings.close_timeout).await;
        outcome
    }

    async fn per_thread(
        &self,
        contract: &'static str,
        context: &ConstructionContext,
        registry: &EndpointRegistry,
        settings: &CallSettings,
        request: &Invocation,
    ) -> CallOutcome {
        let key =
            ThreadSlot { thread: std::thread::current().id(), contract, context: context.key() };
        let mut proxy = self.checkout_thread(&key, context);
        let outcome = proxy.invoke(registry, settings, request).await;
        self.return_thread(key, proxy, settings).await;
        outcome
    }

    fn checkout_thread(&self, key: &ThreadSlot, context: &ConstructionContext) -> ResilientProxy {
        match lock(&self.inner.per_thread).remove(key) {
            Some((proxy, _)) => proxy,
            None => self.new_proxy(key.contract, CacheMode::PerThread, context),
        }
    }

    /// Return a checked-out proxy to its thread slot. Faulted proxies are discarded.
    async fn return_thread(&self, key: ThreadSlot, proxy: ResilientProxy, settings: &CallSettings) {
        let discard = if proxy.is_faulted() {
            Some(proxy)
        } else {
            let mut slots = lock(&self.inner.per_thread);
            if slots.contains_key(&key) {
                Some(proxy)
            } else {
                slots.insert(key, (proxy, settings.close_timeout));
                None
            }
        };
        if let Some(proxy) = discard {
            proxy.close(settings.close_timeout).await;
        }
    }

    fn scope_key(&self, contract: &'static str, context: &ConstructionContext) -> ScopeKey {
        ScopeKey { factory: Arc::as_ptr(&self.inner) as usize, contract, context: context.key() }
    }

    async fn per_request(
        &self,
        scope: &RequestScope,
        contract: &'static str,
        context: &ConstructionContext,
        registry: &EndpointRegistry,
        settings: &CallSettings,
        request: &Invocation,
    ) -> CallOutcome {
        let key = self.scope_key(contract, context);
        let mut proxy = scope
            .checkout(&key)
            .unwrap_or_else(|| self.new_proxy(contract, CacheMode::PerLogicalRequest, context));
        let outcome = proxy.invoke(registry, settings, request).await;
        let discard = if proxy.is_faulted() {
            Some(proxy)
        } else {
            scope.put_back(key, proxy, settings.close_timeout)
        };
        if let Some(proxy) = discard {
            proxy.close(settings.close_timeout).await;
        }
        outcome
    }

    fn endpoint_slot(
        &self,
        contract: &'static str,
        endpoint: &Endpoint,
        context: &ConstructionContext,
        settings: &CallSettings,
    ) -> SharedSlot {
        let key = EndpointSlot { contract, endpoint: endpoint.clone(), context: context.key() };
        lock(&self.inner.per_endpoint)
            .entry(key)
            .or_insert_with(|| (SharedSlot::default(), settings.close_timeout))
            .0
            .clone()
    }

    /// Callers share one proxy per endpoint and take turns on its channel.
    async fn per_endpoint(
        &self,
        contract: &'static str,
        context: &ConstructionContext,
        registry: &EndpointRegistry,
        settings: &CallSettings,
        request: &Invocation,
    ) -> CallOutcome {
        let Some(endpoint) = registry.get_eligible_endpoint(&Default::default(), 0) else {
            return CallOutcome {
                result: Err(InvocationError::NoEndpoint { contract: contract.to_string() }),
                attempts: Vec::new(),
            };
        };
        let slot = self.endpoint_slot(contract, &endpoint, context, settings);
        let mut guard = slot.lock().await;
        let proxy = guard.get_or_insert_with(|| {
            let mut proxy = self.new_proxy(contract, CacheMode::PerEndpoint, context);
            proxy.target(&endpoint);
            proxy
        });
        let outcome = proxy.invoke(registry, settings, request).await;

        // A proxy that failed over now belongs to another endpoint; the slot starts fresh.
        let stale = proxy.is_faulted() || proxy.endpoint() != Some(&endpoint);
        let discard = if stale { guard.take() } else { None };
        drop(guard);
        if let Some(proxy) = discard {
            proxy.close(settings.close_timeout).await;
        }
        outcome
    }

    fn new_proxy(
        &self,
        contract: &'static str,
        mode: CacheMode,
        context: &ConstructionContext,
    ) -> ResilientProxy {
        ResilientProxy::new(
            contract,
            mode,
            context.clone(),
            self.inner.cache.clone(),
            self.inner.classifier.clone(),
        )
    }

    /// The contract's registry, rebuilt when the configured endpoints, cooldown or retry cap
    /// change. Health of endpoints that remain configured carries over.
    fn registry_for(&self, contract: &str, config: &ContractConfig) -> Arc<EndpointRegistry> {
        let endpoints = config.endpoint_list();
        let mut registries = lock(&self.inner.registries);
        if let Some(existing) = registries.get(contract) {
            if existing.matches(&endpoints)
                && existing.cooldown() == config.cooldown
                && existing.max_retry_count() == config.max_retry_count
            {
                return existing.clone();
            }
            let rebuilt =
                Arc::new(existing.rebuild(endpoints, config.cooldown, config.max_retry_count));
            info!(contract, endpoints = rebuilt.len(), "endpoint registry rebuilt from new configuration");
            registries.insert(contract.to_string(), rebuilt.clone());
            return rebuilt;
        }
        let registry = Arc::new(EndpointRegistry::with_clock(
            endpoints,
            config.cooldown,
            config.max_retry_count,
            self.inner.clock.clone(),
        ));
        registries.insert(contract.to_string(), registry.clone());
        registry
    }
}
