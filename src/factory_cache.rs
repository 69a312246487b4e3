//! Reference-counted cache of opened channel factories.
//!
//! Factories are expensive to build and open, so proxies targeting the same endpoint with the
//! default construction context share one. Sharing rules:
//! - Only live (opened) entries are handed out; dead entries are discarded on the next acquire.
//! - Concurrent builders race to publish; the first writer wins and later builders discard their
//!   own factory and join the published one.
//! - Eviction is purely reference counted. An entry is removed when its last handle is released
//!   or when [`ChannelFactoryCache::invalidate`] proves it bad.
//!
//! Reference counts only change while the map lock is held, so an entry can never drop to zero
//! and be evicted while another acquirer is about to reuse it. The lock is never held across
//! network I/O.

use crate::connector::BoundedConnector;
use crate::endpoint::Endpoint;
use crate::error::TransportError;
use crate::transport::{Channel, ChannelFactory, CommunicationState, ConstructionContext, Transport};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// How a handle gives up its reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Graceful: the last release closes the factory in the background.
    Close,
    /// The owning proxy is aborting: the last release aborts the factory immediately.
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FactoryKey {
    contract: String,
    endpoint: Endpoint,
}

struct Entry {
    factory: Arc<dyn ChannelFactory>,
    refs: AtomicUsize,
    close_timeout: Duration,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.factory.state() == CommunicationState::Opened
    }
}

struct CacheInner {
    transport: Arc<dyn Transport>,
    connector: BoundedConnector,
    entries: Mutex<HashMap<FactoryKey, Arc<Entry>>>,
}

impl CacheInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<FactoryKey, Arc<Entry>>> {
        // Map operations never leave it half-updated, so a poisoned lock is still usable.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared, reference-counted channel factories keyed by `(contract, endpoint)`.
#[derive(Clone)]
pub struct ChannelFactoryCache {
    inner: Arc<CacheInner>,
}

impl fmt::Debug for ChannelFactoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelFactoryCache").field("entries", &self.entries()).finish()
    }
}

impl ChannelFactoryCache {
    pub fn new(transport: Arc<dyn Transport>, connector: BoundedConnector) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                transport,
                connector,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Connector used for factory opens; proxies reuse it for channel opens.
    pub fn connector(&self) -> &BoundedConnector {
        &self.inner.connector
    }

    /// Acquire a factory for `endpoint`.
    ///
    /// Shareable contexts reuse a live cached factory when one exists. Otherwise a new factory
    /// is built and opened within `open_timeout`; if shareable it is published to the cache.
    pub async fn acquire(
        &self,
        contract: &str,
        endpoint: &Endpoint,
        context: &ConstructionContext,
        open_timeout: Duration,
        close_timeout: Duration,
    ) -> Result<FactoryHandle, TransportError> {
        let key = FactoryKey { contract: contract.to_string(), endpoint: endpoint.clone() };
        let shareable = context.is_shareable();

        if shareable {
            if let Some(handle) = self.try_reuse(&key) {
                return Ok(handle);
            }
        }

        let factory = self.inner.transport.create_factory(contract, endpoint, context)?;
        if let Err(err) = self.inner.connector.open_factory(factory.clone(), open_timeout).await {
            factory.abort();
            return Err(err.into());
        }

        if !shareable {
            debug!(contract, endpoint = %endpoint, "built private channel factory");
            return Ok(FactoryHandle::private(factory, close_timeout));
        }

        let entry = {
            let mut map = self.inner.lock();
            match map.get(&key) {
                Some(existing) if existing.is_live() => {
                    existing.refs.fetch_add(1, Ordering::AcqRel);
                    let existing = existing.clone();
                    drop(map);
                    debug!(contract, endpoint = %endpoint, "lost publish race; discarding new factory");
                    factory.abort();
                    existing
                }
                _ => {
                    let entry =
                        Arc::new(Entry { factory, refs: AtomicUsize::new(1), close_timeout });
                    map.insert(key.clone(), entry.clone());
                    debug!(contract, endpoint = %endpoint, "published shared channel factory");
                    entry
                }
            }
        };
        Ok(FactoryHandle::shared(self.inner.clone(), key, entry))
    }

    fn try_reuse(&self, key: &FactoryKey) -> Option<FactoryHandle> {
        let mut map = self.inner.lock();
        let entry = map.get(key)?.clone();
        if entry.is_live() {
            entry.refs.fetch_add(1, Ordering::AcqRel);
            drop(map);
            debug!(contract = %key.contract, endpoint = %key.endpoint, "reusing shared channel factory");
            return Some(FactoryHandle::shared(self.inner.clone(), key.clone(), entry));
        }
        // Dead entry: unpublish it. Remaining holders dispose of it on their last release.
        map.remove(key);
        drop(map);
        debug!(contract = %key.contract, endpoint = %key.endpoint, "discarding dead cached factory");
        None
    }

    /// Remove the cached factory for `endpoint` unconditionally. Outstanding handles stay valid
    /// until released; new acquirers build a fresh factory.
    pub fn invalidate(&self, contract: &str, endpoint: &Endpoint) -> bool {
        let key = FactoryKey { contract: contract.to_string(), endpoint: endpoint.clone() };
        let removed = self.inner.lock().remove(&key).is_some();
        if removed {
            warn!(contract, endpoint = %endpoint, "shared channel factory invalidated");
        }
        removed
    }

    /// Snapshot of `(contract, endpoint address, ref count)` sorted by contract then address.
    pub fn entries(&self) -> Vec<(String, String, usize)> {
        let map = self.inner.lock();
        let mut out: Vec<_> = map
            .iter()
            .map(|(k, e)| {
                (k.contract.clone(), k.endpoint.address().to_string(), e.refs.load(Ordering::Acquire))
            })
            .collect();
        drop(map);
        out.sort();
        out
    }

    /// Reference count of the cached entry for `endpoint`, if one is published.
    pub fn ref_count(&self, contract: &str, endpoint: &Endpoint) -> Option<usize> {
        let key = FactoryKey { contract: contract.to_string(), endpoint: endpoint.clone() };
        self.inner.lock().get(&key).map(|e| e.refs.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Ownership {
    Shared { cache: Arc<CacheInner>, key: FactoryKey, entry: Arc<Entry> },
    Private { factory: Arc<dyn ChannelFactory>, close_timeout: Duration },
    Released,
}

/// A proxy's reference to a channel factory.
///
/// Dropping the handle releases it with [`ReleaseMode::Close`].
pub struct FactoryHandle {
    ownership: Ownership,
}

impl fmt::Debug for FactoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.ownership {
            Ownership::Shared { .. } => "shared",
            Ownership::Private { .. } => "private",
            Ownership::Released => "released",
        };
        f.debug_struct("FactoryHandle").field("kind", &kind).finish()
    }
}

impl FactoryHandle {
    fn shared(cache: Arc<CacheInner>, key: FactoryKey, entry: Arc<Entry>) -> Self {
        Self { ownership: Ownership::Shared { cache, key, entry } }
    }

    fn private(factory: Arc<dyn ChannelFactory>, close_timeout: Duration) -> Self {
        Self { ownership: Ownership::Private { factory, close_timeout } }
    }

    /// Whether this handle references a cached, shared factory.
    pub fn is_shared(&self) -> bool {
        matches!(self.ownership, Ownership::Shared { .. })
    }

    fn factory(&self) -> Option<&Arc<dyn ChannelFactory>> {
        match &self.ownership {
            Ownership::Shared { entry, .. } => Some(&entry.factory),
            Ownership::Private { factory, .. } => Some(factory),
            Ownership::Released => None,
        }
    }

    pub fn state(&self) -> CommunicationState {
        self.factory().map_or(CommunicationState::Closed, |f| f.state())
    }

    /// Create a channel from the underlying factory.
    pub async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        match self.factory() {
            Some(factory) => factory.create_channel().await,
            None => Err(TransportError::Disposed),
        }
    }

    /// Give up this reference. The last reference disposes of the factory according to `mode`.
    pub fn release(mut self, mode: ReleaseMode) {
        if let Some((factory, close_timeout)) = self.take_last_reference() {
            dispose_in_background(factory, mode, close_timeout);
        }
    }

    /// Give up this reference, awaiting a graceful close if it was the last one.
    pub async fn close(mut self) {
        if let Some((factory, close_timeout)) = self.take_last_reference() {
            if let Err(err) = factory.close(close_timeout).await {
                debug!(error = %err, "factory close failed; aborting");
                factory.abort();
            }
        }
    }

    /// Decrement the reference count. Returns the factory when this was the last reference.
    fn take_last_reference(&mut self) -> Option<(Arc<dyn ChannelFactory>, Duration)> {
        match std::mem::replace(&mut self.ownership, Ownership::Released) {
            Ownership::Shared { cache, key, entry } => {
                let mut map = cache.lock();
                let previous = entry.refs.fetch_sub(1, Ordering::AcqRel);
                if previous > 1 {
                    return None;
                }
                if map.get(&key).is_some_and(|current| Arc::ptr_eq(current, &entry)) {
                    map.remove(&key);
                }
                drop(map);
                debug!(contract = %key.contract, endpoint = %key.endpoint, "last reference released; evicted");
                Some((entry.factory.clone(), entry.close_timeout))
            }
            Ownership::Private { factory, close_timeout } => Some((factory, close_timeout)),
            Ownership::Released => None,
        }
    }
}

impl Drop for FactoryHandle {
    fn drop(&mut self) {
        if let Some((factory, close_timeout)) = self.take_last_reference() {
            dispose_in_background(factory, ReleaseMode::Close, close_timeout);
        }
    }
}

fn dispose_in_background(
    factory: Arc<dyn ChannelFactory>,
    mode: ReleaseMode,
    close_timeout: Duration,
) {
    let runtime = tokio::runtime::Handle::try_current();
    match (mode, runtime) {
        (ReleaseMode::Close, Ok(runtime)) => {
            runtime.spawn(async move {
                if let Err(err) = factory.close(close_timeout).await {
                    debug!(error = %err, "background factory close failed; aborting");
                    factory.abort();
                }
            });
        }
        _ => factory.abort(),
    }
}
