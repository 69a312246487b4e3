//! Live-updatable configuration handle.
//!
//! Readers take a cheap `Arc` snapshot per invocation, so a reload never changes the settings
//! under a call that is already running. The default backend is `ArcSwap` (lock-free reads); the
//! `adaptive-rwlock` feature switches to `RwLock`.

use std::sync::Arc;

#[cfg(feature = "adaptive-rwlock")]
use std::sync::{PoisonError, RwLock};

#[cfg(not(feature = "adaptive-rwlock"))]
use arc_swap::ArcSwap;

/// Shared configuration value that can be replaced while proxies are running.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    #[cfg(not(feature = "adaptive-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "adaptive-rwlock")]
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(Arc::new(value))) }
        }
    }

    /// Current snapshot.
    pub fn get(&self) -> Arc<T> {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.load_full()
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    /// Replace the value, returning the previous snapshot.
    pub fn set(&self, value: T) -> Arc<T> {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.swap(Arc::new(value))
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *guard, Arc::new(value))
        }
    }

    /// Derive a new value from the current one. Concurrent updates may lose writes; callers that
    /// need read-modify-write atomicity should serialize their updates.
    pub fn update<F>(&self, f: F) -> Arc<T>
    where
        F: FnOnce(&T) -> T,
    {
        let next = Arc::new(f(&self.get()));
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.store(next.clone());
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            *self.inner.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::DynamicConfig;
    use crate::config::{ClientConfig, ContractConfig};
    use std::time::Duration;

    #[test]
    fn snapshots_are_stable_across_updates() {
        let live = DynamicConfig::new(
            ClientConfig::new().with_contract("c", ContractConfig::with_addresses("tcp", ["a"])),
        );
        let before = live.get();

        let after = live.update(|cfg| {
            let mut cfg = cfg.clone();
            if let Some(c) = cfg.contracts.get_mut("c") {
                c.cooldown = Duration::from_secs(1);
            }
            cfg
        });

        assert_eq!(before.contracts["c"].cooldown, Duration::from_secs(30));
        assert_eq!(after.contracts["c"].cooldown, Duration::from_secs(1));
        assert_eq!(live.get().contracts["c"].cooldown, Duration::from_secs(1));
    }

    #[test]
    fn set_returns_previous_value() {
        let live = DynamicConfig::new(1_u32);
        let old = live.set(2);
        assert_eq!(*old, 1);
        assert_eq!(*live.get(), 2);
    }
}
