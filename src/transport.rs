//! Interfaces to the underlying RPC runtime.
//!
//! The wire protocol is not implemented here. A transport hands out channel factories for
//! endpoints; factories hand out channels; channels carry one [`Invocation`] at a time.

use crate::endpoint::{Binding, Endpoint};
use crate::error::TransportError;
use crate::invocation::Invocation;
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle state of a communication object (factory or channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommunicationState {
    Created,
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
}

impl CommunicationState {
    /// Closed and Faulted objects are never reused.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed | Self::Faulted)
    }
}

/// One logical connection to an endpoint.
///
/// Implementations may assume a channel is never invoked by two callers at once.
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    fn state(&self) -> CommunicationState;

    /// Open the channel. `timeout` is the transport-level bound and may be longer than the
    /// caller's deadline.
    async fn open(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Send one request and wait for its response.
    async fn invoke(&self, request: &Invocation) -> Result<serde_json::Value, TransportError>;

    /// Graceful close.
    async fn close(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Immediate teardown. Must not block.
    fn abort(&self);
}

/// Builds channels for one endpoint. Expensive to construct, safe to share once opened.
#[async_trait]
pub trait ChannelFactory: Send + Sync + fmt::Debug {
    fn state(&self) -> CommunicationState;

    async fn open(&self, timeout: Duration) -> Result<(), TransportError>;

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError>;

    async fn close(&self, timeout: Duration) -> Result<(), TransportError>;

    fn abort(&self);
}

/// Entry point into the RPC runtime.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Construct (but do not open) a channel factory for `endpoint`.
    fn create_factory(
        &self,
        contract: &str,
        endpoint: &Endpoint,
        context: &ConstructionContext,
    ) -> Result<Arc<dyn ChannelFactory>, TransportError>;
}

/// How a proxy's channel factory is constructed.
///
/// Only [`ConstructionContext::Shared`] factories are published to the factory cache. Every other
/// variant produces a private factory owned by one proxy.
#[derive(Clone, Default)]
pub enum ConstructionContext {
    /// Default construction, shareable across proxies for the same endpoint.
    #[default]
    Shared,
    /// Default construction, but pinned to one proxy.
    Private,
    /// Duplex construction with a callback instance.
    Callback(Arc<dyn Any + Send + Sync>),
    /// Construction with an explicit binding object instead of the configured one.
    Binding(Binding),
}

/// Hashable identity of a [`ConstructionContext`], used to key cached proxies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContextKey {
    Shared,
    Private,
    Callback(usize),
    Binding(Binding),
}

impl ConstructionContext {
    pub fn callback<T: Any + Send + Sync>(instance: T) -> Self {
        Self::Callback(Arc::new(instance))
    }

    pub fn is_shareable(&self) -> bool {
        matches!(self, Self::Shared)
    }

    pub fn key(&self) -> ContextKey {
        match self {
            Self::Shared => ContextKey::Shared,
            Self::Private => ContextKey::Private,
            Self::Callback(instance) => {
                ContextKey::Callback(Arc::as_ptr(instance) as *const () as usize)
            }
            Self::Binding(binding) => ContextKey::Binding(binding.clone()),
        }
    }

    /// The context a shared proxy moves to once it has been finalized to non-shared.
    pub(crate) fn finalized(&self) -> Self {
        match self {
            Self::Shared => Self::Private,
            other => other.clone(),
        }
    }
}

impl fmt::Debug for ConstructionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => f.write_str("Shared"),
            Self::Private => f.write_str("Private"),
            Self::Callback(_) => f.write_str("Callback(..)"),
            Self::Binding(binding) => f.debug_tuple("Binding").field(binding).finish(),
        }
    }
}
