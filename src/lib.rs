#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Lifeline
//!
//! Resilient remote invocation for async Rust: callers talk to a typed contract proxy and never
//! see which server answered, how many endpoints were tried, or how channels are pooled.
//!
//! ## Features
//!
//! - **Endpoint failover** across an ordered endpoint list, with per-endpoint cooldowns
//! - **Failure classification** into faults, channel-local errors, endpoint-down and timeouts
//! - **Shared channel factories**, reference counted per contract and endpoint
//! - **Bounded connects** that never leave the caller waiting past its open timeout
//! - **Proxy caching** per call, per thread, per logical request or per endpoint
//! - **Invocation records** for every call, delivered to pluggable `tower` sinks
//! - **Live configuration** through lock-free snapshots
//!
//! ## Quick Start
//!
//! ```rust
//! use lifeline::mock::MockTransport;
//! use lifeline::{CacheMode, ClientConfig, Contract, ContractConfig, Invocation, ProxyFactory};
//!
//! struct Inventory;
//!
//! impl Contract for Inventory {
//!     const NAME: &'static str = "inventory";
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), lifeline::InvocationError> {
//!     let config = ClientConfig::new().with_contract(
//!         "inventory",
//!         ContractConfig::with_addresses("mock", ["primary", "backup"]),
//!     );
//!     let factory = ProxyFactory::new(MockTransport::new(), config);
//!
//!     let proxy = factory.get_proxy::<Inventory>(CacheMode::PerCall)?;
//!     let reply = proxy.invoke_raw(Invocation::new("stock_level")).await?;
//!     assert_eq!(reply["operation"], "stock_level");
//!     Ok(())
//! }
//! ```

pub mod adaptive;
pub mod classify;
pub mod clock;
pub mod config;
pub mod connector;
pub mod contract;
pub mod endpoint;
pub mod error;
pub mod factory_cache;
pub mod invocation;
/// In-memory transport and clock for tests and demos.
pub mod mock;
pub mod proxy;
pub mod proxy_factory;
pub mod registry;
pub mod telemetry;
pub mod transport;

// Re-exports
pub use adaptive::DynamicConfig;
pub use classify::Classifier;
pub use clock::{Clock, MonotonicClock};
pub use config::{
    CallSettings, ClientConfig, ConfigSource, ContractConfig, EndpointConfig, OperationConfig,
};
pub use connector::BoundedConnector;
pub use contract::{Contract, Proxy};
pub use endpoint::{Binding, Endpoint, HealthStatus};
pub use error::{ConfigError, ErrorCode, FailureKind, InvocationError, TransportError};
pub use factory_cache::{ChannelFactoryCache, FactoryHandle, ReleaseMode};
pub use invocation::{Invocation, InvocationBuilder, ResultEnvelope, ServiceError, ServiceResult};
pub use proxy::ResilientProxy;
pub use proxy_factory::{CacheMode, ProxyFactory, ProxyFactoryBuilder, RequestScope};
pub use registry::EndpointRegistry;
pub use telemetry::{
    InvocationOutcome, InvocationRecord, LogSink, MemorySink, NonBlockingSink, NullSink,
    TelemetrySink,
};
pub use transport::{
    Channel, ChannelFactory, CommunicationState, ConstructionContext, ContextKey, Transport,
};
