//! Typed service contracts and the proxies that call them.
//!
//! A contract is a marker type naming a remote service. [`Proxy<C>`] dispatches
//! [`Invocation`]s for it through a [`ProxyFactory`], and the [`contract!`](crate::contract!)
//! macro generates a typed client whose methods build those invocations.

use crate::error::InvocationError;
use crate::invocation::{Invocation, ResultEnvelope};
use crate::proxy_factory::{CacheMode, ProxyFactory};
use crate::transport::ConstructionContext;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;
use std::task::{Context, Poll};

/// A remote service contract.
pub trait Contract: Send + Sync + 'static {
    /// Name used to look up the contract's configuration.
    const NAME: &'static str;
    /// Whether calls may interleave on one shared channel. Required for
    /// [`CacheMode::PerEndpoint`].
    const INTERLEAVE_SAFE: bool = false;
}

/// Client-side handle for contract `C`. Cheap to clone.
///
/// Every call performs endpoint selection, retry and failover transparently. Failures surface as
/// [`InvocationError`], or in-band through [`Proxy::call_enveloped`].
pub struct Proxy<C: Contract> {
    factory: ProxyFactory,
    mode: CacheMode,
    context: ConstructionContext,
    _contract: PhantomData<fn() -> C>,
}

impl<C: Contract> Clone for Proxy<C> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            mode: self.mode,
            context: self.context.clone(),
            _contract: PhantomData,
        }
    }
}

impl<C: Contract> fmt::Debug for Proxy<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("contract", &C::NAME)
            .field("mode", &self.mode)
            .field("context", &self.context)
            .finish()
    }
}

impl<C: Contract> Proxy<C> {
    pub(crate) fn new(factory: ProxyFactory, mode: CacheMode, context: ConstructionContext) -> Self {
        Self { factory, mode, context, _contract: PhantomData }
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn context(&self) -> &ConstructionContext {
        &self.context
    }

    /// Same proxy with a different construction context.
    ///
    /// Non-shared contexts get a private channel factory per proxy.
    #[must_use]
    pub fn with_context(mut self, context: ConstructionContext) -> Self {
        self.context = context;
        self
    }

    /// Run `request` and return the raw response body.
    pub async fn invoke_raw(&self, request: Invocation) -> Result<serde_json::Value, InvocationError> {
        self.factory.execute(C::NAME, self.mode, &self.context, &request).await
    }

    /// Run `request` and decode the response into `R`.
    pub async fn call<R: DeserializeOwned>(&self, request: Invocation) -> Result<R, InvocationError> {
        let value = self.invoke_raw(request).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Run `request`, reporting any failure inside the returned envelope.
    pub async fn call_enveloped<R: ResultEnvelope>(&self, request: Invocation) -> R {
        match self.invoke_raw(request).await.and_then(R::from_response) {
            Ok(envelope) => envelope,
            Err(err) => R::from_failure(err.code(), err.redacted_message()),
        }
    }

    /// Open a channel ahead of the first call when the cache mode keeps one around.
    ///
    /// Returns whether a channel is ready. Failure is never an error; the next call retries.
    pub async fn warm_up(&self) -> bool {
        self.factory.warm_up(C::NAME, self.mode, &self.context).await
    }
}

impl<C: Contract> tower_service::Service<Invocation> for Proxy<C> {
    type Response = serde_json::Value;
    type Error = InvocationError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Invocation) -> Self::Future {
        let proxy = self.clone();
        Box::pin(async move { proxy.invoke_raw(request).await })
    }
}

/// Declare a contract marker type and a typed client for it.
///
/// ```ignore
/// lifeline::contract! {
///     /// Order management service.
///     pub contract Orders("orders") for OrdersClient {
///         fn place_order(sku: String, quantity: u32) -> OrderAck;
///         fn find_order(id: u64) -> enveloped ServiceResult<Order>;
///     }
/// }
/// ```
///
/// Each method sends an [`Invocation`] named after the method, with one parameter per argument.
/// Plain methods return `Result<T, InvocationError>`; `enveloped` methods return the envelope
/// type itself. Add `interleave_safe` after the name (`Orders("orders", interleave_safe)`) to
/// allow [`CacheMode::PerEndpoint`].
#[macro_export]
macro_rules! contract {
    (
        $(#[$meta:meta])*
        $vis:vis contract $name:ident($wire:literal $(, $safe:ident)?) for $client:ident {
            $($methods:tt)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        $vis struct $name;

        impl $crate::Contract for $name {
            const NAME: &'static str = $wire;
            const INTERLEAVE_SAFE: bool = $crate::__contract_interleave!($($safe)?);
        }

        #[derive(Debug, Clone)]
        $vis struct $client {
            proxy: $crate::Proxy<$name>,
        }

        impl $client {
            pub fn new(proxy: $crate::Proxy<$name>) -> Self {
                Self { proxy }
            }

            pub fn proxy(&self) -> &$crate::Proxy<$name> {
                &self.proxy
            }

            $crate::__contract_methods! { $($methods)* }
        }

        impl ::core::convert::From<$crate::Proxy<$name>> for $client {
            fn from(proxy: $crate::Proxy<$name>) -> Self {
                Self { proxy }
            }
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __contract_interleave {
    () => {
        false
    };
    (interleave_safe) => {
        true
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __contract_methods {
    () => {};
    (
        $(#[$meta:meta])*
        fn $method:ident($($arg:ident : $ty:ty),* $(,)?) -> enveloped $ret:ty;
        $($rest:tt)*
    ) => {
        $(#[$meta])*
        pub async fn $method(&self, $($arg: $ty),*) -> $ret {
            let request = $crate::Invocation::builder(stringify!($method))
                $(.param(stringify!($arg), &$arg))*
                .build();
            match request {
                Ok(request) => self.proxy.call_enveloped::<$ret>(request).await,
                Err(err) => <$ret as $crate::ResultEnvelope>::from_failure(
                    err.code(),
                    err.redacted_message(),
                ),
            }
        }

        $crate::__contract_methods! { $($rest)* }
    };
    (
        $(#[$meta:meta])*
        fn $method:ident($($arg:ident : $ty:ty),* $(,)?) -> $ret:ty;
        $($rest:tt)*
    ) => {
        $(#[$meta])*
        pub async fn $method(&self, $($arg: $ty),*) -> ::core::result::Result<$ret, $crate::InvocationError> {
            let request = $crate::Invocation::builder(stringify!($method))
                $(.param(stringify!($arg), &$arg))*
                .build()?;
            self.proxy.call::<$ret>(request).await
        }

        $crate::__contract_methods! { $($rest)* }
    };
}
