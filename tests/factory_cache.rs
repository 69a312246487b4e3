mod common;

use common::test_helpers::{contract_config, endpoint};
use futures::future::join_all;
use lifeline::mock::MockTransport;
use lifeline::{
    BoundedConnector, CacheMode, ChannelFactoryCache, Classifier, ConstructionContext,
    EndpointRegistry, Invocation, ResilientProxy,
};
use std::sync::Arc;
use std::time::Duration;

fn cache(transport: &MockTransport) -> ChannelFactoryCache {
    ChannelFactoryCache::new(Arc::new(transport.clone()), BoundedConnector::default())
}

fn proxy(cache: &ChannelFactoryCache, context: ConstructionContext) -> ResilientProxy {
    ResilientProxy::new("orders", CacheMode::PerThread, context, cache.clone(), Classifier::default())
}

fn registry(addresses: &[&str]) -> EndpointRegistry {
    EndpointRegistry::new(
        addresses.iter().map(|a| endpoint(a)).collect(),
        Duration::from_secs(5),
        3,
    )
}

#[tokio::test]
async fn proxies_share_one_factory_and_close_it_once() {
    let transport = MockTransport::new();
    let cache = cache(&transport);
    let registry = registry(&["a"]);
    let settings = contract_config(&["a"]).settings_for("get");

    let mut proxies: Vec<_> = (0..5).map(|_| proxy(&cache, ConstructionContext::Shared)).collect();
    for p in &mut proxies {
        p.invoke(&registry, &settings, &Invocation::new("get")).await.result.unwrap();
        assert_eq!(p.uses_shared_factory(), Some(true));
    }

    let stats = transport.stats();
    assert_eq!(stats.factories_built, 1);
    assert_eq!(stats.factories_opened, 1);
    assert_eq!(stats.channels_created, 5);
    assert_eq!(cache.ref_count("orders", &endpoint("a")), Some(5));

    let mut remaining = proxies.len();
    for p in proxies {
        p.close(Duration::from_secs(1)).await;
        remaining -= 1;
        if remaining > 0 {
            assert_eq!(transport.stats().factories_closed, 0);
        }
    }

    let stats = transport.stats();
    assert_eq!(stats.factories_closed, 1);
    assert_eq!(stats.factories_aborted, 0);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn concurrent_builders_converge_on_one_published_factory() {
    let transport = MockTransport::new();
    let cache = cache(&transport);
    let registry = registry(&["a"]);
    let settings = contract_config(&["a"]).settings_for("get");

    let request = Invocation::new("get");
    let mut proxies: Vec<_> = (0..8).map(|_| proxy(&cache, ConstructionContext::Shared)).collect();
    let results =
        join_all(proxies.iter_mut().map(|p| p.invoke(&registry, &settings, &request))).await;
    assert!(results.iter().all(|o| o.result.is_ok()));

    let stats = transport.stats();
    // Race losers discard their own factory.
    assert_eq!(stats.factories_built - stats.factories_aborted, 1);
    assert_eq!(cache.ref_count("orders", &endpoint("a")), Some(8));
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn private_contexts_never_touch_the_cache() {
    let transport = MockTransport::new();
    let cache = cache(&transport);
    let registry = registry(&["a"]);
    let settings = contract_config(&["a"]).settings_for("get");

    let mut first = proxy(&cache, ConstructionContext::Private);
    let mut second = proxy(&cache, ConstructionContext::callback(7u32));
    first.invoke(&registry, &settings, &Invocation::new("get")).await.result.unwrap();
    second.invoke(&registry, &settings, &Invocation::new("get")).await.result.unwrap();

    assert_eq!(first.uses_shared_factory(), Some(false));
    assert_eq!(transport.stats().factories_built, 2);
    assert!(cache.is_empty());

    first.close(Duration::from_secs(1)).await;
    second.close(Duration::from_secs(1)).await;
    assert_eq!(transport.stats().factories_closed, 2);
}

#[tokio::test]
async fn dead_entry_is_replaced_on_next_acquire() {
    let transport = MockTransport::new();
    let cache = cache(&transport);
    let registry = registry(&["a"]);
    let settings = contract_config(&["a"]).settings_for("get");

    let mut holder = proxy(&cache, ConstructionContext::Shared);
    holder.invoke(&registry, &settings, &Invocation::new("get")).await.result.unwrap();
    transport.fault_factories("a");

    let mut fresh = proxy(&cache, ConstructionContext::Shared);
    fresh.invoke(&registry, &settings, &Invocation::new("get")).await.result.unwrap();

    assert_eq!(transport.stats().factories_built, 2);
    assert_eq!(cache.ref_count("orders", &endpoint("a")), Some(1));
    assert_eq!(cache.entries(), vec![("orders".to_string(), "a".to_string(), 1)]);
}

#[tokio::test]
async fn invalidate_unpublishes_but_keeps_holders_working() {
    let transport = MockTransport::new();
    let cache = cache(&transport);
    let registry = registry(&["a"]);
    let settings = contract_config(&["a"]).settings_for("get");

    let mut holder = proxy(&cache, ConstructionContext::Shared);
    holder.invoke(&registry, &settings, &Invocation::new("get")).await.result.unwrap();

    assert!(cache.invalidate("orders", &endpoint("a")));
    assert!(!cache.invalidate("orders", &endpoint("a")));
    assert!(cache.is_empty());

    holder.invoke(&registry, &settings, &Invocation::new("again")).await.result.unwrap();
    assert_eq!(transport.stats().factories_built, 1);

    holder.close(Duration::from_secs(1)).await;
    assert_eq!(transport.stats().factories_closed, 1);
}
