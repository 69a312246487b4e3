use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lifeline::mock::MockTransport;
use lifeline::{
    BoundedConnector, CacheMode, ChannelFactoryCache, ClientConfig, ConstructionContext,
    Contract, ContractConfig, Endpoint, Binding, Invocation, ProxyFactory,
};
use std::sync::Arc;
use std::time::Duration;

struct Bench;

impl Contract for Bench {
    const NAME: &'static str = "bench";
    const INTERLEAVE_SAFE: bool = true;
}

fn factory() -> ProxyFactory {
    ProxyFactory::new(
        MockTransport::new(),
        ClientConfig::new()
            .with_contract("bench", ContractConfig::with_addresses("mock", ["a", "b", "c"])),
    )
}

// Acquire and release against a warm cache entry.
fn cache_acquire_hit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache = ChannelFactoryCache::new(Arc::new(MockTransport::new()), BoundedConnector::default());
    let endpoint = Endpoint::new("a", Binding::new("mock"));
    let timeout = Duration::from_secs(1);
    let _warm = rt
        .block_on(cache.acquire("bench", &endpoint, &ConstructionContext::Shared, timeout, timeout))
        .unwrap();

    c.bench_function("factory_cache_acquire_hit", |b| {
        b.to_async(&rt).iter(|| async {
            let handle = cache
                .acquire("bench", &endpoint, &ConstructionContext::Shared, timeout, timeout)
                .await
                .unwrap();
            black_box(handle.is_shared());
        });
    });
}

fn invoke_by_cache_mode(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let factory = factory();

    for mode in [CacheMode::PerCall, CacheMode::PerThread, CacheMode::PerEndpoint] {
        let proxy = factory.get_proxy::<Bench>(mode).unwrap();
        c.bench_function(&format!("invoke_{mode}"), |b| {
            b.to_async(&rt).iter(|| async {
                let reply = proxy.invoke_raw(black_box(Invocation::new("ping"))).await.unwrap();
                black_box(reply);
            });
        });
    }
}

criterion_group!(benches, cache_acquire_hit, invoke_by_cache_mode);
criterion_main!(benches);
