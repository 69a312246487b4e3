mod common;

use common::test_helpers::{contract_config, Orders};
use lifeline::mock::{ManualClock, MockTransport};
use lifeline::telemetry::{
    LogSink, MemorySink, MulticastSink, NonBlockingSink, TelemetrySink, MAX_PARAMETER_CHARS,
    REDACTED,
};
use lifeline::{CacheMode, ClientConfig, Invocation, InvocationRecord, ProxyFactory};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

fn factory_with<S>(transport: &MockTransport, config: ClientConfig, sink: S) -> ProxyFactory
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    ProxyFactory::builder(transport.clone())
        .config(config)
        .sink(sink)
        .clock(ManualClock::new())
        .build()
}

#[tokio::test]
async fn parameters_are_redacted_and_truncated() {
    let transport = MockTransport::new();
    let sink = MemorySink::new();
    let config = ClientConfig::new()
        .with_contract("orders", contract_config(&["a"]).redact("card_number"));
    let factory = factory_with(&transport, config, sink.clone());

    let note = "x".repeat(MAX_PARAMETER_CHARS * 2);
    let request = Invocation::builder("place_order")
        .param("sku", "ABC-1")
        .param("quantity", &3)
        .param("card_number", "4111111111111111")
        .param("note", &note)
        .build()
        .unwrap();
    let proxy = factory.get_proxy::<Orders>(CacheMode::PerCall).unwrap();
    proxy.invoke_raw(request).await.unwrap();

    let record = sink.last().unwrap();
    assert_eq!(record.parameter("sku"), Some("\"ABC-1\""));
    assert_eq!(record.parameter("quantity"), Some("3"));
    assert_eq!(record.parameter("card_number"), Some(REDACTED));
    assert_eq!(record.parameter("note").unwrap().chars().count(), MAX_PARAMETER_CHARS);
    assert!(!format!("{record}").contains("4111"));
}

#[tokio::test]
async fn one_record_per_logical_invocation() {
    let transport = MockTransport::new();
    let sink = MemorySink::new();
    let factory = factory_with(
        &transport,
        ClientConfig::new().with_contract("orders", contract_config(&["a", "b"])),
        sink.clone(),
    );
    transport.take_down("a");

    let proxy = factory.get_proxy::<Orders>(CacheMode::PerThread).unwrap();
    for _ in 0..4 {
        proxy.invoke_raw(Invocation::new("get_order")).await.unwrap();
    }

    let records = sink.records();
    assert_eq!(records.len(), 4);
    let mut ids: Vec<_> = records.iter().map(|r| r.id).collect();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert!(records.iter().all(|r| r.served_by() == Some("b")));
    assert_eq!(records[0].attempt_count(), 2);
}

#[tokio::test]
async fn multicast_reaches_both_sinks() {
    let transport = MockTransport::new();
    let first = MemorySink::new();
    let second = MemorySink::with_capacity(1);
    let factory = factory_with(
        &transport,
        ClientConfig::new().with_contract("orders", contract_config(&["a"])),
        MulticastSink::new(first.clone(), second.clone()),
    );

    let proxy = factory.get_proxy::<Orders>(CacheMode::PerCall).unwrap();
    proxy.invoke_raw(Invocation::new("one")).await.unwrap();
    proxy.invoke_raw(Invocation::new("two")).await.unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 1);
    assert_eq!(second.evicted(), 1);
    assert_eq!(second.last().unwrap().operation, "two");
}

#[tokio::test]
async fn non_blocking_sink_delivers_in_background() {
    let transport = MockTransport::new();
    let memory = MemorySink::new();
    let sink = NonBlockingSink::with_capacity(memory.clone(), 16);
    let factory = factory_with(
        &transport,
        ClientConfig::new().with_contract("orders", contract_config(&["a"])),
        sink.clone(),
    );

    let proxy = factory.get_proxy::<Orders>(CacheMode::PerCall).unwrap();
    proxy.invoke_raw(Invocation::new("get_order")).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), async {
        while memory.is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(sink.dropped(), 0);
}

#[derive(Clone, Default)]
struct FailingSink {
    calls: Arc<AtomicUsize>,
}

#[derive(Debug)]
struct SinkDown;

impl std::fmt::Display for SinkDown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("sink down")
    }
}

impl std::error::Error for SinkDown {}

impl tower_service::Service<InvocationRecord> for FailingSink {
    type Response = ();
    type Error = SinkDown;
    type Future = Pin<Box<dyn Future<Output = Result<(), SinkDown>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), SinkDown>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _record: InvocationRecord) -> Self::Future {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(SinkDown) })
    }
}

impl TelemetrySink for FailingSink {
    type SinkError = SinkDown;
}

#[tokio::test]
async fn sink_errors_never_reach_the_caller() {
    let transport = MockTransport::new();
    let sink = FailingSink::default();
    let factory = factory_with(
        &transport,
        ClientConfig::new().with_contract("orders", contract_config(&["a"])),
        sink.clone(),
    );

    let proxy = factory.get_proxy::<Orders>(CacheMode::PerCall).unwrap();
    proxy.invoke_raw(Invocation::new("get_order")).await.unwrap();
    assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn log_sink_writes_through_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let transport = MockTransport::new();
    let factory = factory_with(
        &transport,
        ClientConfig::new().with_contract("orders", contract_config(&["a", "b"])),
        LogSink,
    );
    transport.take_down("a");

    let proxy = factory.get_proxy::<Orders>(CacheMode::PerCall).unwrap();
    proxy.invoke_raw(Invocation::new("get_order")).await.unwrap();
}
