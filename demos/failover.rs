//! Failover example: one endpoint is down, another times out, the third answers.
use lifeline::mock::{MockTransport, Step};
use lifeline::telemetry::{LogSink, MemorySink, MulticastSink};
use lifeline::{CacheMode, ClientConfig, ContractConfig, InvocationError, TransportError};
use std::time::Duration;

lifeline::contract! {
    /// Inventory service.
    pub contract Inventory("inventory") for InventoryClient {
        fn stock_level(sku: String) -> serde_json::Value;
    }
}

#[tokio::main]
async fn main() -> Result<(), InvocationError> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let transport = MockTransport::new();
    transport.take_down("tcp://inventory-a:7000");
    transport.script_invoke(
        "tcp://inventory-b:7000",
        [Step::Fail(TransportError::Timeout(Duration::from_secs(2)))],
    );

    let config = ClientConfig::new().with_contract(
        "inventory",
        ContractConfig::with_addresses(
            "tcp",
            ["tcp://inventory-a:7000", "tcp://inventory-b:7000", "tcp://inventory-c:7000"],
        )
        .call_timeout(Duration::from_secs(2))
        .cooldown(Duration::from_secs(5))
        .max_retry_count(2),
    );

    let records = MemorySink::new();
    let factory = lifeline::ProxyFactory::builder(transport.clone())
        .config(config)
        .sink(MulticastSink::new(LogSink, records.clone()))
        .build();

    let client = InventoryClient::new(factory.get_proxy(CacheMode::PerThread)?);
    let reply = client.stock_level("SKU-42".to_string()).await?;
    println!("reply: {reply}");

    for record in records.records() {
        println!("{record}");
        for attempt in &record.attempts {
            println!("  {attempt}");
        }
    }

    if let Some(registry) = factory.registry("inventory") {
        for (address, health) in registry.snapshot() {
            println!("{address}: {health:?}");
        }
    }

    factory.shutdown().await;
    Ok(())
}
