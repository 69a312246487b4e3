use lifeline::mock::{ManualClock, MockTransport};
use lifeline::telemetry::MemorySink;
use lifeline::{Binding, ClientConfig, ContractConfig, Endpoint, ProxyFactory};
use std::time::Duration;

lifeline::contract! {
    /// Order lookups. Calls carry per-caller state, so channels are never shared between callers.
    pub contract Orders("orders") for OrdersClient {
        fn get_order(id: u64) -> serde_json::Value;
        fn cancel_order(id: u64, reason: String) -> enveloped lifeline::ServiceResult<serde_json::Value>;
    }
}

lifeline::contract! {
    /// Stateless quote service; safe to interleave on one channel.
    pub contract Quotes("quotes", interleave_safe) for QuotesClient {
        fn quote(symbol: String) -> serde_json::Value;
    }
}

pub fn endpoint(address: &str) -> Endpoint {
    Endpoint::new(address, Binding::new("mock"))
}

/// Contract config over mock endpoints with short timeouts.
pub fn contract_config(addresses: &[&str]) -> ContractConfig {
    ContractConfig::with_addresses("mock", addresses.iter().copied())
        .open_timeout(Duration::from_secs(2))
        .call_timeout(Duration::from_secs(5))
        .close_timeout(Duration::from_secs(1))
        .cooldown(Duration::from_secs(5))
}

/// A proxy factory over a [`MockTransport`] with a manual clock and an in-memory sink.
pub struct Harness {
    pub transport: MockTransport,
    pub clock: ManualClock,
    pub sink: MemorySink,
    pub factory: ProxyFactory,
}

impl Harness {
    pub fn new(config: ClientConfig) -> Self {
        let transport = MockTransport::new();
        let clock = ManualClock::new();
        let sink = MemorySink::new();
        let factory = ProxyFactory::builder(transport.clone())
            .config(config)
            .sink(sink.clone())
            .clock(clock.clone())
            .build();
        Self { transport, clock, sink, factory }
    }

    /// Harness with one `orders` contract over `addresses`.
    pub fn orders(addresses: &[&str]) -> Self {
        Self::new(ClientConfig::new().with_contract("orders", contract_config(addresses)))
    }

    /// Address that served the latest recorded invocation.
    pub fn last_served_by(&self) -> Option<String> {
        self.sink.last().and_then(|r| r.served_by().map(str::to_string))
    }
}
