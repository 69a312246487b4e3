//! Request scope example: every call made while handling one inbound request shares a channel.
use lifeline::mock::MockTransport;
use lifeline::{
    CacheMode, ClientConfig, ContractConfig, InvocationError, ProxyFactory, RequestScope,
    ServiceResult,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Profile {
    user: String,
    plan: String,
}

lifeline::contract! {
    /// Account service.
    pub contract Accounts("accounts") for AccountsClient {
        fn profile(user: String) -> Profile;
        fn upgrade(user: String, plan: String) -> enveloped ServiceResult<Profile>;
    }
}

async fn handle_request(client: &AccountsClient, user: &str) -> Result<(), InvocationError> {
    let profile = client.profile(user.to_string()).await?;
    println!("before: {profile:?}");
    match client.upgrade(user.to_string(), "pro".to_string()).await.into_result() {
        Ok(profile) => println!("after: {profile:?}"),
        Err(err) => println!("upgrade failed with code {}: {}", err.code, err.message),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), InvocationError> {
    tracing_subscriber::fmt().init();

    let transport = MockTransport::new();
    transport.respond_with(|_, request| {
        let user = request.parameter("user").and_then(|v| v.as_str()).unwrap_or("anonymous");
        let plan = request.parameter("plan").and_then(|v| v.as_str()).unwrap_or("free");
        Ok(serde_json::json!({ "user": user, "plan": plan }))
    });

    let factory = ProxyFactory::new(
        transport.clone(),
        ClientConfig::new().with_contract(
            "accounts",
            ContractConfig::with_addresses("http", ["http://accounts-1", "http://accounts-2"]),
        ),
    );
    let client = AccountsClient::new(factory.get_proxy(CacheMode::PerLogicalRequest)?);

    for user in ["ada", "grace"] {
        RequestScope::new().run(handle_request(&client, user)).await?;
    }

    let stats = transport.stats();
    println!(
        "channels created: {}, invocations: {}",
        stats.channels_created,
        stats.total_invocations()
    );
    Ok(())
}
