//! Subscribe to a realtime GraphQL endpoint and print payloads.
//!
//! ```sh
//! APPSYNC_ENDPOINT=https://<api>.appsync-api.<region>.amazonaws.com/graphql \
//! APPSYNC_API_KEY=da2-... \
//! cargo run --example subscribe
//! ```

use appsync_realtime_sdk::auth::{AuthConfig, AuthMode};
use appsync_realtime_sdk::realtime::{Client, Config, SubscribeRequest};
use futures::StreamExt as _;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let endpoint = std::env::var("APPSYNC_ENDPOINT")?;
    let api_key = std::env::var("APPSYNC_API_KEY")?;

    let config = Config::builder()
        .endpoint(endpoint)
        .auth(
            AuthConfig::builder()
                .mode(AuthMode::ApiKey)
                .api_key(api_key)
                .build(),
        )
        .build();
    let client = Client::new(config)?;

    let mut states = client.connection_states();
    tokio::spawn(async move {
        while let Ok(state) = states.recv().await {
            tracing::info!(%state, "connection state changed");
        }
    });

    let mut subscription = client
        .subscribe(
            SubscribeRequest::builder()
                .query("subscription OnCreateTodo { onCreateTodo { id content } }")
                .build(),
        )
        .await?;
    tracing::info!(id = %subscription.id(), "subscribed");

    while let Some(payload) = subscription.next().await {
        let payload = payload?;
        tracing::info!(%payload, "received");
    }

    Ok(())
}
