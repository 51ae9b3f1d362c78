//! Realtime GraphQL subscription transport.
//!
//! This module provides a WebSocket-based client that multiplexes many
//! logical GraphQL subscriptions over one connection to an
//! AppSync-compatible realtime gateway.
//!
//! One [`Client`] owns one socket. Subscribing registers a logical
//! subscription, performs the connection handshake if no socket is live,
//! and returns a [`Subscription`] stream of payloads. Keepalive frames
//! from the gateway feed a liveness timer; a disrupted connection is
//! detected by the [`crate::monitor::ConnectionStateMonitor`] and every
//! registered subscription is transparently re-established over a fresh
//! socket, keeping its id.
//!
//! # Example
//!
//! ```rust, no_run
//! use appsync_realtime_sdk::auth::{AuthConfig, AuthMode};
//! use appsync_realtime_sdk::realtime::{Client, Config, SubscribeRequest};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::builder()
//!         .endpoint("https://example.appsync-api.us-east-1.amazonaws.com/graphql")
//!         .auth(AuthConfig::builder().mode(AuthMode::ApiKey).api_key("da2-key".to_owned()).build())
//!         .build();
//!     let client = Client::new(config)?;
//!
//!     let request = SubscribeRequest::builder()
//!         .query("subscription OnCreate { onCreate { id } }")
//!         .build();
//!     let mut subscription = client.subscribe(request).await?;
//!
//!     while let Some(payload) = subscription.next().await {
//!         println!("payload: {:?}", payload?);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
mod connection;
pub mod error;
mod protocol;

// Re-export commonly used types
pub use client::{Client, SubscribeRequest, Subscription, TransportEvent};
pub use config::{Config, RetryConfig};
pub use error::RealtimeError;
pub use protocol::SubscriptionId;
