// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Messaging Gateway
//!
//! A broker-facing gateway that owns one connection, multiplexes named
//! channels over it, asserts the configured topology, publishes JSON
//! envelopes and dispatches deliveries to registered handlers with a
//! bounded retry policy.
//!
//! ```no_run
//! use rmq_gateway::{config::GatewaySettings, Gateway};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewaySettings::load(Some("gateway.toml"))?.resolve()?;
//! let gateway = Gateway::lapin(config);
//!
//! if let Some(binding) = gateway.config().consumer_binding("emails").cloned() {
//!     gateway.on_fn(&binding, |payload| async move {
//!         tracing::info!(payload = payload.to_string(), "email received");
//!         Ok::<(), rmq_gateway::HandlerError>(())
//!     })
//!     .await;
//! }
//!
//! gateway.connect(None).await?;
//!
//! if let Some(binding) = gateway.config().publisher_binding("emails") {
//!     gateway.publish(binding, &json!({"to": "someone@example.com"}), None).await?;
//! }
//! # Ok(())
//! # }
//! ```

mod consumer;
mod otel;
#[cfg(test)]
mod test_support;

pub mod amqp;
pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod reconnect;
pub mod retry;
pub mod topology;
pub mod transport;

pub use crate::{
    connection::{ConnectionState, Gateway},
    consumer::Disposition,
    errors::{AmqpError, HandlerError},
    publisher::PublishOptions,
    queue::Binding,
};
