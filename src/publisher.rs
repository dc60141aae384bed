// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module routes outbound messages. A queue that declares an exchange is
//! published to through that exchange, with headers derived from the exchange
//! behaviour; any other queue is sent to directly. Broker-side failures never
//! surface as errors here: they are logged and resolve to `Ok(false)`.

use crate::{
    channel::ChannelRegistry,
    envelope,
    errors::{AmqpError, TransportError},
    exchange::{
        ExchangeBehavior, AMQP_HEADERS_DELAY, AMQP_HEADERS_SINGLE_ACTIVE_CONSUMER,
    },
    otel,
    queue::Binding,
    transport::{BrokerChannel, Headers, MessageProperties},
};
use opentelemetry::Context;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Caller-side options of a publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    /// Generated when absent
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub headers: Headers,
    /// Delay hint in milliseconds, only meaningful for delayed exchanges
    pub delay_time: Option<i64>,
    pub persistent: bool,
    pub expiration: Option<String>,
    pub priority: Option<u8>,
}

impl PublishOptions {
    pub fn new() -> PublishOptions {
        PublishOptions::default()
    }

    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: Value) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    pub fn delay(mut self, millis: i64) -> Self {
        self.delay_time = Some(millis);
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

/// Computes the exchange headers and moves them into `options`.
///
/// The delay hint is consumed whatever the behaviour; computed headers replace
/// caller headers with the same key.
pub(crate) fn apply_exchange_headers(behavior: ExchangeBehavior, options: &mut PublishOptions) {
    let delay = options.delay_time.take();

    match behavior {
        ExchangeBehavior::Delayed => {
            options
                .headers
                .insert(AMQP_HEADERS_DELAY.to_owned(), Value::from(delay.unwrap_or(0)));
        }
        ExchangeBehavior::SingleActive => {
            options
                .headers
                .insert(AMQP_HEADERS_SINGLE_ACTIVE_CONSUMER.to_owned(), Value::Bool(true));
        }
        ExchangeBehavior::Plain => {}
    }
}

/// Message properties for the transport, defaulting the message id.
fn message_properties(options: &mut PublishOptions) -> MessageProperties {
    let message_id = options
        .message_id
        .get_or_insert_with(|| Uuid::new_v4().to_string())
        .clone();

    otel::inject(&Context::current(), &mut options.headers);

    MessageProperties {
        message_id,
        correlation_id: options.correlation_id.clone(),
        content_type: Some(JSON_CONTENT_TYPE.to_owned()),
        headers: options.headers.clone(),
        persistent: options.persistent,
        expiration: options.expiration.clone(),
        priority: options.priority,
    }
}

/// Publish dispatcher over the channels of one connection.
pub struct Publisher {
    channels: Arc<ChannelRegistry>,
}

impl Publisher {
    pub fn new(channels: Arc<ChannelRegistry>) -> Publisher {
        Publisher { channels }
    }

    /// Publishes `payload` to the binding's queue.
    ///
    /// Resolves to the broker acknowledgement flag.
    pub async fn publish<T>(
        &self,
        binding: &Binding,
        payload: &T,
        options: Option<PublishOptions>,
    ) -> Result<bool, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let mut options = options.unwrap_or_default();

        if binding.queue.exchange.is_some() {
            return self.publish_via_exchange(binding, payload, &mut options).await;
        }

        self.send_direct_to_queue(binding, payload, &mut options).await
    }

    /// Sends `payload` to the queue through the default exchange.
    pub async fn send_direct_to_queue<T>(
        &self,
        binding: &Binding,
        payload: &T,
        options: &mut PublishOptions,
    ) -> Result<bool, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let channel = self.channel(binding).await?;
        let body = envelope::encode(payload)?;
        options.delay_time = None;
        let properties = message_properties(options);
        let queue = binding.queue_name();

        debug!(queue = queue, message_id = properties.message_id, "sending to queue");
        let result = channel.send_to_queue(queue, body, properties).await;
        settle(queue, result)
    }

    /// Publishes `payload` through the queue's exchange, using the queue name
    /// as routing key.
    pub async fn publish_via_exchange<T>(
        &self,
        binding: &Binding,
        payload: &T,
        options: &mut PublishOptions,
    ) -> Result<bool, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let Some(exchange) = &binding.queue.exchange else {
            return self.send_direct_to_queue(binding, payload, options).await;
        };

        let channel = self.channel(binding).await?;
        let body = envelope::encode(payload)?;
        apply_exchange_headers(exchange.behavior(), options);
        let properties = message_properties(options);
        let queue = binding.queue_name();

        debug!(
            exchange = exchange.name,
            queue = queue,
            message_id = properties.message_id,
            "publishing message"
        );
        let result = channel.publish(&exchange.name, queue, body, properties).await;
        settle(queue, result)
    }

    async fn channel(&self, binding: &Binding) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let Some(name) = binding.channel.as_deref() else {
            return Err(AmqpError::UnassignedBinding(binding.queue_name().to_owned()));
        };

        self.channels
            .get(name)
            .await
            .ok_or_else(|| AmqpError::ChannelNotFound(name.to_owned()))
    }
}

fn settle(
    queue: &str,
    result: Result<bool, TransportError>,
) -> Result<bool, AmqpError> {
    match result {
        Ok(true) => Ok(true),
        Ok(false) => {
            warn!(queue = queue, "message was not acknowledged by the broker");
            Ok(false)
        }
        Err(err) => {
            error!(error = err.to_string(), queue = queue, "error publishing message");
            Ok(false)
        }
    }
}
