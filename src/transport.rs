// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! The gateway never speaks the wire protocol itself. Every broker interaction
//! goes through the traits in this module; [`crate::amqp`] implements them over
//! `lapin`, and the test suite implements them with an in-memory fake.

use crate::{
    channel::ChannelKind,
    errors::TransportError,
    exchange::{ExchangeKind, ExchangeOptions},
    queue::QueueOptions,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::broadcast;

/// Message headers and declaration arguments.
pub type Headers = BTreeMap<String, Value>;

/// Stream of deliveries for one consumer. `None` is an empty delivery, the
/// broker's way of signalling that the consumer was cancelled.
pub type DeliveryStream = BoxStream<'static, Option<Delivery>>;

/// Lifecycle notification emitted by a connection or a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Error(String),
    Closed,
}

/// Properties sent along with a published message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub headers: Headers,
    pub persistent: bool,
    pub expiration: Option<String>,
    pub priority: Option<u8>,
}

/// A message received from a queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub headers: Headers,
    pub data: Vec<u8>,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
}

/// Opens connections to a broker.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BrokerConnection>, TransportError>;
}

/// One physical broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(
        &self,
        kind: ChannelKind,
    ) -> Result<Arc<dyn BrokerChannel>, TransportError>;

    /// Subscribes to the error and close notifications of this connection.
    fn events(&self) -> broadcast::Receiver<BrokerEvent>;

    /// Closes the connection, resolving to the broker's close outcome.
    async fn close(&self) -> Result<bool, TransportError>;
}

/// A flow-controlled sub-stream multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Bounds the number of unacknowledged deliveries in flight on this channel.
    async fn prefetch(&self, count: u16) -> Result<(), TransportError>;

    async fn assert_queue(&self, name: &str, options: &QueueOptions) -> Result<(), TransportError>;

    async fn assert_exchange(
        &self,
        name: &str,
        kind: &ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Publishes a message, resolving to the broker acknowledgement flag.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<bool, TransportError>;

    /// Publishes straight to `queue` through the default exchange.
    async fn send_to_queue(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<bool, TransportError> {
        self.publish("", queue, body, properties).await
    }

    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, TransportError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Rejects the delivery and asks the broker to redeliver it.
    async fn nack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    fn events(&self) -> broadcast::Receiver<BrokerEvent>;
}
