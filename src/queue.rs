// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions and Bindings
//!
//! This module provides the queue descriptor and the [`Binding`] that pairs it
//! with a channel. A binding is the unit configured for every publisher and
//! every consumer; the same binding may serve both roles for one queue.

use crate::{exchange::ExchangeDefinition, transport::Headers};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Declaration flags and arguments of a queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: Headers,
}

/// Definition of a queue with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure queue definitions.
/// A queue that carries an exchange is published to through that exchange and
/// bound to it with its own name as routing key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueDefinition {
    pub name: String,
    #[serde(default, alias = "headers")]
    pub options: QueueOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange: Option<ExchangeDefinition>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created with standard settings (non-durable, non-exclusive, etc.)
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// A new queue definition with default settings
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.options.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delete(mut self) -> Self {
        self.options.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.options.exclusive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    ///
    /// # Parameters
    /// * `ttl` - Message TTL in milliseconds
    ///
    /// # Returns
    /// Self for method chaining
    pub fn ttl(self, ttl: i32) -> Self {
        self.argument(AMQP_HEADERS_MESSAGE_TTL, Value::from(ttl))
    }

    /// Sets the maximum number of messages the queue can hold.
    ///
    /// # Parameters
    /// * `max` - Maximum number of messages
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length(self, max: i32) -> Self {
        self.argument(AMQP_HEADERS_MAX_LENGTH, Value::from(max))
    }

    /// Sets the maximum size in bytes the queue can hold.
    ///
    /// # Parameters
    /// * `max_bytes` - Maximum total size in bytes
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length_bytes(self, max_bytes: i32) -> Self {
        self.argument(AMQP_HEADERS_MAX_LENGTH_BYTES, Value::from(max_bytes))
    }

    /// Adds a single declaration argument to the queue.
    ///
    /// # Parameters
    /// * `key` - The argument name
    /// * `value` - The argument value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn argument(mut self, key: &str, value: Value) -> Self {
        self.options.arguments.insert(key.to_owned(), value);
        self
    }

    /// Routes the queue through the given exchange.
    ///
    /// # Parameters
    /// * `exchange` - The exchange definition
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, exchange: ExchangeDefinition) -> Self {
        self.exchange = Some(exchange);
        self
    }
}

/// Pairs a queue with the channel used to publish to it or consume from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    /// A binding without channel is ignored by the topology provisioner
    #[serde(default)]
    pub channel: Option<String>,
    pub queue: QueueDefinition,
}

impl Binding {
    pub fn new(channel: &str, queue: QueueDefinition) -> Binding {
        Binding {
            channel: Some(channel.to_owned()),
            queue,
        }
    }

    /// Creates a binding that has no channel assigned yet.
    pub fn unassigned(queue: QueueDefinition) -> Binding {
        Binding {
            channel: None,
            queue,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_arguments() {
        let def = QueueDefinition::new("orders")
            .durable()
            .ttl(1000)
            .max_length(10);

        assert!(def.options.durable);
        assert_eq!(
            def.options.arguments.get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&Value::from(1000))
        );
        assert_eq!(
            def.options.arguments.get(AMQP_HEADERS_MAX_LENGTH),
            Some(&Value::from(10))
        );
        assert!(def.exchange.is_none());
    }

    #[test]
    fn binding_exposes_queue_name() {
        let binding = Binding::new("publisher", QueueDefinition::new("orders"));
        assert_eq!(binding.queue_name(), "orders");
        assert_eq!(binding.channel.as_deref(), Some("publisher"));
        assert!(Binding::unassigned(QueueDefinition::new("orders")).channel.is_none());
    }
}
