// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! This module provides the exchange descriptor used by the topology provisioner
//! and the publish dispatcher. Besides its AMQP type, every exchange belongs to
//! one [`ExchangeBehavior`] class, which decides the headers attached to the
//! messages published through it.

use crate::transport::Headers;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Constant for the header field used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";
/// Constant for the per-message delay header understood by the delayed exchange plugin
pub const AMQP_HEADERS_DELAY: &str = "x-delay";
/// Constant for the single active consumer flag
pub const AMQP_HEADERS_SINGLE_ACTIVE_CONSUMER: &str = "x-single-active-consumer";

/// Represents the exchange types the gateway declares.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeKind {
    #[default]
    #[serde(rename = "direct")]
    Direct,
    #[serde(rename = "x-delayed-message", alias = "delayed")]
    XMessageDelayed,
}

impl ExchangeKind {
    /// The AMQP type name sent in `exchange.declare`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::XMessageDelayed => "x-delayed-message",
        }
    }
}

/// Publishing behaviour of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeBehavior {
    /// Accepts a per-message delay, sent as the `x-delay` header
    Delayed,
    /// Forces the `x-single-active-consumer` header on every message
    SingleActive,
    /// No extra headers
    Plain,
}

/// Declaration flags and arguments of an exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: Headers,
}

/// Definition of an exchange with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure exchange definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangeDefinition {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ExchangeKind,
    #[serde(default, alias = "headers")]
    pub options: ExchangeOptions,
    /// Overrides the behaviour derived from `kind` and `options`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behavior: Option<ExchangeBehavior>,
}

impl ExchangeDefinition {
    /// Creates a new direct exchange definition with the given name.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    ///
    /// # Returns
    /// A new direct exchange definition with default options
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Sets the exchange type.
    ///
    /// # Parameters
    /// * `kind` - The exchange type
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Direct.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    /// Creates a delayed direct exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn direct_delayed(mut self) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.options.arguments.insert(
            AMQP_HEADERS_DELAYED_EXCHANGE_TYPE.to_owned(),
            Value::String("direct".to_owned()),
        );
        self
    }

    /// Marks the exchange as single active consumer.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn single_active(mut self) -> Self {
        self.options.arguments.insert(
            AMQP_HEADERS_SINGLE_ACTIVE_CONSUMER.to_owned(),
            Value::Bool(true),
        );
        self
    }

    /// Adds a single declaration argument to the exchange.
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

    /// Makes the exchange durable, persisting across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.options.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delete(mut self) -> Self {
        self.options.auto_delete = true;
        self
    }

    /// Pins the publishing behaviour instead of deriving it.
    ///
    /// # Parameters
    /// * `behavior` - The behaviour applied when publishing
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_behavior(mut self, behavior: ExchangeBehavior) -> Self {
        self.behavior = Some(behavior);
        self
    }

    /// Resolves the publishing behaviour of this exchange.
    ///
    /// An explicit override wins; otherwise a delayed kind is `Delayed`, a
    /// `x-single-active-consumer: true` argument is `SingleActive`, and anything
    /// else is `Plain`.
    pub fn behavior(&self) -> ExchangeBehavior {
        if let Some(behavior) = self.behavior {
            return behavior;
        }

        match self.kind {
            ExchangeKind::XMessageDelayed => ExchangeBehavior::Delayed,
            ExchangeKind::Direct => {
                match self.options.arguments.get(AMQP_HEADERS_SINGLE_ACTIVE_CONSUMER) {
                    Some(Value::Bool(true)) => ExchangeBehavior::SingleActive,
                    _ => ExchangeBehavior::Plain,
                }
            }
        }
    }
}
