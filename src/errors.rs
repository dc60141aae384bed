// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Gateway
//!
//! `TransportError` is what a broker transport reports, `AmqpError` is what the
//! gateway surfaces to its callers. Handler, retry store and configuration
//! failures have their own types so they never get confused with broker faults.

use thiserror::Error;

/// Errors reported by a [`crate::transport::BrokerTransport`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The broker is unreachable or refused the connection
    #[error("failure to connect: {0}")]
    Connect(String),

    /// A channel could not be opened or configured
    #[error("channel failure: {0}")]
    Channel(String),

    /// A queue, exchange or binding declaration was rejected
    #[error("declaration failure: {0}")]
    Declare(String),

    /// Writing a message to the broker failed
    #[error("failure to publish: {0}")]
    Publish(String),

    /// A consumer could not be registered
    #[error("failure to consume: {0}")]
    Consume(String),

    /// Acknowledging or rejecting a delivery failed
    #[error("failure to settle delivery: {0}")]
    Settle(String),

    /// Closing the connection failed
    #[error("failure to close: {0}")]
    Close(String),
}

/// Represents errors that can occur during gateway operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// The operation needs a live connection and there is none
    #[error("not connected")]
    NotConnected,

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The connection was closed while the attempt was in flight
    #[error("connection attempt cancelled")]
    ConnectCancelled,

    /// Error opening a named channel
    #[error("failure to create the channel `{0}`: {1}")]
    ChannelError(String, String),

    /// A binding refers to a channel that was never created
    #[error("channel `{0}` not found")]
    ChannelNotFound(String),

    /// A binding used for publishing or consuming has no channel assigned
    #[error("binding for queue `{0}` has no channel")]
    UnassignedBinding(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error serializing or parsing a message envelope
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error declaring a consumer
    #[error("failure to declare consumer for queue `{0}`")]
    ConsumerDeclarationError(String),
}

/// Error returned by a message handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(reason: impl std::fmt::Display) -> Self {
        HandlerError(reason.to_string())
    }
}

impl From<&str> for HandlerError {
    fn from(value: &str) -> Self {
        HandlerError(value.to_owned())
    }
}

impl From<String> for HandlerError {
    fn from(value: String) -> Self {
        HandlerError(value)
    }
}

/// Errors raised by a [`crate::retry::RetryStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryStoreError {
    #[error("retry store unavailable: {0}")]
    Unavailable(String),

    #[error("retry store command failed: {0}")]
    Command(String),
}

/// Errors raised while loading or resolving the gateway configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failure to load configuration")]
    Load(#[from] config::ConfigError),

    #[error("queue `{queue}` refers to an unknown exchange `{exchange}`")]
    UnknownExchange { queue: String, exchange: String },

    #[error("binding refers to an unknown queue `{0}`")]
    UnknownQueue(String),

    #[error("binding for queue `{queue}` refers to an unknown channel `{channel}`")]
    UnknownChannel { queue: String, channel: String },

    #[error("duplicated channel `{0}`")]
    DuplicatedChannel(String),
}
