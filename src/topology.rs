// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module asserts the queues, exchanges and queue-to-exchange bindings the
//! configured publishers and consumers rely on. Bindings are installed in the
//! order they were registered; every queue and exchange is asserted once per
//! install even when several bindings share it.

use crate::{channel::ChannelRegistry, errors::AmqpError, queue::Binding};
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::{debug, error};

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology<'tp> {
    /// Adds a publisher or consumer binding to the topology.
    fn binding(self, binding: &'tp Binding) -> Self;

    /// Asserts every registered binding on the broker.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Topology installed through the channels of a [`ChannelRegistry`].
pub struct AmqpTopology<'tp> {
    channels: &'tp ChannelRegistry,
    pub(crate) bindings: Vec<&'tp Binding>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channels: &'tp ChannelRegistry) -> AmqpTopology<'tp> {
        AmqpTopology {
            channels,
            bindings: vec![],
        }
    }

    /// Registers every publisher binding, then every consumer binding.
    pub fn bindings(
        mut self,
        publishers: &'tp [Binding],
        consumers: &'tp [Binding],
    ) -> AmqpTopology<'tp> {
        self.bindings.extend(publishers.iter().chain(consumers.iter()));
        self
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn binding(mut self, binding: &'tp Binding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// For each binding this method:
    /// 1. Asserts the queue on the binding's channel
    /// 2. Asserts the queue's exchange, if it declares one
    /// 3. Binds the queue to the exchange using the queue name as routing key
    ///
    /// Bindings without channel are skipped.
    async fn install(&self) -> Result<(), AmqpError> {
        let mut queues = HashSet::new();
        let mut exchanges = HashSet::new();

        for binding in &self.bindings {
            let queue = &binding.queue;
            let Some(channel_name) = binding.channel.as_deref() else {
                debug!(queue = queue.name, "binding without channel, skipping");
                continue;
            };

            if !queues.insert(queue.name.as_str()) {
                continue;
            }

            let Some(channel) = self.channels.get(channel_name).await else {
                error!(
                    channel = channel_name,
                    queue = queue.name,
                    "channel not found for binding"
                );
                return Err(AmqpError::ChannelNotFound(channel_name.to_owned()));
            };

            debug!("creating queue: {}", queue.name);
            if let Err(err) = channel.assert_queue(&queue.name, &queue.options).await {
                error!(
                    error = err.to_string(),
                    queue = queue.name,
                    "error to declare the queue"
                );
                return Err(AmqpError::DeclareQueueError(queue.name.clone()));
            }
            debug!("queue: {} was created", queue.name);

            let Some(exch) = &queue.exchange else {
                continue;
            };

            if exchanges.insert(exch.name.as_str()) {
                debug!("creating exchange: {}", exch.name);
                if let Err(err) = channel
                    .assert_exchange(&exch.name, &exch.kind, &exch.options)
                    .await
                {
                    error!(
                        error = err.to_string(),
                        name = exch.name,
                        "error to declare the exchange"
                    );
                    return Err(AmqpError::DeclareExchangeError(exch.name.clone()));
                }
                debug!("exchange: {} was created", exch.name);
            }

            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                queue.name, exch.name, queue.name
            );
            if let Err(err) = channel
                .bind_queue(&queue.name, &exch.name, &queue.name)
                .await
            {
                error!(error = err.to_string(), "error to bind queue to exchange");
                return Err(AmqpError::BindingExchangeToQueueError(
                    exch.name.clone(),
                    queue.name.clone(),
                ));
            }
        }

        debug!("topology installed");

        Ok(())
    }
}
