// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Dispatcher
//!
//! Starts one consumption loop per consumer binding. Loops run independently;
//! inside a loop every delivery is settled on its own task, so the channel
//! prefetch is the only bound on in-flight deliveries. Delivery tasks belong
//! to their loop and are cancelled with it.

use crate::{
    channel::ChannelRegistry,
    consumer::{consume, ConsumerContext},
    errors::AmqpError,
    handler::HandlerRegistry,
    queue::Binding,
    retry::RetryStore,
    transport::Delivery,
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};
use uuid::Uuid;

pub struct ConsumerDispatcher {
    handlers: Arc<HandlerRegistry>,
    retry_store: Arc<dyn RetryStore>,
    max_retries: Option<u32>,
}

impl ConsumerDispatcher {
    /// A ceiling of 0 means no ceiling.
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        retry_store: Arc<dyn RetryStore>,
        max_retries: Option<u32>,
    ) -> Self {
        ConsumerDispatcher {
            handlers,
            retry_store,
            max_retries: max_retries.filter(|max| *max > 0),
        }
    }

    /// Registers a consumer for every binding and spawns its loop.
    ///
    /// Returns the loop handles; aborting them stops consumption.
    pub async fn start(
        &self,
        channels: &ChannelRegistry,
        consumers: &[Binding],
    ) -> Result<Vec<JoinHandle<()>>, AmqpError> {
        let mut spawns = vec![];

        for binding in consumers {
            let queue = binding.queue_name();
            let Some(channel_name) = binding.channel.as_deref() else {
                error!(queue = queue, "consumer binding without channel");
                return Err(AmqpError::UnassignedBinding(queue.to_owned()));
            };
            let Some(channel) = channels.get(channel_name).await else {
                error!(channel = channel_name, queue = queue, "channel not found");
                return Err(AmqpError::ChannelNotFound(channel_name.to_owned()));
            };

            info!(queue = queue, "consuming...");
            let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
            let mut deliveries = match channel.consume(queue, &consumer_tag).await {
                Err(err) => {
                    error!(error = err.to_string(), queue = queue, "failure to create the consumer");
                    Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
                }
                Ok(c) => Ok(c),
            }?;

            let ctx = Arc::new(ConsumerContext {
                queue: queue.to_owned(),
                channel,
                handlers: self.handlers.clone(),
                retry_store: self.retry_store.clone(),
                max_retries: self.max_retries,
            });

            spawns.push(tokio::spawn(async move {
                let mut in_flight = JoinSet::new();

                loop {
                    tokio::select! {
                        next = deliveries.next() => {
                            let Some(delivery) = next else {
                                break;
                            };
                            in_flight.spawn(settle(delivery, ctx.clone()));
                        }
                        Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                    }
                }

                info!(queue = ctx.queue, "consumer stream ended");
                while in_flight.join_next().await.is_some() {}
            }));
        }

        Ok(spawns)
    }
}

async fn settle(delivery: Option<Delivery>, ctx: Arc<ConsumerContext>) {
    match consume(&global::tracer("amqp consumer"), delivery, &ctx).await {
        Ok(disposition) => debug!(queue = ctx.queue, ?disposition, "delivery settled"),
        Err(err) => error!(error = err.to_string(), "error consume msg"),
    }
}
