// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! This module holds the per-delivery policy of the consumption loop: find the
//! handler, decode the envelope, run the handler and settle the delivery. Failed
//! deliveries are redelivered until their failure count exceeds the configured
//! ceiling, after which they are acknowledged and dropped.

use crate::{
    envelope,
    errors::{AmqpError, HandlerError},
    handler::HandlerRegistry,
    otel,
    retry::RetryStore,
    transport::{BrokerChannel, Delivery},
};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, info, warn};

/// What happened to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Neither acknowledged nor rejected
    Ignored,
    /// Processed and acknowledged
    Acked,
    /// Rejected for redelivery
    Requeued,
    /// Acknowledged without successful processing, retry ceiling exceeded
    Dropped,
}

/// Everything a consumption loop needs to settle its deliveries.
pub(crate) struct ConsumerContext {
    pub(crate) queue: String,
    pub(crate) channel: Arc<dyn BrokerChannel>,
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) retry_store: Arc<dyn RetryStore>,
    pub(crate) max_retries: Option<u32>,
}

/// Consumes and processes one delivery.
///
/// An empty delivery, or a delivery for a queue without handler, is left
/// pending on the broker.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: Option<Delivery>,
    ctx: &ConsumerContext,
) -> Result<Disposition, AmqpError> {
    let handler = ctx.handlers.get(&ctx.queue).await;
    let (Some(delivery), Some(handler)) = (delivery, handler) else {
        info!(queue = ctx.queue, "no handler for queue or delivery is empty");
        return Ok(Disposition::Ignored);
    };

    let (otel_ctx, mut span) = otel::new_span(&delivery.headers, tracer, &ctx.queue);

    debug!(
        queue = ctx.queue,
        message_id = ?delivery.message_id,
        redelivered = delivery.redelivered,
        "received message"
    );

    let result = match envelope::decode(&delivery.data) {
        Ok(payload) => handler.exec(&otel_ctx, &payload).await,
        Err(err) => Err(HandlerError::new(err)),
    };

    match result {
        Ok(()) => {
            debug!("message successfully processed");
            ack(&delivery, ctx, &mut span).await?;
            clear_counter(&delivery, ctx).await;
            span.set_status(Status::Ok);
            Ok(Disposition::Acked)
        }
        Err(err) => {
            warn!(error = err.to_string(), queue = ctx.queue, "error whiling handling msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
            on_failure(&delivery, ctx, &mut span).await
        }
    }
}

async fn on_failure(
    delivery: &Delivery,
    ctx: &ConsumerContext,
    span: &mut BoxedSpan,
) -> Result<Disposition, AmqpError> {
    let Some(max_retries) = ctx.max_retries else {
        nack(delivery, ctx, span).await?;
        return Ok(Disposition::Requeued);
    };

    let Some(message_id) = delivery.message_id.as_deref() else {
        warn!(queue = ctx.queue, "message without id, failure can't be counted");
        nack(delivery, ctx, span).await?;
        return Ok(Disposition::Requeued);
    };

    match ctx.retry_store.increment(message_id).await {
        Ok(count) if count > max_retries => {
            error!(
                queue = ctx.queue,
                message_id = message_id,
                attempts = count,
                "too many attempts, dropping message"
            );
            ack(delivery, ctx, span).await?;
            clear_counter(delivery, ctx).await;
            Ok(Disposition::Dropped)
        }
        Ok(count) => {
            debug!(message_id = message_id, attempts = count, "requeuing for later");
            nack(delivery, ctx, span).await?;
            Ok(Disposition::Requeued)
        }
        Err(err) => {
            error!(error = err.to_string(), message_id = message_id, "failure to count retry");
            nack(delivery, ctx, span).await?;
            Ok(Disposition::Requeued)
        }
    }
}

async fn ack(
    delivery: &Delivery,
    ctx: &ConsumerContext,
    span: &mut BoxedSpan,
) -> Result<(), AmqpError> {
    if let Err(err) = ctx.channel.ack(delivery).await {
        error!(error = err.to_string(), "error whiling ack msg");
        span.record_error(&err);
        span.set_status(Status::Error {
            description: Cow::from("error to ack msg"),
        });
        return Err(AmqpError::AckMessageError);
    }

    Ok(())
}

async fn nack(
    delivery: &Delivery,
    ctx: &ConsumerContext,
    span: &mut BoxedSpan,
) -> Result<(), AmqpError> {
    if let Err(err) = ctx.channel.nack(delivery).await {
        error!(error = err.to_string(), "error whiling nack msg");
        span.record_error(&err);
        span.set_status(Status::Error {
            description: Cow::from("error to nack msg"),
        });
        return Err(AmqpError::NackMessageError);
    }

    Ok(())
}

async fn clear_counter(delivery: &Delivery, ctx: &ConsumerContext) {
    if ctx.max_retries.is_none() {
        return;
    }
    let Some(message_id) = delivery.message_id.as_deref() else {
        return;
    };

    if let Err(err) = ctx.retry_store.clear(message_id).await {
        warn!(error = err.to_string(), message_id = message_id, "failure to clear retry counter");
    }
}
