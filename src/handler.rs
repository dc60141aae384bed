// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Registry
//!
//! One handler per queue name. Registering a second handler for the same queue
//! replaces the first.

use crate::{errors::HandlerError, queue::Binding};
use async_trait::async_trait;
use opentelemetry::Context;
use serde_json::Value;
use std::{collections::HashMap, future::Future, sync::Arc};
use tokio::sync::RwLock;
use tracing::info;

/// Processes the payload of a delivery.
///
/// Returning an error hands the delivery to the retry policy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, payload: &Value) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a [`ConsumerHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        FnHandler { f }
    }
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn exec(&self, _ctx: &Context, payload: &Value) -> Result<(), HandlerError> {
        (self.f)(payload.clone()).await
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ConsumerHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    /// Registers `handler` for the binding's queue.
    ///
    /// Returns `true` when a previous handler was replaced.
    pub async fn on(&self, binding: &Binding, handler: Arc<dyn ConsumerHandler>) -> bool {
        let queue = binding.queue_name();
        info!(queue = queue, "new handler registered");

        self.handlers
            .write()
            .await
            .insert(queue.to_owned(), handler)
            .is_some()
    }

    pub async fn get(&self, queue: &str) -> Option<Arc<dyn ConsumerHandler>> {
        self.handlers.read().await.get(queue).cloned()
    }
}
