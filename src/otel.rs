// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels inside message headers: it is injected on publish and
//! extracted on delivery, where it becomes the parent of the consumer span.

use crate::transport::Headers;
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use serde_json::Value;
use std::borrow::Cow;

/// An adapter for injecting and extracting OpenTelemetry context from message headers.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), Value::String(value));
    }
}

/// Read-only view used on the consuming side.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a Headers,
}

impl Extractor for HeaderExtractor<'_> {
    /// Only string headers can carry trace context.
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(Value::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Writes the given context into `headers` with the global propagator.
pub(crate) fn inject(ctx: &Context, headers: &mut Headers) {
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderPropagator::new(headers))
    });
}

/// Creates a new consumer span for message processing.
///
/// The parent context is extracted from the delivery headers; the extracted
/// context is returned alongside the span.
pub(crate) fn new_span(headers: &Headers, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor { headers })
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
