// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels inside message headers: the publisher injects the
//! caller's context and consumers extract it to parent their spans.

use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

/// Name of the tracer used for consumer spans.
pub(crate) const CONSUMER_TRACER: &str = "amqp consumer";

/// Adapter injecting OpenTelemetry context into outgoing message headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<String, String>,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

/// Adapter extracting OpenTelemetry context from received message headers.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<String, String>,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Writes the propagation fields of `ctx` into `headers`.
pub(crate) fn inject(ctx: &Context, headers: &mut BTreeMap<String, String>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector::new(headers))
    });
}

/// Creates a consumer span parented by the context carried in `headers`.
pub(crate) fn new_span(
    headers: &BTreeMap<String, String>,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
