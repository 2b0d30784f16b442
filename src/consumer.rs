// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! This module runs the per-subscription consumer loops. Every delivery is
//! handed to the registered [`ConsumerHandler`]; under manual acknowledgement
//! the handler's verdict settles the delivery exactly once:
//! - `Ok(Outcome::Ack)` acknowledges the message
//! - `Ok(Outcome::Requeue)` rejects it and asks the broker to redeliver it
//! - `Ok(Outcome::Reject)` or `Err(_)` rejects it without requeue
//!
//! A failing handler never stops the loop. Only the end of the delivery
//! stream or the subscription's cancellation token does.

use crate::{
    errors::AmqpError,
    logger::Logger,
    otel,
    registry::ConsumerRegistration,
    transport::{AckMode, ConsumerMessage, Delivery, DeliveryStream, Outcome},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, sync::Arc};
use tokio_util::sync::CancellationToken;

/// Application code processing the messages of a subscription.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<Outcome, AmqpError>;
}

/// Consumes `stream` until it ends or `token` is cancelled.
///
/// Handlers run one at a time, in delivery order. A handler already running
/// when the token is cancelled is allowed to finish; deliveries still buffered
/// at that point are left to the broker.
///
/// # Parameters
/// * `stream` - Deliveries of a single subscription
/// * `registration` - The subscription the deliveries belong to
/// * `token` - Stops the loop once cancelled
/// * `logger` - Receives handler and settlement failures
pub(crate) async fn consume_loop(
    mut stream: DeliveryStream,
    registration: ConsumerRegistration,
    token: CancellationToken,
    logger: Arc<dyn Logger>,
) {
    let tracer = global::tracer(otel::CONSUMER_TRACER);

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                if let Err(err) = consume(&tracer, delivery, &registration, logger.as_ref()).await
                {
                    logger.error(
                        "error consume msg",
                        &[("error", &err), ("queue", &registration.queue)],
                    );
                }
            }
            Some(Err(err)) => logger.error(
                "errors consume msg",
                &[("error", &err), ("queue", &registration.queue)],
            ),
            None => break,
        }
    }

    logger.debug(
        "consumer stopped",
        &[("subscription", &registration.id), ("queue", &registration.queue)],
    );
}

/// Processes a single delivery and settles it according to the ack mode.
///
/// # Returns
/// Ok(()) when the delivery was handled, or the settlement error under manual
/// acknowledgement
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: Delivery,
    registration: &ConsumerRegistration,
    logger: &dyn Logger,
) -> Result<(), AmqpError> {
    let msg = &delivery.message;
    let span_name = msg.msg_type.clone().unwrap_or_else(|| msg.queue.clone());
    let (ctx, mut span) = otel::new_span(&msg.headers, tracer, &span_name);

    logger.debug(
        "received",
        &[
            ("queue", &msg.queue),
            ("exchange", &msg.exchange),
            ("routing_key", &msg.routing_key),
        ],
    );

    let result = registration.handler.exec(&ctx, msg).await;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            logger.warn(
                "error while handling msg",
                &[("error", &err), ("queue", &msg.queue)],
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("handler failure"),
            });
            Outcome::Reject
        }
    };

    if registration.ack_mode == AckMode::Auto {
        return Ok(());
    }

    match delivery.settle(outcome).await {
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to settle msg"),
            });
            Err(err)
        }
        Ok(()) => {
            if outcome == Outcome::Ack {
                span.set_status(Status::Ok);
            }
            Ok(())
        }
    }
}
