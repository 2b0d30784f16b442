// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Contract
//!
//! The dispatcher does not speak AMQP by itself. It drives a [`Transport`]
//! that opens [`Link`]s to the broker, and every link offers the handful of
//! operations the dispatcher needs: declarations, publishing, consuming and
//! close notification.
//!
//! The production implementation lives in [`crate::channel`] and is backed by
//! `lapin`.

use crate::{
    config::TlsSettings,
    errors::AmqpError,
    exchange::Exchange,
    queue::Queue,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::uri::AMQPUri;
use std::{collections::BTreeMap, sync::Arc};

/// Callback fired once when a link is lost.
pub type CloseCallback = Box<dyn FnOnce(AmqpError) + Send>;

/// Stream of deliveries of a single consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Whether deliveries are acknowledged by the broker on delivery or by the
/// consumer once the handler returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckMode {
    Auto,
    #[default]
    Manual,
}

/// How a manually acknowledged delivery is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Removes the message from the queue
    Ack,
    /// Gives the message back to the queue for redelivery
    Requeue,
    /// Drops the message, or dead-letters it when the queue is configured so
    Reject,
}

/// Message ready to be written on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message_id: String,
    pub msg_type: Option<String>,
    pub content_type: String,
    pub headers: BTreeMap<String, String>,
    pub data: Vec<u8>,
}

/// Message handed to a consumer handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub message_id: Option<String>,
    pub msg_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub data: Vec<u8>,
}

/// Settles a single delivery on the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;
    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message received from the broker together with the means to settle it.
///
/// Settling consumes the delivery, so a message is acknowledged or rejected
/// at most once.
pub struct Delivery {
    pub message: ConsumerMessage,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(message: ConsumerMessage, acker: Box<dyn Acker>) -> Delivery {
        Delivery { message, acker }
    }

    pub async fn settle(self, outcome: Outcome) -> Result<(), AmqpError> {
        match outcome {
            Outcome::Ack => self.acker.ack().await,
            Outcome::Requeue => self.acker.reject(true).await,
            Outcome::Reject => self.acker.reject(false).await,
        }
    }
}

/// A live session with the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Link: Send + Sync {
    async fn declare_exchange(&self, def: &Exchange) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &Queue) -> Result<(), AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError>;

    /// Starts a consumer tagged `consumer_tag` on `queue`.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        ack_mode: AckMode,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Registers the callback fired when the link is lost.
    ///
    /// When the link is already lost the callback fires immediately.
    fn on_close(&self, callback: CloseCallback);

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Opens links to the broker.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        uri: &AMQPUri,
        tls: Option<&TlsSettings>,
    ) -> Result<Arc<dyn Link>, AmqpError>;
}
