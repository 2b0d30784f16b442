// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Publishes messages on the link currently owned by the connection manager.
//! Omitted targets fall back to the configured [`PublishSettings`] and the
//! caller's OpenTelemetry context travels in the message headers.
//!
//! Publishing never waits for a reconnection: without a live link the call
//! fails with [`AmqpError::NotConnected`] and nothing is sent.

use crate::{
    config::PublishSettings,
    connection::ConnectionManager,
    errors::AmqpError,
    otel,
    transport::OutboundMessage,
};
use opentelemetry::Context;
use std::{collections::BTreeMap, sync::Arc};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message to publish, with optional target overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishMessage {
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub msg_type: Option<String>,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub data: Vec<u8>,
}

impl PublishMessage {
    pub fn new(data: &[u8]) -> PublishMessage {
        PublishMessage {
            data: data.to_vec(),
            ..Default::default()
        }
    }

    pub fn to(mut self, exchange: &str) -> Self {
        self.exchange = Some(exchange.to_owned());
        self
    }

    pub fn key(mut self, routing_key: &str) -> Self {
        self.routing_key = Some(routing_key.to_owned());
        self
    }

    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }
}

pub struct Publisher {
    manager: Arc<ConnectionManager>,
    settings: PublishSettings,
}

impl Publisher {
    pub fn new(manager: Arc<ConnectionManager>) -> Publisher {
        let settings = manager.config().default_publish_settings.clone();
        Publisher { manager, settings }
    }

    /// Sends `msg` on the current link.
    ///
    /// A link lost while publishing is reported as [`AmqpError::NotConnected`],
    /// like a publish issued between two connections.
    pub async fn publish(&self, ctx: &Context, msg: PublishMessage) -> Result<(), AmqpError> {
        let link = self.manager.current_link()?;
        let outbound = self.outbound(ctx, msg);

        if let Err(err) = link.publish(&outbound).await {
            self.manager.logger().error(
                "error publishing message",
                &[
                    ("error", &err),
                    ("exchange", &outbound.exchange),
                    ("routing_key", &outbound.routing_key),
                ],
            );
            if err.is_transient() {
                return Err(AmqpError::NotConnected);
            }
            return Err(err);
        }

        self.manager.logger().debug(
            "message published",
            &[
                ("exchange", &outbound.exchange),
                ("routing_key", &outbound.routing_key),
                ("message_id", &outbound.message_id),
            ],
        );

        Ok(())
    }

    fn outbound(&self, ctx: &Context, msg: PublishMessage) -> OutboundMessage {
        let mut headers = BTreeMap::new();
        otel::inject(ctx, &mut headers);
        headers.extend(msg.headers);

        OutboundMessage {
            exchange: msg
                .exchange
                .unwrap_or_else(|| self.settings.exchange.clone()),
            routing_key: msg
                .routing_key
                .unwrap_or_else(|| self.settings.routing_key.clone()),
            message_id: Uuid::new_v4().to_string(),
            msg_type: msg.msg_type,
            content_type: msg
                .content_type
                .unwrap_or_else(|| JSON_CONTENT_TYPE.to_owned()),
            headers,
            data: msg.data,
        }
    }
}
