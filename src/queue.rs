// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Descriptors
//!
//! This module provides the definition of a queue and the binding keys that
//! link it to its parent exchange, together with the conversion of the queue
//! limits into RabbitMQ declaration arguments.

use crate::exchange::durable_by_default;
use lapin::types::{AMQPValue, FieldTable, LongInt, ShortString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a queue with its binding keys and declaration parameters.
///
/// A queue without binding keys is bound to its exchange using its own name
/// as routing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) binding_keys: Vec<String>,
    #[serde(default = "durable_by_default")]
    pub(crate) durable: bool,
    #[serde(default)]
    pub(crate) auto_delete: bool,
    #[serde(default)]
    pub(crate) exclusive: bool,
    #[serde(default)]
    pub(crate) ttl: Option<i32>,
    #[serde(default)]
    pub(crate) max_length: Option<i32>,
    #[serde(default)]
    pub(crate) max_length_bytes: Option<i32>,
}

impl Queue {
    /// Creates a new durable queue definition with the given name.
    pub fn new(name: &str) -> Queue {
        Queue {
            name: name.to_owned(),
            binding_keys: vec![],
            durable: true,
            auto_delete: false,
            exclusive: false,
            ttl: None,
            max_length: None,
            max_length_bytes: None,
        }
    }

    /// Adds a binding key linking the queue to its exchange.
    pub fn binding_key(mut self, key: &str) -> Self {
        self.binding_keys.push(key.to_owned());
        self
    }

    /// Makes the queue non-durable.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binding_keys(&self) -> &[String] {
        &self.binding_keys
    }

    /// The routing keys used to bind the queue, without duplicates.
    ///
    /// Falls back to the queue name when no binding key was configured.
    pub fn routing_keys(&self) -> Vec<&str> {
        if self.binding_keys.is_empty() {
            return vec![self.name.as_str()];
        }

        let mut keys: Vec<&str> = Vec::with_capacity(self.binding_keys.len());
        for key in &self.binding_keys {
            if !keys.contains(&key.as_str()) {
                keys.push(key);
            }
        }
        keys
    }

    /// Declaration arguments derived from the queue limits.
    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        if let Some(max_bytes) = self.max_length_bytes {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongInt(LongInt::from(max_bytes)),
            );
        }

        FieldTable::from(args)
    }
}
