// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Descriptors
//!
//! This module provides the declarative description of the exchanges the
//! dispatcher installs on every (re)connection. An [`Exchange`] owns the
//! ordered list of [`Queue`]s bound to it, so a topology is simply a list of
//! exchanges.

use crate::queue::Queue;
use serde::{Deserialize, Serialize};

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of an exchange and the queues bound to it.
///
/// Exchanges are durable by default so the topology survives broker restarts;
/// use [`Exchange::transient`] to opt out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) kind: ExchangeKind,
    #[serde(default = "durable_by_default")]
    pub(crate) durable: bool,
    #[serde(default)]
    pub(crate) auto_delete: bool,
    #[serde(default)]
    pub(crate) internal: bool,
    #[serde(default)]
    pub(crate) queues: Vec<Queue>,
}

pub(crate) fn durable_by_default() -> bool {
    true
}

impl Exchange {
    /// Creates a new durable direct exchange with the given name and no queues.
    pub fn new(name: &str) -> Exchange {
        Exchange {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: true,
            auto_delete: false,
            internal: false,
            queues: vec![],
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Direct.
    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    /// Sets the exchange type to Fanout.
    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    /// Sets the exchange type to Topic.
    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Makes the exchange non-durable: it disappears on broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Appends a queue bound to this exchange.
    pub fn queue(mut self, queue: Queue) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }
}
