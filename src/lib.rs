// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Asynchronous AMQP task dispatcher.
//!
//! The crate keeps a supervised connection to an AMQP broker, declares the
//! configured exchanges, queues and bindings on every connection, and exposes
//! publish and consume operations that survive reconnections.

mod otel;

pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod logger;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod topology;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{AuthFailurePolicy, PublishSettings, ServerConfig, TlsSettings};
pub use connection::ConnectionState;
pub use consumer::ConsumerHandler;
pub use dispatcher::Dispatcher;
pub use errors::AmqpError;
pub use exchange::{Exchange, ExchangeKind};
pub use publisher::PublishMessage;
pub use queue::Queue;
pub use registry::SubscriptionId;
pub use transport::{AckMode, ConsumerMessage, Outcome};
