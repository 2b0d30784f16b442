// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Dispatcher
//!
//! This module provides the error taxonomy shared by every component of the
//! dispatcher: configuration validation, connection establishment, topology
//! declaration, publishing, consuming and message settlement.
//!
//! Errors are split into two families. Transient errors (see
//! [`AmqpError::is_transient`]) are absorbed by the connection manager's retry
//! loop, while the remaining ones are either fatal or returned to the caller.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant names the operation that failed. Variants carrying a `String`
/// keep the name of the entity involved or the transport's description of the
/// failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Malformed or inconsistent configuration, never retried
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The broker refused the supplied credentials
    #[error("failure to authenticate: {0}")]
    AuthenticationError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// No usable channel: the connection is not in the connected state
    #[error("not connected")]
    NotConnected,

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// A consumer handler reported a failure for a message
    #[error("handler failure: {0}")]
    HandlerError(String),

    /// Every reconnection attempt allowed by the configuration failed
    #[error("server closed: reconnection retries exhausted after {0} attempts")]
    RetryBudgetExhausted(u32),

    /// The connection manager was closed
    #[error("server closed")]
    Closed,
}

impl AmqpError {
    /// Whether the error is recovered by retrying a connection attempt.
    ///
    /// Authentication failures are not listed here: whether they are retried
    /// depends on the configured [`crate::config::AuthFailurePolicy`].
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_)
                | AmqpError::ChannelError
                | AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingExchangeToQueueError(_, _)
                | AmqpError::QoSDeclarationError(_)
                | AmqpError::NotConnected
        )
    }
}
