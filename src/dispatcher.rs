// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Task Dispatcher
//!
//! The [`Dispatcher`] is the entry point applications use. It wires the
//! connection manager to the topology installer and the consumer registry,
//! then exposes publish and consume operations on top of them.
//!
//! ```ignore
//! let dispatcher = Dispatcher::new(config)?;
//! dispatcher.consume("default", AckMode::Manual, handler).await?;
//! dispatcher.open().await?;
//!
//! dispatcher.publish(Some("jobs"), Some("job.created"), b"{}").await?;
//! ```
//!
//! Consumers registered before [`Dispatcher::open`], or while the broker is
//! unreachable, are subscribed as soon as a link is established.

use crate::{
    channel::LapinTransport,
    config::ServerConfig,
    connection::{ConnectionManager, ConnectionState},
    consumer::ConsumerHandler,
    errors::AmqpError,
    publisher::{PublishMessage, Publisher},
    registry::{ConsumerRegistry, SubscriptionId},
    topology::TopologyInstaller,
    transport::{AckMode, Transport},
};
use opentelemetry::Context;
use std::sync::Arc;
use tokio::sync::watch;

pub struct Dispatcher {
    manager: Arc<ConnectionManager>,
    publisher: Publisher,
    registry: Arc<ConsumerRegistry>,
}

impl Dispatcher {
    /// Creates a dispatcher talking to the broker through `lapin`.
    pub fn new(config: ServerConfig) -> Result<Dispatcher, AmqpError> {
        let transport = Arc::new(LapinTransport::new(&config));
        Dispatcher::with_transport(config, transport)
    }

    /// Creates a dispatcher on top of a custom transport.
    ///
    /// The configuration is validated here; nothing is sent to the broker
    /// before [`Dispatcher::open`].
    ///
    /// # Parameters
    /// * `config` - Broker address, reconnection policy and topology
    /// * `transport` - Opens the links to the broker
    ///
    /// # Returns
    /// The dispatcher, or `ConfigError` when the configuration is invalid
    pub fn with_transport(
        config: ServerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Dispatcher, AmqpError> {
        let manager = ConnectionManager::new(config, transport)?;

        let installer = TopologyInstaller::new(
            manager.config().init_exchanges.clone(),
            manager.logger(),
        );
        let registry = Arc::new(ConsumerRegistry::new(manager.logger()));

        manager.subscribe(Arc::new(installer));
        manager.subscribe(registry.clone());

        Ok(Dispatcher {
            publisher: Publisher::new(manager.clone()),
            manager,
            registry,
        })
    }

    /// Connects to the broker, installs the topology and starts the
    /// registered consumers.
    pub async fn open(&self) -> Result<(), AmqpError> {
        self.manager.open().await
    }

    /// Publishes `payload`, falling back to the default publish settings for
    /// the omitted targets.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, `Some("")` for the default exchange
    /// * `routing_key` - Routing key of the message
    /// * `payload` - Message body, sent as JSON content
    ///
    /// # Returns
    /// Ok(()) once the message is handed to the broker, `NotConnected` while
    /// no link is available
    pub async fn publish(
        &self,
        exchange: Option<&str>,
        routing_key: Option<&str>,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        let mut msg = PublishMessage::new(payload);
        msg.exchange = exchange.map(str::to_owned);
        msg.routing_key = routing_key.map(str::to_owned);

        self.publish_message(&Context::current(), msg).await
    }

    pub async fn publish_message(&self, ctx: &Context, msg: PublishMessage) -> Result<(), AmqpError> {
        self.publisher.publish(ctx, msg).await
    }

    /// Registers `handler` on `queue`.
    ///
    /// The returned id stays valid across reconnections until
    /// [`Dispatcher::cancel_consume`] is called.
    ///
    /// # Parameters
    /// * `queue` - Queue to consume from
    /// * `ack_mode` - Whether the handler's outcome settles each delivery
    /// * `handler` - Application code run for every delivery
    ///
    /// # Returns
    /// The subscription id, or the broker's refusal when the queue cannot be
    /// consumed from
    pub async fn consume(
        &self,
        queue: &str,
        ack_mode: AckMode,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<SubscriptionId, AmqpError> {
        if self.manager.is_closed() {
            return Err(AmqpError::Closed);
        }

        let id = self.registry.register(queue, ack_mode, handler).await?;
        self.manager.logger().info(
            "consumer registered",
            &[("subscription", &id), ("queue", &queue)],
        );

        Ok(id)
    }

    pub async fn cancel_consume(&self, id: &SubscriptionId) -> Result<(), AmqpError> {
        self.registry.cancel(id).await
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.manager.state_changes()
    }

    /// Resolves once the dispatcher is closed, with the closing reason.
    pub async fn done(&self) -> AmqpError {
        self.manager.done().await
    }

    /// Stops every consumer and closes the connection.
    pub async fn close(&self) {
        self.manager.close().await;
    }
}
