// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Installation
//!
//! This module replays the configured topology against the broker every time
//! the connection manager establishes a link. Declarations are idempotent on
//! the broker side, so installing the same topology twice is harmless.
//!
//! For every exchange, in configuration order:
//! 1. the exchange is declared
//! 2. each of its queues is declared
//! 3. each queue is bound with each of its routing keys
//!
//! The first failing declaration aborts the installation. The connection
//! manager then treats the whole connection attempt as failed.

use crate::{
    connection::ConnectionListener, errors::AmqpError, exchange::Exchange, logger::Logger,
    transport::Link,
};
use async_trait::async_trait;
use std::{collections::HashSet, sync::Arc};

/// Checks that every exchange and queue carries a name and that exchange
/// names are unique.
pub fn validate(exchanges: &[Exchange]) -> Result<(), AmqpError> {
    let mut seen = HashSet::new();

    for exchange in exchanges {
        if exchange.name().is_empty() {
            return Err(AmqpError::ConfigError("exchange name is empty".to_owned()));
        }

        if !seen.insert(exchange.name()) {
            return Err(AmqpError::ConfigError(format!(
                "exchange `{}` is declared more than once",
                exchange.name()
            )));
        }

        if exchange.queues().iter().any(|q| q.name().is_empty()) {
            return Err(AmqpError::ConfigError(format!(
                "exchange `{}` has a queue with an empty name",
                exchange.name()
            )));
        }
    }

    Ok(())
}

/// Declares the whole topology on the given link.
pub async fn install(link: &dyn Link, exchanges: &[Exchange]) -> Result<(), AmqpError> {
    for exchange in exchanges {
        link.declare_exchange(exchange).await?;

        for queue in exchange.queues() {
            link.declare_queue(queue).await?;

            for key in queue.routing_keys() {
                link.bind_queue(queue.name(), exchange.name(), key).await?;
            }
        }
    }

    Ok(())
}

/// Connection listener installing the topology on every new link.
pub struct TopologyInstaller {
    exchanges: Vec<Exchange>,
    logger: Arc<dyn Logger>,
}

impl TopologyInstaller {
    pub fn new(exchanges: Vec<Exchange>, logger: Arc<dyn Logger>) -> TopologyInstaller {
        TopologyInstaller { exchanges, logger }
    }
}

#[async_trait]
impl ConnectionListener for TopologyInstaller {
    async fn on_connected(&self, link: Arc<dyn Link>) -> Result<(), AmqpError> {
        match install(link.as_ref(), &self.exchanges).await {
            Ok(()) => {
                let exchanges = self.exchanges.len();
                self.logger
                    .info("topology installed", &[("exchanges", &exchanges)]);
                Ok(())
            }
            Err(err) => {
                self.logger
                    .error("failure to install topology", &[("error", &err)]);
                Err(err)
            }
        }
    }
}
