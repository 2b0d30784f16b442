// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Registry
//!
//! The registry remembers every active subscription so it can be replayed on
//! each new link. It is subscribed to the connection manager after the
//! topology installer: by the time it replays, every queue exists.
//!
//! All bookkeeping happens under a single async mutex. Registrations added
//! from application tasks therefore never race with a replay: a registration
//! made before the replay is subscribed by it, one made after it is
//! subscribed on the link the replay installed.

use crate::{
    connection::ConnectionListener,
    consumer::{consume_loop, ConsumerHandler},
    errors::AmqpError,
    logger::Logger,
    transport::{AckMode, Link},
};
use async_trait::async_trait;
use std::{fmt, sync::Arc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identifier returned by `consume`, also used as AMQP consumer tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub(crate) fn new() -> SubscriptionId {
        SubscriptionId(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A consumer the application asked for.
#[derive(Clone)]
pub struct ConsumerRegistration {
    pub id: SubscriptionId,
    pub queue: String,
    pub ack_mode: AckMode,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
}

struct Entry {
    registration: ConsumerRegistration,
    /// Cancels the running consumer loop, present while subscribed
    worker: Option<CancellationToken>,
}

#[derive(Default)]
struct RegistryState {
    link: Option<Arc<dyn Link>>,
    entries: Vec<Entry>,
    closed: bool,
}

/// Subscription id to registration mapping, replayed on every reconnection.
pub struct ConsumerRegistry {
    logger: Arc<dyn Logger>,
    shutdown: CancellationToken,
    state: Mutex<RegistryState>,
}

impl ConsumerRegistry {
    pub fn new(logger: Arc<dyn Logger>) -> ConsumerRegistry {
        ConsumerRegistry {
            logger,
            shutdown: CancellationToken::new(),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Records a consumer and subscribes it when a link is available.
    ///
    /// Without a live link the registration stays pending until the next
    /// reconnection. A subscription refused by the broker is not recorded.
    pub async fn register(
        &self,
        queue: &str,
        ack_mode: AckMode,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<SubscriptionId, AmqpError> {
        let mut state = self.state.lock().await;

        if state.closed {
            return Err(AmqpError::Closed);
        }

        let mut entry = Entry {
            registration: ConsumerRegistration {
                id: SubscriptionId::new(),
                queue: queue.to_owned(),
                ack_mode,
                handler,
            },
            worker: None,
        };

        match state.link.clone() {
            Some(link) => match self.start(link.as_ref(), &mut entry).await {
                Ok(()) => {}
                Err(err) if err.is_transient() => self.logger.debug(
                    "consumer registered while the link is lost",
                    &[("queue", &queue), ("error", &err)],
                ),
                Err(err) => return Err(err),
            },
            None => self.logger.debug(
                "consumer registered while disconnected",
                &[("queue", &queue)],
            ),
        }

        let id = entry.registration.id;
        state.entries.push(entry);
        Ok(id)
    }

    /// Removes a registration and cancels its broker consumer.
    ///
    /// Unknown or already cancelled ids are accepted.
    pub async fn cancel(&self, id: &SubscriptionId) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;

        let Some(position) = state
            .entries
            .iter()
            .position(|entry| entry.registration.id == *id)
        else {
            return Ok(());
        };

        let entry = state.entries.remove(position);
        let Some(worker) = entry.worker else {
            return Ok(());
        };
        worker.cancel();

        let Some(link) = &state.link else {
            return Ok(());
        };

        match link.cancel(&id.to_string()).await {
            // the broker dropped the consumer along with the link
            Err(err) if err.is_transient() => Ok(()),
            res => res,
        }
    }

    /// Registrations in registration order.
    pub async fn registrations(&self) -> Vec<ConsumerRegistration> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .map(|entry| entry.registration.clone())
            .collect()
    }

    /// Number of registrations with a running consumer loop.
    pub async fn active(&self) -> usize {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .filter(|entry| entry.worker.is_some())
            .count()
    }

    async fn start(&self, link: &dyn Link, entry: &mut Entry) -> Result<(), AmqpError> {
        let registration = &entry.registration;
        let stream = link
            .consume(
                &registration.queue,
                &registration.id.to_string(),
                registration.ack_mode,
            )
            .await?;

        let token = self.shutdown.child_token();
        tokio::spawn(consume_loop(
            stream,
            registration.clone(),
            token.clone(),
            self.logger.clone(),
        ));

        entry.worker = Some(token);
        Ok(())
    }
}

#[async_trait]
impl ConnectionListener for ConsumerRegistry {
    /// Replays every registration on the new link.
    ///
    /// Failures are logged and left for the next reconnection; they never fail
    /// the connection attempt.
    async fn on_connected(&self, link: Arc<dyn Link>) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;
        state.link = Some(link.clone());

        let mut entries = std::mem::take(&mut state.entries);
        for entry in entries.iter_mut() {
            if let Some(stale) = entry.worker.take() {
                stale.cancel();
            }

            if let Err(err) = self.start(link.as_ref(), entry).await {
                self.logger.warn(
                    "failure to resubscribe consumer",
                    &[
                        ("subscription", &entry.registration.id),
                        ("queue", &entry.registration.queue),
                        ("error", &err),
                    ],
                );
            }
        }
        state.entries = entries;

        let active = state.entries.iter().filter(|e| e.worker.is_some()).count();
        if active > 0 {
            self.logger
                .info("consumers resubscribed", &[("count", &active)]);
        }

        Ok(())
    }

    async fn on_disconnected(&self) {
        let mut state = self.state.lock().await;
        state.link = None;

        for entry in state.entries.iter_mut() {
            if let Some(worker) = entry.worker.take() {
                worker.cancel();
            }
        }
    }

    async fn on_closed(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.link = None;
        state.entries.clear();
        self.shutdown.cancel();
    }
}
