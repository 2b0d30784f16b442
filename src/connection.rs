// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! The [`ConnectionManager`] owns the link to the broker and runs the
//! reconnection state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (link lost) -> Reconnecting
//!                    ^    |                                     |
//!                    |    +-- attempt failed --> Reconnecting   |
//!                    +------------- after the interval ---------+
//! ```
//!
//! Every state can move to `Closed`, either through [`ConnectionManager::close`]
//! or when the retry budget is exhausted. `Closed` is terminal.
//!
//! An attempt only succeeds once every [`ConnectionListener`] accepted the new
//! link, in subscription order. The dispatcher subscribes the topology
//! installer first and the consumer registry second, so `Connected` is only
//! advertised once the topology is declared and the consumers are replayed.

use crate::{
    config::{AuthFailurePolicy, ServerConfig},
    errors::AmqpError,
    logger::Logger,
    transport::{Link, Transport},
};
use async_trait::async_trait;
use lapin::uri::AMQPUri;
use std::{
    fmt,
    sync::{Arc, Mutex, RwLock},
};
use tokio::{
    sync::{mpsc, watch},
    time::sleep,
};
use tokio_util::sync::CancellationToken;

/// Lifecycle of the connection to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Observer of the link lifecycle.
///
/// `on_connected` runs before the new link is advertised; returning an error
/// fails the connection attempt.
#[async_trait]
pub trait ConnectionListener: Send + Sync {
    async fn on_connected(&self, link: Arc<dyn Link>) -> Result<(), AmqpError>;

    async fn on_disconnected(&self) {}

    async fn on_closed(&self) {}
}

/// Link-lost notification tagged with the generation of the lost link.
type LostLink = (u64, AmqpError);

struct LinkSlot {
    link: Option<Arc<dyn Link>>,
    generation: u64,
    closed: bool,
}

/// Owner of the broker link and of the reconnection state machine.
pub struct ConnectionManager {
    config: Arc<ServerConfig>,
    uri: AMQPUri,
    transport: Arc<dyn Transport>,
    logger: Arc<dyn Logger>,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    slot: Arc<Mutex<LinkSlot>>,
    state: watch::Sender<ConnectionState>,
    done: watch::Sender<Option<AmqpError>>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Validates the configuration and builds a manager in the
    /// `Disconnected` state.
    ///
    /// Configuration errors are returned here and never retried.
    ///
    /// # Parameters
    /// * `config` - Validated into the broker URI
    /// * `transport` - Opens every link, on first connection and reconnection
    pub fn new(
        config: ServerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<ConnectionManager>, AmqpError> {
        let uri = config.validate()?;
        let logger = config.logger();

        Ok(Arc::new(ConnectionManager {
            config: Arc::new(config),
            uri,
            transport,
            logger,
            listeners: RwLock::new(vec![]),
            slot: Arc::new(Mutex::new(LinkSlot {
                link: None,
                generation: 0,
                closed: false,
            })),
            state: watch::Sender::new(ConnectionState::Disconnected),
            done: watch::Sender::new(None),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn logger(&self) -> Arc<dyn Logger> {
        self.logger.clone()
    }

    /// Adds a listener notified on every link change, after the ones already
    /// subscribed.
    pub fn subscribe(&self, listener: Arc<dyn ConnectionListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Stream of state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Establishes the first connection and starts supervising it.
    ///
    /// Fails once the whole retry budget is spent without a usable link, in
    /// which case the manager is closed.
    ///
    /// # Returns
    /// Ok(()) once `Connected`, `RetryBudgetExhausted` when every attempt
    /// failed, or a `ConnectionError` when the manager was already opened
    pub async fn open(self: &Arc<Self>) -> Result<(), AmqpError> {
        let opened = self.state.send_if_modified(|current| {
            if *current != ConnectionState::Disconnected {
                return false;
            }
            *current = ConnectionState::Connecting;
            true
        });

        if !opened {
            return Err(AmqpError::ConnectionError(
                "connection manager already opened".to_owned(),
            ));
        }

        let (lost_tx, lost_rx) = mpsc::unbounded_channel();

        match self.connect_with_retries(&lost_tx).await {
            Ok(()) => {
                tokio::spawn(self.clone().supervise(lost_tx, lost_rx));
                Ok(())
            }
            Err(err) => {
                self.finish(err.clone()).await;
                Err(err)
            }
        }
    }

    /// The live link, only while the manager is `Connected`.
    ///
    /// Callers must fetch it per operation and never keep it across
    /// reconnections.
    pub fn current_link(&self) -> Result<Arc<dyn Link>, AmqpError> {
        let Ok(slot) = self.slot.lock() else {
            return Err(AmqpError::InternalError);
        };

        if slot.closed {
            return Err(AmqpError::Closed);
        }

        match (&slot.link, self.state()) {
            (Some(link), ConnectionState::Connected) => Ok(link.clone()),
            _ => Err(AmqpError::NotConnected),
        }
    }

    /// Closes the manager and releases the link. Calling it again is a no-op.
    pub async fn close(&self) {
        self.finish(AmqpError::Closed).await;
    }

    /// Resolves once the manager is closed, with the reason it closed for.
    pub async fn done(&self) -> AmqpError {
        let mut rx = self.done.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        reason.unwrap_or(AmqpError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.done.borrow().is_some()
    }

    /// Waits for link losses and reconnects until closed.
    async fn supervise(
        self: Arc<Self>,
        lost_tx: mpsc::UnboundedSender<LostLink>,
        mut lost_rx: mpsc::UnboundedReceiver<LostLink>,
    ) {
        loop {
            let lost = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                lost = lost_rx.recv() => lost,
            };

            let Some((generation, reason)) = lost else {
                return;
            };

            if !self.drop_link(generation) {
                continue;
            }

            self.logger
                .warn("connection lost", &[("reason", &reason)]);
            self.set_state(ConnectionState::Reconnecting);

            for listener in self.listeners() {
                listener.on_disconnected().await;
            }

            match self.connect_with_retries(&lost_tx).await {
                Ok(()) => self.logger.info("reconnected", &[]),
                Err(err) => {
                    self.finish(err).await;
                    return;
                }
            }
        }
    }

    /// Runs up to `reconnection_retries + 1` attempts, the first one
    /// immediately and the others after the configured interval.
    async fn connect_with_retries(
        &self,
        lost_tx: &mpsc::UnboundedSender<LostLink>,
    ) -> Result<(), AmqpError> {
        let attempts = self.config.reconnection_retries.saturating_add(1);
        let interval = self.config.reconnection_interval();

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(AmqpError::Closed),
                    _ = sleep(interval) => {}
                }
            }

            self.logger.info(
                "connecting to the broker",
                &[("attempt", &attempt), ("attempts", &attempts)],
            );

            let err = match self.connect_once(lost_tx).await {
                Ok(()) => {
                    self.logger
                        .info("connected to the broker", &[("attempt", &attempt)]);
                    return Ok(());
                }
                Err(err) => err,
            };

            if let AmqpError::AuthenticationError(_) = err {
                if self.config.auth_failure_policy == AuthFailurePolicy::Fatal {
                    self.logger
                        .error("broker refused the credentials", &[("error", &err)]);
                    return Err(err);
                }
            } else if !err.is_transient() {
                return Err(err);
            }

            self.logger.warn(
                "connection attempt failed",
                &[("attempt", &attempt), ("error", &err)],
            );
            self.set_state(ConnectionState::Reconnecting);
        }

        self.logger.error(
            "reconnection retries exhausted, closing the server",
            &[("attempts", &attempts)],
        );
        Err(AmqpError::RetryBudgetExhausted(attempts))
    }

    /// A single attempt: connect, run the listeners, then publish the link.
    async fn connect_once(
        &self,
        lost_tx: &mpsc::UnboundedSender<LostLink>,
    ) -> Result<(), AmqpError> {
        if self.shutdown.is_cancelled() {
            return Err(AmqpError::Closed);
        }

        self.set_state(ConnectionState::Connecting);

        let link = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(AmqpError::Closed),
            link = self.transport.connect(&self.uri, self.config.tls()) => link?,
        };

        for listener in self.listeners() {
            if let Err(err) = listener.on_connected(link.clone()).await {
                self.release(&link).await;
                return Err(err);
            }
        }

        let generation = {
            let Ok(mut slot) = self.slot.lock() else {
                return Err(AmqpError::InternalError);
            };

            if slot.closed {
                None
            } else {
                slot.generation += 1;
                slot.link = Some(link.clone());
                Some(slot.generation)
            }
        };

        let Some(generation) = generation else {
            self.release(&link).await;
            return Err(AmqpError::Closed);
        };

        let tx = lost_tx.clone();
        let slot = self.slot.clone();
        link.on_close(Box::new(move |reason| {
            // stop handing out the link before the supervisor runs
            if let Ok(mut slot) = slot.lock() {
                if slot.generation == generation {
                    slot.link = None;
                }
            }
            let _ = tx.send((generation, reason));
        }));

        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// Forgets the link of `generation`; false when it is not the current one.
    fn drop_link(&self, generation: u64) -> bool {
        let Ok(mut slot) = self.slot.lock() else {
            return false;
        };

        if slot.closed || slot.generation != generation {
            return false;
        }

        slot.link = None;
        true
    }

    /// Moves to `Closed`, notifies listeners and wakes `done` waiters.
    async fn finish(&self, reason: AmqpError) {
        let link = {
            let Ok(mut slot) = self.slot.lock() else {
                return;
            };
            if slot.closed {
                return;
            }
            slot.closed = true;
            slot.link.take()
        };

        self.shutdown.cancel();
        self.set_state(ConnectionState::Closed);

        for listener in self.listeners() {
            listener.on_closed().await;
        }

        if let Some(link) = link {
            self.release(&link).await;
        }

        match &reason {
            AmqpError::Closed => self.logger.info("server closed", &[]),
            err => self
                .logger
                .error("server closed", &[("reason", err)]),
        }

        self.done.send_replace(Some(reason));
    }

    async fn release(&self, link: &Arc<dyn Link>) {
        if let Err(err) = link.close().await {
            self.logger
                .warn("failure to close the link", &[("error", &err)]);
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => vec![],
        }
    }
}
