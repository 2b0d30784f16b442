// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker and recording collaborators shared by the unit tests.

use crate::{
    config::TlsSettings,
    errors::AmqpError,
    exchange::{Exchange, ExchangeKind},
    logger::{render, Fields, Logger},
    queue::Queue,
    transport::{
        AckMode, Acker, CloseCallback, ConsumerMessage, Delivery, DeliveryStream, Link,
        OutboundMessage, Transport,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::uri::AMQPUri;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{
    sync::{mpsc, Semaphore},
    time::Instant,
};

/// Polls `check` until it holds, sleeping a little between polls.
pub(crate) async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Logger keeping every entry in memory.
#[derive(Default)]
pub(crate) struct RecordingLogger {
    entries: Mutex<Vec<(&'static str, String, String)>>,
}

impl RecordingLogger {
    pub(crate) fn contains(&self, level: &str, message: &str) -> bool {
        self.count(level, message) > 0
    }

    pub(crate) fn count(&self, level: &str, message: &str) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, m, _)| *l == level && m == message)
            .count()
    }

    fn push(&self, level: &'static str, message: &str, fields: Fields<'_>) {
        self.entries
            .lock()
            .unwrap()
            .push((level, message.to_owned(), render(fields)));
    }
}

impl Logger for RecordingLogger {
    fn debug(&self, message: &str, fields: Fields<'_>) {
        self.push("debug", message, fields);
    }

    fn info(&self, message: &str, fields: Fields<'_>) {
        self.push("info", message, fields);
    }

    fn warn(&self, message: &str, fields: Fields<'_>) {
        self.push("warn", message, fields);
    }

    fn error(&self, message: &str, fields: Fields<'_>) {
        self.push("error", message, fields);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Settled {
    Ack,
    Reject { requeue: bool },
}

/// Acker recording how deliveries were settled.
#[derive(Clone)]
pub(crate) struct RecordingAcker {
    settled: Arc<Mutex<Vec<Settled>>>,
}

impl RecordingAcker {
    pub(crate) fn new() -> (RecordingAcker, Arc<Mutex<Vec<Settled>>>) {
        let settled = Arc::new(Mutex::new(vec![]));
        (
            RecordingAcker {
                settled: settled.clone(),
            },
            settled,
        )
    }
}

#[async_trait]
impl Acker for RecordingAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.settled.lock().unwrap().push(Settled::Ack);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.settled.lock().unwrap().push(Settled::Reject { requeue });
        Ok(())
    }
}

#[derive(Clone)]
struct FakeMessage {
    exchange: String,
    routing_key: String,
    message_id: Option<String>,
    msg_type: Option<String>,
    headers: BTreeMap<String, String>,
    data: Vec<u8>,
    redelivered: bool,
}

struct FakeConsumer {
    tag: String,
    link_id: u64,
    ack_mode: AckMode,
    tx: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

#[derive(Default)]
struct FakeQueue {
    messages: VecDeque<FakeMessage>,
    consumers: Vec<FakeConsumer>,
    next_consumer: usize,
}

struct Unacked {
    link_id: u64,
    queue: String,
    message: FakeMessage,
}

struct LinkRecord {
    alive: bool,
    on_close: Option<CloseCallback>,
}

struct BrokerState {
    reachable: bool,
    refuse_credentials: bool,
    connect_failures: usize,
    declaration_failures: usize,
    connect_times: Vec<Instant>,
    exchanges: BTreeMap<String, ExchangeKind>,
    queues: BTreeMap<String, FakeQueue>,
    bindings: BTreeSet<(String, String, String)>,
    links: HashMap<u64, LinkRecord>,
    next_link: u64,
    closed_links: usize,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    consume_calls: HashMap<String, usize>,
    consume_gate: Option<Arc<Semaphore>>,
    published: usize,
    acked: usize,
    rejected: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        BrokerState {
            reachable: true,
            refuse_credentials: false,
            connect_failures: 0,
            declaration_failures: 0,
            connect_times: vec![],
            exchanges: BTreeMap::new(),
            queues: BTreeMap::new(),
            bindings: BTreeSet::new(),
            links: HashMap::new(),
            next_link: 0,
            closed_links: 0,
            next_tag: 0,
            unacked: BTreeMap::new(),
            consume_calls: HashMap::new(),
            consume_gate: None,
            published: 0,
            acked: 0,
            rejected: 0,
        }
    }
}

/// In-memory broker with direct and fanout routing and failure injection.
#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub(crate) fn new() -> FakeBroker {
        FakeBroker::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub(crate) fn refuse_credentials(&self, refuse: bool) {
        self.lock().refuse_credentials = refuse;
    }

    pub(crate) fn fail_next_connects(&self, count: usize) {
        self.lock().connect_failures = count;
    }

    pub(crate) fn fail_next_declarations(&self, count: usize) {
        self.lock().declaration_failures = count;
    }

    /// Holds every following `consume` until the returned semaphore hands
    /// out permits, one permit per call.
    pub(crate) fn gate_consumes(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.lock().consume_gate = Some(gate.clone());
        gate
    }

    pub(crate) fn add_queue(&self, name: &str) {
        self.lock().queues.entry(name.to_owned()).or_default();
    }

    /// Puts a message straight into a queue.
    pub(crate) fn enqueue(&self, queue: &str, data: &[u8]) {
        let mut state = self.lock();
        state
            .queues
            .entry(queue.to_owned())
            .or_default()
            .messages
            .push_back(FakeMessage {
                exchange: String::new(),
                routing_key: queue.to_owned(),
                message_id: None,
                msg_type: None,
                headers: BTreeMap::new(),
                data: data.to_vec(),
                redelivered: false,
            });
        self.dispatch(&mut state, queue);
    }

    /// Simulates the loss of every live link.
    pub(crate) fn drop_links(&self) {
        let callbacks: Vec<CloseCallback> = {
            let mut state = self.lock();
            let ids: Vec<u64> = state
                .links
                .iter()
                .filter(|(_, record)| record.alive)
                .map(|(id, _)| *id)
                .collect();

            let mut callbacks = vec![];
            for id in ids {
                Self::kill_link(&mut state, id);
                if let Some(record) = state.links.get_mut(&id) {
                    if let Some(callback) = record.on_close.take() {
                        callbacks.push(callback);
                    }
                }
            }
            callbacks
        };

        for callback in callbacks {
            callback(AmqpError::ConnectionError("connection reset by peer".to_owned()));
        }
    }

    pub(crate) fn connect_attempts(&self) -> usize {
        self.lock().connect_times.len()
    }

    pub(crate) fn connect_times(&self) -> Vec<Instant> {
        self.lock().connect_times.clone()
    }

    pub(crate) fn closed_links(&self) -> usize {
        self.lock().closed_links
    }

    pub(crate) fn exchange_count(&self) -> usize {
        self.lock().exchanges.len()
    }

    pub(crate) fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    pub(crate) fn binding_count(&self) -> usize {
        self.lock().bindings.len()
    }

    pub(crate) fn has_binding(&self, exchange: &str, queue: &str, key: &str) -> bool {
        self.lock().bindings.contains(&(
            exchange.to_owned(),
            queue.to_owned(),
            key.to_owned(),
        ))
    }

    pub(crate) fn consume_calls(&self, queue: &str) -> usize {
        self.lock().consume_calls.get(queue).copied().unwrap_or(0)
    }

    pub(crate) fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Messages waiting in a queue, not counting unacknowledged ones.
    pub(crate) fn ready(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    pub(crate) fn unacked(&self) -> usize {
        self.lock().unacked.len()
    }

    pub(crate) fn published(&self) -> usize {
        self.lock().published
    }

    pub(crate) fn acked(&self) -> usize {
        self.lock().acked
    }

    pub(crate) fn rejected(&self) -> usize {
        self.lock().rejected
    }

    fn is_alive(&self, link_id: u64) -> Result<(), AmqpError> {
        match self.lock().links.get(&link_id) {
            Some(record) if record.alive => Ok(()),
            _ => Err(AmqpError::ConnectionError("link closed".to_owned())),
        }
    }

    fn take_declaration_failure(state: &mut BrokerState) -> bool {
        if state.declaration_failures > 0 {
            state.declaration_failures -= 1;
            return true;
        }
        false
    }

    /// Marks the link dead, drops its consumers and requeues its deliveries.
    fn kill_link(state: &mut BrokerState, link_id: u64) {
        if let Some(record) = state.links.get_mut(&link_id) {
            record.alive = false;
        }

        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.link_id != link_id);
        }

        let tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.link_id == link_id)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in tags.into_iter().rev() {
            if let Some(mut unacked) = state.unacked.remove(&tag) {
                unacked.message.redelivered = true;
                state
                    .queues
                    .entry(unacked.queue)
                    .or_default()
                    .messages
                    .push_front(unacked.message);
            }
        }
    }

    /// Hands ready messages of `queue` to its consumers, round robin.
    fn dispatch(&self, state: &mut BrokerState, queue_name: &str) {
        loop {
            let tag = state.next_tag + 1;

            let Some(queue) = state.queues.get_mut(queue_name) else {
                return;
            };
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let index = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = index + 1;
            let Some(message) = queue.messages.pop_front() else {
                return;
            };

            let consumer = &queue.consumers[index];
            let ack_mode = consumer.ack_mode;
            let link_id = consumer.link_id;

            let delivery = Delivery::new(
                ConsumerMessage {
                    queue: queue_name.to_owned(),
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    delivery_tag: tag,
                    redelivered: message.redelivered,
                    message_id: message.message_id.clone(),
                    msg_type: message.msg_type.clone(),
                    headers: message.headers.clone(),
                    data: message.data.clone(),
                },
                Box::new(FakeAcker {
                    broker: self.clone(),
                    tag,
                }),
            );

            if consumer.tx.send(Ok(delivery)).is_err() {
                queue.consumers.remove(index);
                queue.messages.push_front(message);
                continue;
            }

            state.next_tag = tag;
            if ack_mode == AckMode::Manual {
                state.unacked.insert(
                    tag,
                    Unacked {
                        link_id,
                        queue: queue_name.to_owned(),
                        message,
                    },
                );
            } else {
                state.acked += 1;
            }
        }
    }
}

#[async_trait]
impl Transport for FakeBroker {
    async fn connect(
        &self,
        _uri: &AMQPUri,
        _tls: Option<&TlsSettings>,
    ) -> Result<Arc<dyn Link>, AmqpError> {
        let mut state = self.lock();
        state.connect_times.push(Instant::now());

        if !state.reachable {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        if state.refuse_credentials {
            return Err(AmqpError::AuthenticationError("ACCESS_REFUSED".to_owned()));
        }

        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        state.next_link += 1;
        let id = state.next_link;
        state.links.insert(
            id,
            LinkRecord {
                alive: true,
                on_close: None,
            },
        );

        Ok(Arc::new(FakeLink {
            broker: self.clone(),
            id,
        }))
    }
}

struct FakeAcker {
    broker: FakeBroker,
    tag: u64,
}

#[async_trait]
impl Acker for FakeAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        match state.unacked.remove(&self.tag) {
            Some(_) => {
                state.acked += 1;
                Ok(())
            }
            None => Err(AmqpError::AckMessageError),
        }
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        let Some(mut unacked) = state.unacked.remove(&self.tag) else {
            return Err(AmqpError::RejectMessageError);
        };

        if !requeue {
            state.rejected += 1;
            return Ok(());
        }

        unacked.message.redelivered = true;
        state
            .queues
            .entry(unacked.queue.clone())
            .or_default()
            .messages
            .push_front(unacked.message);
        self.broker.dispatch(&mut state, &unacked.queue);
        Ok(())
    }
}

struct FakeLink {
    broker: FakeBroker,
    id: u64,
}

#[async_trait]
impl Link for FakeLink {
    async fn declare_exchange(&self, def: &Exchange) -> Result<(), AmqpError> {
        self.broker.is_alive(self.id)?;
        let mut state = self.broker.lock();

        if FakeBroker::take_declaration_failure(&mut state) {
            return Err(AmqpError::DeclareExchangeError(def.name().to_owned()));
        }

        match state.exchanges.get(def.name()) {
            Some(kind) if *kind != def.exchange_kind() => {
                Err(AmqpError::DeclareExchangeError(def.name().to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(def.name().to_owned(), def.exchange_kind());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &Queue) -> Result<(), AmqpError> {
        self.broker.is_alive(self.id)?;
        let mut state = self.broker.lock();

        if FakeBroker::take_declaration_failure(&mut state) {
            return Err(AmqpError::DeclareQueueError(def.name().to_owned()));
        }

        state.queues.entry(def.name().to_owned()).or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.broker.is_alive(self.id)?;
        let mut state = self.broker.lock();

        if FakeBroker::take_declaration_failure(&mut state)
            || !state.exchanges.contains_key(exchange)
            || !state.queues.contains_key(queue)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        state.bindings.insert((
            exchange.to_owned(),
            queue.to_owned(),
            routing_key.to_owned(),
        ));
        Ok(())
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        self.broker.is_alive(self.id)?;
        let mut state = self.broker.lock();

        let targets: Vec<String> = if msg.exchange.is_empty() {
            vec![msg.routing_key.clone()]
        } else {
            let Some(kind) = state.exchanges.get(&msg.exchange).copied() else {
                return Err(AmqpError::PublishingError(format!(
                    "no exchange `{}`",
                    msg.exchange
                )));
            };
            state
                .bindings
                .iter()
                .filter(|(ex, _, key)| {
                    *ex == msg.exchange
                        && (kind == ExchangeKind::Fanout || *key == msg.routing_key)
                })
                .map(|(_, queue, _)| queue.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        };

        state.published += 1;

        for target in targets {
            let Some(queue) = state.queues.get_mut(&target) else {
                continue;
            };
            queue.messages.push_back(FakeMessage {
                exchange: msg.exchange.clone(),
                routing_key: msg.routing_key.clone(),
                message_id: Some(msg.message_id.clone()),
                msg_type: msg.msg_type.clone(),
                headers: msg.headers.clone(),
                data: msg.data.clone(),
                redelivered: false,
            });
            self.broker.dispatch(&mut state, &target);
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        ack_mode: AckMode,
    ) -> Result<DeliveryStream, AmqpError> {
        self.broker.is_alive(self.id)?;

        let gate = {
            let mut state = self.broker.lock();
            *state.consume_calls.entry(queue.to_owned()).or_default() += 1;
            state.consume_gate.clone()
        };

        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|_| AmqpError::InternalError)?
                .forget();
        }

        let mut state = self.broker.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        let Some(fake_queue) = state.queues.get_mut(queue) else {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        };
        fake_queue.consumers.push(FakeConsumer {
            tag: consumer_tag.to_owned(),
            link_id: self.id,
            ack_mode,
            tx,
        });
        self.broker.dispatch(&mut state, queue);

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.broker.is_alive(self.id)?;
        let mut state = self.broker.lock();

        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.tag != consumer_tag);
        }
        Ok(())
    }

    fn on_close(&self, callback: CloseCallback) {
        let lost = {
            let mut state = self.broker.lock();
            match state.links.get_mut(&self.id) {
                Some(record) if record.alive => {
                    record.on_close = Some(callback);
                    return;
                }
                _ => callback,
            }
        };
        lost(AmqpError::ConnectionError("link closed".to_owned()));
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        let alive = matches!(state.links.get(&self.id), Some(record) if record.alive);
        if alive {
            FakeBroker::kill_link(&mut state, self.id);
            state.closed_links += 1;
        }
        Ok(())
    }
}
