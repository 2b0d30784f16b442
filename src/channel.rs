// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module implements the [`Transport`] and [`Link`] contracts with
//! `lapin`. A link wraps one AMQP connection and the single channel the
//! dispatcher multiplexes every operation on.
//!
//! Connection and channel errors reported by `lapin` are funnelled into the
//! link's close callback, which is how the connection manager learns that the
//! link is gone.

use crate::{
    config::{ServerConfig, TlsSettings},
    errors::AmqpError,
    exchange::Exchange,
    logger::Logger,
    queue::Queue,
    transport::{
        AckMode, Acker, CloseCallback, ConsumerMessage, Delivery, DeliveryStream, Link,
        OutboundMessage, Transport,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker as LapinAcker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    tcp::OwnedTLSConfig,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

/// AMQP reply code used when the dispatcher closes its own connection.
const REPLY_SUCCESS: u16 = 200;

/// [`Transport`] opening `lapin` connections.
pub struct LapinTransport {
    connection_name: Option<String>,
    prefetch_count: u16,
    logger: Arc<dyn Logger>,
}

impl LapinTransport {
    pub fn new(cfg: &ServerConfig) -> LapinTransport {
        LapinTransport {
            connection_name: cfg.connection_name.clone(),
            prefetch_count: cfg.prefetch_count,
            logger: cfg.logger(),
        }
    }

    async fn open_connection(
        &self,
        uri: &AMQPUri,
        tls: Option<&TlsSettings>,
    ) -> Result<Connection, AmqpError> {
        let mut options = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        let Some(tls) = tls else {
            return Connection::connect_uri(uri.clone(), options)
                .await
                .map_err(connect_error);
        };

        let cert_chain = match &tls.ca_cert_path {
            Some(path) => Some(tokio::fs::read_to_string(path).await.map_err(|err| {
                AmqpError::ConfigError(format!("unreadable ca certificate: {}", err))
            })?),
            None => None,
        };

        Connection::connect_uri_with_config(
            uri.clone(),
            options,
            OwnedTLSConfig {
                identity: None,
                cert_chain,
            },
        )
        .await
        .map_err(connect_error)
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(
        &self,
        uri: &AMQPUri,
        tls: Option<&TlsSettings>,
    ) -> Result<Arc<dyn Link>, AmqpError> {
        self.logger.debug(
            "creating amqp connection...",
            &[("host", &uri.authority.host), ("port", &uri.authority.port)],
        );

        let conn = match self.open_connection(uri, tls).await {
            Ok(c) => Ok(c),
            Err(err) => {
                self.logger.error("failure to connect", &[("error", &err)]);
                Err(err)
            }
        }?;
        self.logger.debug("amqp connected", &[]);

        let channel = match conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                self.logger
                    .error("error to create the channel", &[("error", &err)]);
                Err(AmqpError::ChannelError)
            }
        }?;

        if self.prefetch_count > 0 {
            if let Err(err) = channel
                .basic_qos(self.prefetch_count, BasicQosOptions { global: false })
                .await
            {
                self.logger
                    .error("failure to configure qos", &[("error", &err)]);
                return Err(AmqpError::QoSDeclarationError(err.to_string()));
            }
        }

        Ok(Arc::new(LapinLink::new(conn, channel, self.logger.clone())))
    }
}

/// Maps a connection failure onto the dispatcher taxonomy.
fn connect_error(err: lapin::Error) -> AmqpError {
    match &err {
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)) =>
        {
            AmqpError::AuthenticationError(err.to_string())
        }
        _ => AmqpError::ConnectionError(err.to_string()),
    }
}

/// Whether `err` means the connection or channel is gone rather than the
/// operation being refused by the broker.
fn is_link_lost(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::IOError(_)
    )
}

/// Close notification shared between `lapin` error hooks and the link.
#[derive(Default)]
struct CloseNotifier {
    callback: Option<CloseCallback>,
    lost: Option<AmqpError>,
}

impl CloseNotifier {
    fn register(slot: &Mutex<CloseNotifier>, callback: CloseCallback) {
        let lost = {
            let Ok(mut notifier) = slot.lock() else {
                return;
            };
            match notifier.lost.clone() {
                Some(lost) => lost,
                None => {
                    notifier.callback = Some(callback);
                    return;
                }
            }
        };
        callback(lost);
    }

    fn fire(slot: &Mutex<CloseNotifier>, reason: AmqpError) {
        let callback = {
            let Ok(mut notifier) = slot.lock() else {
                return;
            };
            if notifier.lost.is_some() {
                return;
            }
            notifier.lost = Some(reason.clone());
            notifier.callback.take()
        };

        if let Some(callback) = callback {
            callback(reason);
        }
    }
}

/// [`Link`] over one `lapin` connection and channel.
pub struct LapinLink {
    conn: Connection,
    channel: Channel,
    notifier: Arc<Mutex<CloseNotifier>>,
    logger: Arc<dyn Logger>,
}

impl LapinLink {
    fn new(conn: Connection, channel: Channel, logger: Arc<dyn Logger>) -> LapinLink {
        let notifier = Arc::new(Mutex::new(CloseNotifier::default()));

        let slot = notifier.clone();
        conn.on_error(move |err| {
            CloseNotifier::fire(&slot, AmqpError::ConnectionError(err.to_string()))
        });

        let slot = notifier.clone();
        channel.on_error(move |err| {
            CloseNotifier::fire(&slot, AmqpError::ConnectionError(err.to_string()))
        });

        LapinLink {
            conn,
            channel,
            notifier,
            logger,
        }
    }
}

#[async_trait]
impl Link for LapinLink {
    async fn declare_exchange(&self, def: &Exchange) -> Result<(), AmqpError> {
        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                self.logger.error(
                    "error to declare the exchange",
                    &[("error", &err), ("name", &def.name)],
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &Queue) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                self.logger.error(
                    "error to declare the queue",
                    &[("error", &err), ("name", &def.name)],
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                self.logger.error(
                    "error to bind queue to exchange",
                    &[("error", &err), ("queue", &queue), ("exchange", &exchange)],
                );
                Err(AmqpError::BindingExchangeToQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(msg.content_type.clone()))
            .with_message_id(ShortString::from(msg.message_id.clone()))
            .with_headers(to_field_table(&msg.headers));

        if let Some(kind) = &msg.msg_type {
            properties = properties.with_type(ShortString::from(kind.clone()));
        }

        match self
            .channel
            .basic_publish(
                &msg.exchange,
                &msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.data,
                properties,
            )
            .await
        {
            Err(err) => {
                self.logger
                    .error("error publishing message", &[("error", &err)]);
                if is_link_lost(&err) {
                    return Err(AmqpError::ConnectionError(err.to_string()));
                }
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        ack_mode: AckMode,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: ack_mode == AckMode::Auto,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                self.logger.error(
                    "error to create the consumer",
                    &[("error", &err), ("queue", &queue)],
                );
                if is_link_lost(&err) {
                    return Err(AmqpError::ConnectionError(err.to_string()));
                }
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let queue = queue.to_owned();
        let stream = consumer.map(move |result| match result {
            Ok(delivery) => Ok(to_delivery(&queue, delivery)),
            Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
        });

        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                self.logger.error(
                    "error to cancel the consumer",
                    &[("error", &err), ("consumer_tag", &consumer_tag)],
                );
                if is_link_lost(&err) {
                    return AmqpError::ConnectionError(err.to_string());
                }
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    fn on_close(&self, callback: CloseCallback) {
        CloseNotifier::register(&self.notifier, callback);
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.conn.status().connected() {
            return Ok(());
        }

        self.conn
            .close(REPLY_SUCCESS, "dispatcher closed")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

struct LapinDeliveryAcker {
    acker: LapinAcker,
}

#[async_trait]
impl Acker for LapinDeliveryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|_| AmqpError::AckMessageError)
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(|_| AmqpError::RejectMessageError)
    }
}

fn to_delivery(queue: &str, delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;

    let message = ConsumerMessage {
        queue: queue.to_owned(),
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        message_id: props.message_id().as_ref().map(|id| id.as_str().to_owned()),
        msg_type: props.kind().as_ref().map(|kind| kind.as_str().to_owned()),
        headers: from_field_table(props.headers().as_ref()),
        data: delivery.data.clone(),
    };

    Delivery::new(
        message,
        Box::new(LapinDeliveryAcker {
            acker: delivery.acker,
        }),
    )
}

fn to_field_table(headers: &BTreeMap<String, String>) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in headers {
        btree.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    FieldTable::from(btree)
}

/// Keeps the string valued headers, which is all the dispatcher writes.
fn from_field_table(table: Option<&FieldTable>) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();

    let Some(table) = table else {
        return headers;
    };

    for (key, value) in table.inner() {
        let value = match value {
            AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
            AMQPValue::ShortString(v) => v.as_str().to_owned(),
            _ => continue,
        };
        headers.insert(key.as_str().to_owned(), value);
    }

    headers
}
