// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Transport
//!
//! [`BrokerTransport`] implementation over `lapin`. Header tables are
//! converted from and to JSON values at this boundary so the rest of the
//! crate never sees AMQP field types.

use crate::{
    channel::ChannelKind,
    errors::TransportError,
    exchange::{ExchangeKind, ExchangeOptions},
    queue::QueueOptions,
    transport::{
        BrokerChannel, BrokerConnection, BrokerEvent, BrokerTransport, Delivery, DeliveryStream,
        Headers, MessageProperties,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use serde_json::{Number, Value};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::broadcast;
use tracing::{debug, error};

const EVENTS_CAPACITY: usize = 16;
const PERSISTENT_DELIVERY_MODE: u8 = 2;

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::XMessageDelayed => lapin::ExchangeKind::Custom(kind.as_str().to_owned()),
        }
    }
}

pub(crate) fn to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(values) => AMQPValue::FieldArray(FieldArray::from(
            values.iter().map(to_amqp_value).collect::<Vec<_>>(),
        )),
        Value::Object(map) => AMQPValue::FieldTable(FieldTable::from(
            map.iter()
                .map(|(k, v)| (ShortString::from(k.clone()), to_amqp_value(v)))
                .collect::<BTreeMap<_, _>>(),
        )),
    }
}

pub(crate) fn from_amqp_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(i) => Value::from(*i),
        AMQPValue::ShortShortUInt(i) => Value::from(*i),
        AMQPValue::ShortInt(i) => Value::from(*i),
        AMQPValue::ShortUInt(i) => Value::from(*i),
        AMQPValue::LongInt(i) => Value::from(*i),
        AMQPValue::LongUInt(i) => Value::from(*i),
        AMQPValue::LongLongInt(i) => Value::from(*i),
        AMQPValue::Timestamp(t) => Value::from(*t),
        AMQPValue::Float(f) => Number::from_f64(f64::from(*f)).map_or(Value::Null, Value::Number),
        AMQPValue::Double(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_owned()),
        AMQPValue::LongString(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::FieldArray(values) => {
            Value::Array(values.as_slice().iter().map(from_amqp_value).collect())
        }
        AMQPValue::FieldTable(table) => Value::Object(
            table
                .inner()
                .iter()
                .map(|(k, v)| (k.as_str().to_owned(), from_amqp_value(v)))
                .collect(),
        ),
        _ => Value::Null,
    }
}

pub(crate) fn field_table(headers: &Headers) -> FieldTable {
    FieldTable::from(
        headers
            .iter()
            .map(|(k, v)| (ShortString::from(k.clone()), to_amqp_value(v)))
            .collect::<BTreeMap<_, _>>(),
    )
}

pub(crate) fn headers(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(k, v)| (k.as_str().to_owned(), from_amqp_value(v)))
        .collect()
}

fn basic_properties(properties: MessageProperties) -> BasicProperties {
    let mut props = BasicProperties::default()
        .with_message_id(ShortString::from(properties.message_id))
        .with_headers(field_table(&properties.headers));

    if let Some(content_type) = properties.content_type {
        props = props.with_content_type(ShortString::from(content_type));
    }
    if let Some(correlation_id) = properties.correlation_id {
        props = props.with_correlation_id(ShortString::from(correlation_id));
    }
    if properties.persistent {
        props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    if let Some(expiration) = properties.expiration {
        props = props.with_expiration(ShortString::from(expiration));
    }
    if let Some(priority) = properties.priority {
        props = props.with_priority(priority);
    }

    props
}

fn delivery(delivery: lapin::message::Delivery) -> Delivery {
    let message_id = delivery.properties.message_id().as_ref().map(|id| id.to_string());
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(headers)
        .unwrap_or_default();

    Delivery {
        delivery_tag: delivery.delivery_tag,
        message_id,
        headers,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        data: delivery.data,
    }
}

/// Opens RabbitMQ connections with `lapin`.
#[derive(Debug, Clone, Default)]
pub struct LapinTransport {
    connection_name: Option<String>,
}

impl LapinTransport {
    pub fn new(connection_name: Option<String>) -> LapinTransport {
        LapinTransport { connection_name }
    }
}

#[async_trait]
impl BrokerTransport for LapinTransport {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let mut options = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        let connection = Connection::connect(address, options)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;

        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        let sender = events.clone();
        connection.on_error(move |err| {
            let _ = sender.send(BrokerEvent::Error(err.to_string()));
            let _ = sender.send(BrokerEvent::Closed);
        });

        Ok(Arc::new(LapinConnection { connection, events }))
    }
}

pub struct LapinConnection {
    connection: Connection,
    events: broadcast::Sender<BrokerEvent>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(
        &self,
        kind: ChannelKind,
    ) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|err| TransportError::Channel(err.to_string()))?;

        if kind == ChannelKind::Confirm {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|err| TransportError::Channel(err.to_string()))?;
        }

        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        let sender = events.clone();
        channel.on_error(move |err| {
            let _ = sender.send(BrokerEvent::Error(err.to_string()));
            let _ = sender.send(BrokerEvent::Closed);
        });

        Ok(Arc::new(LapinChannel { channel, events }))
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<bool, TransportError> {
        if !self.connection.status().connected() {
            return Ok(true);
        }

        self.connection
            .close(200, "OK")
            .await
            .map_err(|err| TransportError::Close(err.to_string()))?;
        let _ = self.events.send(BrokerEvent::Closed);

        Ok(true)
    }
}

pub struct LapinChannel {
    channel: Channel,
    events: broadcast::Sender<BrokerEvent>,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|err| TransportError::Channel(err.to_string()))
    }

    async fn assert_queue(&self, name: &str, options: &QueueOptions) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                },
                field_table(&options.arguments),
            )
            .await
            .map(|_| ())
            .map_err(|err| TransportError::Declare(err.to_string()))
    }

    async fn assert_exchange(
        &self,
        name: &str,
        kind: &ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), TransportError> {
        self.channel
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    nowait: false,
                },
                field_table(&options.arguments),
            )
            .await
            .map_err(|err| TransportError::Declare(err.to_string()))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| TransportError::Declare(err.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<bool, TransportError> {
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &body,
                basic_properties(properties),
            )
            .await
            .map_err(|err| TransportError::Publish(err.to_string()))?
            .await
            .map_err(|err| TransportError::Publish(err.to_string()))?;

        Ok(!confirmation.is_nack())
    }

    /// The stream yields a final `None` when the broker cancels the consumer.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| TransportError::Consume(err.to_string()))?;

        let queue = queue.to_owned();
        let deliveries = consumer.filter_map(move |result| {
            let queue = queue.clone();
            async move {
                match result {
                    Ok(d) => Some(Some(delivery(d))),
                    Err(err) => {
                        error!(error = err.to_string(), queue = queue, "errors consume msg");
                        None
                    }
                }
            }
        });

        Ok(deliveries
            .chain(stream::once(async {
                debug!("consumer cancelled");
                None
            }))
            .boxed())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery.delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| TransportError::Settle(err.to_string()))
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.channel
            .basic_nack(
                delivery.delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: true,
                },
            )
            .await
            .map_err(|err| TransportError::Settle(err.to_string()))
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }
}
