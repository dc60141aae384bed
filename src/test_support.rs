// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests. Every call is recorded in order.

use crate::{
    channel::ChannelKind,
    errors::TransportError,
    exchange::{ExchangeKind, ExchangeOptions},
    queue::QueueOptions,
    transport::{
        BrokerChannel, BrokerConnection, BrokerEvent, BrokerTransport, Delivery, DeliveryStream,
        MessageProperties,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Connect(String),
    CreateChannel(ChannelKind),
    Prefetch(u16),
    AssertQueue(String),
    AssertExchange(String, ExchangeKind),
    BindQueue(String, String, String),
    Publish {
        exchange: String,
        routing_key: String,
        body: Vec<u8>,
        properties: MessageProperties,
    },
    Consume(String),
    Ack(u64),
    Nack(u64),
    Close,
}

#[derive(Default)]
pub(crate) struct FakeBroker {
    calls: Mutex<Vec<Call>>,
    connects: AtomicUsize,
    connect_failures: AtomicUsize,
    stall_connects: AtomicBool,
    fail_channels: AtomicBool,
    fail_publish: AtomicBool,
    nack_publish: AtomicBool,
    failing_queue: Mutex<Option<String>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    consumers: Mutex<HashMap<String, mpsc::UnboundedSender<Option<Delivery>>>>,
}

impl FakeBroker {
    pub(crate) fn new() -> Arc<FakeBroker> {
        Arc::new(FakeBroker::default())
    }

    pub(crate) fn transport(self: &Arc<Self>) -> Arc<dyn BrokerTransport> {
        Arc::new(FakeTransport {
            broker: self.clone(),
        })
    }

    /// Opens a connection without recording a `Connect` call.
    pub(crate) async fn open(self: &Arc<Self>) -> Arc<dyn BrokerConnection> {
        self.new_connection()
    }

    fn new_connection(self: &Arc<Self>) -> Arc<dyn BrokerConnection> {
        let (events, _) = broadcast::channel(16);
        let connection = Arc::new(FakeConnection {
            broker: self.clone(),
            events,
            closed: AtomicBool::new(false),
        });
        self.connections.lock().unwrap().push(connection.clone());
        connection
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_next_connects(&self, count: usize) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Makes every following connect stall for two minutes before answering.
    pub(crate) fn stall_connects(&self, stall: bool) {
        self.stall_connects.store(stall, Ordering::SeqCst);
    }

    pub(crate) fn fail_channels(&self, fail: bool) {
        self.fail_channels.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn nack_publish(&self, nack: bool) {
        self.nack_publish.store(nack, Ordering::SeqCst);
    }

    pub(crate) fn fail_queue_declaration(&self, queue: &str) {
        *self.failing_queue.lock().unwrap() = Some(queue.to_owned());
    }

    pub(crate) fn connection(&self, index: usize) -> Arc<FakeConnection> {
        self.connections.lock().unwrap()[index].clone()
    }

    pub(crate) fn publishes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Publish { .. }))
            .collect()
    }

    pub(crate) fn acks(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Ack(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn nacks(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Nack(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }

    /// Pushes a delivery to the consumer of `queue`, if any.
    pub(crate) fn deliver(&self, queue: &str, delivery: Option<Delivery>) -> bool {
        match self.consumers.lock().unwrap().get(queue) {
            Some(tx) => tx.send(delivery).is_ok(),
            None => false,
        }
    }

    pub(crate) fn has_consumer(&self, queue: &str) -> bool {
        self.consumers.lock().unwrap().contains_key(queue)
    }
}

/// Polls `condition` until it holds, panicking after one second.
pub(crate) async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

struct FakeTransport {
    broker: Arc<FakeBroker>,
}

#[async_trait]
impl BrokerTransport for FakeTransport {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        self.broker.connects.fetch_add(1, Ordering::SeqCst);
        self.broker.record(Call::Connect(address.to_owned()));

        if self.broker.stall_connects.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(120)).await;
        }

        let pending = self.broker.connect_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.broker.connect_failures.store(pending - 1, Ordering::SeqCst);
            return Err(TransportError::Connect("connection refused".to_owned()));
        }

        Ok(self.broker.new_connection())
    }
}

pub(crate) struct FakeConnection {
    broker: Arc<FakeBroker>,
    events: broadcast::Sender<BrokerEvent>,
    closed: AtomicBool,
}

impl FakeConnection {
    /// Simulates the broker dropping the connection.
    pub(crate) fn drop_unexpectedly(&self) {
        let _ = self.events.send(BrokerEvent::Closed);
    }

    pub(crate) fn emit_error(&self, reason: &str) {
        let _ = self.events.send(BrokerEvent::Error(reason.to_owned()));
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn create_channel(
        &self,
        kind: ChannelKind,
    ) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        if self.broker.fail_channels.load(Ordering::SeqCst) {
            return Err(TransportError::Channel("channel limit reached".to_owned()));
        }
        self.broker.record(Call::CreateChannel(kind));
        let (events, _) = broadcast::channel(16);

        Ok(Arc::new(FakeChannel {
            broker: self.broker.clone(),
            events,
        }))
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<bool, TransportError> {
        self.broker.record(Call::Close);
        self.closed.store(true, Ordering::SeqCst);
        self.broker.consumers.lock().unwrap().clear();
        let _ = self.events.send(BrokerEvent::Closed);
        Ok(true)
    }
}

struct FakeChannel {
    broker: Arc<FakeBroker>,
    events: broadcast::Sender<BrokerEvent>,
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.broker.record(Call::Prefetch(count));
        Ok(())
    }

    async fn assert_queue(&self, name: &str, _options: &QueueOptions) -> Result<(), TransportError> {
        if self.broker.failing_queue.lock().unwrap().as_deref() == Some(name) {
            return Err(TransportError::Declare(format!("PRECONDITION_FAILED - {name}")));
        }
        self.broker.record(Call::AssertQueue(name.to_owned()));
        Ok(())
    }

    async fn assert_exchange(
        &self,
        name: &str,
        kind: &ExchangeKind,
        _options: &ExchangeOptions,
    ) -> Result<(), TransportError> {
        self.broker
            .record(Call::AssertExchange(name.to_owned(), kind.clone()));
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.broker.record(Call::BindQueue(
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
        ));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<bool, TransportError> {
        if self.broker.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish("channel closed".to_owned()));
        }
        self.broker.record(Call::Publish {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body,
            properties,
        });
        Ok(!self.broker.nack_publish.load(Ordering::SeqCst))
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        self.broker.record(Call::Consume(queue.to_owned()));
        let (tx, rx) = mpsc::unbounded_channel();
        self.broker
            .consumers
            .lock()
            .unwrap()
            .insert(queue.to_owned(), tx);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.broker.record(Call::Ack(delivery.delivery_tag));
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.broker.record(Call::Nack(delivery.delivery_tag));
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }
}
