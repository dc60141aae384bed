// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! [`Gateway`] owns the single broker connection of the process. Connecting
//! builds every configured channel, installs the topology and starts the
//! consumption loops. When the broker drops the connection the gateway goes
//! back to [`ConnectionState::Disconnected`] and reconnects according to the
//! configured [`ReconnectPolicy`](crate::reconnect::ReconnectPolicy), until
//! [`Gateway::close_connection`] is called.
//!
//! Connection attempts are serialized by their own guard, so concurrent
//! `connect` calls never open two connections. The state mutex is only held
//! to read or commit state, never across a broker round trip, so `publish`
//! and `state` answer immediately while an attempt is in flight.

use crate::{
    amqp::LapinTransport,
    channel::ChannelRegistry,
    config::GatewayConfig,
    dispatcher::ConsumerDispatcher,
    errors::{AmqpError, HandlerError},
    handler::{ConsumerHandler, FnHandler, HandlerRegistry},
    publisher::{PublishOptions, Publisher},
    queue::Binding,
    reconnect::ReconnectSchedule,
    retry::{MemoryRetryStore, RetryStore},
    topology::{AmqpTopology, Topology},
    transport::{BrokerConnection, BrokerEvent, BrokerTransport},
};
use serde::Serialize;
use serde_json::Value;
use std::{
    future::Future,
    sync::{Arc, Weak},
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

struct Slot {
    state: ConnectionState,
    connection: Option<Arc<dyn BrokerConnection>>,
    channels: Option<Arc<ChannelRegistry>>,
    loops: Vec<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    /// Identity of the current connection, bumped on every open and release
    epoch: u64,
    /// Bumped by `close_connection`, invalidates scheduled reconnects
    lifecycle: u64,
    reconnect_enabled: bool,
    reconnect_scheduled: bool,
}

impl Default for Slot {
    fn default() -> Self {
        Slot {
            state: ConnectionState::Disconnected,
            connection: None,
            channels: None,
            loops: vec![],
            watcher: None,
            epoch: 0,
            lifecycle: 0,
            reconnect_enabled: true,
            reconnect_scheduled: false,
        }
    }
}

impl Slot {
    /// Stops the loops and forgets the connection without closing it.
    async fn release(&mut self) -> Option<Arc<dyn BrokerConnection>> {
        self.epoch += 1;
        for handle in self.loops.drain(..) {
            handle.abort();
        }
        if let Some(channels) = self.channels.take() {
            channels.clear().await;
        }
        self.state = ConnectionState::Disconnected;
        self.connection.take()
    }
}

struct Inner {
    config: GatewayConfig,
    transport: Arc<dyn BrokerTransport>,
    handlers: Arc<HandlerRegistry>,
    retry_store: Arc<dyn RetryStore>,
    slot: Mutex<Slot>,
    /// Held for the whole duration of a connection attempt
    attempt: Mutex<()>,
}

/// Broker-facing messaging gateway.
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        transport: Arc<dyn BrokerTransport>,
        retry_store: Arc<dyn RetryStore>,
    ) -> Gateway {
        Gateway {
            inner: Arc::new(Inner {
                config,
                transport,
                handlers: Arc::new(HandlerRegistry::new()),
                retry_store,
                slot: Mutex::new(Slot::default()),
                attempt: Mutex::new(()),
            }),
        }
    }

    /// Gateway over RabbitMQ with an in-memory retry store.
    pub fn lapin(config: GatewayConfig) -> Gateway {
        let transport = Arc::new(LapinTransport::new(config.connection_name.clone()));
        Gateway::new(config, transport, Arc::new(MemoryRetryStore::new()))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.slot.lock().await.state
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Connects to `address`, or to the configured url when `None`.
    ///
    /// Returns the live connection when already connected. On failure the
    /// partial connection is closed, a reconnect is scheduled and the error is
    /// returned. A [`Gateway::close_connection`] issued while the attempt is in
    /// flight discards its result with [`AmqpError::ConnectCancelled`].
    pub async fn connect(
        &self,
        address: Option<&str>,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let address = address.unwrap_or(&self.inner.config.url).to_owned();
        let _attempt = self.inner.attempt.lock().await;
        self.inner.slot.lock().await.reconnect_enabled = true;

        let result = self.inner.open(&address).await;
        if result.is_err() {
            let mut slot = self.inner.slot.lock().await;
            self.inner.schedule_reconnect(&mut slot, address);
        }

        result
    }

    /// Closes the connection and disables reconnection.
    ///
    /// Returns `true` when there was nothing to close.
    pub async fn close_connection(&self) -> bool {
        let mut slot = self.inner.slot.lock().await;
        slot.reconnect_enabled = false;
        slot.reconnect_scheduled = false;
        slot.lifecycle += 1;

        if slot.connection.is_none() {
            return true;
        }

        info!("closing connection...");
        if let Some(watcher) = slot.watcher.take() {
            watcher.abort();
        }
        let connection = slot.release().await;
        slot.state = ConnectionState::Closing;
        drop(slot);

        let closed = match connection {
            Some(connection) => close(connection.as_ref()).await,
            None => true,
        };

        let mut slot = self.inner.slot.lock().await;
        if slot.state == ConnectionState::Closing {
            slot.state = ConnectionState::Disconnected;
        }
        info!(closed = closed, "connection closed");

        closed
    }

    /// Registers `handler` for the binding's queue, replacing any previous one.
    ///
    /// Returns `true` when a handler was replaced.
    pub async fn on(&self, binding: &Binding, handler: Arc<dyn ConsumerHandler>) -> bool {
        self.inner.handlers.on(binding, handler).await
    }

    pub async fn on_fn<F, Fut>(&self, binding: &Binding, f: F) -> bool
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.on(binding, Arc::new(FnHandler::new(f))).await
    }

    /// Publishes `payload` to the binding's queue.
    ///
    /// Fails with [`AmqpError::NotConnected`] unless connected; broker-side
    /// failures resolve to `Ok(false)`.
    pub async fn publish<T>(
        &self,
        binding: &Binding,
        payload: &T,
        options: Option<PublishOptions>,
    ) -> Result<bool, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let channels = {
            let slot = self.inner.slot.lock().await;
            match (slot.state, &slot.channels) {
                (ConnectionState::Connected, Some(channels)) => channels.clone(),
                _ => return Err(AmqpError::NotConnected),
            }
        };

        Publisher::new(channels).publish(binding, payload, options).await
    }
}

impl Inner {
    /// Runs one connection attempt. Callers hold the `attempt` guard.
    async fn open(
        self: &Arc<Self>,
        address: &str,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let lifecycle = {
            let mut slot = self.slot.lock().await;
            if let (ConnectionState::Connected, Some(connection)) = (slot.state, &slot.connection) {
                return Ok(connection.clone());
            }
            slot.state = ConnectionState::Connecting;
            slot.lifecycle
        };

        debug!("creating amqp connection...");
        let connection = match self.transport.connect(address).await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                self.abandon().await;
                return Err(AmqpError::ConnectionError(err.to_string()));
            }
        };
        debug!("amqp connected");

        let events = connection.events();
        let (channels, loops) = match self.initialize(connection.clone()).await {
            Ok(initialized) => initialized,
            Err(err) => {
                error!(error = err.to_string(), "failure to initialize the connection");
                close(connection.as_ref()).await;
                self.abandon().await;
                return Err(err);
            }
        };

        let mut slot = self.slot.lock().await;
        if slot.lifecycle != lifecycle {
            slot.state = ConnectionState::Disconnected;
            drop(slot);

            warn!("connection closed while connecting, discarding it");
            for handle in loops {
                handle.abort();
            }
            channels.clear().await;
            close(connection.as_ref()).await;
            return Err(AmqpError::ConnectCancelled);
        }

        slot.epoch += 1;
        slot.connection = Some(connection.clone());
        slot.channels = Some(channels);
        slot.loops = loops;
        slot.watcher = Some(tokio::spawn(watch(
            Arc::downgrade(self),
            slot.epoch,
            address.to_owned(),
            events,
        )));
        slot.state = ConnectionState::Connected;
        info!("gateway connected");

        Ok(connection)
    }

    /// Leaves `Connecting` after a failed attempt.
    async fn abandon(&self) {
        let mut slot = self.slot.lock().await;
        if slot.state == ConnectionState::Connecting {
            slot.state = ConnectionState::Disconnected;
        }
    }

    async fn initialize(
        &self,
        connection: Arc<dyn BrokerConnection>,
    ) -> Result<(Arc<ChannelRegistry>, Vec<JoinHandle<()>>), AmqpError> {
        let channels = Arc::new(ChannelRegistry::new(connection, &self.config.channels));
        channels.create_channels(&self.config.channels).await?;

        AmqpTopology::new(&channels)
            .bindings(&self.config.publishers, &self.config.consumers)
            .install()
            .await?;

        let loops = ConsumerDispatcher::new(
            self.handlers.clone(),
            self.retry_store.clone(),
            self.config.consumer_retry,
        )
        .start(&channels, &self.config.consumers)
        .await?;

        Ok((channels, loops))
    }

    fn schedule_reconnect(self: &Arc<Self>, slot: &mut Slot, address: String) {
        if !slot.reconnect_enabled || slot.reconnect_scheduled {
            return;
        }

        slot.reconnect_scheduled = true;
        tokio::spawn(reconnect(
            Arc::downgrade(self),
            slot.lifecycle,
            self.config.reconnect.schedule(),
            address,
        ));
    }
}

async fn close(connection: &dyn BrokerConnection) -> bool {
    match connection.close().await {
        Ok(closed) => closed,
        Err(err) => {
            error!(error = err.to_string(), "failure to close the connection");
            false
        }
    }
}

async fn watch(
    gateway: Weak<Inner>,
    epoch: u64,
    address: String,
    mut events: broadcast::Receiver<BrokerEvent>,
) {
    loop {
        match events.recv().await {
            Ok(BrokerEvent::Error(reason)) => {
                if !reason.contains("closing") {
                    error!(error = reason, "connection error");
                }
            }
            Ok(BrokerEvent::Closed) | Err(RecvError::Closed) => break,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped = skipped, "connection events lagged");
            }
        }
    }

    let Some(inner) = gateway.upgrade() else {
        return;
    };
    let mut slot = inner.slot.lock().await;
    if slot.epoch != epoch || !slot.reconnect_enabled {
        return;
    }

    warn!("connection closed by the broker");
    slot.watcher.take();
    slot.release().await;
    inner.schedule_reconnect(&mut slot, address);
}

async fn reconnect(
    gateway: Weak<Inner>,
    lifecycle: u64,
    mut schedule: ReconnectSchedule,
    address: String,
) {
    loop {
        let Some(delay) = schedule.next_delay() else {
            error!(attempts = schedule.attempts(), "giving up reconnecting");
            if let Some(inner) = gateway.upgrade() {
                let mut slot = inner.slot.lock().await;
                if slot.lifecycle == lifecycle {
                    slot.reconnect_scheduled = false;
                }
            }
            return;
        };

        info!(?delay, attempt = schedule.attempts(), "reconnecting...");
        tokio::time::sleep(delay).await;

        let Some(inner) = gateway.upgrade() else {
            return;
        };
        let _attempt = inner.attempt.lock().await;
        {
            let mut slot = inner.slot.lock().await;
            if slot.lifecycle != lifecycle || !slot.reconnect_enabled {
                debug!("reconnect cancelled");
                return;
            }
            if slot.state == ConnectionState::Connected {
                slot.reconnect_scheduled = false;
                return;
            }
        }

        match inner.open(&address).await {
            Ok(_) => {
                let mut slot = inner.slot.lock().await;
                if slot.lifecycle == lifecycle {
                    slot.reconnect_scheduled = false;
                }
                info!(attempt = schedule.attempts(), "reconnected");
                return;
            }
            Err(err) => warn!(error = err.to_string(), "reconnect attempt failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::ChannelDefinition,
        envelope,
        exchange::ExchangeDefinition,
        queue::QueueDefinition,
        reconnect::ReconnectPolicy,
        test_support::{eventually, Call, FakeBroker},
        transport::Delivery,
    };
    use serde_json::json;
    use std::time::Duration;

    const URL: &str = "amqp://localhost:5672/%2f";

    fn config() -> GatewayConfig {
        GatewayConfig::new(URL)
            .channel(ChannelDefinition::standard("consumer", 10))
            .channel(ChannelDefinition::confirm("publisher"))
            .publisher(Binding::new(
                "publisher",
                QueueDefinition::new("emails").exchange(ExchangeDefinition::new("bunny").direct_delayed()),
            ))
            .consumer(Binding::new("consumer", QueueDefinition::new("emails")))
            .consumer_retry(3)
    }

    fn gateway(broker: &Arc<FakeBroker>, config: GatewayConfig) -> Gateway {
        Gateway::new(config, broker.transport(), Arc::new(MemoryRetryStore::new()))
    }

    #[tokio::test]
    async fn connect_builds_channels_topology_and_consumers() {
        let broker = FakeBroker::new();
        let gateway = gateway(&broker, config());

        gateway.connect(None).await.unwrap();

        assert!(gateway.is_connected().await);
        assert_eq!(broker.calls()[0], Call::Connect(URL.to_owned()));
        assert!(broker.calls().contains(&Call::Prefetch(10)));
        assert!(broker
            .calls()
            .contains(&Call::BindQueue("emails".into(), "bunny".into(), "emails".into())));
        assert!(broker.has_consumer("emails"));
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let broker = FakeBroker::new();
        let gateway = gateway(&broker, config());

        let first = gateway.connect(None).await.unwrap();
        let second = gateway.connect(Some("amqp://elsewhere")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_connects_open_a_single_connection() {
        let broker = FakeBroker::new();
        let gateway = gateway(&broker, config());

        let (left, right) = tokio::join!(gateway.connect(None), gateway.connect(None));

        assert!(Arc::ptr_eq(&left.unwrap(), &right.unwrap()));
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn broker_close_triggers_exactly_one_reconnect() {
        let broker = FakeBroker::new();
        let gateway = gateway(&broker, config());
        gateway.connect(None).await.unwrap();

        broker.connection(0).drop_unexpectedly();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(broker.connect_count(), 1);
        assert_eq!(gateway.state().await, ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(broker.connect_count(), 2);
        assert!(gateway.is_connected().await);
        assert!(broker.has_consumer("emails"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_close_never_reconnects() {
        let broker = FakeBroker::new();
        let gateway = gateway(&broker, config());
        gateway.connect(None).await.unwrap();

        assert!(gateway.close_connection().await);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(broker.connect_count(), 1);
        assert!(broker.connection(0).is_closed());
        assert_eq!(gateway.state().await, ConnectionState::Disconnected);
        assert!(!broker.has_consumer("emails"));
    }

    #[tokio::test]
    async fn close_without_connection_is_a_noop() {
        let broker = FakeBroker::new();
        let gateway = gateway(&broker, config());

        assert!(gateway.close_connection().await);
        assert!(broker.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_a_scheduled_reconnect() {
        let broker = FakeBroker::new();
        broker.fail_next_connects(1);
        let gateway = gateway(&broker, config());

        assert!(matches!(
            gateway.connect(None).await,
            Err(AmqpError::ConnectionError(_))
        ));
        gateway.close_connection().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_retries_until_it_succeeds() {
        let broker = FakeBroker::new();
        broker.fail_next_connects(2);
        let gateway = gateway(&broker, config());

        assert!(gateway.connect(None).await.is_err());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(broker.connect_count(), 3);
        assert!(gateway.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn init_failure_tears_down_and_reconnects() {
        let broker = FakeBroker::new();
        broker.fail_channels(true);
        let gateway = gateway(&broker, config());

        let err = gateway.connect(None).await.err().unwrap();
        assert!(matches!(err, AmqpError::ChannelError(name, _) if name == "consumer"));
        assert!(broker.connection(0).is_closed());
        assert_eq!(gateway.state().await, ConnectionState::Disconnected);

        broker.fail_channels(false);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(broker.connect_count(), 2);
        assert!(gateway.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_policy_stops_reconnecting() {
        let broker = FakeBroker::new();
        broker.fail_next_connects(10);
        let config = config().reconnect(ReconnectPolicy::Fixed {
            delay_ms: 100,
            max_attempts: Some(2),
        });
        let gateway = gateway(&broker, config);

        assert!(gateway.connect(None).await.is_err());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(broker.connect_count(), 3);
        assert_eq!(gateway.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_fails_fast_while_connecting() {
        let broker = FakeBroker::new();
        broker.stall_connects(true);
        let gateway = gateway(&broker, config());
        let binding = gateway.config().publisher_binding("emails").unwrap().clone();

        let _attempt = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.connect(None).await.map(|_| ()) }
        });
        eventually(|| broker.connect_count() == 1).await;

        assert_eq!(gateway.state().await, ConnectionState::Connecting);
        let published = tokio::time::timeout(
            Duration::from_millis(100),
            gateway.publish(&binding, &json!({"x": 1}), None),
        )
        .await;
        assert_eq!(published, Ok(Err(AmqpError::NotConnected)));
        assert!(broker.publishes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn close_while_connecting_discards_the_attempt() {
        let broker = FakeBroker::new();
        broker.stall_connects(true);
        let gateway = gateway(&broker, config());

        let attempt = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.connect(None).await.map(|_| ()) }
        });
        eventually(|| broker.connect_count() == 1).await;

        assert!(gateway.close_connection().await);
        assert_eq!(attempt.await.unwrap(), Err(AmqpError::ConnectCancelled));
        assert!(broker.connection(0).is_closed());
        assert_eq!(gateway.state().await, ConnectionState::Disconnected);

        broker.stall_connects(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_errors_never_reconnect() {
        let broker = FakeBroker::new();
        let gateway = gateway(&broker, config());
        gateway.connect(None).await.unwrap();

        broker.connection(0).emit_error("boom");
        broker.connection(0).emit_error("connection is closing");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(broker.connect_count(), 1);
        assert!(gateway.is_connected().await);
        assert!(!broker.connection(0).is_closed());
    }

    #[tokio::test]
    async fn publish_requires_a_connection() {
        let broker = FakeBroker::new();
        let gateway = gateway(&broker, config());
        let binding = gateway.config().publisher_binding("emails").unwrap().clone();

        assert_eq!(
            gateway.publish(&binding, &json!({"x": 1}), None).await,
            Err(AmqpError::NotConnected)
        );

        gateway.connect(None).await.unwrap();
        assert_eq!(gateway.publish(&binding, &json!({"x": 1}), None).await, Ok(true));
        assert_eq!(broker.publishes().len(), 1);
    }

    #[tokio::test]
    async fn registered_handler_receives_consumed_payloads() {
        let broker = FakeBroker::new();
        let gateway = gateway(&broker, config());
        let binding = gateway.config().consumer_binding("emails").unwrap().clone();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let replaced = gateway
            .on_fn(&binding, move |payload| {
                let tx = tx.clone();
                async move {
                    tx.send(payload).map_err(HandlerError::new)?;
                    Ok::<(), HandlerError>(())
                }
            })
            .await;
        assert!(!replaced);

        gateway.connect(None).await.unwrap();
        broker.deliver(
            "emails",
            Some(Delivery {
                delivery_tag: 7,
                message_id: Some("m-7".to_owned()),
                data: envelope::encode(&json!({"to": "a@b.c"})).unwrap(),
                ..Default::default()
            }),
        );

        assert_eq!(rx.recv().await, Some(json!({"to": "a@b.c"})));
        eventually(|| broker.acks() == vec![7]).await;
    }
}
