// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Management
//!
//! This module creates and caches the named channels the gateway multiplexes over
//! its single broker connection. Standard channels carry a prefetch limit and are
//! meant for consumers; confirm channels get a broker acknowledgement for every
//! publish and are meant for publishers.

use crate::{
    errors::AmqpError,
    transport::{BrokerChannel, BrokerConnection, BrokerEvent},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info};

/// The two channel flavours the gateway opens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    #[default]
    #[serde(alias = "consumer")]
    Standard,
    #[serde(alias = "publisher")]
    Confirm,
}

/// Static description of a named channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDefinition {
    pub name: String,
    #[serde(default, alias = "type")]
    pub kind: ChannelKind,
    #[serde(default)]
    pub prefetch: Option<u16>,
}

impl ChannelDefinition {
    pub fn standard(name: &str, prefetch: u16) -> ChannelDefinition {
        ChannelDefinition {
            name: name.to_owned(),
            kind: ChannelKind::Standard,
            prefetch: Some(prefetch),
        }
    }

    pub fn confirm(name: &str) -> ChannelDefinition {
        ChannelDefinition {
            name: name.to_owned(),
            kind: ChannelKind::Confirm,
            prefetch: None,
        }
    }
}

/// Cache of live channels keyed by name, bound to one connection.
pub struct ChannelRegistry {
    connection: Arc<dyn BrokerConnection>,
    prefetch: HashMap<String, u16>,
    channels: Mutex<HashMap<String, Arc<dyn BrokerChannel>>>,
}

impl ChannelRegistry {
    pub fn new(
        connection: Arc<dyn BrokerConnection>,
        definitions: &[ChannelDefinition],
    ) -> ChannelRegistry {
        let prefetch = definitions
            .iter()
            .filter_map(|def| def.prefetch.map(|count| (def.name.clone(), count)))
            .collect();

        ChannelRegistry {
            connection,
            prefetch,
            channels: Mutex::new(HashMap::default()),
        }
    }

    /// Opens every configured channel, in declaration order.
    pub async fn create_channels(&self, definitions: &[ChannelDefinition]) -> Result<(), AmqpError> {
        for def in definitions {
            match def.kind {
                ChannelKind::Standard => self.create_standard_channel(&def.name).await?,
                ChannelKind::Confirm => self.create_confirm_channel(&def.name).await?,
            };
        }

        Ok(())
    }

    /// Returns the cached channel `name`, opening a standard channel if absent.
    ///
    /// The configured prefetch limit is applied before the channel is cached.
    pub async fn create_standard_channel(
        &self,
        name: &str,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(name) {
            return Ok(channel.clone());
        }

        debug!(channel = name, "creating channel...");
        let channel = match self.connection.create_channel(ChannelKind::Standard).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), channel = name, "failure to create the channel");
                Err(AmqpError::ChannelError(name.to_owned(), err.to_string()))
            }
        }?;

        if let Some(count) = self.prefetch.get(name) {
            if let Err(err) = channel.prefetch(*count).await {
                error!(error = err.to_string(), channel = name, "failure to configure qos");
                return Err(AmqpError::ChannelError(name.to_owned(), err.to_string()));
            }
        }

        tokio::spawn(log_channel_events(name.to_owned(), channel.events()));
        channels.insert(name.to_owned(), channel.clone());
        debug!(channel = name, "channel created");

        Ok(channel)
    }

    /// Returns the cached channel `name`, opening a confirm channel if absent.
    pub async fn create_confirm_channel(
        &self,
        name: &str,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(name) {
            return Ok(channel.clone());
        }

        debug!(channel = name, "creating confirm channel...");
        let channel = match self.connection.create_channel(ChannelKind::Confirm).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    channel = name,
                    "failure to create the confirm channel"
                );
                Err(AmqpError::ChannelError(name.to_owned(), err.to_string()))
            }
        }?;

        tokio::spawn(log_channel_events(name.to_owned(), channel.events()));
        channels.insert(name.to_owned(), channel.clone());
        debug!(channel = name, "confirm channel created");

        Ok(channel)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn BrokerChannel>> {
        self.channels.lock().await.get(name).cloned()
    }

    /// Forgets every cached channel.
    pub async fn clear(&self) {
        self.channels.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.channels.lock().await.is_empty()
    }
}

async fn log_channel_events(name: String, mut events: broadcast::Receiver<BrokerEvent>) {
    loop {
        match events.recv().await {
            Ok(BrokerEvent::Error(reason)) => {
                error!(error = reason, channel = name, "channel error");
            }
            Ok(BrokerEvent::Closed) => {
                info!(channel = name, "channel closed");
                return;
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Call, FakeBroker};

    #[tokio::test]
    async fn standard_channel_is_cached_by_name() {
        let broker = FakeBroker::new();
        let connection = broker.open().await;
        let registry = ChannelRegistry::new(connection, &[ChannelDefinition::standard("consumer", 5)]);

        let first = registry.create_standard_channel("consumer").await.unwrap();
        let second = registry.create_standard_channel("consumer").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            broker.calls(),
            vec![Call::CreateChannel(ChannelKind::Standard), Call::Prefetch(5)]
        );
    }

    #[tokio::test]
    async fn confirm_channel_skips_prefetch() {
        let broker = FakeBroker::new();
        let connection = broker.open().await;
        let defs = [ChannelDefinition::confirm("publisher")];
        let registry = ChannelRegistry::new(connection, &defs);

        registry.create_channels(&defs).await.unwrap();
        registry.create_confirm_channel("publisher").await.unwrap();

        assert_eq!(broker.calls(), vec![Call::CreateChannel(ChannelKind::Confirm)]);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn open_failure_is_reported_with_the_channel_name() {
        let broker = FakeBroker::new();
        let connection = broker.open().await;
        broker.fail_channels(true);
        let registry = ChannelRegistry::new(connection, &[]);

        let err = registry.create_standard_channel("consumer").await.err().unwrap();

        assert!(matches!(err, AmqpError::ChannelError(name, _) if name == "consumer"));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn clear_drops_cached_handles() {
        let broker = FakeBroker::new();
        let connection = broker.open().await;
        let registry = ChannelRegistry::new(connection, &[]);

        registry.create_standard_channel("consumer").await.unwrap();
        registry.clear().await;

        assert!(registry.get("consumer").await.is_none());
    }

    #[test]
    fn kind_accepts_role_aliases() {
        let defs: Vec<ChannelDefinition> = serde_json::from_value(serde_json::json!([
            { "name": "a", "type": "consumer", "prefetch": 10 },
            { "name": "b", "kind": "publisher" },
            { "name": "c" }
        ]))
        .unwrap();

        assert_eq!(defs[0].kind, ChannelKind::Standard);
        assert_eq!(defs[0].prefetch, Some(10));
        assert_eq!(defs[1].kind, ChannelKind::Confirm);
        assert_eq!(defs[2].kind, ChannelKind::Standard);
    }
}
