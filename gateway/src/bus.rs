use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use skyblock_common::models::event::{Envelope, Event};
use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Cross-process event fan-out. Delivery is at-most-once; ordering is only
/// what the underlying transport provides.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, recipient_ids: &[String], event: &Event) -> Result<(), BusError>;

    /// Long-lived stream of every envelope published on the channel.
    async fn subscribe(&self) -> Result<BoxStream<'static, Envelope>, BusError>;

    /// `SET key value NX EX ttl` on the bus key store; returns whether the
    /// key was ours to set. Used for startup leader election.
    async fn set_if_not_exists(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BusError>;
}

pub struct RedisBus {
    client: redis::Client,
    manager: ConnectionManager,
    channel: String,
}

impl RedisBus {
    pub async fn connect(url: &str, channel: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;

        Ok(Self {
            client,
            manager,
            channel: channel.to_string(),
        })
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, recipient_ids: &[String], event: &Event) -> Result<(), BusError> {
        let envelope = Envelope {
            recipient_ids: recipient_ids.to_vec(),
            event: event.clone(),
        };
        let payload = serde_json::to_vec(&envelope)
            .map_err(|err| BusError::Unavailable(err.to_string()))?;

        let mut connection = self.manager.clone();
        connection
            .publish::<_, _, ()>(&self.channel, payload)
            .await?;

        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Envelope>, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|message| async move {
                let payload: Vec<u8> = message.get_payload().ok()?;
                match serde_json::from_slice(&payload) {
                    Ok(envelope) => Some(envelope),
                    Err(err) => {
                        warn!(error = %err, "dropping malformed bus message");
                        None
                    }
                }
            })
            .boxed();

        Ok(stream)
    }

    async fn set_if_not_exists(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BusError> {
        let mut connection = self.manager.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut connection)
            .await?;

        Ok(acquired.is_some())
    }
}

/// Clients connected to this process, keyed by recipient id. The bus
/// subscriber only forwards an event to recipients present here.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    connections: Arc<RwLock<HashMap<String, LocalConnection>>>,
    next_token: Arc<std::sync::atomic::AtomicU64>,
}

struct LocalConnection {
    token: u64,
    sender: mpsc::Sender<String>,
}

pub const CLIENT_BUFFER: usize = 64;

impl ClientRegistry {
    /// Register a client connection, replacing any previous connection for
    /// the same id. The returned receiver yields serialised events; the
    /// token identifies this connection on unregister, so a handler for a
    /// replaced connection cannot tear down its successor.
    pub async fn register(&self, client_id: &str) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        let token = self
            .next_token
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let mut connections = self.connections.write().await;
        if connections
            .insert(client_id.to_string(), LocalConnection { token, sender: tx })
            .is_some()
        {
            debug!(client_id, "client reconnected, replacing old connection");
        }

        (token, rx)
    }

    pub async fn unregister(&self, client_id: &str, token: u64) {
        let mut connections = self.connections.write().await;
        if connections
            .get(client_id)
            .map(|connection| connection.token == token)
            .unwrap_or(false)
        {
            connections.remove(client_id);
        }
    }

    async fn send_local(&self, client_id: &str, payload: &str) {
        let sender = {
            let connections = self.connections.read().await;
            connections
                .get(client_id)
                .map(|connection| connection.sender.clone())
        };

        if let Some(sender) = sender {
            if sender.send(payload.to_string()).await.is_err() {
                debug!(client_id, "dropping event for closed local connection");
            }
        }
    }
}

/// Pull envelopes off the bus and forward each event to the recipients
/// holding a live local connection. Runs for the life of the process and
/// resubscribes after transport errors.
pub async fn forward_events(bus: Arc<dyn EventBus>, registry: ClientRegistry) {
    loop {
        let mut stream = match bus.subscribe().await {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "bus subscribe failed, retrying");
                sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        while let Some(envelope) = stream.next().await {
            let payload = match serde_json::to_string(&envelope.event) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "could not serialise event for fan-out");
                    continue;
                }
            };

            for recipient in &envelope.recipient_ids {
                registry.send_local(recipient, &payload).await;
            }
        }

        warn!("bus subscription ended, resubscribing");
        sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_replaces_reconnecting_clients() {
        let registry = ClientRegistry::default();

        let (old_token, mut old_rx) = registry.register("steve").await;
        let (new_token, mut new_rx) = registry.register("steve").await;

        registry.send_local("steve", "hello").await;
        assert_eq!(new_rx.recv().await.as_deref(), Some("hello"));
        // The replaced connection's channel is closed.
        assert!(old_rx.recv().await.is_none());

        // A stale handler cannot tear down its successor.
        registry.unregister("steve", old_token).await;
        registry.send_local("steve", "still here").await;
        assert_eq!(new_rx.recv().await.as_deref(), Some("still here"));

        registry.unregister("steve", new_token).await;
        registry.send_local("steve", "gone").await;
        assert!(new_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn events_only_reach_registered_recipients() {
        let registry = ClientRegistry::default();

        let (_token, mut rx) = registry.register("alice").await;
        registry.send_local("bob", "not for alice").await;
        registry.send_local("alice", "for alice").await;

        assert_eq!(rx.recv().await.as_deref(), Some("for alice"));
    }
}
