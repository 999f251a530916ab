// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event bus abstraction.
//!
//! All inter-component interaction goes over a publish/subscribe message
//! layer with request/reply on named addresses. `send` is point-to-point
//! and preserves per-address ordering; `publish` fans out to every
//! subscriber without ordering guarantees. The in-process
//! [`LocalEventBus`] backs single-node deployments and tests; a clustered
//! deployment plugs a distributed implementation in behind the same trait.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Well-known bus addresses.
pub mod addresses {
    /// Progress reports for running process chains (publish).
    pub const PROCESS_CHAIN_PROGRESS: &str = "processchain.progress";

    /// Nudge for the scheduler: new chains were registered (publish).
    pub const PROCESS_CHAIN_REGISTERED: &str = "processchain.registered";

    /// An agent joined the cluster; payload is its id (publish).
    pub const CLUSTER_NODE_ADDED: &str = "cluster.node.added";

    /// An agent left the cluster; payload is its id (publish).
    pub const CLUSTER_NODE_LEFT: &str = "cluster.node.left";

    /// A submission was stored (publish).
    pub const SUBMISSION_ADDED: &str = "submissionRegistry.submissionAdded";

    /// Request/reply address of the agent with the given id.
    pub fn agent(agent_id: &str) -> String {
        format!("agent.{agent_id}")
    }
}

/// Errors from bus operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BusError {
    /// No consumer is registered at the address.
    #[error("No handler registered at address '{0}'")]
    NoHandler(String),

    /// The request was not answered within the timeout.
    #[error("Request to '{0}' timed out")]
    Timeout(String),

    /// The handler dropped the request without replying.
    #[error("Handler at '{0}' dropped the request")]
    NoReply(String),
}

/// A point-to-point message delivered to a consumer.
#[derive(Debug)]
pub struct Delivery {
    /// The message body.
    pub body: Value,
    reply: Option<oneshot::Sender<Value>>,
}

impl Delivery {
    /// Whether the sender awaits a reply.
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Answer the request. A reply to a fire-and-forget message is
    /// silently dropped.
    pub fn reply(self, body: Value) {
        if let Some(tx) = self.reply {
            let _ = tx.send(body);
        }
    }
}

/// Publish/subscribe message layer with request/reply on named addresses.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Send a point-to-point message to the consumer at `address`.
    /// Per-address ordering of sends is preserved.
    async fn send(&self, address: &str, body: Value) -> Result<(), BusError>;

    /// Send a point-to-point message and await the consumer's reply.
    async fn request(
        &self,
        address: &str,
        body: Value,
        timeout: Duration,
    ) -> Result<Value, BusError>;

    /// Broadcast to all current subscribers of `address`. Never fails;
    /// a publish without subscribers is dropped.
    async fn publish(&self, address: &str, body: Value);

    /// Register the (single) consumer of point-to-point messages at
    /// `address`, replacing any previous consumer.
    fn consumer(&self, address: &str) -> mpsc::Receiver<Delivery>;

    /// Subscribe to publishes at `address`.
    fn subscribe(&self, address: &str) -> broadcast::Receiver<Value>;

    /// Remove the consumer at `address`.
    fn unregister(&self, address: &str);
}

const CONSUMER_QUEUE_CAPACITY: usize = 256;
const BROADCAST_CAPACITY: usize = 1024;

struct Entry {
    consumer: Option<mpsc::Sender<Delivery>>,
    broadcast: broadcast::Sender<Value>,
}

impl Default for Entry {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            consumer: None,
            broadcast: tx,
        }
    }
}

/// In-process event bus on tokio channels.
#[derive(Default)]
pub struct LocalEventBus {
    entries: Mutex<HashMap<String, Entry>>,
}

impl LocalEventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    fn consumer_sender(&self, address: &str) -> Option<mpsc::Sender<Delivery>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(address).and_then(|e| e.consumer.clone())
    }

    fn broadcast_sender(&self, address: &str) -> broadcast::Sender<Value> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.entry(address.to_string()).or_default().broadcast.clone()
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn send(&self, address: &str, body: Value) -> Result<(), BusError> {
        let Some(sender) = self.consumer_sender(address) else {
            return Err(BusError::NoHandler(address.to_string()));
        };
        sender
            .send(Delivery { body, reply: None })
            .await
            .map_err(|_| BusError::NoHandler(address.to_string()))
    }

    async fn request(
        &self,
        address: &str,
        body: Value,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        let Some(sender) = self.consumer_sender(address) else {
            return Err(BusError::NoHandler(address.to_string()));
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Delivery {
                body,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| BusError::NoHandler(address.to_string()))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BusError::NoReply(address.to_string())),
            Err(_) => Err(BusError::Timeout(address.to_string())),
        }
    }

    async fn publish(&self, address: &str, body: Value) {
        // A publish without receivers is not an error
        let _ = self.broadcast_sender(address).send(body);
    }

    fn consumer(&self, address: &str) -> mpsc::Receiver<Delivery> {
        let (tx, rx) = mpsc::channel(CONSUMER_QUEUE_CAPACITY);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.entry(address.to_string()).or_default().consumer = Some(tx);
        rx
    }

    fn subscribe(&self, address: &str) -> broadcast::Receiver<Value> {
        self.broadcast_sender(address).subscribe()
    }

    fn unregister(&self, address: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(address) {
            entry.consumer = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_reaches_consumer_in_order() {
        let bus = LocalEventBus::new();
        let mut rx = bus.consumer("svc");

        for i in 0..5 {
            bus.send("svc", json!({"n": i})).await.unwrap();
        }
        for i in 0..5 {
            let delivery = rx.recv().await.unwrap();
            assert_eq!(delivery.body["n"], i);
            assert!(!delivery.expects_reply());
        }
    }

    #[tokio::test]
    async fn test_send_without_consumer_fails() {
        let bus = LocalEventBus::new();
        let err = bus.send("nobody", json!({})).await.unwrap_err();
        assert!(matches!(err, BusError::NoHandler(_)));
    }

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let bus = std::sync::Arc::new(LocalEventBus::new());
        let mut rx = bus.consumer("echo");
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let body = delivery.body.clone();
                delivery.reply(json!({"echo": body}));
            }
        });

        let reply = bus
            .request("echo", json!("hello"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply["echo"], "hello");
    }

    #[tokio::test]
    async fn test_request_times_out_when_unanswered() {
        let bus = LocalEventBus::new();
        let _rx = bus.consumer("mute");
        let err = bus
            .request("mute", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_all_subscribers() {
        let bus = LocalEventBus::new();
        let mut a = bus.subscribe("topic");
        let mut b = bus.subscribe("topic");

        bus.publish("topic", json!(42)).await;

        assert_eq!(a.recv().await.unwrap(), json!(42));
        assert_eq!(b.recv().await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = LocalEventBus::new();
        bus.publish("void", json!(1)).await;
    }
}
