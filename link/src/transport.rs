//! Contracts the link core consumes from the connection layer.
//!
//! The transport link itself is opaque: its primitives are only ever
//! invoked from work scheduled on a [`Dispatcher`](crate::dispatcher::Dispatcher).

use crate::condition::ErrorCondition;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Identity of one link, used for correlation in logs and errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkIdentity {
    pub connection_id: String,
    pub host: String,
    pub link_name: String,
    pub entity_path: String,
}

impl LinkIdentity {
    pub fn new(
        connection_id: impl Into<String>,
        host: impl Into<String>,
        link_name: impl Into<String>,
        entity_path: impl Into<String>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            host: host.into(),
            link_name: link_name.into(),
            entity_path: entity_path.into(),
        }
    }

    /// Identity with a freshly generated `<entity>_<uuid>` link name
    pub fn generate(
        connection_id: impl Into<String>,
        host: impl Into<String>,
        entity_path: impl Into<String>,
    ) -> Self {
        let entity_path = entity_path.into();
        let link_name = format!("{}_{}", entity_path.replace('/', "_"), Uuid::new_v4());
        Self::new(connection_id, host, link_name, entity_path)
    }
}

impl fmt::Display for LinkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connection={} host={} link={} entity={}",
            self.connection_id, self.host, self.link_name, self.entity_path
        )
    }
}

/// Local open/close state of the transport endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalState {
    Uninitialized,
    Active,
    Closed,
}

/// Native receive link primitives provided by the AMQP transport.
///
/// All mutating calls (`flow`, `set_condition`, `close`) must only be made
/// from dispatcher work. Reads may happen from any thread.
pub trait TransportLink: Send + Sync {
    fn name(&self) -> &str;

    /// Last remote credit reported by the transport
    fn credit(&self) -> u32;

    /// Grant `credits` additional credits to the sender
    fn flow(&self, credits: u32);

    fn local_state(&self) -> LocalState;

    fn condition(&self) -> Option<ErrorCondition>;

    fn set_condition(&self, condition: ErrorCondition);

    /// Send the detach/close frame for this link
    fn close(&self);
}

/// Notification that the owning connection is shutting down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownSignal {
    pub initiated_by_peer: bool,
    pub description: String,
}

impl ShutdownSignal {
    pub fn new(initiated_by_peer: bool, description: impl Into<String>) -> Self {
        Self {
            initiated_by_peer,
            description: description.into(),
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = if self.initiated_by_peer {
            "peer"
        } else {
            "client"
        };
        write!(f, "{} (initiated by {origin})", self.description)
    }
}

/// The connection a link lives on.
pub trait AmqpConnection: Send + Sync {
    fn id(&self) -> &str;

    fn host(&self) -> &str;

    /// Stream of shutdown notifications for this connection
    fn shutdown_signals(&self) -> BoxStream<'static, ShutdownSignal>;
}

/// Broadcasts shutdown signals to every subscribed link.
///
/// Connection implementations keep one notifier and hand out
/// [`subscribe`](ShutdownNotifier::subscribe) streams. Streams end when the
/// notifier is dropped.
#[derive(Debug, Clone)]
pub struct ShutdownNotifier {
    sender: broadcast::Sender<ShutdownSignal>,
}

impl ShutdownNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self { sender }
    }

    /// Publish a signal; returns how many subscribers received it
    pub fn notify(&self, signal: ShutdownSignal) -> usize {
        log::info!("Connection shutdown signal: {signal}");
        self.sender.send(signal).unwrap_or(0)
    }

    pub fn subscribe(&self) -> BoxStream<'static, ShutdownSignal> {
        let receiver = self.sender.subscribe();
        stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(signal) => return Some((signal, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Shutdown signal subscriber lagged by {skipped} signals");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

impl Default for ShutdownNotifier {
    fn default() -> Self {
        Self::new()
    }
}
