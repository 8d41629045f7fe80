//! # Quetty Link Library
//!
//! Lifecycle and flow-control core for AMQP receive links. One
//! [`ReactorReceiver`] manages one receiving link: credits, the message
//! stream, the replaying endpoint-state stream and an idempotent close
//! that converges even when the peer never acknowledges.
//!
//! ## Modules
//!
//! - [`receiver`] - Link session manager
//! - [`handler`] - Event sink the transport reactor drives for a link
//! - [`endpoint`] - Endpoint states and the replaying state stream
//! - [`dispatcher`] - Serializing executor for transport mutations
//! - [`transport`] - Contracts consumed from the connection layer
//! - [`condition`] - AMQP error conditions and their classification
//! - [`auth`] - Token providers and background authorization renewal
//! - [`retry`] - Retry policy for transient failures
//! - [`config`] - Configuration loading and validation
//! - [`model`] - Deliveries and decoded messages
//! - [`common`] - Error types
//! - `testing` - In-memory collaborators (`test-utils` feature)

pub mod auth;
pub mod common;
pub mod condition;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod handler;
pub mod model;
pub mod receiver;
pub mod retry;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use common::{DispatchError, LinkError, LinkResult};
pub use condition::{AmqpErrorCondition, ErrorCondition};
pub use dispatcher::{Dispatcher, ReactorDispatcher};
pub use endpoint::EndpointState;
pub use handler::ReceiveLinkHandler;
pub use model::{Delivery, ReceivedMessage};
pub use receiver::{ReactorReceiver, ReceiverOptions};
pub use transport::{AmqpConnection, LinkIdentity, TransportLink};
