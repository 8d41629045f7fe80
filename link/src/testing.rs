//! In-memory collaborators for exercising a receive link without a broker.
//!
//! Available to the crate's own tests and, behind the `test-utils`
//! feature, to downstream crates.

use crate::auth::{AuthError, AuthorizationOutcome, AuthorizationResults};
use crate::common::DispatchError;
use crate::condition::ErrorCondition;
use crate::dispatcher::{Dispatcher, Work};
use crate::transport::{
    AmqpConnection, LocalState, ShutdownNotifier, ShutdownSignal, TransportLink,
};
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::{mpsc, watch};

/// Transport link that records every call made to it.
///
/// `flow` does not change the reported credit; tests set it explicitly
/// with [`set_credit`](MockLink::set_credit), mirroring a transport that
/// only updates credit when the peer reports it.
pub struct MockLink {
    name: String,
    credit: AtomicU32,
    local_state: Mutex<LocalState>,
    condition: Mutex<Option<ErrorCondition>>,
    flows: Mutex<Vec<u32>>,
    close_calls: watch::Sender<u32>,
}

impl MockLink {
    pub fn new(name: impl Into<String>) -> Self {
        let (close_calls, _) = watch::channel(0);
        Self {
            name: name.into(),
            credit: AtomicU32::new(0),
            local_state: Mutex::new(LocalState::Active),
            condition: Mutex::new(None),
            flows: Mutex::new(Vec::new()),
            close_calls,
        }
    }

    pub fn with_credit(self, credit: u32) -> Self {
        self.set_credit(credit);
        self
    }

    pub fn set_credit(&self, credit: u32) {
        self.credit.store(credit, Ordering::SeqCst);
    }

    /// Credits passed to `flow`, in call order
    pub fn flow_calls(&self) -> Vec<u32> {
        self.flows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn close_calls(&self) -> u32 {
        *self.close_calls.borrow()
    }

    /// Resolves once `close` has been called at least once
    pub async fn wait_for_close(&self) {
        let mut calls = self.close_calls.subscribe();
        let _ = calls.wait_for(|count| *count > 0).await;
    }
}

impl TransportLink for MockLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn credit(&self) -> u32 {
        self.credit.load(Ordering::SeqCst)
    }

    fn flow(&self, credits: u32) {
        self.flows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(credits);
    }

    fn local_state(&self) -> LocalState {
        *self
            .local_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn condition(&self) -> Option<ErrorCondition> {
        self.condition
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_condition(&self, condition: ErrorCondition) {
        *self
            .condition
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(condition);
    }

    fn close(&self) {
        *self
            .local_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = LocalState::Closed;
        self.close_calls.send_modify(|count| *count += 1);
    }
}

/// Dispatcher that runs work synchronously on the calling thread
#[derive(Default)]
pub struct InlineDispatcher {
    invocations: AtomicUsize,
}

impl InlineDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl Dispatcher for InlineDispatcher {
    fn invoke(&self, work: Work) -> Result<(), DispatchError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        work();
        Ok(())
    }
}

/// Dispatcher that refuses every work item with a fixed error
pub struct RejectingDispatcher {
    error: DispatchError,
    rejections: AtomicUsize,
}

impl RejectingDispatcher {
    pub fn new(error: DispatchError) -> Self {
        Self {
            error,
            rejections: AtomicUsize::new(0),
        }
    }

    pub fn rejections(&self) -> usize {
        self.rejections.load(Ordering::SeqCst)
    }
}

impl Dispatcher for RejectingDispatcher {
    fn invoke(&self, _work: Work) -> Result<(), DispatchError> {
        self.rejections.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Connection whose shutdown can be triggered by the test
pub struct MockConnection {
    id: String,
    host: String,
    notifier: ShutdownNotifier,
}

impl MockConnection {
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            notifier: ShutdownNotifier::new(),
        }
    }

    /// Publish a shutdown signal to every link on this connection
    pub fn shutdown(&self, initiated_by_peer: bool, description: &str) -> usize {
        self.notifier
            .notify(ShutdownSignal::new(initiated_by_peer, description))
    }
}

impl AmqpConnection for MockConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn shutdown_signals(&self) -> BoxStream<'static, ShutdownSignal> {
        self.notifier.subscribe()
    }
}

pub type AuthorizationSender = mpsc::UnboundedSender<Result<AuthorizationOutcome, AuthError>>;

/// Authorization results driven by the test. Dropping the sender completes
/// the stream.
pub fn authorization_channel() -> (AuthorizationSender, AuthorizationResults) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let results = stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|result| (result, receiver))
    })
    .boxed();
    (sender, results)
}

/// Authorization results that never settle
pub fn pending_authorization() -> AuthorizationResults {
    stream::pending().boxed()
}
