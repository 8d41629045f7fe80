//! Receive link session manager.
//!
//! [`ReactorReceiver`] owns one receiving link's message stream, credit
//! management and close sequencing. Every effect on the transport link is
//! marshalled onto a [`Dispatcher`]; the only state touched outside of it
//! is the `disposed` flag, which is flipped with an atomic swap so that
//! exactly one of the close triggers (local close, remote close, link
//! final, connection shutdown, authorization failure) sends the native
//! close.

use crate::auth::AuthorizationResults;
use crate::common::{DispatchError, LinkError};
use crate::condition::{AmqpErrorCondition, ErrorCondition};
use crate::dispatcher::Dispatcher;
use crate::endpoint::{EndpointState, LinkStatus};
use crate::handler::ReceiveLinkHandler;
use crate::model::{Delivery, ReceivedMessage};
use crate::transport::{AmqpConnection, LinkIdentity, LocalState, ShutdownSignal, TransportLink};
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{oneshot, watch};

/// Default time a local close waits for the peer to acknowledge.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverOptions {
    /// How long a local close waits for the remote close before the
    /// endpoint is completed anyway
    pub close_timeout: Duration,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

type CreditListener = Arc<dyn Fn() -> u32 + Send + Sync>;

/// Terminal outcome of the message stream, `None` while it is live
type MessageOutcome = Option<Result<(), LinkError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseMode {
    /// Wait for the peer's close, bounded by the close timeout
    AwaitRemote,
    /// Complete the endpoint as soon as the local close has run
    Forced,
}

struct ReceiverShared {
    identity: LinkIdentity,
    link: Arc<dyn TransportLink>,
    handler: Arc<ReceiveLinkHandler>,
    dispatcher: Arc<dyn Dispatcher>,
    options: ReceiverOptions,
    disposed: AtomicBool,
    /// Set once the native close has run, or was given up on
    locally_closed: watch::Sender<bool>,
    messages: watch::Sender<MessageOutcome>,
    credit_listener: RwLock<Option<CreditListener>>,
    runtime: Handle,
}

/// Session manager for one receiving link.
///
/// Created once the connection has negotiated the link. A supervisor task
/// watches the endpoint state, the connection's shutdown signals and the
/// authorization results, and drives the shared close path when any of
/// them ends the link.
///
/// Dropping an undisposed receiver force-closes the link.
pub struct ReactorReceiver {
    shared: Arc<ReceiverShared>,
}

impl ReactorReceiver {
    /// Create the manager and start supervising the link.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn new(
        connection: &dyn AmqpConnection,
        link: Arc<dyn TransportLink>,
        handler: Arc<ReceiveLinkHandler>,
        authorization_results: AuthorizationResults,
        dispatcher: Arc<dyn Dispatcher>,
        options: ReceiverOptions,
    ) -> Self {
        let identity = handler.identity().clone();
        let (messages, _) = watch::channel(None);
        let (locally_closed, _) = watch::channel(false);

        let shared = Arc::new(ReceiverShared {
            identity,
            link,
            handler,
            dispatcher,
            options,
            disposed: AtomicBool::new(false),
            locally_closed,
            messages,
            credit_listener: RwLock::new(None),
            runtime: Handle::current(),
        });

        log::debug!(
            "Creating receive link on connection {} ({}): {}",
            connection.id(),
            connection.host(),
            shared.identity
        );

        tokio::spawn(supervise(
            Arc::clone(&shared),
            shared.handler.subscribe(),
            connection.shutdown_signals(),
            authorization_results,
        ));

        Self { shared }
    }

    /// Connection, entity and link name this receiver was created for
    pub fn identity(&self) -> &LinkIdentity {
        &self.shared.identity
    }

    /// Grant `credits` more credits to the sender.
    ///
    /// Resolves once the flow update has run on the dispatcher. When the
    /// dispatcher rejects the work the transport link is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidCredits`] for zero credits,
    /// [`LinkError::Disposed`] once a close has started and
    /// [`LinkError::Dispatch`] when the dispatcher refused or dropped the
    /// flow update.
    pub async fn add_credits(&self, credits: u32) -> Result<(), LinkError> {
        if credits == 0 {
            return Err(LinkError::InvalidCredits);
        }
        if self.is_disposed() {
            return Err(LinkError::Disposed {
                link_name: self.shared.identity.link_name.clone(),
            });
        }

        let link = Arc::clone(&self.shared.link);
        let completion = self.shared.schedule(move || link.flow(credits))?;
        completion
            .await
            .map_err(|_| LinkError::Dispatch(DispatchError::Dropped))
    }

    /// Last remote credit reported by the transport link
    pub fn credits(&self) -> u32 {
        self.shared.link.credit()
    }

    /// Stream of decoded messages.
    ///
    /// Every call returns an independent subscription over the link's
    /// delivery queue. Messages already queued are drained before the
    /// stream ends. The stream ends cleanly when the link closes without
    /// error and yields one `Err` before ending when the link failed or
    /// authorization could not be renewed.
    pub fn receive(&self) -> BoxStream<'static, Result<ReceivedMessage, LinkError>> {
        let shared = Arc::clone(&self.shared);
        let deliveries = shared.handler.deliveries();
        let outcome = shared.messages.subscribe();

        stream::unfold(
            (shared, deliveries, outcome, false),
            |(shared, deliveries, mut outcome, finished)| async move {
                if finished {
                    return None;
                }

                loop {
                    let next = tokio::select! {
                        biased;
                        delivery = deliveries.recv_async() => delivery.ok(),
                        _ = outcome.wait_for(Option::is_some) => deliveries.try_recv().ok(),
                    };

                    let Some(delivery) = next else {
                        let terminal = outcome.borrow().clone();
                        return match terminal {
                            Some(Err(error)) => Some((Err(error), (shared, deliveries, outcome, true))),
                            _ => None,
                        };
                    };

                    if let Some(message) = shared.process_delivery(delivery).await {
                        return Some((Ok(message), (shared, deliveries, outcome, false)));
                    }
                }
            },
        )
        .boxed()
    }

    /// Replaying stream of endpoint states.
    ///
    /// Late subscribers see the latest state first. The stream ends after
    /// `Closed`, or after a single `Err` when the peer closed the link with
    /// a recognized error condition.
    pub fn endpoint_states(&self) -> BoxStream<'static, Result<EndpointState, LinkError>> {
        self.shared.handler.endpoint_states()
    }

    /// Supplier asked for more credits when remote credit reaches zero
    /// while messages are drained
    pub fn set_empty_credit_listener<F>(&self, listener: F)
    where
        F: Fn() -> u32 + Send + Sync + 'static,
    {
        let mut slot = self
            .shared
            .credit_listener
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Arc::new(listener));
    }

    /// Close the link and wait for the peer to acknowledge.
    ///
    /// Resolves once the endpoint is terminal: after the remote close
    /// arrives, or after the configured close timeout when it never does.
    /// Calling it again, or after any other close trigger, only waits.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// receiver.close_async().await;
    /// assert!(receiver.is_disposed());
    /// ```
    pub async fn close_async(&self) {
        self.close_with("User initiated close", None).await;
    }

    /// Close the link, recording `condition` on it for the peer.
    ///
    /// Idempotent: only the first close reaches the transport and every
    /// caller resolves once the endpoint has settled. Never fails; protocol
    /// errors surface on the streams only.
    pub async fn close_with(&self, message: &str, condition: Option<ErrorCondition>) {
        self.shared
            .begin_close(message, condition, CloseMode::AwaitRemote);
        self.shared.wait_settled().await;
    }

    /// Blocking form of [`close_async`](Self::close_async).
    ///
    /// From a plain thread the close is driven to completion on the
    /// runtime the receiver was created on. Inside a multi-threaded runtime
    /// the calling worker is handed over with `block_in_place` first.
    ///
    /// # Panics
    ///
    /// Panics when called from a current-thread runtime, where blocking
    /// the only worker would keep the close from ever running. Use
    /// [`close_async`](Self::close_async) there.
    pub fn dispose(&self) {
        match Handle::try_current() {
            Err(_) => futures::executor::block_on(self.close_async()),
            Ok(handle) => match handle.runtime_flavor() {
                RuntimeFlavor::CurrentThread => panic!(
                    "ReactorReceiver::dispose cannot block a current-thread runtime, use close_async: {}",
                    self.shared.identity
                ),
                _ => tokio::task::block_in_place(|| handle.block_on(self.close_async())),
            },
        }
    }

    /// Whether a close has been initiated by any trigger
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }
}

impl Drop for ReactorReceiver {
    fn drop(&mut self) {
        if !self.is_disposed() {
            self.shared
                .begin_close("Receiver dropped", None, CloseMode::Forced);
        }
    }
}

impl ReceiverShared {
    /// Hand `work` to the dispatcher. The returned receiver resolves once
    /// the work has run, or errors if the work was dropped.
    fn schedule<F>(&self, work: F) -> Result<oneshot::Receiver<()>, DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.dispatcher.invoke(Box::new(move || {
            work();
            let _ = done_tx.send(());
        }))?;
        Ok(done_rx)
    }

    /// Start the close sequence unless one is already under way. Returns
    /// whether this call started it.
    fn begin_close(
        self: &Arc<Self>,
        message: &str,
        condition: Option<ErrorCondition>,
        mode: CloseMode,
    ) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            log::debug!("Close already initiated, ignoring '{message}': {}", self.identity);
            return false;
        }

        log::info!("Closing receive link ({message}): {}", self.identity);
        let shared = Arc::clone(self);
        self.runtime.spawn(async move {
            shared.run_close(condition, mode).await;
        });
        true
    }

    async fn run_close(&self, condition: Option<ErrorCondition>, mode: CloseMode) {
        let link = Arc::clone(&self.link);
        let scheduled = self.schedule(move || {
            if link.local_state() == LocalState::Closed {
                return;
            }
            if let Some(condition) = condition {
                if link.condition().is_none() {
                    link.set_condition(condition);
                }
            }
            link.close();
        });

        let completion = match scheduled {
            Ok(completion) => completion,
            Err(e) => {
                log::warn!(
                    "Dispatcher rejected local close ({e}), completing endpoint locally: {}",
                    self.identity
                );
                self.locally_closed.send_replace(true);
                self.handler.close();
                return;
            }
        };

        let dropped = completion.await.is_err();
        self.locally_closed.send_replace(true);
        if dropped {
            log::warn!(
                "Local close was dropped by the dispatcher, completing endpoint locally: {}",
                self.identity
            );
            self.handler.close();
            return;
        }

        if mode == CloseMode::Forced {
            self.handler.close();
            return;
        }

        let mut status = self.handler.subscribe();
        let acknowledged = tokio::time::timeout(
            self.options.close_timeout,
            status.wait_for(LinkStatus::is_terminal),
        )
        .await
        .is_ok();

        if !acknowledged {
            log::info!(
                "No close acknowledgment within {:?}, completing endpoint: {}",
                self.options.close_timeout,
                self.identity
            );
            self.handler.close();
        }
    }

    /// Wait until the native close has run, whichever trigger started it.
    async fn wait_locally_closed(&self) {
        let mut closed = self.locally_closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Close the link and end the message stream with `outcome` once the
    /// native close has run.
    async fn close_then_settle(
        self: &Arc<Self>,
        message: &str,
        condition: Option<ErrorCondition>,
        outcome: Result<(), LinkError>,
    ) {
        self.begin_close(message, condition, CloseMode::AwaitRemote);
        self.wait_locally_closed().await;
        self.settle_messages(outcome);
    }

    async fn wait_settled(&self) {
        let mut status = self.handler.subscribe();
        let _ = status.wait_for(LinkStatus::is_terminal).await;
    }

    /// Settle the message stream; the first outcome wins.
    fn settle_messages(&self, outcome: Result<(), LinkError>) {
        self.messages.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        });
    }

    /// The endpoint reached its terminal state through the handler.
    fn on_endpoint_terminal(self: &Arc<Self>, outcome: Result<(), LinkError>) {
        let condition = match &outcome {
            Err(LinkError::Amqp {
                condition,
                description,
                ..
            }) => Some(ErrorCondition::from_known(*condition, description.clone())),
            _ => None,
        };

        self.settle_messages(outcome);
        self.begin_close("Remote link closed", condition, CloseMode::AwaitRemote);
    }

    /// The connection is going away, so no acknowledgment will arrive.
    /// A close already waiting on the peer is completed as soon as its
    /// native close has run.
    async fn on_shutdown_signal(self: &Arc<Self>, signal: ShutdownSignal) {
        log::info!("Connection shutdown signal received ({signal}): {}", self.identity);
        let started = self.begin_close(
            &format!("Connection shutdown: {}", signal.description),
            None,
            CloseMode::Forced,
        );
        if !started {
            self.wait_locally_closed().await;
            self.handler.close();
        }
    }

    async fn process_delivery(&self, delivery: Delivery) -> Option<ReceivedMessage> {
        let message = match ReceivedMessage::try_from(delivery) {
            Ok(message) => Some(message),
            Err(e) => {
                log::warn!("Skipping delivery that failed to decode ({e}): {}", self.identity);
                None
            }
        };

        self.replenish_credits().await;
        message
    }

    /// Ask the empty-credit listener for more credits if remote credit is
    /// exhausted. The check and the flow both run on the dispatcher.
    async fn replenish_credits(&self) {
        let listener = self
            .credit_listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(listener) = listener else {
            return;
        };

        let link = Arc::clone(&self.link);
        let scheduled = self.schedule(move || {
            if link.local_state() == LocalState::Closed || link.credit() > 0 {
                return;
            }
            let credits = listener();
            if credits > 0 {
                link.flow(credits);
            }
        });

        match scheduled {
            Ok(completion) => {
                let _ = completion.await;
            }
            Err(e) => {
                log::warn!("Unable to schedule credit replenishment ({e}): {}", self.identity);
            }
        }
    }
}

/// Watches the endpoint state, shutdown signals and authorization results
/// until the endpoint is terminal.
async fn supervise(
    shared: Arc<ReceiverShared>,
    mut status: watch::Receiver<LinkStatus>,
    mut shutdown_signals: BoxStream<'static, ShutdownSignal>,
    mut authorization: AuthorizationResults,
) {
    let mut signals_open = true;
    let mut authorization_open = true;

    loop {
        let outcome = status.borrow_and_update().outcome();
        if let Some(outcome) = outcome {
            shared.on_endpoint_terminal(outcome);
            break;
        }

        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            signal = shutdown_signals.next(), if signals_open => match signal {
                Some(signal) => shared.on_shutdown_signal(signal).await,
                None => signals_open = false,
            },
            result = authorization.next(), if authorization_open => match result {
                Some(Ok(outcome)) => {
                    log::debug!(
                        "Authorization renewed until {}: {}",
                        outcome.expires_on,
                        shared.identity
                    );
                }
                Some(Err(e)) => {
                    authorization_open = false;
                    log::error!("Authorization renewal failed ({e}): {}", shared.identity);
                    shared
                        .close_then_settle(
                            "Authorization renewal failed",
                            Some(ErrorCondition::from_known(
                                AmqpErrorCondition::NotAllowed,
                                e.to_string(),
                            )),
                            Err(LinkError::Authorization {
                                link_name: shared.identity.link_name.clone(),
                                reason: e.to_string(),
                            }),
                        )
                        .await;
                }
                None => {
                    authorization_open = false;
                    log::info!("Authorization renewal completed: {}", shared.identity);
                    shared
                        .close_then_settle("Authorization renewal completed", None, Ok(()))
                        .await;
                }
            },
        }
    }

    log::debug!("Receive link supervisor exited: {}", shared.identity);
}
