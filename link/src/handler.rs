use crate::condition::ErrorCondition;
use crate::endpoint::{EndpointState, LinkStatus, endpoint_state_stream};
use crate::common::LinkError;
use crate::model::Delivery;
use crate::transport::LinkIdentity;
use futures::stream::BoxStream;
use tokio::sync::watch;

/// Event sink for one receive link.
///
/// The transport reactor calls the `on_*` methods as protocol events
/// arrive for the link. The handler owns the replaying endpoint-state
/// holder and the queue of inbound deliveries, and enforces that state
/// only moves forward: `Uninitialized -> Active -> Closed` (or the failed
/// terminal state), never back.
pub struct ReceiveLinkHandler {
    identity: LinkIdentity,
    status: watch::Sender<LinkStatus>,
    deliveries_tx: flume::Sender<Delivery>,
    deliveries_rx: flume::Receiver<Delivery>,
}

impl ReceiveLinkHandler {
    /// Handler for a link that has not been opened by the peer yet
    pub fn new(identity: LinkIdentity) -> Self {
        let (status, _) = watch::channel(LinkStatus::Uninitialized);
        let (deliveries_tx, deliveries_rx) = flume::unbounded();
        Self {
            identity,
            status,
            deliveries_tx,
            deliveries_rx,
        }
    }

    /// Identity used to tag every log line for this link
    pub fn identity(&self) -> &LinkIdentity {
        &self.identity
    }

    /// Current endpoint state
    pub fn state(&self) -> EndpointState {
        match *self.status.borrow() {
            LinkStatus::Uninitialized => EndpointState::Uninitialized,
            LinkStatus::Active => EndpointState::Active,
            LinkStatus::Closed | LinkStatus::Failed(_) => EndpointState::Closed,
        }
    }

    /// Whether the endpoint has closed, cleanly or with an error.
    ///
    /// Once terminal no event moves the state again and inbound deliveries
    /// are dropped.
    pub fn is_terminal(&self) -> bool {
        self.status.borrow().is_terminal()
    }

    /// Replaying stream of endpoint states, see [`EndpointState`]
    pub fn endpoint_states(&self) -> BoxStream<'static, Result<EndpointState, LinkError>> {
        endpoint_state_stream(self.status.subscribe())
    }

    /// Peer attached its end of the link. Ignored once the endpoint is
    /// active or terminal.
    pub fn on_link_remote_open(&self) {
        if self.transition(LinkStatus::Active) {
            log::info!("Receive link remote open: {}", self.identity);
        } else {
            log::debug!(
                "Ignoring remote open in state {:?}: {}",
                self.state(),
                self.identity
            );
        }
    }

    /// Queue an inbound transfer for the message stream
    pub fn on_delivery(&self, delivery: Delivery) {
        if self.is_terminal() {
            log::warn!(
                "Dropping delivery received after link closed: {}",
                self.identity
            );
            return;
        }

        // Unbounded; the receiver half is owned by self so this cannot fail
        let _ = self.deliveries_tx.send(delivery);
    }

    /// Remote peer sent a detach/close for this link.
    ///
    /// A condition with a recognized symbol fails the endpoint. Absent or
    /// unknown conditions close it cleanly.
    pub fn on_link_remote_close(&self, condition: Option<ErrorCondition>) {
        let next = match &condition {
            None => LinkStatus::Closed,
            Some(condition) => match condition.to_link_error(&self.identity.link_name) {
                Some(error) => LinkStatus::Failed(error),
                None => {
                    log::warn!(
                        "Remote close with unrecognized condition '{condition}', treating as clean close: {}",
                        self.identity
                    );
                    LinkStatus::Closed
                }
            },
        };

        let failed = matches!(next, LinkStatus::Failed(_));
        if self.transition(next) {
            if failed {
                log::error!(
                    "Receive link closed by peer with error {}: {}",
                    condition.map(|c| c.to_string()).unwrap_or_default(),
                    self.identity
                );
            } else {
                log::info!("Receive link remote close: {}", self.identity);
            }
        } else {
            log::debug!("Remote close after link already closed: {}", self.identity);
        }
    }

    /// Transport released the link; no further events will arrive.
    pub fn on_link_final(&self) {
        if self.transition(LinkStatus::Closed) {
            log::info!("Receive link final: {}", self.identity);
        }
    }

    /// Complete the endpoint locally without a remote acknowledgment.
    ///
    /// Used when the close handshake cannot complete: the connection is
    /// gone, the dispatcher refused the close, or the peer never answered.
    pub fn close(&self) {
        if self.transition(LinkStatus::Closed) {
            log::info!("Receive link closed locally: {}", self.identity);
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    pub(crate) fn deliveries(&self) -> flume::Receiver<Delivery> {
        self.deliveries_rx.clone()
    }

    fn transition(&self, next: LinkStatus) -> bool {
        self.status.send_if_modified(|status| status.advance(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::AmqpErrorCondition;
    use futures::StreamExt;

    fn handler() -> ReceiveLinkHandler {
        ReceiveLinkHandler::new(LinkIdentity::new(
            "conn-1",
            "ns.servicebus.windows.net",
            "orders_1",
            "orders",
        ))
    }

    #[tokio::test]
    async fn test_open_then_close() {
        let handler = handler();
        let states = handler.endpoint_states();

        handler.on_link_remote_open();
        handler.on_link_remote_close(None);
        handler.on_link_remote_open();

        let states: Vec<_> = states.collect().await;
        assert_eq!(
            states.last(),
            Some(&Ok(EndpointState::Closed))
        );
        assert_eq!(handler.state(), EndpointState::Closed);
    }

    #[tokio::test]
    async fn test_recognized_condition_fails_endpoint() {
        let handler = handler();
        handler.on_link_remote_close(Some(ErrorCondition::from_known(
            AmqpErrorCondition::UnauthorizedAccess,
            "token expired",
        )));

        let states: Vec<_> = handler.endpoint_states().collect().await;
        assert_eq!(states.len(), 1);
        let error = states[0].clone().unwrap_err();
        assert_eq!(
            error.condition(),
            Some(AmqpErrorCondition::UnauthorizedAccess)
        );
    }

    #[test]
    fn test_deliveries_after_close_are_dropped() {
        let handler = handler();
        handler.on_delivery(Delivery::new(vec![1], b"a".to_vec()));
        handler.on_link_final();
        handler.on_delivery(Delivery::new(vec![2], b"b".to_vec()));

        let queued: Vec<_> = handler.deliveries().drain().collect();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].tag, vec![1]);
    }
}
