use crate::common::LinkError;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tokio::sync::watch;

/// Lifecycle phase of a link endpoint as observed by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EndpointState {
    /// Link created, remote open not yet seen
    Uninitialized,
    /// Remote peer opened the link
    Active,
    /// Link closed; terminal
    Closed,
}

/// Status held by the replaying state holder.
///
/// `Failed` is the terminal state reached when the remote close carried a
/// recognized error condition. It replaces `Closed` for that link.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LinkStatus {
    Uninitialized,
    Active,
    Closed,
    Failed(LinkError),
}

impl LinkStatus {
    fn rank(&self) -> u8 {
        match self {
            LinkStatus::Uninitialized => 0,
            LinkStatus::Active => 1,
            LinkStatus::Closed | LinkStatus::Failed(_) => 2,
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    /// Terminal outcome, `None` while the link is still live
    pub(crate) fn outcome(&self) -> Option<Result<(), LinkError>> {
        match self {
            LinkStatus::Closed => Some(Ok(())),
            LinkStatus::Failed(error) => Some(Err(error.clone())),
            _ => None,
        }
    }

    /// Move forward to `next`. Returns false if `next` is not ahead of the
    /// current state.
    pub(crate) fn advance(&mut self, next: LinkStatus) -> bool {
        if next.rank() <= self.rank() {
            return false;
        }
        *self = next;
        true
    }
}

/// Stream of endpoint states read from a status watch.
///
/// The current state is replayed first. The stream ends after `Closed`,
/// or after a single `Err` for a failed link. Intermediate states may be
/// coalesced when they change faster than the subscriber polls, but
/// order is always preserved.
pub(crate) fn endpoint_state_stream(
    receiver: watch::Receiver<LinkStatus>,
) -> BoxStream<'static, Result<EndpointState, LinkError>> {
    stream::unfold(
        (receiver, None::<EndpointState>, false),
        |(mut receiver, last, finished)| async move {
            if finished {
                return None;
            }

            loop {
                let status = receiver.borrow_and_update().clone();
                let next = match status {
                    LinkStatus::Uninitialized => EndpointState::Uninitialized,
                    LinkStatus::Active => EndpointState::Active,
                    LinkStatus::Closed => EndpointState::Closed,
                    LinkStatus::Failed(error) => return Some((Err(error), (receiver, last, true))),
                };

                if last != Some(next) {
                    let finished = next == EndpointState::Closed;
                    return Some((Ok(next), (receiver, Some(next), finished)));
                }

                if receiver.changed().await.is_err() {
                    return None;
                }
            }
        },
    )
    .boxed()
}
