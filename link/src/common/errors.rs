use crate::condition::AmqpErrorCondition;
use thiserror::Error;

/// Errors returned when work cannot be handed to a [`Dispatcher`].
///
/// Submission never throws: a dispatcher reports rejection through this
/// type and callers branch on it. `QueueFull` and `Closed` are returned
/// synchronously by [`Dispatcher::invoke`]; `Dropped` is observed when
/// accepted work was discarded before it ran (the dispatcher shut down
/// with the item still queued).
///
/// [`Dispatcher`]: crate::dispatcher::Dispatcher
/// [`Dispatcher::invoke`]: crate::dispatcher::Dispatcher::invoke
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Dispatcher queue is full")]
    QueueFull,

    #[error("Dispatcher is closed and no longer accepts work")]
    Closed,

    #[error("Scheduled work was dropped before it ran")]
    Dropped,
}

/// Errors surfaced by a receive link.
///
/// Protocol errors are classified once, when the remote close is
/// processed, and the same value is replayed to every subscriber of the
/// endpoint-state and message streams. The type is therefore `Clone`.
///
/// # Error Categories
///
/// - [`Dispatch`] - scheduling onto the I/O dispatcher was rejected
/// - [`Amqp`] - the peer closed the link with a recognized error condition
/// - [`Authorization`] - the authorization renewal stream failed
/// - [`Disposed`] - the operation was attempted after the link was closed
/// - [`InvalidCredits`] - a credit request of zero was made
///
/// [`Dispatch`]: LinkError::Dispatch
/// [`Amqp`]: LinkError::Amqp
/// [`Authorization`]: LinkError::Authorization
/// [`Disposed`]: LinkError::Disposed
/// [`InvalidCredits`]: LinkError::InvalidCredits
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinkError {
    #[error("Failed to schedule work on dispatcher: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Link '{link_name}' closed by peer: {condition} - {description}")]
    Amqp {
        condition: AmqpErrorCondition,
        description: String,
        link_name: String,
        transient: bool,
    },

    #[error("Authorization renewal failed for link '{link_name}': {reason}")]
    Authorization { link_name: String, reason: String },

    #[error("Link '{link_name}' is disposed")]
    Disposed { link_name: String },

    #[error("Credits to add must be greater than zero")]
    InvalidCredits,
}

impl LinkError {
    /// Whether an outer retry layer may re-establish the link and try again.
    pub fn is_transient(&self) -> bool {
        match self {
            LinkError::Amqp { transient, .. } => *transient,
            LinkError::Dispatch(DispatchError::QueueFull) => true,
            LinkError::Dispatch(_) => false,
            LinkError::Authorization { .. } => false,
            LinkError::Disposed { .. } => false,
            LinkError::InvalidCredits => false,
        }
    }

    /// Get the AMQP condition if the peer closed the link with one
    pub fn condition(&self) -> Option<AmqpErrorCondition> {
        match self {
            LinkError::Amqp { condition, .. } => Some(*condition),
            _ => None,
        }
    }
}

pub type LinkResult<T> = Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_follows_condition_flag() {
        let error = LinkError::Amqp {
            condition: AmqpErrorCondition::ServerBusy,
            description: "busy".to_string(),
            link_name: "orders_1".to_string(),
            transient: true,
        };
        assert!(error.is_transient());
        assert_eq!(error.condition(), Some(AmqpErrorCondition::ServerBusy));
    }

    #[test]
    fn test_dispatch_rejections() {
        assert!(LinkError::from(DispatchError::QueueFull).is_transient());
        assert!(!LinkError::from(DispatchError::Closed).is_transient());
        assert_eq!(
            LinkError::from(DispatchError::Closed).to_string(),
            "Failed to schedule work on dispatcher: Dispatcher is closed and no longer accepts work"
        );
    }
}
