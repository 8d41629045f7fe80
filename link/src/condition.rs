//! AMQP error conditions carried on link detach/close frames.
//!
//! A remote close may carry an [`ErrorCondition`]. Conditions whose symbol
//! maps to a known [`AmqpErrorCondition`] are surfaced to callers as
//! [`LinkError::Amqp`]; anything else is treated as a benign close.

use crate::common::LinkError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error condition as it appears on the wire: a symbol plus an optional
/// human readable description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCondition {
    pub condition: String,
    pub description: Option<String>,
}

impl ErrorCondition {
    pub fn new(condition: impl Into<String>, description: Option<String>) -> Self {
        Self {
            condition: condition.into(),
            description,
        }
    }

    /// Build a condition from a known symbol
    pub fn from_known(condition: AmqpErrorCondition, description: impl Into<String>) -> Self {
        Self {
            condition: condition.symbol().to_string(),
            description: Some(description.into()),
        }
    }

    /// Look up the recognized condition for this symbol, if any
    pub fn known(&self) -> Option<AmqpErrorCondition> {
        AmqpErrorCondition::from_symbol(&self.condition)
    }

    /// Classify this condition for the given link.
    ///
    /// Returns `None` for unrecognized symbols, which callers treat as a
    /// clean close.
    pub fn to_link_error(&self, link_name: &str) -> Option<LinkError> {
        let condition = self.known()?;
        Some(LinkError::Amqp {
            condition,
            description: self
                .description
                .clone()
                .unwrap_or_else(|| condition.symbol().to_string()),
            link_name: link_name.to_string(),
            transient: condition.is_transient(),
        })
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {}", self.condition, description),
            None => write!(f, "{}", self.condition),
        }
    }
}

/// Recognized AMQP 1.0 and service-specific error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AmqpErrorCondition {
    InternalError,
    NotFound,
    UnauthorizedAccess,
    DecodeError,
    ResourceLimitExceeded,
    NotAllowed,
    NotImplemented,
    IllegalState,
    ConnectionForced,
    ConnectionFramingError,
    LinkDetachForced,
    LinkStolen,
    LinkPayloadSizeExceeded,
    ServerBusy,
    Timeout,
    ArgumentError,
    EntityDisabled,
    PartitionNotOwned,
    ProtonIo,
}

const CONDITIONS: [AmqpErrorCondition; 19] = [
    AmqpErrorCondition::InternalError,
    AmqpErrorCondition::NotFound,
    AmqpErrorCondition::UnauthorizedAccess,
    AmqpErrorCondition::DecodeError,
    AmqpErrorCondition::ResourceLimitExceeded,
    AmqpErrorCondition::NotAllowed,
    AmqpErrorCondition::NotImplemented,
    AmqpErrorCondition::IllegalState,
    AmqpErrorCondition::ConnectionForced,
    AmqpErrorCondition::ConnectionFramingError,
    AmqpErrorCondition::LinkDetachForced,
    AmqpErrorCondition::LinkStolen,
    AmqpErrorCondition::LinkPayloadSizeExceeded,
    AmqpErrorCondition::ServerBusy,
    AmqpErrorCondition::Timeout,
    AmqpErrorCondition::ArgumentError,
    AmqpErrorCondition::EntityDisabled,
    AmqpErrorCondition::PartitionNotOwned,
    AmqpErrorCondition::ProtonIo,
];

impl AmqpErrorCondition {
    pub fn symbol(&self) -> &'static str {
        match self {
            AmqpErrorCondition::InternalError => "amqp:internal-error",
            AmqpErrorCondition::NotFound => "amqp:not-found",
            AmqpErrorCondition::UnauthorizedAccess => "amqp:unauthorized-access",
            AmqpErrorCondition::DecodeError => "amqp:decode-error",
            AmqpErrorCondition::ResourceLimitExceeded => "amqp:resource-limit-exceeded",
            AmqpErrorCondition::NotAllowed => "amqp:not-allowed",
            AmqpErrorCondition::NotImplemented => "amqp:not-implemented",
            AmqpErrorCondition::IllegalState => "amqp:illegal-state",
            AmqpErrorCondition::ConnectionForced => "amqp:connection:forced",
            AmqpErrorCondition::ConnectionFramingError => "amqp:connection:framing-error",
            AmqpErrorCondition::LinkDetachForced => "amqp:link:detach-forced",
            AmqpErrorCondition::LinkStolen => "amqp:link:stolen",
            AmqpErrorCondition::LinkPayloadSizeExceeded => "amqp:link:message-size-exceeded",
            AmqpErrorCondition::ServerBusy => "com.microsoft:server-busy",
            AmqpErrorCondition::Timeout => "com.microsoft:timeout",
            AmqpErrorCondition::ArgumentError => "com.microsoft:argument-error",
            AmqpErrorCondition::EntityDisabled => "com.microsoft:entity-disabled",
            AmqpErrorCondition::PartitionNotOwned => "com.microsoft:partition-not-owned",
            AmqpErrorCondition::ProtonIo => "proton:io",
        }
    }

    /// Every recognized condition
    pub fn all() -> &'static [AmqpErrorCondition] {
        &CONDITIONS
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        CONDITIONS
            .iter()
            .copied()
            .find(|condition| condition.symbol() == symbol)
    }

    /// Conditions a caller can expect to clear up on a fresh link
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmqpErrorCondition::InternalError
                | AmqpErrorCondition::ConnectionForced
                | AmqpErrorCondition::LinkDetachForced
                | AmqpErrorCondition::ServerBusy
                | AmqpErrorCondition::Timeout
                | AmqpErrorCondition::ProtonIo
        )
    }
}

impl fmt::Display for AmqpErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}
