//! Error types for the replication core.
//!
//! Only configuration misuse and codec failures are errors. Stale or
//! out-of-order data is ignored where it is detected and never surfaces
//! here.

use bevy_ecs::entity::Entity;

use crate::channel::{ChannelDirection, ChannelId};
use crate::replication::ClientId;

/// Errors raised by replication, channel lookup and component codecs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicationError {
    /// The channel id is not present in the channel table.
    #[error("unknown channel {0:?}")]
    UnknownChannel(ChannelId),

    /// The channel exists but carries traffic the other way.
    #[error("channel {channel:?} is {actual:?}, expected {expected:?}")]
    ChannelDirection {
        /// Offending channel.
        channel: ChannelId,
        /// Direction required by the caller.
        expected: ChannelDirection,
        /// Direction the channel was declared with.
        actual: ChannelDirection,
    },

    /// The client was never added, or has been removed.
    #[error("unknown client {0}")]
    UnknownClient(ClientId),

    /// A component tag that was never registered.
    #[error("unknown component tag {0:?}")]
    UnknownComponent(String),

    /// The target entity does not exist in the world.
    #[error("entity {0:?} does not exist")]
    MissingEntity(Entity),

    /// A payload could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// A payload could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Errors reported by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The destination client is gone. The caller drops it.
    #[error("client {0} disconnected")]
    Disconnected(ClientId),

    /// The transport refused the channel id.
    #[error("channel {0:?} rejected by transport")]
    ChannelRejected(ChannelId),
}

/// Errors raised by the client prediction manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PredictionError {
    /// The entity was never registered for prediction.
    #[error("entity {0:?} is not predicted")]
    EntityNotPredicted(Entity),

    /// A configuration value is out of range.
    #[error("invalid prediction configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Failure to parse a setting enum from a string (CLI or config).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} {value:?}")]
pub struct ParseSettingError {
    /// Which setting was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}
