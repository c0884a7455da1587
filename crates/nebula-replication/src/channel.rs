//! Channels and the transport seam.
//!
//! The core never touches sockets. It enqueues payloads on a [`Transport`]
//! addressed by client and [`ChannelId`], and drains inbound payloads once
//! per tick. [`LoopbackTransport`] is an in-memory implementation for tests
//! and headless runs.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{ReplicationError, TransportError};
use crate::replication::ClientId;

// ---------------------------------------------------------------------------
// Channel identity
// ---------------------------------------------------------------------------

/// Small integer naming a transport path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u8);

impl ChannelId {
    /// Server → client, reliable and ordered. Inserts and removes.
    pub const STRUCTURAL: ChannelId = ChannelId(0);
    /// Server → client, unreliable. Frequent value updates.
    pub const UPDATES: ChannelId = ChannelId(1);
    /// Client → server, reliable and ordered. Acknowledgements.
    pub const ACKS: ChannelId = ChannelId(2);
}

/// Delivery guarantee of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelMode {
    /// Fire and forget, any order.
    UnreliableUnordered,
    /// Fire and forget, stale packets dropped by the receiver.
    UnreliableSequenced,
    /// Retransmitted until delivered, any order.
    ReliableUnordered,
    /// Retransmitted until delivered, in send order.
    ReliableOrdered,
}

impl ChannelMode {
    /// Whether delivery is guaranteed.
    pub fn is_reliable(self) -> bool {
        matches!(self, Self::ReliableUnordered | Self::ReliableOrdered)
    }

    /// Whether the receiver observes send order.
    pub fn is_ordered(self) -> bool {
        matches!(self, Self::ReliableOrdered | Self::UnreliableSequenced)
    }
}

/// Which side sends on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelDirection {
    /// Server sends, client receives.
    ServerToClient,
    /// Client sends, server receives.
    ClientToServer,
}

/// Declaration of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Channel identifier.
    pub id: ChannelId,
    /// Delivery guarantee.
    pub mode: ChannelMode,
    /// Traffic direction.
    pub direction: ChannelDirection,
}

// ---------------------------------------------------------------------------
// ChannelTable
// ---------------------------------------------------------------------------

/// The set of channels both ends agree on.
#[derive(Debug, Clone)]
pub struct ChannelTable {
    channels: Vec<ChannelConfig>,
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self {
            channels: vec![
                ChannelConfig {
                    id: ChannelId::STRUCTURAL,
                    mode: ChannelMode::ReliableOrdered,
                    direction: ChannelDirection::ServerToClient,
                },
                ChannelConfig {
                    id: ChannelId::UPDATES,
                    mode: ChannelMode::UnreliableSequenced,
                    direction: ChannelDirection::ServerToClient,
                },
                ChannelConfig {
                    id: ChannelId::ACKS,
                    mode: ChannelMode::ReliableOrdered,
                    direction: ChannelDirection::ClientToServer,
                },
            ],
        }
    }
}

impl ChannelTable {
    /// An empty table. Most callers want [`ChannelTable::default`].
    pub fn empty() -> Self {
        Self {
            channels: Vec::new(),
        }
    }

    /// Declares a channel, replacing any earlier declaration with the same id.
    pub fn add(&mut self, config: ChannelConfig) {
        self.channels.retain(|c| c.id != config.id);
        self.channels.push(config);
    }

    /// Looks up a channel.
    pub fn get(&self, id: ChannelId) -> Result<&ChannelConfig, ReplicationError> {
        self.channels
            .iter()
            .find(|c| c.id == id)
            .ok_or(ReplicationError::UnknownChannel(id))
    }

    /// Looks up a channel and checks it runs in `direction`.
    pub fn require(
        &self,
        id: ChannelId,
        direction: ChannelDirection,
    ) -> Result<&ChannelConfig, ReplicationError> {
        let channel = self.get(id)?;
        if channel.direction != direction {
            return Err(ReplicationError::ChannelDirection {
                channel: id,
                expected: direction,
                actual: channel.direction,
            });
        }
        Ok(channel)
    }

    /// All declared channels.
    pub fn channels(&self) -> &[ChannelConfig] {
        &self.channels
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// A payload received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Sender. On the client this is the server's id (conventionally 0).
    pub from: ClientId,
    /// Channel the payload arrived on.
    pub channel: ChannelId,
    /// Raw payload.
    pub payload: Vec<u8>,
}

/// A payload handed to the transport for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Destination.
    pub to: ClientId,
    /// Channel to send on.
    pub channel: ChannelId,
    /// Raw payload.
    pub payload: Vec<u8>,
}

/// The wire seam. Implementations enqueue or poll; neither call blocks.
pub trait Transport {
    /// Enqueue `payload` for `client` on `channel`.
    fn send(
        &mut self,
        client: ClientId,
        channel: ChannelId,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Take every payload that arrived since the last drain.
    fn drain_inbound(&mut self) -> Vec<InboundMessage>;
}

// ---------------------------------------------------------------------------
// LoopbackTransport
// ---------------------------------------------------------------------------

/// In-memory transport. Outbound payloads accumulate until taken; inbound
/// payloads are pushed by the test or by a peer loop.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    outbound: Vec<OutboundMessage>,
    inbound: VecDeque<InboundMessage>,
    disconnected: HashSet<ClientId>,
}

impl LoopbackTransport {
    /// Creates an empty loopback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later send to `client` fail with
    /// [`TransportError::Disconnected`].
    pub fn disconnect(&mut self, client: ClientId) {
        self.disconnected.insert(client);
    }

    /// Queues an inbound payload.
    pub fn push_inbound(&mut self, from: ClientId, channel: ChannelId, payload: Vec<u8>) {
        self.inbound.push_back(InboundMessage {
            from,
            channel,
            payload,
        });
    }

    /// Takes every payload sent so far.
    pub fn take_outbound(&mut self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.outbound)
    }

    /// Payloads sent so far, without taking them.
    pub fn outbound(&self) -> &[OutboundMessage] {
        &self.outbound
    }
}

impl Transport for LoopbackTransport {
    fn send(
        &mut self,
        client: ClientId,
        channel: ChannelId,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if self.disconnected.contains(&client) {
            return Err(TransportError::Disconnected(client));
        }
        self.outbound.push(OutboundMessage {
            to: client,
            channel,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn drain_inbound(&mut self) -> Vec<InboundMessage> {
        self.inbound.drain(..).collect()
    }
}
