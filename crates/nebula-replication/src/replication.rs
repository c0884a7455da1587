//! Server-side replication: decides, per network tick, which component
//! changes go to which client and on which channel.
//!
//! Each tick the [`ReplicationManager`] asks [`ClientVisibility`] which
//! replicated entities each client may see, diffs serialized component
//! state against per-client shadow state, and hands one
//! [`ReplicationBatch`] per channel to the [`Transport`]. Structural
//! changes (inserts and removes) always travel on a reliable channel and
//! count as delivered once sent. Value updates on an unreliable channel
//! stay pending until the client acknowledges the batch tick.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use bevy_ecs::prelude::*;
use serde::{Deserialize, Serialize};

use crate::channel::{ChannelDirection, ChannelId, ChannelTable, InboundMessage, Transport};
use crate::error::{ParseSettingError, ReplicationError, TransportError};
use crate::registry::{ComponentRegistry, ComponentTypeTag, Replicated};
use crate::visibility::ClientVisibility;

/// Unique identifier for a connected client.
pub type ClientId = u64;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How much of the visible state is (re)sent each tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicationStrategy {
    /// Resend every visible component every tick.
    Full,
    /// Send only components whose bytes differ from the acknowledged state.
    #[default]
    Delta,
    /// Like `Delta`, restricted to component tags the client subscribed to.
    OnDemand,
}

impl fmt::Display for ReplicationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Full => "full",
            Self::Delta => "delta",
            Self::OnDemand => "on-demand",
        })
    }
}

impl FromStr for ReplicationStrategy {
    type Err = ParseSettingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "delta" => Ok(Self::Delta),
            "on-demand" | "ondemand" | "on_demand" => Ok(Self::OnDemand),
            _ => Err(ParseSettingError {
                kind: "replication strategy",
                value: s.to_string(),
            }),
        }
    }
}

/// Tunables for [`ReplicationManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Resend policy.
    pub strategy: ReplicationStrategy,
    /// Send value updates on the structural (reliable) channel too.
    pub reliable: bool,
    /// Replicate every N ticks of [`ReplicationManager::update`].
    pub update_interval_ticks: u64,
    /// Server → client reliable channel for inserts and removes.
    pub structural_channel: ChannelId,
    /// Server → client channel for value updates.
    pub update_channel: ChannelId,
    /// Client → server channel carrying [`ClientAck`]s.
    pub ack_channel: ChannelId,
    /// Unacknowledged update batches retained per client.
    pub max_pending_acks: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            strategy: ReplicationStrategy::Delta,
            reliable: false,
            update_interval_ticks: 1,
            structural_channel: ChannelId::STRUCTURAL,
            update_channel: ChannelId::UPDATES,
            ack_channel: ChannelId::ACKS,
            max_pending_acks: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// Kind of change carried by a [`ReplicationItem`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Entity or component appears on the client.
    Insert,
    /// Component value changed.
    Update,
    /// Entity or component disappears from the client.
    Remove,
}

/// One change for one entity. `component: None` addresses the entity
/// itself: `Insert` spawns a bare mirror, `Remove` despawns it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReplicationItem {
    /// Server entity, as [`Entity::to_bits`].
    pub entity: u64,
    /// Component tag, or `None` for the entity itself.
    pub component: Option<ComponentTypeTag>,
    /// Serialized component. Empty for removes and bare spawns.
    pub payload: Vec<u8>,
    /// Change kind.
    pub kind: ChangeKind,
}

impl ReplicationItem {
    fn spawn(entity: Entity) -> Self {
        Self {
            entity: entity.to_bits(),
            component: None,
            payload: Vec::new(),
            kind: ChangeKind::Insert,
        }
    }

    fn despawn(entity: Entity) -> Self {
        Self {
            entity: entity.to_bits(),
            component: None,
            payload: Vec::new(),
            kind: ChangeKind::Remove,
        }
    }

    fn component(entity: Entity, tag: &str, payload: Vec<u8>, kind: ChangeKind) -> Self {
        Self {
            entity: entity.to_bits(),
            component: Some(tag.to_string()),
            payload,
            kind,
        }
    }
}

/// Everything one client receives on one channel for one tick.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ReplicationBatch {
    /// Server tick that produced the batch.
    pub tick: u64,
    /// Ordered changes.
    pub items: Vec<ReplicationItem>,
}

impl ReplicationBatch {
    /// Serializes the batch with postcard.
    pub fn encode(&self) -> Result<Vec<u8>, ReplicationError> {
        postcard::to_allocvec(self).map_err(|e| ReplicationError::Encode(e.to_string()))
    }

    /// Deserializes a batch.
    pub fn decode(bytes: &[u8]) -> Result<Self, ReplicationError> {
        postcard::from_bytes(bytes).map_err(|e| ReplicationError::Decode(e.to_string()))
    }
}

/// Client → server acknowledgement of the newest batch applied on one
/// channel. Only an ack on the update channel confirms update writes, and
/// only those of exactly `tick`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAck {
    /// Channel the acknowledged batch arrived on.
    pub channel: ChannelId,
    /// Tick of that batch.
    pub tick: u64,
}

impl ClientAck {
    /// Acknowledges the batch of `tick` received on `channel`.
    pub fn new(channel: ChannelId, tick: u64) -> Self {
        Self { channel, tick }
    }

    /// Serializes the ack with postcard.
    pub fn encode(&self) -> Result<Vec<u8>, ReplicationError> {
        postcard::to_allocvec(self).map_err(|e| ReplicationError::Encode(e.to_string()))
    }

    /// Deserializes an ack.
    pub fn decode(bytes: &[u8]) -> Result<Self, ReplicationError> {
        postcard::from_bytes(bytes).map_err(|e| ReplicationError::Decode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Per-client shadow state
// ---------------------------------------------------------------------------

/// What one client is known to mirror for one entity.
#[derive(Debug, Clone, Default)]
pub(crate) struct EntityShadow {
    /// Component tags the client was told about since the entity's insert.
    pub(crate) tags: HashSet<ComponentTypeTag>,
    /// Last bytes the client is known to hold, per tag.
    pub(crate) acked: HashMap<ComponentTypeTag, Vec<u8>>,
}

/// Update writes waiting for the client to ack `tick`.
#[derive(Debug, Clone)]
struct PendingAck {
    tick: u64,
    writes: Vec<(Entity, ComponentTypeTag, Vec<u8>)>,
}

/// Counters for one client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientReplicationStats {
    /// Batches handed to the transport.
    pub batches_sent: u64,
    /// Items across those batches.
    pub items_sent: u64,
    /// Acks accepted.
    pub acks_received: u64,
    /// Highest tick acknowledged.
    pub last_acked_tick: u64,
}

/// Shadow state for one client.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClientShadow {
    pub(crate) entities: HashMap<Entity, EntityShadow>,
    pending: VecDeque<PendingAck>,
    /// Newest acked tick per channel.
    acked_ticks: HashMap<ChannelId, u64>,
    subscriptions: HashSet<ComponentTypeTag>,
    stats: ClientReplicationStats,
}

/// A shadow change staged while building a structural batch.
#[derive(Debug)]
enum ShadowEdit {
    /// Client dropped its mirror.
    Forget(Entity),
    /// Client received a full insert.
    Insert(Entity, EntityShadow),
    /// Component inserted on an existing mirror.
    AddTag(Entity, ComponentTypeTag, Vec<u8>),
    /// Component removed from an existing mirror.
    DropTag(Entity, ComponentTypeTag),
    /// Value update delivered on a reliable channel.
    Ack(Entity, ComponentTypeTag, Vec<u8>),
}

impl ClientShadow {
    fn promote(&mut self, entity: Entity, tag: &str, bytes: Vec<u8>) {
        if let Some(shadow) = self.entities.get_mut(&entity)
            && shadow.tags.contains(tag)
        {
            shadow.acked.insert(tag.to_string(), bytes);
        }
    }

    fn commit(&mut self, edits: Vec<ShadowEdit>) {
        for edit in edits {
            match edit {
                ShadowEdit::Forget(entity) => {
                    self.entities.remove(&entity);
                }
                ShadowEdit::Insert(entity, shadow) => {
                    self.entities.insert(entity, shadow);
                }
                ShadowEdit::AddTag(entity, tag, bytes) => {
                    if let Some(shadow) = self.entities.get_mut(&entity) {
                        shadow.tags.insert(tag.clone());
                        shadow.acked.insert(tag, bytes);
                    }
                }
                ShadowEdit::DropTag(entity, tag) => {
                    if let Some(shadow) = self.entities.get_mut(&entity) {
                        shadow.tags.remove(&tag);
                        shadow.acked.remove(&tag);
                    }
                }
                ShadowEdit::Ack(entity, tag, bytes) => self.promote(entity, &tag, bytes),
            }
        }
    }

    fn queue_pending(
        &mut self,
        tick: u64,
        writes: Vec<(Entity, ComponentTypeTag, Vec<u8>)>,
        max_pending: usize,
    ) {
        if writes.is_empty() {
            return;
        }
        self.pending.push_back(PendingAck { tick, writes });
        while self.pending.len() > max_pending {
            self.pending.pop_front();
        }
    }
}

/// Summary of one replication pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Tick replicated.
    pub tick: u64,
    /// Batches handed to the transport.
    pub batches_sent: usize,
    /// Items across those batches.
    pub items_sent: usize,
    /// Pairs that entered visibility this pass.
    pub became_visible: usize,
    /// Pairs that left visibility this pass.
    pub became_hidden: usize,
    /// Clients dropped because the transport reported them gone.
    pub dropped_clients: Vec<ClientId>,
}

// ---------------------------------------------------------------------------
// ReplicationManager
// ---------------------------------------------------------------------------

/// Server-side replication driver. Owns per-client shadow state; borrows
/// the world, registry, visibility engine and transport for each tick.
#[derive(Debug)]
pub struct ReplicationManager {
    config: ReplicationConfig,
    tick: u64,
    clients: HashMap<ClientId, ClientShadow>,
    /// Set when a client was removed; triggers visibility cleanup.
    clients_dirty: bool,
}

impl ReplicationManager {
    /// Creates a manager after checking `config` against `channels`.
    pub fn new(
        config: ReplicationConfig,
        channels: &ChannelTable,
    ) -> Result<Self, ReplicationError> {
        if config.update_interval_ticks == 0 {
            return Err(ReplicationError::InvalidConfig(
                "update_interval_ticks must be at least 1",
            ));
        }
        let structural =
            channels.require(config.structural_channel, ChannelDirection::ServerToClient)?;
        if !structural.mode.is_reliable() {
            return Err(ReplicationError::InvalidConfig(
                "structural channel must be reliable",
            ));
        }
        channels.require(config.update_channel, ChannelDirection::ServerToClient)?;
        channels.require(config.ack_channel, ChannelDirection::ClientToServer)?;

        Ok(Self {
            config,
            tick: 0,
            clients: HashMap::new(),
            clients_dirty: false,
        })
    }

    /// Current configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Switches strategy at runtime. Shadow state is kept.
    pub fn set_strategy(&mut self, strategy: ReplicationStrategy) {
        self.config.strategy = strategy;
    }

    /// Current tick.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    // -- clients -------------------------------------------------------------

    /// Starts replicating to `client`. Idempotent.
    pub fn add_client(&mut self, client: ClientId) {
        if !self.clients.contains_key(&client) {
            tracing::info!("replication: client {client} added");
            self.clients.insert(client, ClientShadow::default());
        }
    }

    /// Stops replicating to `client` and forgets its shadow state.
    pub fn remove_client(&mut self, client: ClientId) -> bool {
        let removed = self.clients.remove(&client).is_some();
        if removed {
            tracing::info!("replication: client {client} removed");
            self.clients_dirty = true;
        }
        removed
    }

    /// Connected clients in ascending id order.
    pub fn clients(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.clients.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Whether `client` is connected.
    pub fn has_client(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    /// Counters for `client`.
    pub fn client_stats(&self, client: ClientId) -> Option<ClientReplicationStats> {
        self.clients.get(&client).map(|shadow| shadow.stats)
    }

    /// Whether `client` currently mirrors `entity`.
    pub fn client_knows(&self, client: ClientId, entity: Entity) -> bool {
        self.clients
            .get(&client)
            .is_some_and(|shadow| shadow.entities.contains_key(&entity))
    }

    /// Subscribes `client` to a component tag (OnDemand strategy).
    pub fn subscribe(&mut self, client: ClientId, tag: &str) -> Result<(), ReplicationError> {
        let shadow = self
            .clients
            .get_mut(&client)
            .ok_or(ReplicationError::UnknownClient(client))?;
        shadow.subscriptions.insert(tag.to_string());
        Ok(())
    }

    /// Removes a subscription.
    pub fn unsubscribe(&mut self, client: ClientId, tag: &str) -> Result<(), ReplicationError> {
        let shadow = self
            .clients
            .get_mut(&client)
            .ok_or(ReplicationError::UnknownClient(client))?;
        shadow.subscriptions.remove(tag);
        Ok(())
    }

    /// Forgets everything `client` is known to hold. The next pass sends a
    /// full insert for every visible entity.
    pub fn request_full_resync(&mut self, client: ClientId) -> Result<(), ReplicationError> {
        let shadow = self
            .clients
            .get_mut(&client)
            .ok_or(ReplicationError::UnknownClient(client))?;
        shadow.entities.clear();
        shadow.pending.clear();
        Ok(())
    }

    // -- acknowledgements ----------------------------------------------------

    /// Applies a [`ClientAck`]. An ack on the update channel promotes the
    /// writes sent in exactly that tick and discards older pending batches,
    /// whose still-differing values went out again in the acked one. Acks
    /// from unknown clients or at or below the channel's last acked tick are
    /// ignored.
    pub fn handle_ack(&mut self, client: ClientId, ack: ClientAck) -> bool {
        let Some(shadow) = self.clients.get_mut(&client) else {
            return false;
        };
        let last = shadow.acked_ticks.entry(ack.channel).or_insert(0);
        if ack.tick <= *last {
            return false;
        }
        *last = ack.tick;

        if ack.channel == self.config.update_channel {
            while shadow.pending.front().is_some_and(|p| p.tick <= ack.tick) {
                let Some(pending) = shadow.pending.pop_front() else {
                    break;
                };
                if pending.tick == ack.tick {
                    for (entity, tag, bytes) in pending.writes {
                        shadow.promote(entity, &tag, bytes);
                    }
                }
            }
        }
        shadow.stats.acks_received += 1;
        shadow.stats.last_acked_tick = shadow.stats.last_acked_tick.max(ack.tick);
        true
    }

    /// Drains the transport, applies acks arriving on the ack channel, and
    /// returns every other message untouched.
    pub fn process_inbound(&mut self, transport: &mut dyn Transport) -> Vec<InboundMessage> {
        let mut unhandled = Vec::new();
        for msg in transport.drain_inbound() {
            if msg.channel != self.config.ack_channel {
                unhandled.push(msg);
                continue;
            }
            match ClientAck::decode(&msg.payload) {
                Ok(ack) => {
                    self.handle_ack(msg.from, ack);
                }
                Err(e) => tracing::warn!("dropping malformed ack from {}: {e}", msg.from),
            }
        }
        unhandled
    }

    // -- tick ----------------------------------------------------------------

    /// Advances the tick counter and replicates if the tick falls on the
    /// configured cadence.
    pub fn update(
        &mut self,
        world: &World,
        registry: &ComponentRegistry,
        visibility: &mut ClientVisibility,
        transport: &mut dyn Transport,
    ) -> Result<Option<TickReport>, ReplicationError> {
        self.tick += 1;
        if self.tick % self.config.update_interval_ticks != 0 {
            return Ok(None);
        }
        self.replicate_now(world, registry, visibility, transport)
            .map(Some)
    }

    /// Runs one replication pass at the current tick.
    pub fn replicate_now(
        &mut self,
        world: &World,
        registry: &ComponentRegistry,
        visibility: &mut ClientVisibility,
        transport: &mut dyn Transport,
    ) -> Result<TickReport, ReplicationError> {
        let tick = self.tick;
        let mut report = TickReport {
            tick,
            ..Default::default()
        };

        let mut entities: Vec<Entity> = world
            .iter_entities()
            .filter(|e| e.contains::<Replicated>())
            .map(|e| e.id())
            .collect();
        entities.sort_unstable();
        let clients = self.clients();

        // Keep visibility bookkeeping bounded.
        if self.clients_dirty {
            let connected: HashSet<ClientId> = clients.iter().copied().collect();
            visibility.cleanup_disconnected_clients(&connected);
            self.clients_dirty = false;
        }
        if visibility
            .tracked_entities()
            .any(|e| world.get_entity(e).is_err())
        {
            let existing: HashSet<Entity> = world.iter_entities().map(|e| e.id()).collect();
            visibility.cleanup_removed_entities(&existing);
        }

        visibility.advance_tick(tick);
        let changes = visibility.compute_changes(&entities, &clients);
        visibility.apply_changes(&changes);
        report.became_visible = changes.became_visible.len();
        report.became_hidden = changes.became_hidden.len();
        let entered: HashSet<(Entity, ClientId)> = changes
            .became_visible
            .iter()
            .map(|r| (r.entity, r.client))
            .collect();

        let serialized: HashMap<Entity, Vec<(ComponentTypeTag, Vec<u8>)>> = entities
            .iter()
            .map(|&e| (e, registry.serialize_entity(world, e)))
            .collect();

        let structural_channel = self.config.structural_channel;
        let update_channel = if self.config.reliable {
            structural_channel
        } else {
            self.config.update_channel
        };
        let strategy = self.config.strategy;
        let max_pending = self.config.max_pending_acks;

        for &client in &clients {
            let Some(shadow) = self.clients.get_mut(&client) else {
                continue;
            };
            let pairs: Vec<(Entity, ClientId)> = entities.iter().map(|&e| (e, client)).collect();
            let visible = visibility.batch_is_visible(&pairs);
            let visible_set: HashSet<Entity> = entities
                .iter()
                .zip(&visible)
                .filter_map(|(&e, &v)| v.then_some(e))
                .collect();

            let mut structural = Vec::new();
            let mut updates = Vec::new();
            let mut pending_writes = Vec::new();
            // Shadow changes carried by the structural batch; committed only
            // once the transport accepts it.
            let mut staged = Vec::new();

            // Entities the client mirrors that are gone or hidden.
            let mut gone: Vec<Entity> = shadow
                .entities
                .keys()
                .filter(|e| !visible_set.contains(*e))
                .copied()
                .collect();
            gone.sort_unstable();
            for entity in gone {
                staged.push(ShadowEdit::Forget(entity));
                structural.push(ReplicationItem::despawn(entity));
            }

            for &entity in &entities {
                if !visible_set.contains(&entity) {
                    continue;
                }
                let components = &serialized[&entity];

                let entity_shadow = match shadow.entities.get(&entity) {
                    Some(entity_shadow) if !entered.contains(&(entity, client)) => entity_shadow,
                    _ => {
                        // Full insert, regardless of strategy.
                        let mut entity_shadow = EntityShadow::default();
                        if components.is_empty() {
                            structural.push(ReplicationItem::spawn(entity));
                        }
                        for (tag, bytes) in components {
                            structural.push(ReplicationItem::component(
                                entity,
                                tag,
                                bytes.clone(),
                                ChangeKind::Insert,
                            ));
                            entity_shadow.tags.insert(tag.clone());
                            entity_shadow.acked.insert(tag.clone(), bytes.clone());
                        }
                        staged.push(ShadowEdit::Insert(entity, entity_shadow));
                        continue;
                    }
                };

                let mut removed: Vec<&ComponentTypeTag> = entity_shadow
                    .tags
                    .iter()
                    .filter(|tag| !components.iter().any(|(t, _)| t == *tag))
                    .collect();
                removed.sort_unstable();
                for tag in removed {
                    staged.push(ShadowEdit::DropTag(entity, tag.clone()));
                    structural.push(ReplicationItem::component(
                        entity,
                        tag,
                        Vec::new(),
                        ChangeKind::Remove,
                    ));
                }

                for (tag, bytes) in components {
                    if !entity_shadow.tags.contains(tag) {
                        staged.push(ShadowEdit::AddTag(entity, tag.clone(), bytes.clone()));
                        structural.push(ReplicationItem::component(
                            entity,
                            tag,
                            bytes.clone(),
                            ChangeKind::Insert,
                        ));
                        continue;
                    }

                    let changed = entity_shadow.acked.get(tag) != Some(bytes);
                    let send = match strategy {
                        ReplicationStrategy::Full => true,
                        ReplicationStrategy::Delta => changed,
                        ReplicationStrategy::OnDemand => {
                            changed && shadow.subscriptions.contains(tag)
                        }
                    };
                    if !send {
                        continue;
                    }
                    updates.push(ReplicationItem::component(
                        entity,
                        tag,
                        bytes.clone(),
                        ChangeKind::Update,
                    ));
                    if self.config.reliable {
                        staged.push(ShadowEdit::Ack(entity, tag.clone(), bytes.clone()));
                    } else {
                        pending_writes.push((entity, tag.clone(), bytes.clone()));
                    }
                }
            }

            if self.config.reliable {
                structural.append(&mut updates);
            }

            let mut disconnected = false;
            let outgoing = [
                (structural_channel, structural, true),
                (update_channel, updates, false),
            ];
            for (channel, items, is_structural) in outgoing {
                if items.is_empty() {
                    continue;
                }
                let item_count = items.len();
                let payload = ReplicationBatch { tick, items }.encode()?;
                match transport.send(client, channel, &payload) {
                    Ok(()) => {
                        shadow.stats.batches_sent += 1;
                        shadow.stats.items_sent += item_count as u64;
                        report.batches_sent += 1;
                        report.items_sent += item_count;
                        if is_structural {
                            shadow.commit(std::mem::take(&mut staged));
                        } else {
                            shadow.queue_pending(
                                tick,
                                std::mem::take(&mut pending_writes),
                                max_pending,
                            );
                        }
                    }
                    Err(TransportError::Disconnected(_)) => {
                        disconnected = true;
                        break;
                    }
                    // Nothing is committed, so the next pass retries.
                    Err(e) => tracing::warn!("replication: send to client {client} failed: {e}"),
                }
            }

            if disconnected {
                tracing::warn!("replication: client {client} disconnected mid-batch, dropping");
                report.dropped_clients.push(client);
            }
        }

        for &client in &report.dropped_clients {
            self.remove_client(client);
        }

        tracing::debug!(
            "replication tick {tick}: {} batches, {} items, +{} -{} visible",
            report.batches_sent,
            report.items_sent,
            report.became_visible,
            report.became_hidden
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[path = "replication_tests.rs"]
mod tests;
