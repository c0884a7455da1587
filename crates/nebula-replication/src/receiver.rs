//! Client-side application of [`ReplicationBatch`]es to the local world.

use std::collections::{BTreeMap, HashMap};

use bevy_ecs::prelude::*;

use crate::channel::{ChannelId, ChannelTable, InboundMessage};
use crate::error::ReplicationError;
use crate::registry::ComponentRegistry;
use crate::replication::{ChangeKind, ClientAck, ReplicationBatch};

/// Links a local mirror entity to the server entity it reflects.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerEntity(pub u64);

/// Outcome of applying one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedBatch {
    /// Batch tick.
    pub tick: u64,
    /// Items applied.
    pub applied: usize,
    /// Items skipped (unknown entity, unknown tag, undecodable payload).
    pub skipped: usize,
    /// Local entities touched by the batch, in item order, deduplicated.
    pub touched: Vec<Entity>,
}

/// Applies server batches to a client [`World`] and tracks what to ack.
#[derive(Debug)]
pub struct ReplicationReceiver {
    channels: ChannelTable,
    server_to_local: HashMap<u64, Entity>,
    /// Newest batch tick applied per channel.
    applied_ticks: BTreeMap<ChannelId, u64>,
    /// Newest tick already acknowledged per channel.
    acked_ticks: BTreeMap<ChannelId, u64>,
}

impl ReplicationReceiver {
    /// Creates a receiver that interprets channels through `channels`.
    pub fn new(channels: ChannelTable) -> Self {
        Self {
            channels,
            server_to_local: HashMap::new(),
            applied_ticks: BTreeMap::new(),
            acked_ticks: BTreeMap::new(),
        }
    }

    /// Local entity mirroring `server_entity`, if any.
    pub fn local_entity(&self, server_entity: u64) -> Option<Entity> {
        self.server_to_local.get(&server_entity).copied()
    }

    /// Number of mirrored entities.
    pub fn mirrored(&self) -> usize {
        self.server_to_local.len()
    }

    /// Decodes and applies one inbound message. Returns `Ok(None)` for a
    /// stale packet on a sequenced or unordered channel.
    pub fn receive(
        &mut self,
        world: &mut World,
        registry: &ComponentRegistry,
        message: &InboundMessage,
    ) -> Result<Option<AppliedBatch>, ReplicationError> {
        let channel = self.channels.get(message.channel)?;
        let batch = ReplicationBatch::decode(&message.payload)?;

        let newest = self.applied_ticks.entry(message.channel).or_insert(0);
        if !channel.mode.is_reliable() && batch.tick <= *newest {
            tracing::debug!("dropping stale batch {} on {:?}", batch.tick, message.channel);
            return Ok(None);
        }
        *newest = (*newest).max(batch.tick);

        Ok(Some(self.apply(world, registry, &batch)))
    }

    /// Applies a decoded batch without any staleness check.
    pub fn apply(
        &mut self,
        world: &mut World,
        registry: &ComponentRegistry,
        batch: &ReplicationBatch,
    ) -> AppliedBatch {
        let mut result = AppliedBatch {
            tick: batch.tick,
            ..Default::default()
        };

        for item in &batch.items {
            let local = match (item.kind, self.server_to_local.get(&item.entity).copied()) {
                (_, Some(local)) if world.get_entity(local).is_ok() => Some(local),
                (ChangeKind::Insert, _) => {
                    let local = world.spawn(ServerEntity(item.entity)).id();
                    self.server_to_local.insert(item.entity, local);
                    Some(local)
                }
                _ => None,
            };
            let Some(local) = local else {
                result.skipped += 1;
                continue;
            };

            let outcome = match (&item.component, item.kind) {
                (None, ChangeKind::Remove) => {
                    self.server_to_local.remove(&item.entity);
                    world.despawn(local);
                    Ok(())
                }
                (None, _) => Ok(()),
                (Some(tag), ChangeKind::Remove) => registry.require(tag).map(|desc| {
                    (desc.remover)(world, local);
                }),
                (Some(tag), ChangeKind::Insert | ChangeKind::Update) => registry
                    .require(tag)
                    .and_then(|desc| (desc.deserializer)(world, local, &item.payload)),
            };

            match outcome {
                Ok(()) => {
                    result.applied += 1;
                    if !result.touched.contains(&local) {
                        result.touched.push(local);
                    }
                }
                Err(e) => {
                    tracing::warn!("skipping replication item for {}: {e}", item.entity);
                    result.skipped += 1;
                }
            }
        }
        result
    }

    /// One ack per channel whose newest applied tick has not been acked
    /// yet, in channel order.
    pub fn take_acks(&mut self) -> Vec<ClientAck> {
        let mut acks = Vec::new();
        for (&channel, &tick) in &self.applied_ticks {
            let acked = self.acked_ticks.entry(channel).or_insert(0);
            if tick > *acked {
                *acked = tick;
                acks.push(ClientAck::new(channel, tick));
            }
        }
        acks
    }
}
