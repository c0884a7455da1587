//! Unit tests for server-side replication.

use super::*;
use crate::channel::{ChannelConfig, ChannelMode, LoopbackTransport};
use crate::visibility::{VisibilityConfig, VisibilityPolicy};

// Test component types.
#[derive(Component, Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Position {
    x: i64,
    y: i64,
}

#[derive(Component, Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Health(u32);

/// Helper: registry with Position and Health.
fn test_registry() -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();
    registry.register::<Position>("Position");
    registry.register::<Health>("Health");
    registry
}

/// Everything the server side of a test needs.
struct Harness {
    world: World,
    registry: ComponentRegistry,
    visibility: ClientVisibility,
    transport: LoopbackTransport,
    manager: ReplicationManager,
}

impl Harness {
    fn new(config: ReplicationConfig) -> Self {
        Self::with_visibility(config, VisibilityConfig::default())
    }

    fn with_visibility(config: ReplicationConfig, visibility: VisibilityConfig) -> Self {
        let mut manager = ReplicationManager::new(config, &ChannelTable::default()).unwrap();
        manager.add_client(1);
        Self {
            world: World::new(),
            registry: test_registry(),
            visibility: ClientVisibility::new(visibility),
            transport: LoopbackTransport::new(),
            manager,
        }
    }

    fn spawn(&mut self) -> Entity {
        self.world
            .spawn((Replicated, Position { x: 1, y: 2 }, Health(100)))
            .id()
    }

    /// Runs one update and returns the decoded batches sent to client 1.
    fn tick(&mut self) -> Vec<(ChannelId, ReplicationBatch)> {
        self.manager
            .update(
                &self.world,
                &self.registry,
                &mut self.visibility,
                &mut self.transport,
            )
            .unwrap();
        self.transport
            .take_outbound()
            .into_iter()
            .filter(|m| m.to == 1)
            .map(|m| (m.channel, ReplicationBatch::decode(&m.payload).unwrap()))
            .collect()
    }
}

fn items_on(batches: &[(ChannelId, ReplicationBatch)], channel: ChannelId) -> Vec<ReplicationItem> {
    batches
        .iter()
        .filter(|(c, _)| *c == channel)
        .flat_map(|(_, b)| b.items.clone())
        .collect()
}

fn tags(items: &[ReplicationItem]) -> Vec<&str> {
    items
        .iter()
        .filter_map(|i| i.component.as_deref())
        .collect()
}

#[test]
fn test_visible_entity_gets_full_insert() {
    let mut h = Harness::new(ReplicationConfig::default());
    let entity = h.spawn();

    let batches = h.tick();
    assert_eq!(batches.len(), 1);
    let (channel, batch) = &batches[0];
    assert_eq!(*channel, ChannelId::STRUCTURAL);
    assert_eq!(batch.tick, 1);
    assert_eq!(batch.items.len(), 2);
    assert!(batch.items.iter().all(|i| i.kind == ChangeKind::Insert));
    assert!(batch.items.iter().all(|i| i.entity == entity.to_bits()));
    assert_eq!(tags(&batch.items), vec!["Position", "Health"]);
    assert!(h.manager.client_knows(1, entity));
}

#[test]
fn test_entity_without_components_gets_bare_spawn() {
    let mut h = Harness::new(ReplicationConfig::default());
    let entity = h.world.spawn(Replicated).id();

    let items = items_on(&h.tick(), ChannelId::STRUCTURAL);
    assert_eq!(items, vec![ReplicationItem::spawn(entity)]);
}

#[test]
fn test_unreplicated_entity_is_ignored() {
    let mut h = Harness::new(ReplicationConfig::default());
    h.world.spawn(Position { x: 0, y: 0 });
    assert!(h.tick().is_empty());
}

#[test]
fn test_delta_sends_only_changed_components() {
    let mut h = Harness::new(ReplicationConfig::default());
    let entity = h.spawn();
    h.tick();

    h.world.get_mut::<Position>(entity).unwrap().x = 50;
    let batches = h.tick();
    assert!(items_on(&batches, ChannelId::STRUCTURAL).is_empty());
    let updates = items_on(&batches, ChannelId::UPDATES);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].kind, ChangeKind::Update);
    assert_eq!(tags(&updates), vec!["Position"]);
}

#[test]
fn test_unchanged_world_sends_nothing() {
    let mut h = Harness::new(ReplicationConfig::default());
    h.spawn();
    h.tick();
    assert!(h.tick().is_empty());
}

#[test]
fn test_unacked_update_is_resent_until_acked() {
    let mut h = Harness::new(ReplicationConfig::default());
    let entity = h.spawn();
    h.tick();

    h.world.get_mut::<Position>(entity).unwrap().x = 50;
    assert_eq!(items_on(&h.tick(), ChannelId::UPDATES).len(), 1);
    // Not acked yet: the same value goes out again.
    assert_eq!(items_on(&h.tick(), ChannelId::UPDATES).len(), 1);

    assert!(h.manager.handle_ack(1, ClientAck::new(ChannelId::UPDATES, 2)));
    assert!(h.tick().is_empty());
    assert_eq!(h.manager.client_stats(1).unwrap().last_acked_tick, 2);
}

#[test]
fn test_structural_ack_does_not_confirm_updates() {
    let mut h = Harness::new(ReplicationConfig::default());
    let entity = h.spawn();
    h.tick();

    h.world.get_mut::<Position>(entity).unwrap().x = 50;
    h.spawn();
    let batches = h.tick();
    assert_eq!(items_on(&batches, ChannelId::UPDATES).len(), 1);
    assert_eq!(items_on(&batches, ChannelId::STRUCTURAL).len(), 2);

    assert!(h.manager.handle_ack(1, ClientAck::new(ChannelId::STRUCTURAL, 2)));
    assert_eq!(items_on(&h.tick(), ChannelId::UPDATES).len(), 1);

    assert!(h.manager.handle_ack(1, ClientAck::new(ChannelId::UPDATES, 3)));
    assert!(h.tick().is_empty());
}

#[test]
fn test_stale_ack_is_ignored() {
    let mut h = Harness::new(ReplicationConfig::default());
    h.spawn();
    h.tick();
    h.tick();
    assert!(h.manager.handle_ack(1, ClientAck::new(ChannelId::UPDATES, 2)));
    assert!(!h.manager.handle_ack(1, ClientAck::new(ChannelId::UPDATES, 2)));
    assert!(!h.manager.handle_ack(1, ClientAck::new(ChannelId::UPDATES, 1)));
    assert!(!h.manager.handle_ack(99, ClientAck::new(ChannelId::UPDATES, 5)));
    assert_eq!(h.manager.client_stats(1).unwrap().acks_received, 1);
}

#[test]
fn test_full_strategy_resends_everything() {
    let mut h = Harness::new(ReplicationConfig {
        strategy: ReplicationStrategy::Full,
        ..Default::default()
    });
    h.spawn();
    h.tick();

    let updates = items_on(&h.tick(), ChannelId::UPDATES);
    assert_eq!(tags(&updates), vec!["Position", "Health"]);
}

#[test]
fn test_on_demand_only_sends_subscribed_tags() {
    let mut h = Harness::new(ReplicationConfig {
        strategy: ReplicationStrategy::OnDemand,
        ..Default::default()
    });
    let entity = h.spawn();
    // The initial insert is complete regardless of subscriptions.
    assert_eq!(items_on(&h.tick(), ChannelId::STRUCTURAL).len(), 2);

    h.manager.subscribe(1, "Health").unwrap();
    h.world.get_mut::<Position>(entity).unwrap().x = 9;
    h.world.get_mut::<Health>(entity).unwrap().0 = 1;
    let updates = items_on(&h.tick(), ChannelId::UPDATES);
    assert_eq!(tags(&updates), vec!["Health"]);

    h.manager.unsubscribe(1, "Health").unwrap();
    h.manager.handle_ack(1, ClientAck::new(ChannelId::UPDATES, 2));
    h.world.get_mut::<Health>(entity).unwrap().0 = 2;
    assert!(h.tick().is_empty());
}

#[test]
fn test_subscription_for_unknown_client_fails() {
    let mut h = Harness::new(ReplicationConfig::default());
    assert_eq!(
        h.manager.subscribe(7, "Health"),
        Err(ReplicationError::UnknownClient(7))
    );
    assert_eq!(
        h.manager.request_full_resync(7),
        Err(ReplicationError::UnknownClient(7))
    );
}

#[test]
fn test_hidden_entity_is_removed_and_reinserted() {
    let mut h = Harness::with_visibility(
        ReplicationConfig::default(),
        VisibilityConfig {
            policy: VisibilityPolicy::Blacklist,
            ..Default::default()
        },
    );
    let entity = h.spawn();
    h.tick();

    h.visibility.set_entity_visibility(entity, 1, false);
    let items = items_on(&h.tick(), ChannelId::STRUCTURAL);
    assert_eq!(items, vec![ReplicationItem::despawn(entity)]);
    assert!(!h.manager.client_knows(1, entity));

    // Hidden entities get nothing, even when they change.
    h.world.get_mut::<Health>(entity).unwrap().0 = 3;
    assert!(h.tick().is_empty());

    h.visibility.set_entity_visibility(entity, 1, true);
    let items = items_on(&h.tick(), ChannelId::STRUCTURAL);
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|i| i.kind == ChangeKind::Insert));
}

#[test]
fn test_despawned_entity_is_removed() {
    let mut h = Harness::new(ReplicationConfig::default());
    let entity = h.spawn();
    h.tick();

    h.world.despawn(entity);
    let items = items_on(&h.tick(), ChannelId::STRUCTURAL);
    assert_eq!(items, vec![ReplicationItem::despawn(entity)]);
    assert!(!h.manager.client_knows(1, entity));
}

#[test]
fn test_component_removal_and_addition_are_structural() {
    let mut h = Harness::new(ReplicationConfig::default());
    let entity = h.world.spawn((Replicated, Position { x: 0, y: 0 })).id();
    h.tick();

    h.world.entity_mut(entity).insert(Health(5));
    let items = items_on(&h.tick(), ChannelId::STRUCTURAL);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].kind, ChangeKind::Insert);
    assert_eq!(tags(&items), vec!["Health"]);

    h.world.entity_mut(entity).remove::<Health>();
    let items = items_on(&h.tick(), ChannelId::STRUCTURAL);
    assert_eq!(
        items,
        vec![ReplicationItem::component(
            entity,
            "Health",
            Vec::new(),
            ChangeKind::Remove
        )]
    );
}

#[test]
fn test_disconnected_client_is_dropped() {
    let mut h = Harness::new(ReplicationConfig::default());
    h.manager.add_client(2);
    h.spawn();
    h.transport.disconnect(2);

    let report = h
        .manager
        .update(&h.world, &h.registry, &mut h.visibility, &mut h.transport)
        .unwrap()
        .unwrap();
    assert_eq!(report.dropped_clients, vec![2]);
    assert!(!h.manager.has_client(2));
    assert_eq!(h.manager.clients(), vec![1]);
    assert_eq!(report.batches_sent, 1);
}

/// Loopback that rejects the next `reject` sends.
#[derive(Default)]
struct FlakyTransport {
    inner: LoopbackTransport,
    reject: usize,
}

impl Transport for FlakyTransport {
    fn send(
        &mut self,
        client: ClientId,
        channel: ChannelId,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if self.reject > 0 {
            self.reject -= 1;
            return Err(TransportError::ChannelRejected(channel));
        }
        self.inner.send(client, channel, payload)
    }

    fn drain_inbound(&mut self) -> Vec<InboundMessage> {
        self.inner.drain_inbound()
    }
}

#[test]
fn test_rejected_send_is_retried_next_pass() {
    let mut h = Harness::new(ReplicationConfig::default());
    let mut transport = FlakyTransport {
        reject: 1,
        ..Default::default()
    };
    let entity = h.spawn();

    let report = h
        .manager
        .update(&h.world, &h.registry, &mut h.visibility, &mut transport)
        .unwrap()
        .unwrap();
    assert_eq!(report.batches_sent, 0);
    assert!(report.dropped_clients.is_empty());
    assert!(!h.manager.client_knows(1, entity));

    h.manager
        .update(&h.world, &h.registry, &mut h.visibility, &mut transport)
        .unwrap();
    assert!(h.manager.client_knows(1, entity));
    let sent = transport.inner.take_outbound();
    assert_eq!(sent.len(), 1);
    let batch = ReplicationBatch::decode(&sent[0].payload).unwrap();
    assert_eq!(tags(&batch.items), vec!["Position", "Health"]);

    // A rejected despawn is not forgotten either.
    h.world.despawn(entity);
    transport.reject = 1;
    h.manager
        .update(&h.world, &h.registry, &mut h.visibility, &mut transport)
        .unwrap();
    assert!(h.manager.client_knows(1, entity));
    h.manager
        .update(&h.world, &h.registry, &mut h.visibility, &mut transport)
        .unwrap();
    assert!(!h.manager.client_knows(1, entity));
    let sent = transport.inner.take_outbound();
    let batch = ReplicationBatch::decode(&sent[0].payload).unwrap();
    assert_eq!(batch.items, vec![ReplicationItem::despawn(entity)]);
}

#[test]
fn test_rejected_update_stays_unconfirmed() {
    let mut h = Harness::new(ReplicationConfig::default());
    let mut transport = FlakyTransport::default();
    let entity = h.spawn();
    h.manager
        .update(&h.world, &h.registry, &mut h.visibility, &mut transport)
        .unwrap();

    h.world.get_mut::<Position>(entity).unwrap().x = 7;
    transport.reject = 1;
    h.manager
        .update(&h.world, &h.registry, &mut h.visibility, &mut transport)
        .unwrap();
    // Tick 2 never left, so an ack naming it confirms nothing.
    assert!(h.manager.handle_ack(1, ClientAck::new(ChannelId::UPDATES, 2)));
    transport.inner.take_outbound();

    h.manager
        .update(&h.world, &h.registry, &mut h.visibility, &mut transport)
        .unwrap();
    let sent = transport.inner.take_outbound();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].channel, ChannelId::UPDATES);
}

#[test]
fn test_visibility_of_despawned_unreplicated_entity_is_cleaned_up() {
    let mut h = Harness::new(ReplicationConfig::default());
    h.spawn();
    let marker = h.world.spawn(Health(1)).id();
    h.visibility.set_entity_visibility(marker, 1, true);
    h.tick();
    assert!(h.visibility.tracked_entities().any(|e| e == marker));

    h.world.despawn(marker);
    h.tick();
    assert!(!h.visibility.tracked_entities().any(|e| e == marker));
}

#[test]
fn test_removed_client_visibility_is_cleaned_up() {
    let mut h = Harness::new(ReplicationConfig::default());
    h.manager.add_client(2);
    let entity = h.spawn();
    h.tick();
    assert!(h.visibility.was_visible(entity, 2));

    h.manager.remove_client(2);
    h.tick();
    assert!(!h.visibility.was_visible(entity, 2));
    assert!(h.visibility.was_visible(entity, 1));
}

#[test]
fn test_reliable_flag_sends_updates_on_structural_channel() {
    let mut h = Harness::new(ReplicationConfig {
        reliable: true,
        ..Default::default()
    });
    let entity = h.spawn();
    h.tick();

    h.world.get_mut::<Position>(entity).unwrap().y = 8;
    let batches = h.tick();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].0, ChannelId::STRUCTURAL);
    assert_eq!(batches[0].1.items[0].kind, ChangeKind::Update);
    // Counted as delivered without an ack.
    assert!(h.tick().is_empty());
}

#[test]
fn test_update_interval_skips_ticks() {
    let mut h = Harness::new(ReplicationConfig {
        update_interval_ticks: 3,
        ..Default::default()
    });
    h.spawn();
    for _ in 0..2 {
        let report = h
            .manager
            .update(&h.world, &h.registry, &mut h.visibility, &mut h.transport)
            .unwrap();
        assert!(report.is_none());
    }
    let report = h
        .manager
        .update(&h.world, &h.registry, &mut h.visibility, &mut h.transport)
        .unwrap()
        .unwrap();
    assert_eq!(report.tick, 3);
    assert_eq!(report.became_visible, 1);
}

#[test]
fn test_full_resync_resends_inserts() {
    let mut h = Harness::new(ReplicationConfig::default());
    let entity = h.spawn();
    h.tick();
    assert!(h.tick().is_empty());

    h.manager.request_full_resync(1).unwrap();
    let items = items_on(&h.tick(), ChannelId::STRUCTURAL);
    assert_eq!(items.len(), 2);
    assert!(h.manager.client_knows(1, entity));
}

#[test]
fn test_process_inbound_consumes_acks_only() {
    let mut h = Harness::new(ReplicationConfig::default());
    h.spawn();
    h.tick();

    let ack = ClientAck::new(ChannelId::STRUCTURAL, 1).encode().unwrap();
    h.transport.push_inbound(1, ChannelId::ACKS, ack);
    h.transport.push_inbound(1, ChannelId::ACKS, vec![0xff, 0xff, 0xff]);
    h.transport.push_inbound(1, ChannelId(9), vec![1, 2, 3]);

    let unhandled = h.manager.process_inbound(&mut h.transport);
    assert_eq!(unhandled.len(), 1);
    assert_eq!(unhandled[0].channel, ChannelId(9));
    assert_eq!(h.manager.client_stats(1).unwrap().acks_received, 1);
}

#[test]
fn test_channel_configuration_is_validated() {
    let table = ChannelTable::default();

    let err = ReplicationManager::new(
        ReplicationConfig {
            structural_channel: ChannelId::UPDATES,
            ..Default::default()
        },
        &table,
    )
    .unwrap_err();
    assert!(matches!(err, ReplicationError::InvalidConfig(_)));

    let err = ReplicationManager::new(
        ReplicationConfig {
            update_channel: ChannelId::ACKS,
            ..Default::default()
        },
        &table,
    )
    .unwrap_err();
    assert!(matches!(err, ReplicationError::ChannelDirection { .. }));

    let err = ReplicationManager::new(
        ReplicationConfig {
            ack_channel: ChannelId(9),
            ..Default::default()
        },
        &table,
    )
    .unwrap_err();
    assert_eq!(err, ReplicationError::UnknownChannel(ChannelId(9)));

    let err = ReplicationManager::new(
        ReplicationConfig {
            update_interval_ticks: 0,
            ..Default::default()
        },
        &table,
    )
    .unwrap_err();
    assert!(matches!(err, ReplicationError::InvalidConfig(_)));
}

#[test]
fn test_custom_channel_table() {
    let mut table = ChannelTable::default();
    table.add(ChannelConfig {
        id: ChannelId(5),
        mode: ChannelMode::ReliableUnordered,
        direction: ChannelDirection::ServerToClient,
    });
    let manager = ReplicationManager::new(
        ReplicationConfig {
            structural_channel: ChannelId(5),
            ..Default::default()
        },
        &table,
    );
    assert!(manager.is_ok());
}

#[test]
fn test_strategy_round_trips_through_strings() {
    for strategy in [
        ReplicationStrategy::Full,
        ReplicationStrategy::Delta,
        ReplicationStrategy::OnDemand,
    ] {
        assert_eq!(strategy.to_string().parse::<ReplicationStrategy>(), Ok(strategy));
    }
    assert!("sometimes".parse::<ReplicationStrategy>().is_err());
}
