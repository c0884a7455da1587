//! Headless server/client loop over a lossy loopback link.
//!
//! One server world holds a ship per client (each piloted by that client
//! through predicted input) plus drifting NPC ships. Every tick the
//! clients predict, the server applies delayed inputs and confirms them,
//! replication runs, and update packets cross a link that drops a
//! configurable share of them.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use bevy_ecs::prelude::*;
use nebula_config::{Config, ConfigError};
use nebula_replication::{
    ChannelTable, ClientId, ClientPredictionManager, ClientVisibility, ComponentRegistry,
    ConfirmationOutcome, InboundMessage, LoopbackTransport, PredictionError, PredictionStats,
    Replicated, ReplicationError, ReplicationManager, ReplicationReceiver, SnapshotOutcome,
    TickReport, VisibilityPolicy,
};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Half-width of the square NPC ships bounce around in.
const ARENA_HALF_EXTENT: f32 = 50.0;
/// Offset the server applies when it deliberately disagrees with a client.
const DIVERGENCE_NUDGE: f32 = 0.5;

// ---------------------------------------------------------------------------
// Components and input
// ---------------------------------------------------------------------------

/// World-space position.
#[derive(Component, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Units per second.
#[derive(Component, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Velocity {
    pub x: f32,
    pub y: f32,
}

/// Hit points.
#[derive(Component, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Health(pub u32);

/// Display name.
#[derive(Component, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ShipName(pub String);

/// Server-only marker for ships steered by a client.
#[derive(Component, Debug, Clone, Copy)]
pub struct Pilot;

/// One frame of steering input.
#[derive(Debug, Clone, PartialEq)]
pub struct Thrust {
    pub frame: u64,
    pub dx: f32,
    pub dy: f32,
}

/// Registers every replicated demo component.
pub fn demo_registry() -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();
    registry.register::<Position>("Position");
    registry.register::<Velocity>("Velocity");
    registry.register::<Health>("Health");
    registry.register::<ShipName>("ShipName");
    registry
}

fn apply_thrust(world: &mut World, entity: Entity, thrust: &Thrust, dt: f32) {
    if let Some(mut pos) = world.get_mut::<Position>(entity) {
        pos.x += thrust.dx * dt;
        pos.y += thrust.dy * dt;
    }
}

// ---------------------------------------------------------------------------
// Errors and summaries
// ---------------------------------------------------------------------------

/// Anything that stops the demo.
#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
    #[error(transparent)]
    Prediction(#[from] PredictionError),
}

/// What happened during one tick.
#[derive(Debug, Clone, Default)]
pub struct TickSummary {
    pub tick: u64,
    pub replication: Option<TickReport>,
    pub dropped_packets: usize,
    pub rollbacks: usize,
}

/// Totals over a whole run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub ticks: u64,
    pub items_sent: usize,
    pub dropped_packets: usize,
    pub rollbacks: usize,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Everything one simulated client owns.
pub struct DemoClient {
    pub id: ClientId,
    pub world: World,
    pub receiver: ReplicationReceiver,
    pub prediction: ClientPredictionManager<Thrust>,
    /// Local predicted copy of the client's own ship.
    pub avatar: Entity,
    /// Server entity of the client's own ship.
    pub server_avatar: Entity,
    rollbacks: Rc<Cell<u64>>,
}

impl DemoClient {
    /// Thrust pattern for `frame`: a slow circle, different per client.
    fn steer(&self, frame: u64) -> Thrust {
        let phase = frame as f32 * 0.1 + self.id as f32;
        Thrust {
            frame,
            dx: phase.cos() * 4.0,
            dy: phase.sin() * 4.0,
        }
    }

    /// Predicts one frame. Returns the input to send, or `None` when
    /// prediction stalled and the frame must be retried.
    fn predict(&mut self, registry: &ComponentRegistry, dt: f32) -> Option<Thrust> {
        let thrust = self.steer(self.prediction.current_frame());
        let before = self.world.get::<Position>(self.avatar).cloned();

        self.prediction.record_input(thrust.clone());
        apply_thrust(&mut self.world, self.avatar, &thrust, dt);
        match self
            .prediction
            .save_prediction_snapshot(&self.world, registry, thrust.clone())
        {
            SnapshotOutcome::Recorded(_) | SnapshotOutcome::Disabled => Some(thrust),
            SnapshotOutcome::Stalled => {
                if let Some(before) = before {
                    self.world.entity_mut(self.avatar).insert(before);
                }
                None
            }
        }
    }

    /// Rollbacks observed by this client's listener.
    pub fn rollback_count(&self) -> u64 {
        self.rollbacks.get()
    }
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// Server, clients and the link between them.
pub struct Simulation {
    config: Config,
    registry: ComponentRegistry,
    server_world: World,
    visibility: ClientVisibility,
    transport: LoopbackTransport,
    manager: ReplicationManager,
    clients: Vec<DemoClient>,
    /// Inputs on their way to the server: (arrival tick, client, input).
    in_flight: VecDeque<(u64, ClientId, Thrust)>,
    rng: Xoshiro256StarStar,
    tick: u64,
    dt: f32,
}

impl Simulation {
    /// Builds the server world, the clients and their visibility rules.
    pub fn new(config: Config) -> Result<Self, DemoError> {
        config.validate()?;
        let registry = demo_registry();
        let channels = ChannelTable::default();
        let mut manager = ReplicationManager::new(config.replication.clone(), &channels)?;
        let mut visibility = ClientVisibility::new(config.visibility.clone());
        let mut rng = Xoshiro256StarStar::seed_from_u64(config.debug.seed);
        let dt = 1.0 / config.network.net_tick_rate as f32;

        let mut server_world = World::new();
        let client_count = config.network.clients as u64;
        let mut clients = Vec::new();

        for id in 1..=client_count {
            let start = Position {
                x: id as f32 * 10.0,
                y: 0.0,
            };
            let server_avatar = server_world
                .spawn((
                    Replicated,
                    Pilot,
                    start.clone(),
                    Health(100),
                    ShipName(format!("pilot-{id}")),
                ))
                .id();
            visibility.set_entity_global_visibility(server_avatar, true);
            manager.add_client(id);
            manager.subscribe(id, "Position")?;
            manager.subscribe(id, "Health")?;

            let mut world = World::new();
            let avatar = world.spawn(start).id();
            let mut prediction = ClientPredictionManager::new(config.prediction.clone())?;
            prediction.register_predicted_entity(avatar);
            prediction.set_input_handler(move |world: &mut World, thrust: &Thrust| {
                apply_thrust(world, avatar, thrust, dt);
            });
            let rollbacks = Rc::new(Cell::new(0));
            let counter = rollbacks.clone();
            prediction.on_rollback(move |rollback| {
                counter.set(counter.get() + 1);
                debug!(
                    "client {id}: rolled back {:?} at frame {}",
                    rollback.entity, rollback.frame
                );
            });

            clients.push(DemoClient {
                id,
                world,
                receiver: ReplicationReceiver::new(channels.clone()),
                prediction,
                avatar,
                server_avatar,
                rollbacks,
            });
        }

        for i in 0..config.network.entities {
            let npc = server_world
                .spawn((
                    Replicated,
                    Position {
                        x: rng.gen_range(-ARENA_HALF_EXTENT..ARENA_HALF_EXTENT),
                        y: rng.gen_range(-ARENA_HALF_EXTENT..ARENA_HALF_EXTENT),
                    },
                    Velocity {
                        x: rng.gen_range(-5.0..5.0),
                        y: rng.gen_range(-5.0..5.0),
                    },
                    Health(50),
                    ShipName(format!("npc-{i}")),
                ))
                .id();
            if client_count == 0 {
                continue;
            }
            let owner = u64::from(i) % client_count + 1;
            match config.visibility.policy {
                VisibilityPolicy::All => {}
                VisibilityPolicy::Whitelist => visibility.set_entity_visibility(npc, owner, true),
                VisibilityPolicy::Blacklist => visibility.set_entity_visibility(npc, owner, false),
            }
        }

        info!(
            "simulation ready: {} clients, {} npcs, {} strategy, {} visibility",
            client_count,
            config.network.entities,
            config.replication.strategy,
            config.visibility.policy
        );

        Ok(Self {
            config,
            registry,
            server_world,
            visibility,
            transport: LoopbackTransport::new(),
            manager,
            clients,
            in_flight: VecDeque::new(),
            rng,
            tick: 0,
            dt,
        })
    }

    /// Runs one full tick.
    pub fn step(&mut self) -> Result<TickSummary, DemoError> {
        self.tick += 1;
        let mut summary = TickSummary {
            tick: self.tick,
            ..Default::default()
        };

        // Clients predict and send input.
        let arrival = self.tick + u64::from(self.config.network.input_delay_ticks);
        for client in &mut self.clients {
            if let Some(thrust) = client.predict(&self.registry, self.dt) {
                self.in_flight.push_back((arrival, client.id, thrust));
            }
        }

        summary.rollbacks = self.apply_arrived_inputs()?;
        self.move_npcs();

        // Replicate.
        self.manager.process_inbound(&mut self.transport);
        summary.replication = self.manager.update(
            &self.server_world,
            &self.registry,
            &mut self.visibility,
            &mut self.transport,
        )?;
        summary.dropped_packets = self.deliver()?;

        if self.config.debug.log_visibility_changes {
            for client in &self.clients {
                for change in self.visibility.drain_history(client.id) {
                    info!(
                        "client {}: {:?} {}",
                        change.client,
                        change.entity,
                        if change.is_visible { "entered view" } else { "left view" }
                    );
                }
            }
        }
        Ok(summary)
    }

    /// Applies inputs that reached the server and confirms each one back to
    /// its client. Returns the number of rollbacks triggered.
    fn apply_arrived_inputs(&mut self) -> Result<usize, DemoError> {
        let mut rollbacks = 0;
        while self
            .in_flight
            .front()
            .is_some_and(|(arrival, _, _)| *arrival <= self.tick)
        {
            let Some((_, client_id, thrust)) = self.in_flight.pop_front() else {
                break;
            };
            let Some(client) = self.clients.iter_mut().find(|c| c.id == client_id) else {
                continue;
            };

            apply_thrust(&mut self.server_world, client.server_avatar, &thrust, self.dt);
            if self.rng.gen_bool(self.config.network.divergence_chance)
                && let Some(mut pos) = self.server_world.get_mut::<Position>(client.server_avatar)
            {
                pos.x += DIVERGENCE_NUDGE;
            }

            let mut state = self
                .registry
                .snapshot_entity(&self.server_world, client.server_avatar);
            // Only the predicted component is reconciled.
            state.retain(|tag, _| tag == "Position");
            let confirmation = HashMap::from([(client.avatar, state)]);
            let outcome = client.prediction.handle_server_confirmation(
                &mut client.world,
                &self.registry,
                thrust.frame,
                &confirmation,
            )?;
            if matches!(outcome, ConfirmationOutcome::RolledBack { .. }) {
                rollbacks += 1;
            }
        }
        Ok(rollbacks)
    }

    /// Integrates NPC velocities, bouncing off the arena edge, and chips
    /// away at their health now and then.
    fn move_npcs(&mut self) {
        let dt = self.dt;
        let mut query = self
            .server_world
            .query_filtered::<(&mut Position, &mut Velocity), Without<Pilot>>();
        for (mut pos, mut vel) in query.iter_mut(&mut self.server_world) {
            pos.x += vel.x * dt;
            pos.y += vel.y * dt;
            if pos.x.abs() > ARENA_HALF_EXTENT {
                vel.x = -vel.x;
            }
            if pos.y.abs() > ARENA_HALF_EXTENT {
                vel.y = -vel.y;
            }
        }

        if self.tick % 20 == 0 {
            let mut health = self
                .server_world
                .query_filtered::<&mut Health, Without<Pilot>>();
            for mut hp in health.iter_mut(&mut self.server_world) {
                hp.0 = hp.0.saturating_sub(1);
            }
        }
    }

    /// Hands outbound packets to clients, dropping a share of update
    /// packets, and queues each client's ack. Returns packets dropped.
    fn deliver(&mut self) -> Result<usize, DemoError> {
        let mut dropped = 0;
        let update_channel = self.config.replication.update_channel;
        for msg in self.transport.take_outbound() {
            if msg.channel == update_channel && self.rng.gen_bool(self.config.network.packet_loss)
            {
                dropped += 1;
                continue;
            }
            let Some(client) = self.clients.iter_mut().find(|c| c.id == msg.to) else {
                continue;
            };
            let inbound = InboundMessage {
                from: 0,
                channel: msg.channel,
                payload: msg.payload,
            };
            client
                .receiver
                .receive(&mut client.world, &self.registry, &inbound)?;
        }

        let ack_channel = self.config.replication.ack_channel;
        for client in &mut self.clients {
            for ack in client.receiver.take_acks() {
                self.transport
                    .push_inbound(client.id, ack_channel, ack.encode()?);
            }
        }
        Ok(dropped)
    }

    /// Runs `ticks` ticks, logging a line every second of simulated time.
    pub fn run(&mut self, ticks: u64) -> Result<RunSummary, DemoError> {
        let mut totals = RunSummary::default();
        let log_every = u64::from(self.config.network.net_tick_rate).max(1);
        for _ in 0..ticks {
            let summary = self.step()?;
            totals.ticks += 1;
            totals.dropped_packets += summary.dropped_packets;
            totals.rollbacks += summary.rollbacks;
            if let Some(report) = &summary.replication {
                totals.items_sent += report.items_sent;
            }
            if summary.tick % log_every == 0 {
                info!(
                    "tick {}: {} items sent, {} packets dropped, {} rollbacks so far",
                    summary.tick, totals.items_sent, totals.dropped_packets, totals.rollbacks
                );
            }
        }
        Ok(totals)
    }

    /// Logs per-client replication and prediction counters.
    pub fn log_client_stats(&self) {
        for client in &self.clients {
            let replication = self.manager.client_stats(client.id).unwrap_or_default();
            let PredictionStats {
                confirmations,
                rollbacks,
                resimulated_frames,
                ..
            } = client.prediction.stats();
            info!(
                "client {}: mirrors {} entities, {} batches / {} items received, acked tick {}; \
                 prediction {} confirmed, {} rolled back, {} frames resimulated, latency {}",
                client.id,
                client.receiver.mirrored(),
                replication.batches_sent,
                replication.items_sent,
                replication.last_acked_tick,
                confirmations,
                rollbacks,
                resimulated_frames,
                client.prediction.prediction_latency()
            );
        }
        let cache = self.visibility.cache_stats();
        info!(
            "visibility cache: {} hits, {} misses, {} entries",
            cache.hits, cache.misses, cache.entries
        );
    }

    /// The simulated clients.
    pub fn clients(&self) -> &[DemoClient] {
        &self.clients
    }
}
