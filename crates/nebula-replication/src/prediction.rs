//! Client-side prediction: snapshot predicted entities every simulated
//! frame, reconcile against server confirmations, roll back on divergence
//! and resimulate the inputs the server has not confirmed yet.
//!
//! Frame `F`'s snapshot is the state *after* input `F` was applied. A
//! confirmation for `F` therefore carries the server's state after the
//! same input, and resimulation replays inputs `F + 1 ..` on top of it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use bevy_ecs::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ParseSettingError, PredictionError};
use crate::registry::{ComponentRegistry, EntityState};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What happens when the history ring is full and the server has not
/// confirmed anything in it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HistoryOverflow {
    /// Evict the oldest frame. A later confirmation for it is skipped.
    #[default]
    DropOldest,
    /// Refuse new snapshots until a confirmation frees space.
    Stall,
}

impl fmt::Display for HistoryOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DropOldest => "drop-oldest",
            Self::Stall => "stall",
        })
    }
}

impl FromStr for HistoryOverflow {
    type Err = ParseSettingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop-oldest" | "drop_oldest" | "dropoldest" => Ok(Self::DropOldest),
            "stall" => Ok(Self::Stall),
            _ => Err(ParseSettingError {
                kind: "history overflow policy",
                value: s.to_string(),
            }),
        }
    }
}

/// Tunables for [`ClientPredictionManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    /// Snapshotting and reconciliation run only while enabled.
    pub enabled: bool,
    /// Frames retained in the history ring and input buffer.
    pub max_history_frames: usize,
    /// Absolute tolerance for numeric component fields.
    pub error_threshold: f64,
    /// Behaviour of a full history ring.
    pub overflow: HistoryOverflow,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_history_frames: 128,
            error_threshold: 0.01,
            overflow: HistoryOverflow::DropOldest,
        }
    }
}

// ---------------------------------------------------------------------------
// Frames and events
// ---------------------------------------------------------------------------

/// Predicted state of every registered entity after one frame's input.
#[derive(Debug, Clone)]
pub struct PredictionFrame<I> {
    /// Frame number.
    pub frame: u64,
    /// When the snapshot was taken.
    pub timestamp: Instant,
    /// Input applied during this frame.
    pub input: I,
    /// Deep-cloned component state per predicted entity.
    pub states: HashMap<Entity, EntityState>,
}

/// A forced correction, delivered to rollback listeners.
#[derive(Debug, Clone)]
pub struct PredictionRollback {
    /// Corrected entity.
    pub entity: Entity,
    /// Authoritative components written to the world.
    pub state: EntityState,
    /// Confirmed frame the correction belongs to.
    pub frame: u64,
}

/// Where a predicted entity sits in the prediction cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionStatus {
    /// Local input applied, not yet confirmed.
    Predicted,
    /// Last confirmation matched within tolerance.
    Confirmed,
    /// Last confirmation diverged and the entity was rolled back.
    Corrected,
}

/// Result of [`ClientPredictionManager::save_prediction_snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Snapshot stored under this frame number.
    Recorded(u64),
    /// Prediction is disabled; nothing stored.
    Disabled,
    /// History is full under [`HistoryOverflow::Stall`]; nothing stored.
    Stalled,
}

/// Result of [`ClientPredictionManager::handle_server_confirmation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    /// Prediction is disabled; ignored.
    Disabled,
    /// Frame at or before the last confirmed frame; ignored.
    Stale,
    /// No snapshot for that frame (evicted or never taken); ignored.
    UnknownFrame,
    /// Prediction matched within tolerance.
    Confirmed,
    /// Prediction diverged; these entities were corrected.
    RolledBack {
        /// Corrected entities, ascending.
        entities: Vec<Entity>,
    },
}

/// Handle returned by [`ClientPredictionManager::on_rollback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RollbackHandle(u64);

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PredictionStats {
    /// Confirmations that matched.
    pub confirmations: u64,
    /// Confirmations that triggered a rollback.
    pub rollbacks: u64,
    /// Inputs replayed during resimulation.
    pub resimulated_frames: u64,
    /// Snapshots refused under [`HistoryOverflow::Stall`].
    pub stalls: u64,
    /// Frames evicted under [`HistoryOverflow::DropOldest`].
    pub evicted_frames: u64,
    /// Confirmations skipped as stale or unknown.
    pub skipped_confirmations: u64,
}

type InputHandler<I> = Box<dyn FnMut(&mut World, &I)>;
type RollbackListener = Box<dyn FnMut(&PredictionRollback)>;

// ---------------------------------------------------------------------------
// ClientPredictionManager
// ---------------------------------------------------------------------------

/// Client-side prediction driver, generic over the host's input type.
pub struct ClientPredictionManager<I> {
    config: PredictionConfig,
    predicted: HashMap<Entity, PredictionStatus>,
    history: VecDeque<PredictionFrame<I>>,
    inputs: VecDeque<(u64, I)>,
    current_frame: u64,
    last_confirmed: Option<u64>,
    input_handler: Option<InputHandler<I>>,
    listeners: Vec<(RollbackHandle, RollbackListener)>,
    next_handle: u64,
    stats: PredictionStats,
}

impl<I> fmt::Debug for ClientPredictionManager<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientPredictionManager")
            .field("config", &self.config)
            .field("predicted", &self.predicted.len())
            .field("current_frame", &self.current_frame)
            .field("last_confirmed", &self.last_confirmed)
            .field("history", &self.history.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl<I: Clone> ClientPredictionManager<I> {
    /// Creates a manager with no predicted entities.
    pub fn new(config: PredictionConfig) -> Result<Self, PredictionError> {
        if config.max_history_frames == 0 {
            return Err(PredictionError::InvalidConfig(
                "max_history_frames must be at least 1",
            ));
        }
        if config.error_threshold.is_nan() || config.error_threshold < 0.0 {
            return Err(PredictionError::InvalidConfig(
                "error_threshold must be a non-negative number",
            ));
        }
        Ok(Self {
            config,
            predicted: HashMap::new(),
            history: VecDeque::new(),
            inputs: VecDeque::new(),
            current_frame: 0,
            last_confirmed: None,
            input_handler: None,
            listeners: Vec::new(),
            next_handle: 0,
            stats: PredictionStats::default(),
        })
    }

    /// Current configuration.
    pub fn config(&self) -> &PredictionConfig {
        &self.config
    }

    // -- registration --------------------------------------------------------

    /// Starts predicting `entity`. Returns `false` if it already was.
    pub fn register_predicted_entity(&mut self, entity: Entity) -> bool {
        self.predicted
            .insert(entity, PredictionStatus::Predicted)
            .is_none()
    }

    /// Stops predicting `entity` and drops it from stored snapshots.
    pub fn unregister_predicted_entity(&mut self, entity: Entity) -> Result<(), PredictionError> {
        self.predicted
            .remove(&entity)
            .ok_or(PredictionError::EntityNotPredicted(entity))?;
        for frame in &mut self.history {
            frame.states.remove(&entity);
        }
        Ok(())
    }

    /// Whether `entity` is predicted.
    pub fn is_predicted(&self, entity: Entity) -> bool {
        self.predicted.contains_key(&entity)
    }

    /// Cycle position of a predicted entity.
    pub fn entity_status(&self, entity: Entity) -> Option<PredictionStatus> {
        self.predicted.get(&entity).copied()
    }

    /// Installs the host callback that applies one input to the world.
    /// Only resimulation calls it.
    pub fn set_input_handler(&mut self, handler: impl FnMut(&mut World, &I) + 'static) {
        self.input_handler = Some(Box::new(handler));
    }

    /// Registers a rollback listener. Listeners run in registration order.
    pub fn on_rollback(
        &mut self,
        listener: impl FnMut(&PredictionRollback) + 'static,
    ) -> RollbackHandle {
        let handle = RollbackHandle(self.next_handle);
        self.next_handle += 1;
        self.listeners.push((handle, Box::new(listener)));
        handle
    }

    /// Removes a rollback listener. Returns `false` for an unknown handle.
    pub fn remove_rollback_listener(&mut self, handle: RollbackHandle) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(h, _)| *h != handle);
        self.listeners.len() != before
    }

    // -- enable / reset ------------------------------------------------------

    /// Enables or disables prediction. Disabling stops snapshotting at once
    /// and leaves stored history untouched.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    /// Whether prediction is enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Drops all history, inputs and predicted entities and resets frame
    /// counters. Listeners and the input handler are kept.
    pub fn cleanup(&mut self) {
        self.predicted.clear();
        self.history.clear();
        self.inputs.clear();
        self.current_frame = 0;
        self.last_confirmed = None;
    }

    // -- per-frame -----------------------------------------------------------

    /// Buffers the input for the current frame, replacing an earlier call
    /// in the same frame.
    pub fn record_input(&mut self, input: I) {
        if !self.config.enabled {
            return;
        }
        if let Some(last) = self.inputs.back_mut()
            && last.0 == self.current_frame
        {
            last.1 = input;
            return;
        }
        self.inputs.push_back((self.current_frame, input));
        while self.inputs.len() > self.config.max_history_frames {
            self.inputs.pop_front();
        }
    }

    /// Snapshots every predicted entity into a new frame and advances the
    /// frame counter.
    pub fn save_prediction_snapshot(
        &mut self,
        world: &World,
        registry: &ComponentRegistry,
        input: I,
    ) -> SnapshotOutcome {
        if !self.config.enabled {
            return SnapshotOutcome::Disabled;
        }
        if self.history.len() >= self.config.max_history_frames
            && self.config.overflow == HistoryOverflow::Stall
        {
            self.stats.stalls += 1;
            tracing::debug!("prediction stalled at frame {}", self.current_frame);
            return SnapshotOutcome::Stalled;
        }

        let frame = self.current_frame;
        let states = snapshot_states(&self.predicted, world, registry);
        for status in self.predicted.values_mut() {
            *status = PredictionStatus::Predicted;
        }
        self.history.push_back(PredictionFrame {
            frame,
            timestamp: Instant::now(),
            input,
            states,
        });
        while self.history.len() > self.config.max_history_frames {
            if let Some(evicted) = self.history.pop_front() {
                self.stats.evicted_frames += 1;
                tracing::debug!("prediction history full, evicted frame {}", evicted.frame);
            }
        }
        self.current_frame += 1;
        SnapshotOutcome::Recorded(frame)
    }

    // -- reconciliation ------------------------------------------------------

    /// Reconciles the snapshot of `confirmed_frame` against `server_state`.
    ///
    /// Stale, duplicate and unknown frames are ignored. On divergence every
    /// predicted entity is rewound to `confirmed_frame` (server values where
    /// given, the stored snapshot otherwise), listeners are notified, and
    /// every buffered input after `confirmed_frame` is replayed in order.
    pub fn handle_server_confirmation(
        &mut self,
        world: &mut World,
        registry: &ComponentRegistry,
        confirmed_frame: u64,
        server_state: &HashMap<Entity, EntityState>,
    ) -> Result<ConfirmationOutcome, PredictionError> {
        if !self.config.enabled {
            return Ok(ConfirmationOutcome::Disabled);
        }
        if self.last_confirmed.is_some_and(|last| confirmed_frame <= last) {
            self.stats.skipped_confirmations += 1;
            return Ok(ConfirmationOutcome::Stale);
        }
        if let Some(&entity) = server_state.keys().find(|e| !self.predicted.contains_key(*e)) {
            return Err(PredictionError::EntityNotPredicted(entity));
        }
        let Some(snapshot) = self.history.iter().find(|f| f.frame == confirmed_frame) else {
            self.stats.skipped_confirmations += 1;
            tracing::warn!(
                "no prediction snapshot for confirmed frame {confirmed_frame}; history too short?"
            );
            return Ok(ConfirmationOutcome::UnknownFrame);
        };

        let server_sorted: BTreeMap<Entity, &EntityState> =
            server_state.iter().map(|(e, s)| (*e, s)).collect();
        let threshold = self.config.error_threshold;
        let diverged: Vec<Entity> = server_sorted
            .iter()
            .filter(|(entity, server)| {
                let Some(predicted) = snapshot.states.get(*entity) else {
                    return true;
                };
                server.iter().any(|(tag, server_value)| {
                    predicted
                        .get(tag)
                        .is_none_or(|p| registry.diverges(tag, p, server_value, threshold))
                })
            })
            .map(|(entity, _)| *entity)
            .collect();

        if diverged.is_empty() {
            for entity in server_sorted.keys() {
                self.predicted.insert(*entity, PredictionStatus::Confirmed);
            }
            self.finish_confirmation(confirmed_frame);
            self.stats.confirmations += 1;
            return Ok(ConfirmationOutcome::Confirmed);
        }

        // Rewind every predicted entity to the confirmed frame: its stored
        // snapshot, overlaid with whatever the server sent.
        for (entity, state) in &snapshot.states {
            if self.predicted.contains_key(entity) {
                registry.restore_entity(world, *entity, state);
            }
        }
        for (entity, server) in &server_sorted {
            registry.restore_entity(world, *entity, server);
        }
        for entity in server_sorted.keys() {
            let status = if diverged.contains(entity) {
                PredictionStatus::Corrected
            } else {
                PredictionStatus::Confirmed
            };
            self.predicted.insert(*entity, status);
        }
        for &entity in &diverged {
            let rollback = PredictionRollback {
                entity,
                state: server_sorted[&entity].clone(),
                frame: confirmed_frame,
            };
            for (_, listener) in &mut self.listeners {
                listener(&rollback);
            }
        }

        // Resimulate.
        let replay: Vec<(u64, I)> = self
            .inputs
            .iter()
            .filter(|(frame, _)| *frame > confirmed_frame)
            .cloned()
            .collect();
        match self.input_handler.as_mut() {
            Some(handler) => {
                for (frame, input) in &replay {
                    handler(&mut *world, input);
                    let states = snapshot_states(&self.predicted, world, registry);
                    if let Some(stored) = self.history.iter_mut().find(|f| f.frame == *frame) {
                        stored.states = states;
                    }
                    self.stats.resimulated_frames += 1;
                }
            }
            None if !replay.is_empty() => {
                tracing::warn!(
                    "rollback without an input handler; {} inputs not replayed",
                    replay.len()
                );
            }
            None => {}
        }

        tracing::debug!(
            "rolled back {} entities at frame {confirmed_frame}, replayed {} inputs",
            diverged.len(),
            replay.len()
        );
        self.finish_confirmation(confirmed_frame);
        self.stats.rollbacks += 1;
        Ok(ConfirmationOutcome::RolledBack { entities: diverged })
    }

    fn finish_confirmation(&mut self, confirmed_frame: u64) {
        while self.history.front().is_some_and(|f| f.frame <= confirmed_frame) {
            self.history.pop_front();
        }
        while self.inputs.front().is_some_and(|(frame, _)| *frame <= confirmed_frame) {
            self.inputs.pop_front();
        }
        self.last_confirmed = Some(confirmed_frame);
    }

    // -- diagnostics ---------------------------------------------------------

    /// Next frame number to be snapshotted.
    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    /// Last confirmed frame, `0` before the first confirmation.
    pub fn last_confirmed_frame(&self) -> u64 {
        self.last_confirmed.unwrap_or(0)
    }

    /// Frames predicted but not yet confirmed.
    pub fn prediction_latency(&self) -> u64 {
        self.current_frame - self.last_confirmed_frame()
    }

    /// Stored snapshot for `frame`, if retained.
    pub fn frame(&self, frame: u64) -> Option<&PredictionFrame<I>> {
        self.history.iter().find(|f| f.frame == frame)
    }

    /// Number of retained snapshots.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Number of buffered inputs.
    pub fn buffered_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Counters.
    pub fn stats(&self) -> PredictionStats {
        self.stats
    }
}

fn snapshot_states(
    predicted: &HashMap<Entity, PredictionStatus>,
    world: &World,
    registry: &ComponentRegistry,
) -> HashMap<Entity, EntityState> {
    predicted
        .keys()
        .filter(|&&entity| world.get_entity(entity).is_ok())
        .map(|&entity| (entity, registry.snapshot_entity(world, entity)))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
