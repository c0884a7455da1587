//! Per-client visibility: decides which entities each connected client may
//! see, reports enter/leave transitions between evaluation passes, and
//! memoizes repeated queries within a short tick window.
//!
//! Evaluation order for a pair (entity, client):
//!
//! 1. entities in the global-visible set are always visible;
//! 2. the [`VisibilityPolicy`] is applied to the explicit per-client
//!    entries of that entity;
//! 3. entities with no explicit entries at all fall back to
//!    [`VisibilityConfig::default_visible`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use bevy_ecs::entity::Entity;
use serde::{Deserialize, Serialize};

use crate::error::ParseSettingError;
use crate::replication::ClientId;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Rule set applied to explicit per-client visibility entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VisibilityPolicy {
    /// Every entity is visible to every client.
    #[default]
    All,
    /// Visible unless the client was explicitly excluded.
    Blacklist,
    /// Hidden unless the client was explicitly included.
    Whitelist,
}

impl fmt::Display for VisibilityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::All => "all",
            Self::Blacklist => "blacklist",
            Self::Whitelist => "whitelist",
        })
    }
}

impl FromStr for VisibilityPolicy {
    type Err = ParseSettingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "blacklist" => Ok(Self::Blacklist),
            "whitelist" => Ok(Self::Whitelist),
            _ => Err(ParseSettingError {
                kind: "visibility policy",
                value: s.to_string(),
            }),
        }
    }
}

/// Tunables for [`ClientVisibility`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibilityConfig {
    /// Active policy.
    pub policy: VisibilityPolicy,
    /// Visibility of entities that have no explicit per-client entries.
    pub default_visible: bool,
    /// Enables [`ClientVisibility::compute_changes`]. When off, change
    /// detection reports nothing.
    pub change_tracking: bool,
    /// Maximum retained change records per client.
    pub max_history_size: usize,
    /// Ticks a memoized answer stays valid. `0` disables the cache.
    pub cache_ttl_ticks: u64,
    /// Upper bound on memoized pairs before expired entries are purged.
    pub cache_max_entries: usize,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            policy: VisibilityPolicy::All,
            default_visible: true,
            change_tracking: true,
            max_history_size: 256,
            cache_ttl_ticks: 1,
            cache_max_entries: 65_536,
        }
    }
}

// ---------------------------------------------------------------------------
// Change records
// ---------------------------------------------------------------------------

/// One visibility transition for one (entity, client) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilityChangeRecord {
    /// Entity whose visibility changed.
    pub entity: Entity,
    /// Client observing the change.
    pub client: ClientId,
    /// Visibility in the committed baseline.
    pub was_visible: bool,
    /// Visibility now.
    pub is_visible: bool,
    /// Tick the change was computed at.
    pub tick: u64,
}

/// Result of [`ClientVisibility::compute_changes`]. Nothing is committed
/// until it is passed to [`ClientVisibility::apply_changes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisibilityChanges {
    /// Pairs hidden in the baseline and visible now.
    pub became_visible: Vec<VisibilityChangeRecord>,
    /// Pairs visible in the baseline and hidden now.
    pub became_hidden: Vec<VisibilityChangeRecord>,
    /// Pairs whose visibility did not change.
    pub unchanged: Vec<(Entity, ClientId)>,
}

impl VisibilityChanges {
    /// `true` if nothing entered or left.
    pub fn is_empty(&self) -> bool {
        self.became_visible.is_empty() && self.became_hidden.is_empty()
    }
}

/// Memoization counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Queries answered from the cache.
    pub hits: u64,
    /// Queries that had to be evaluated.
    pub misses: u64,
    /// Entries currently held.
    pub entries: usize,
}

// ---------------------------------------------------------------------------
// PairIndex
// ---------------------------------------------------------------------------

/// Bidirectional entity <-> client index. An empty bucket on either side is
/// always removed.
#[derive(Debug, Clone, Default)]
struct PairIndex {
    by_entity: HashMap<Entity, HashSet<ClientId>>,
    by_client: HashMap<ClientId, HashSet<Entity>>,
}

impl PairIndex {
    fn insert(&mut self, entity: Entity, client: ClientId) {
        self.by_entity.entry(entity).or_default().insert(client);
        self.by_client.entry(client).or_default().insert(entity);
    }

    fn remove(&mut self, entity: Entity, client: ClientId) {
        if let Some(clients) = self.by_entity.get_mut(&entity) {
            clients.remove(&client);
            if clients.is_empty() {
                self.by_entity.remove(&entity);
            }
        }
        if let Some(entities) = self.by_client.get_mut(&client) {
            entities.remove(&entity);
            if entities.is_empty() {
                self.by_client.remove(&client);
            }
        }
    }

    fn contains(&self, entity: Entity, client: ClientId) -> bool {
        self.by_entity
            .get(&entity)
            .is_some_and(|clients| clients.contains(&client))
    }

    fn has_entity(&self, entity: Entity) -> bool {
        self.by_entity.contains_key(&entity)
    }

    fn remove_entity(&mut self, entity: Entity) {
        let Some(clients) = self.by_entity.remove(&entity) else {
            return;
        };
        for client in clients {
            if let Some(entities) = self.by_client.get_mut(&client) {
                entities.remove(&entity);
                if entities.is_empty() {
                    self.by_client.remove(&client);
                }
            }
        }
    }

    fn remove_client(&mut self, client: ClientId) {
        let Some(entities) = self.by_client.remove(&client) else {
            return;
        };
        for entity in entities {
            if let Some(clients) = self.by_entity.get_mut(&entity) {
                clients.remove(&client);
                if clients.is_empty() {
                    self.by_entity.remove(&entity);
                }
            }
        }
    }

    fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.by_entity.keys().copied()
    }

    fn clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.by_client.keys().copied()
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedVisibility {
    visible: bool,
    expires_at: u64,
}

// ---------------------------------------------------------------------------
// ClientVisibility
// ---------------------------------------------------------------------------

/// Visibility engine. All bookkeeping is private; every query is total over
/// arbitrary entity and client ids.
#[derive(Debug, Clone)]
pub struct ClientVisibility {
    config: VisibilityConfig,
    included: PairIndex,
    excluded: PairIndex,
    global: HashSet<Entity>,
    /// Pairs that were visible at the last `apply_changes`.
    baseline: HashSet<(Entity, ClientId)>,
    history: HashMap<ClientId, VecDeque<VisibilityChangeRecord>>,
    cache: HashMap<(Entity, ClientId), CachedVisibility>,
    tick: u64,
    cache_hits: u64,
    cache_misses: u64,
}

impl Default for ClientVisibility {
    fn default() -> Self {
        Self::new(VisibilityConfig::default())
    }
}

impl ClientVisibility {
    /// Creates an engine with no explicit entries.
    pub fn new(config: VisibilityConfig) -> Self {
        Self {
            config,
            included: PairIndex::default(),
            excluded: PairIndex::default(),
            global: HashSet::new(),
            baseline: HashSet::new(),
            history: HashMap::new(),
            cache: HashMap::new(),
            tick: 0,
            cache_hits: 0,
            cache_misses: 0,
        }
    }

    /// Current configuration.
    pub fn config(&self) -> &VisibilityConfig {
        &self.config
    }

    /// Switches policy. Memoized answers are dropped.
    pub fn set_policy(&mut self, policy: VisibilityPolicy) {
        self.config.policy = policy;
        self.invalidate_cache();
    }

    /// Changes the fallback for unmanaged entities.
    pub fn set_default_visible(&mut self, visible: bool) {
        self.config.default_visible = visible;
        self.invalidate_cache();
    }

    /// Enables or disables change detection.
    pub fn set_change_tracking(&mut self, enabled: bool) {
        self.config.change_tracking = enabled;
    }

    /// Moves the cache clock forward. Earlier ticks are ignored.
    pub fn advance_tick(&mut self, tick: u64) {
        if tick <= self.tick {
            return;
        }
        self.tick = tick;
        self.cache.retain(|_, cached| cached.expires_at > tick);
    }

    /// Current cache clock.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    // -- explicit state ------------------------------------------------------

    /// Records an explicit entry for one pair.
    pub fn set_entity_visibility(&mut self, entity: Entity, client: ClientId, visible: bool) {
        if visible {
            self.excluded.remove(entity, client);
            self.included.insert(entity, client);
        } else {
            self.included.remove(entity, client);
            self.excluded.insert(entity, client);
        }
        self.invalidate_cache();
    }

    /// Adds or removes `entity` from the global-visible set. Making an
    /// entity globally visible discards its per-client entries.
    pub fn set_entity_global_visibility(&mut self, entity: Entity, visible: bool) {
        if visible {
            self.included.remove_entity(entity);
            self.excluded.remove_entity(entity);
            self.global.insert(entity);
        } else {
            self.global.remove(&entity);
        }
        self.invalidate_cache();
    }

    /// Whether `entity` is in the global-visible set.
    pub fn is_globally_visible(&self, entity: Entity) -> bool {
        self.global.contains(&entity)
    }

    /// Entities explicitly included for `client`.
    pub fn included_entities(&self, client: ClientId) -> impl Iterator<Item = Entity> + '_ {
        self.included
            .by_client
            .get(&client)
            .into_iter()
            .flat_map(|entities| entities.iter().copied())
    }

    /// Clients explicitly included for `entity`.
    pub fn included_clients(&self, entity: Entity) -> impl Iterator<Item = ClientId> + '_ {
        self.included
            .by_entity
            .get(&entity)
            .into_iter()
            .flat_map(|clients| clients.iter().copied())
    }

    // -- queries -------------------------------------------------------------

    /// Evaluates visibility from current state without touching the cache.
    pub fn is_entity_visible_to_client(&self, entity: Entity, client: ClientId) -> bool {
        if self.global.contains(&entity) {
            return true;
        }
        let managed = self.included.has_entity(entity) || self.excluded.has_entity(entity);
        match self.config.policy {
            VisibilityPolicy::All => true,
            VisibilityPolicy::Whitelist if managed => self.included.contains(entity, client),
            VisibilityPolicy::Blacklist if managed => !self.excluded.contains(entity, client),
            VisibilityPolicy::Whitelist | VisibilityPolicy::Blacklist => {
                self.config.default_visible
            }
        }
    }

    /// Memoized form of [`is_entity_visible_to_client`](Self::is_entity_visible_to_client).
    pub fn cached_is_visible(&mut self, entity: Entity, client: ClientId) -> bool {
        let key = (entity, client);
        if let Some(cached) = self.cache.get(&key)
            && cached.expires_at > self.tick
        {
            self.cache_hits += 1;
            return cached.visible;
        }

        self.cache_misses += 1;
        let visible = self.is_entity_visible_to_client(entity, client);
        if self.config.cache_ttl_ticks > 0 {
            if self.cache.len() >= self.config.cache_max_entries {
                let tick = self.tick;
                self.cache.retain(|_, cached| cached.expires_at > tick);
                if self.cache.len() >= self.config.cache_max_entries {
                    self.cache.clear();
                }
            }
            self.cache.insert(
                key,
                CachedVisibility {
                    visible,
                    expires_at: self.tick + self.config.cache_ttl_ticks,
                },
            );
        }
        visible
    }

    /// Evaluates many pairs through the cache. Answers match repeated
    /// [`cached_is_visible`](Self::cached_is_visible) calls in order.
    pub fn batch_is_visible(&mut self, pairs: &[(Entity, ClientId)]) -> Vec<bool> {
        self.cache.reserve(pairs.len().min(self.config.cache_max_entries));
        pairs
            .iter()
            .map(|&(entity, client)| self.cached_is_visible(entity, client))
            .collect()
    }

    /// Memoization counters.
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.cache_hits,
            misses: self.cache_misses,
            entries: self.cache.len(),
        }
    }

    fn invalidate_cache(&mut self) {
        self.cache.clear();
    }

    // -- change detection ----------------------------------------------------

    /// Diffs current visibility of every (entity, client) pair against the
    /// committed baseline. Does not commit. Clients are visited in
    /// ascending id order so results are deterministic.
    pub fn compute_changes(&self, entities: &[Entity], clients: &[ClientId]) -> VisibilityChanges {
        let mut changes = VisibilityChanges::default();
        if !self.config.change_tracking {
            return changes;
        }

        let mut clients = clients.to_vec();
        clients.sort_unstable();
        clients.dedup();

        for &entity in entities {
            for &client in &clients {
                let was_visible = self.baseline.contains(&(entity, client));
                let is_visible = self.is_entity_visible_to_client(entity, client);
                let record = VisibilityChangeRecord {
                    entity,
                    client,
                    was_visible,
                    is_visible,
                    tick: self.tick,
                };
                match (was_visible, is_visible) {
                    (false, true) => changes.became_visible.push(record),
                    (true, false) => changes.became_hidden.push(record),
                    _ => changes.unchanged.push((entity, client)),
                }
            }
        }
        changes
    }

    /// Commits a changeset as the new baseline and appends its transitions
    /// to each client's history ring.
    pub fn apply_changes(&mut self, changes: &VisibilityChanges) {
        if !self.config.change_tracking {
            return;
        }

        for record in changes.became_visible.iter().chain(&changes.became_hidden) {
            if record.is_visible {
                self.baseline.insert((record.entity, record.client));
            } else {
                self.baseline.remove(&(record.entity, record.client));
            }

            let ring = self.history.entry(record.client).or_default();
            ring.push_back(*record);
            while ring.len() > self.config.max_history_size {
                ring.pop_front();
            }
        }
    }

    /// Whether the committed baseline has `entity` visible to `client`.
    pub fn was_visible(&self, entity: Entity, client: ClientId) -> bool {
        self.baseline.contains(&(entity, client))
    }

    /// Retained transitions for `client`, oldest first.
    pub fn history(&self, client: ClientId) -> impl Iterator<Item = &VisibilityChangeRecord> {
        self.history.get(&client).into_iter().flatten()
    }

    /// Takes the retained transitions for `client`.
    pub fn drain_history(&mut self, client: ClientId) -> Vec<VisibilityChangeRecord> {
        self.history
            .get_mut(&client)
            .map(|ring| ring.drain(..).collect())
            .unwrap_or_default()
    }

    // -- maintenance ---------------------------------------------------------

    /// Every entity with bookkeeping: explicit entries, global visibility or
    /// a committed baseline. May repeat entities.
    pub fn tracked_entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.included
            .entities()
            .chain(self.excluded.entities())
            .chain(self.global.iter().copied())
            .chain(self.baseline.iter().map(|(entity, _)| *entity))
    }

    /// Forgets every entity not in `still_existing`. Emits no change records.
    /// Returns how many entities were forgotten.
    pub fn cleanup_removed_entities(&mut self, still_existing: &HashSet<Entity>) -> usize {
        let stale: HashSet<Entity> = self
            .tracked_entities()
            .filter(|entity| !still_existing.contains(entity))
            .collect();

        if stale.is_empty() {
            return 0;
        }
        for &entity in &stale {
            self.included.remove_entity(entity);
            self.excluded.remove_entity(entity);
            self.global.remove(&entity);
        }
        self.baseline.retain(|(entity, _)| !stale.contains(entity));
        self.cache.retain(|(entity, _), _| !stale.contains(entity));
        tracing::debug!("visibility forgot {} removed entities", stale.len());
        stale.len()
    }

    /// Forgets every client not in `still_connected`. Emits no change
    /// records. Returns how many clients were forgotten.
    pub fn cleanup_disconnected_clients(&mut self, still_connected: &HashSet<ClientId>) -> usize {
        let stale: HashSet<ClientId> = self
            .included
            .clients()
            .chain(self.excluded.clients())
            .chain(self.history.keys().copied())
            .chain(self.baseline.iter().map(|(_, client)| *client))
            .filter(|client| !still_connected.contains(client))
            .collect();

        if stale.is_empty() {
            return 0;
        }
        for &client in &stale {
            self.included.remove_client(client);
            self.excluded.remove_client(client);
            self.history.remove(&client);
        }
        self.baseline.retain(|(_, client)| !stale.contains(client));
        self.cache.retain(|(_, client), _| !stale.contains(client));
        tracing::debug!("visibility forgot {} disconnected clients", stale.len());
        stale.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn e(index: u32) -> Entity {
        Entity::from_raw(index)
    }

    fn whitelist() -> ClientVisibility {
        ClientVisibility::new(VisibilityConfig {
            policy: VisibilityPolicy::Whitelist,
            default_visible: false,
            ..Default::default()
        })
    }

    #[test]
    fn test_policy_all_sees_everything() {
        let mut vis = ClientVisibility::default();
        assert!(vis.is_entity_visible_to_client(e(1), 1));
        assert!(vis.is_entity_visible_to_client(e(999), 12345));

        vis.set_entity_visibility(e(1), 1, false);
        assert!(vis.is_entity_visible_to_client(e(1), 1));
    }

    #[test]
    fn test_whitelist_hides_unlisted_entities() {
        let mut vis = whitelist();
        assert!(!vis.is_entity_visible_to_client(e(1), 1));
        assert!(!vis.is_entity_visible_to_client(e(1), 2));

        vis.set_entity_visibility(e(1), 1, true);
        assert!(vis.is_entity_visible_to_client(e(1), 1));
        assert!(!vis.is_entity_visible_to_client(e(1), 2));
    }

    #[test]
    fn test_blacklist_hides_only_excluded_clients() {
        let mut vis = ClientVisibility::new(VisibilityConfig {
            policy: VisibilityPolicy::Blacklist,
            ..Default::default()
        });
        vis.set_entity_visibility(e(1), 1, false);
        assert!(!vis.is_entity_visible_to_client(e(1), 1));
        assert!(vis.is_entity_visible_to_client(e(1), 2));

        vis.set_entity_visibility(e(1), 1, true);
        assert!(vis.is_entity_visible_to_client(e(1), 1));
    }

    #[test]
    fn test_default_visible_applies_to_unmanaged_entities() {
        let mut vis = ClientVisibility::new(VisibilityConfig {
            policy: VisibilityPolicy::Whitelist,
            default_visible: true,
            ..Default::default()
        });
        assert!(vis.is_entity_visible_to_client(e(5), 1));

        vis.set_entity_visibility(e(5), 2, true);
        assert!(!vis.is_entity_visible_to_client(e(5), 1));
    }

    #[test]
    fn test_global_visibility_overrides_every_policy() {
        for policy in [
            VisibilityPolicy::All,
            VisibilityPolicy::Blacklist,
            VisibilityPolicy::Whitelist,
        ] {
            let mut vis = ClientVisibility::new(VisibilityConfig {
                policy,
                default_visible: false,
                ..Default::default()
            });
            vis.set_entity_visibility(e(1), 1, false);
            vis.set_entity_global_visibility(e(1), true);
            assert!(vis.is_entity_visible_to_client(e(1), 1), "{policy}");
            assert!(vis.is_entity_visible_to_client(e(1), 77), "{policy}");
        }
    }

    #[test]
    fn test_global_visibility_clears_per_client_entries() {
        let mut vis = whitelist();
        vis.set_entity_visibility(e(1), 1, true);
        vis.set_entity_global_visibility(e(1), true);
        assert_eq!(vis.included_clients(e(1)).count(), 0);

        vis.set_entity_global_visibility(e(1), false);
        assert!(!vis.is_entity_visible_to_client(e(1), 1));
    }

    #[test]
    fn test_indices_stay_consistent_and_reclaim_buckets() {
        let mut vis = whitelist();
        vis.set_entity_visibility(e(1), 1, true);
        vis.set_entity_visibility(e(2), 1, true);
        assert_eq!(vis.included_entities(1).count(), 2);

        vis.set_entity_visibility(e(1), 1, false);
        assert_eq!(vis.included_clients(e(1)).count(), 0);
        assert!(!vis.included.by_entity.contains_key(&e(1)));
        assert_eq!(vis.included_entities(1).collect::<Vec<_>>(), vec![e(2)]);

        vis.set_entity_visibility(e(2), 1, false);
        assert!(!vis.included.by_client.contains_key(&1));
    }

    #[test]
    fn test_compute_changes_is_idempotent_until_applied() {
        let mut vis = whitelist();
        vis.set_entity_visibility(e(1), 1, true);
        let entities = [e(1), e(2)];
        let clients = [1, 2];

        let first = vis.compute_changes(&entities, &clients);
        let second = vis.compute_changes(&entities, &clients);
        assert_eq!(first, second);
        assert_eq!(first.became_visible.len(), 1);
        assert_eq!(first.became_visible[0].entity, e(1));
        assert_eq!(first.became_visible[0].client, 1);
        assert_eq!(first.unchanged.len(), 3);

        vis.apply_changes(&first);
        let third = vis.compute_changes(&entities, &clients);
        assert!(third.is_empty());
    }

    #[test]
    fn test_compute_changes_reports_hidden_transitions() {
        let mut vis = whitelist();
        vis.set_entity_visibility(e(1), 1, true);
        let changes = vis.compute_changes(&[e(1)], &[1]);
        vis.apply_changes(&changes);

        vis.set_entity_visibility(e(1), 1, false);
        let changes = vis.compute_changes(&[e(1)], &[1]);
        assert_eq!(changes.became_hidden.len(), 1);
        assert!(changes.became_hidden[0].was_visible);
        assert!(!changes.became_hidden[0].is_visible);
    }

    #[test]
    fn test_change_tracking_disabled_reports_nothing() {
        let mut vis = whitelist();
        vis.set_change_tracking(false);
        vis.set_entity_visibility(e(1), 1, true);
        let changes = vis.compute_changes(&[e(1)], &[1]);
        assert_eq!(changes, VisibilityChanges::default());
    }

    #[test]
    fn test_history_ring_is_bounded() {
        let mut vis = ClientVisibility::new(VisibilityConfig {
            policy: VisibilityPolicy::Whitelist,
            default_visible: false,
            max_history_size: 4,
            ..Default::default()
        });
        for i in 0..10 {
            vis.set_entity_visibility(e(i), 1, true);
            let changes = vis.compute_changes(&[e(i)], &[1]);
            vis.apply_changes(&changes);
        }
        let history: Vec<_> = vis.history(1).map(|r| r.entity).collect();
        assert_eq!(history, vec![e(6), e(7), e(8), e(9)]);

        assert_eq!(vis.drain_history(1).len(), 4);
        assert_eq!(vis.history(1).count(), 0);
    }

    #[test]
    fn test_cache_hits_within_ttl_and_expires_after() {
        let mut vis = whitelist();
        vis.set_entity_visibility(e(1), 1, true);

        assert!(vis.cached_is_visible(e(1), 1));
        assert!(vis.cached_is_visible(e(1), 1));
        assert_eq!(vis.cache_stats().hits, 1);
        assert_eq!(vis.cache_stats().misses, 1);

        vis.advance_tick(1);
        assert_eq!(vis.cache_stats().entries, 0);
        assert!(vis.cached_is_visible(e(1), 1));
        assert_eq!(vis.cache_stats().misses, 2);
    }

    #[test]
    fn test_set_visibility_invalidates_cache() {
        let mut vis = whitelist();
        assert!(!vis.cached_is_visible(e(1), 1));
        vis.set_entity_visibility(e(1), 1, true);
        assert!(vis.cached_is_visible(e(1), 1));
    }

    #[test]
    fn test_batch_matches_single_queries() {
        let mut vis = whitelist();
        vis.set_entity_visibility(e(1), 1, true);
        vis.set_entity_visibility(e(2), 2, true);

        let pairs: Vec<_> = (0..4).flat_map(|i| [(e(i), 1), (e(i), 2)]).collect();
        let expected: Vec<_> = pairs
            .iter()
            .map(|&(entity, client)| vis.is_entity_visible_to_client(entity, client))
            .collect();
        assert_eq!(vis.batch_is_visible(&pairs), expected);
        assert_eq!(vis.batch_is_visible(&pairs), expected);
        assert_eq!(vis.cache_stats().hits, pairs.len() as u64);
    }

    #[test]
    fn test_cache_respects_max_entries() {
        let mut vis = ClientVisibility::new(VisibilityConfig {
            cache_max_entries: 8,
            cache_ttl_ticks: 100,
            ..Default::default()
        });
        for i in 0..20 {
            vis.cached_is_visible(e(i), 1);
        }
        assert!(vis.cache_stats().entries <= 8);
    }

    #[test]
    fn test_cleanup_removed_entities_emits_no_changes() {
        let mut vis = whitelist();
        vis.set_entity_visibility(e(1), 1, true);
        vis.set_entity_visibility(e(2), 1, true);
        let changes = vis.compute_changes(&[e(1), e(2)], &[1]);
        vis.apply_changes(&changes);
        vis.drain_history(1);

        let still: HashSet<Entity> = [e(2)].into_iter().collect();
        assert_eq!(vis.cleanup_removed_entities(&still), 1);
        assert!(!vis.was_visible(e(1), 1));
        assert!(vis.was_visible(e(2), 1));
        assert_eq!(vis.included_entities(1).collect::<Vec<_>>(), vec![e(2)]);
        assert_eq!(vis.history(1).count(), 0);
    }

    #[test]
    fn test_cleanup_disconnected_clients() {
        let mut vis = whitelist();
        vis.set_entity_visibility(e(1), 1, true);
        vis.set_entity_visibility(e(1), 2, true);
        let changes = vis.compute_changes(&[e(1)], &[1, 2]);
        vis.apply_changes(&changes);

        let still: HashSet<ClientId> = [2].into_iter().collect();
        assert_eq!(vis.cleanup_disconnected_clients(&still), 1);
        assert_eq!(vis.included_clients(e(1)).collect::<Vec<_>>(), vec![2]);
        assert!(!vis.was_visible(e(1), 1));
        assert_eq!(vis.history(1).count(), 0);
        assert_eq!(vis.history(2).count(), 1);
        assert_eq!(vis.cleanup_disconnected_clients(&still), 0);
    }

    #[test]
    fn test_policy_parses_from_str() {
        assert_eq!("Whitelist".parse::<VisibilityPolicy>(), Ok(VisibilityPolicy::Whitelist));
        assert!("everyone".parse::<VisibilityPolicy>().is_err());
    }
}
