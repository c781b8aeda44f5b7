//! Entity state replication.
//!
//! [`StateSync`] owns the entity map. Entities registered through
//! [`register_entity`](StateSync::register_entity) are locally owned: their
//! changes are staged by [`update_entity`](StateSync::update_entity) and drained
//! into one `state_delta` per sync tick by
//! [`flush_changes`](StateSync::flush_changes). Incoming snapshots and deltas are
//! applied to remote entities directly; for locally owned entities they are
//! applied only under [`SyncStrategy::Authoritative`].
//!
//! Every simulation [`tick`](StateSync::tick) records a snapshot in a ring of
//! `max_history_frames` slots indexed by `frame % len`, which
//! [`rollback_to_frame`](StateSync::rollback_to_frame) restores from.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, trace};

use crate::config::{SyncConfig, SyncStrategy};
use crate::event::Effects;
use crate::protocol::{
    now_millis, ChangeOperation, Components, EntityChange, EntityId, Message, PlayerId,
    StateDeltaPayload, StateSyncPayload,
};

/// A replicated entity.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedEntity {
    pub id: EntityId,
    pub owner_id: PlayerId,
    pub components: Components,
    /// Milliseconds since the Unix epoch of the last applied change.
    pub last_update: u64,
    /// Incremented on every applied change, local or remote.
    pub version: u64,
}

impl SyncedEntity {
    fn new(id: EntityId, owner_id: PlayerId, components: Components) -> Self {
        Self {
            id,
            owner_id,
            components,
            last_update: now_millis(),
            version: 1,
        }
    }

    fn merge(&mut self, components: Components) {
        self.components.extend(components);
        self.touch();
    }

    fn replace(&mut self, components: Components) {
        self.components = components;
        self.touch();
    }

    fn touch(&mut self) {
        self.version += 1;
        self.last_update = now_millis();
    }
}

/// Entity map recorded by one [`StateSync::tick`].
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSnapshot {
    pub frame: u64,
    pub entities: HashMap<EntityId, SyncedEntity>,
    /// Ids this client owned at `frame`.
    pub local: HashSet<EntityId>,
}

/// The entity replication engine.
#[derive(Debug)]
pub struct StateSync {
    config: SyncConfig,
    local_player: Option<PlayerId>,
    entities: HashMap<EntityId, SyncedEntity>,
    local: HashSet<EntityId>,
    staged: BTreeMap<EntityId, Components>,
    current_frame: u64,
    last_sent_frame: u64,
    history: Vec<Option<FrameSnapshot>>,
}

impl StateSync {
    pub fn new(config: SyncConfig) -> Self {
        let slots = config.max_history_frames.max(1);
        Self {
            config,
            local_player: None,
            entities: HashMap::new(),
            local: HashSet::new(),
            staged: BTreeMap::new(),
            current_frame: 0,
            last_sent_frame: 0,
            history: vec![None; slots],
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Set the local player id. Local entities registered before the id was
    /// known are re-owned.
    pub fn set_local_player(&mut self, player_id: impl Into<PlayerId>) {
        let player_id = player_id.into();
        for id in &self.local {
            if let Some(entity) = self.entities.get_mut(id) {
                if entity.owner_id.is_empty() {
                    entity.owner_id.clone_from(&player_id);
                }
            }
        }
        self.local_player = Some(player_id);
    }

    /// Restrict components to the configured allow-list. An empty list
    /// allows everything.
    fn wire_components(&self, components: &Components) -> Components {
        if self.config.sync_components.is_empty() {
            return components.clone();
        }
        components
            .iter()
            .filter(|(name, _)| self.config.sync_components.iter().any(|c| c == *name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    // ── Local entities ──────────────────────────────────────────────

    /// Register a locally owned entity and announce it with `entity_spawn`.
    /// Registering an existing id takes ownership of it and replaces its
    /// components.
    pub fn register_entity(&mut self, id: &str, components: Components, fx: &mut Effects) {
        let owner_id = self.local_player.clone().unwrap_or_default();
        let wire = self.wire_components(&components);

        match self.entities.get_mut(id) {
            Some(existing) => {
                existing.owner_id.clone_from(&owner_id);
                existing.replace(components);
            }
            None => {
                self.entities.insert(
                    id.to_owned(),
                    SyncedEntity::new(id.to_owned(), owner_id.clone(), components),
                );
            }
        }
        self.local.insert(id.to_owned());
        debug!(entity_id = id, "registered local entity");

        fx.send(Message::EntitySpawn {
            entity_id: id.to_owned(),
            owner_id,
            components: wire,
        });
    }

    /// Remove a locally owned entity and announce it with `entity_destroy`.
    /// Returns `false` if the entity is not locally owned.
    pub fn unregister_entity(&mut self, id: &str, fx: &mut Effects) -> bool {
        if !self.local.remove(id) {
            return false;
        }
        self.entities.remove(id);
        self.staged.remove(id);
        debug!(entity_id = id, "unregistered local entity");
        fx.send(Message::EntityDestroy {
            entity_id: id.to_owned(),
        });
        true
    }

    /// Merge components into an entity. For a locally owned entity the
    /// allow-listed fields are staged for the next sync tick. Returns `false`
    /// if the entity is unknown.
    pub fn update_entity(&mut self, id: &str, components: Components) -> bool {
        let wire = self.wire_components(&components);
        let Some(entity) = self.entities.get_mut(id) else {
            return false;
        };
        entity.merge(components);

        if self.local.contains(id) && !wire.is_empty() {
            self.staged.entry(id.to_owned()).or_default().extend(wire);
        }
        true
    }

    /// Drain staged changes into a `state_delta`. Returns `None` when nothing
    /// is staged.
    pub fn flush_changes(&mut self) -> Option<Message> {
        if self.staged.is_empty() {
            return None;
        }
        let changes = std::mem::take(&mut self.staged)
            .into_iter()
            .map(|(entity_id, components)| EntityChange {
                entity_id,
                operation: ChangeOperation::Update,
                components: Some(components),
                owner_id: None,
            })
            .collect::<Vec<_>>();

        let delta = StateDeltaPayload {
            frame: self.current_frame,
            base_frame: self.last_sent_frame,
            changes,
        };
        trace!(frame = delta.frame, changes = delta.changes.len(), "flushing state delta");
        self.last_sent_frame = self.current_frame;
        Some(Message::StateDelta(delta))
    }

    // ── Incoming ────────────────────────────────────────────────────

    /// Whether a remote change may touch this entity.
    fn accepts(&self, id: &str) -> bool {
        !self.local.contains(id) || self.config.strategy == SyncStrategy::Authoritative
    }

    /// Apply a full snapshot. Locally owned entities are never overwritten.
    pub fn handle_state_sync(&mut self, snapshot: StateSyncPayload) {
        for remote in snapshot.entities {
            if self.local.contains(&remote.id) {
                continue;
            }
            match self.entities.get_mut(&remote.id) {
                Some(entity) => {
                    entity.owner_id = remote.owner_id;
                    entity.replace(remote.components);
                }
                None => {
                    self.entities.insert(
                        remote.id.clone(),
                        SyncedEntity::new(remote.id, remote.owner_id, remote.components),
                    );
                }
            }
        }
        self.current_frame = self.current_frame.max(snapshot.frame);
    }

    /// Apply a delta, change by change in order.
    pub fn handle_state_delta(&mut self, delta: StateDeltaPayload) {
        for change in delta.changes {
            self.apply_change(change);
        }
    }

    fn apply_change(&mut self, change: EntityChange) {
        let EntityChange {
            entity_id,
            operation,
            components,
            owner_id,
        } = change;

        if !self.accepts(&entity_id) {
            trace!(entity_id = %entity_id, ?operation, "ignoring remote change to local entity");
            return;
        }

        match operation {
            ChangeOperation::Create => {
                let components = components.unwrap_or_default();
                match self.entities.get_mut(&entity_id) {
                    Some(entity) => {
                        if let Some(owner_id) = owner_id {
                            entity.owner_id = owner_id;
                        }
                        entity.replace(components);
                    }
                    None => {
                        self.entities.insert(
                            entity_id.clone(),
                            SyncedEntity::new(entity_id, owner_id.unwrap_or_default(), components),
                        );
                    }
                }
            }
            ChangeOperation::Update => {
                self.apply_update(&entity_id, components.unwrap_or_default(), owner_id);
            }
            ChangeOperation::Delete => self.remove_remote(&entity_id),
        }
    }

    fn apply_update(&mut self, id: &str, components: Components, owner_id: Option<PlayerId>) {
        match self.entities.get_mut(id) {
            Some(entity) => {
                if let Some(owner_id) = owner_id {
                    entity.owner_id = owner_id;
                }
                entity.merge(components);
            }
            None => {
                self.entities.insert(
                    id.to_owned(),
                    SyncedEntity::new(id.to_owned(), owner_id.unwrap_or_default(), components),
                );
            }
        }
    }

    fn remove_remote(&mut self, id: &str) {
        self.entities.remove(id);
        if self.local.remove(id) {
            self.staged.remove(id);
            debug!(entity_id = id, "local entity removed by authority");
        }
    }

    /// Apply an `entity_update`.
    pub fn handle_entity_update(
        &mut self,
        entity_id: &str,
        components: Components,
        owner_id: Option<PlayerId>,
    ) {
        if self.accepts(entity_id) {
            self.apply_update(entity_id, components, owner_id);
        }
    }

    /// Apply an `entity_spawn`. The echo of a local registration is ignored.
    pub fn handle_entity_spawn(
        &mut self,
        entity_id: &str,
        owner_id: PlayerId,
        components: Components,
    ) {
        if self.local.contains(entity_id) {
            return;
        }
        self.apply_change(EntityChange {
            entity_id: entity_id.to_owned(),
            operation: ChangeOperation::Create,
            components: Some(components),
            owner_id: Some(owner_id),
        });
    }

    /// Apply an `entity_destroy`.
    pub fn handle_entity_destroy(&mut self, entity_id: &str) {
        if self.accepts(entity_id) {
            self.remove_remote(entity_id);
        }
    }

    // ── History ─────────────────────────────────────────────────────

    fn slot(&self, frame: u64) -> usize {
        // len() is at least 1
        (frame % self.history.len() as u64) as usize
    }

    /// Advance the simulation frame and record the entity map for it.
    pub fn tick(&mut self) -> u64 {
        self.current_frame += 1;
        let frame = self.current_frame;
        let slot = self.slot(frame);
        if let Some(entry) = self.history.get_mut(slot) {
            *entry = Some(FrameSnapshot {
                frame,
                entities: self.entities.clone(),
                local: self.local.clone(),
            });
        }
        frame
    }

    /// The snapshot recorded for `frame`, if it is still in the window.
    pub fn snapshot(&self, frame: u64) -> Option<&FrameSnapshot> {
        self.history
            .get(self.slot(frame))?
            .as_ref()
            .filter(|snapshot| snapshot.frame == frame)
    }

    /// Restore the entity map recorded at `frame` and make it the current
    /// frame. Staged changes are discarded. Returns `false`, leaving state
    /// untouched, if the frame is no longer in the history window.
    pub fn rollback_to_frame(&mut self, frame: u64) -> bool {
        let Some(snapshot) = self.snapshot(frame) else {
            debug!(frame, current = self.current_frame, "rollback frame not in history");
            return false;
        };
        let entities = snapshot.entities.clone();
        let local = snapshot.local.clone();
        self.entities = entities;
        self.local = local;
        self.staged.clear();
        self.current_frame = frame;
        debug!(frame, "rolled back");
        true
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn entity(&self, id: &str) -> Option<&SyncedEntity> {
        self.entities.get(id)
    }

    pub fn all_entities(&self) -> impl Iterator<Item = &SyncedEntity> {
        self.entities.values()
    }

    pub fn player_entities<'a>(
        &'a self,
        player_id: &'a str,
    ) -> impl Iterator<Item = &'a SyncedEntity> + 'a {
        self.entities
            .values()
            .filter(move |entity| entity.owner_id == player_id)
    }

    pub fn is_local(&self, id: &str) -> bool {
        self.local.contains(id)
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    pub fn has_staged_changes(&self) -> bool {
        !self.staged.is_empty()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::EntitySnapshot;
    use serde_json::{json, Value};

    fn comps(value: Value) -> Components {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn sync(strategy: SyncStrategy) -> StateSync {
        let mut sync = StateSync::new(SyncConfig {
            strategy,
            ..SyncConfig::default()
        });
        sync.set_local_player("me");
        sync
    }

    fn delta(
        entity: &str,
        operation: ChangeOperation,
        components: Option<Value>,
    ) -> StateDeltaPayload {
        StateDeltaPayload {
            frame: 10,
            base_frame: 9,
            changes: vec![EntityChange {
                entity_id: entity.into(),
                operation,
                components: components.map(comps),
                owner_id: Some("them".into()),
            }],
        }
    }

    #[test]
    fn register_sends_spawn_and_update_stages_allowed_fields() {
        let mut sync = StateSync::new(SyncConfig {
            sync_components: vec!["x".into()],
            ..SyncConfig::default()
        });
        let mut fx = Effects::new();
        sync.register_entity("p1", comps(json!({"x": 0})), &mut fx);
        assert!(matches!(
            fx.messages.as_slice(),
            [Message::EntitySpawn { entity_id, .. }] if entity_id == "p1"
        ));
        assert!(!sync.has_staged_changes());

        assert!(sync.update_entity("p1", comps(json!({"x": 5}))));

        let Some(Message::StateDelta(delta)) = sync.flush_changes() else {
            panic!("expected a state_delta");
        };
        assert_eq!(
            delta.changes,
            vec![EntityChange {
                entity_id: "p1".into(),
                operation: ChangeOperation::Update,
                components: Some(comps(json!({"x": 5}))),
                owner_id: None,
            }]
        );
        assert!(sync.flush_changes().is_none(), "nothing staged after flush");
    }

    #[test]
    fn allow_list_filters_wire_fields_but_not_local_state() {
        let mut sync = StateSync::new(SyncConfig {
            sync_components: vec!["x".into()],
            ..SyncConfig::default()
        });
        let mut fx = Effects::new();
        sync.register_entity("p1", comps(json!({"x": 0, "hp": 10})), &mut fx);
        let [Message::EntitySpawn { components, .. }] = fx.messages.as_slice() else {
            panic!("expected spawn");
        };
        assert_eq!(components, &comps(json!({"x": 0})));

        sync.update_entity("p1", comps(json!({"hp": 3})));
        assert!(sync.flush_changes().is_none());
        assert_eq!(sync.entity("p1").unwrap().components["hp"], json!(3));
    }

    #[test]
    fn staged_changes_coalesce_per_entity() {
        let mut sync = sync(SyncStrategy::ClientPrediction);
        let mut fx = Effects::new();
        sync.register_entity("a", comps(json!({"x": 0})), &mut fx);
        sync.update_entity("a", comps(json!({"x": 1})));
        sync.update_entity("a", comps(json!({"y": 2})));
        sync.update_entity("a", comps(json!({"x": 3})));
        let Some(Message::StateDelta(delta)) = sync.flush_changes() else {
            panic!()
        };
        assert_eq!(delta.changes.len(), 1);
        assert_eq!(delta.changes[0].components, Some(comps(json!({"x": 3, "y": 2}))));
    }

    #[test]
    fn version_increments_on_every_applied_update() {
        let mut sync = sync(SyncStrategy::ClientPrediction);
        let mut fx = Effects::new();
        sync.register_entity("a", comps(json!({"x": 0})), &mut fx);
        let v0 = sync.entity("a").unwrap().version;
        sync.update_entity("a", comps(json!({"x": 1})));
        sync.update_entity("a", comps(json!({"x": 2})));
        assert_eq!(sync.entity("a").unwrap().version, v0 + 2);

        sync.handle_state_delta(delta("r", ChangeOperation::Create, Some(json!({"x": 0}))));
        let r0 = sync.entity("r").unwrap().version;
        sync.handle_state_delta(delta("r", ChangeOperation::Update, Some(json!({"x": 1}))));
        assert_eq!(sync.entity("r").unwrap().version, r0 + 1);
    }

    #[test]
    fn update_of_unknown_entity_is_rejected() {
        let mut sync = sync(SyncStrategy::ClientPrediction);
        assert!(!sync.update_entity("ghost", comps(json!({"x": 1}))));
    }

    #[test]
    fn client_prediction_ignores_remote_changes_to_local_entity() {
        let mut sync = sync(SyncStrategy::ClientPrediction);
        let mut fx = Effects::new();
        sync.register_entity("e1", comps(json!({"x": 1})), &mut fx);
        let before = sync.entity("e1").cloned().unwrap();

        sync.handle_state_delta(delta("e1", ChangeOperation::Update, Some(json!({"x": 99}))));
        sync.handle_entity_update("e1", comps(json!({"x": 42})), None);
        sync.handle_entity_destroy("e1");

        assert_eq!(sync.entity("e1"), Some(&before));
    }

    #[test]
    fn lockstep_ignores_remote_changes_to_local_entity() {
        let mut sync = sync(SyncStrategy::Lockstep);
        let mut fx = Effects::new();
        sync.register_entity("e1", comps(json!({"x": 1})), &mut fx);
        sync.handle_state_delta(delta("e1", ChangeOperation::Update, Some(json!({"x": 99}))));
        assert_eq!(sync.entity("e1").unwrap().components["x"], json!(1));
    }

    #[test]
    fn authoritative_snaps_local_entity_to_remote_state() {
        let mut sync = sync(SyncStrategy::Authoritative);
        let mut fx = Effects::new();
        sync.register_entity("e1", comps(json!({"x": 1, "y": 1})), &mut fx);
        sync.handle_state_delta(delta("e1", ChangeOperation::Update, Some(json!({"x": 99}))));
        let entity = sync.entity("e1").unwrap();
        assert_eq!(entity.components["x"], json!(99));
        assert_eq!(entity.components["y"], json!(1));
        assert!(sync.is_local("e1"));
    }

    #[test]
    fn remote_entities_follow_create_update_delete() {
        let mut sync = sync(SyncStrategy::ClientPrediction);
        sync.handle_state_delta(delta("r1", ChangeOperation::Create, Some(json!({"x": 1}))));
        assert_eq!(sync.entity("r1").unwrap().owner_id, "them");
        sync.handle_state_delta(delta("r1", ChangeOperation::Update, Some(json!({"x": 2}))));
        assert_eq!(sync.entity("r1").unwrap().components["x"], json!(2));
        sync.handle_state_delta(delta("r1", ChangeOperation::Delete, None));
        assert!(sync.entity("r1").is_none());
    }

    #[test]
    fn state_sync_never_overwrites_local_entities() {
        let mut sync = sync(SyncStrategy::Authoritative);
        let mut fx = Effects::new();
        sync.register_entity("mine", comps(json!({"x": 1})), &mut fx);
        sync.handle_state_sync(StateSyncPayload {
            frame: 50,
            entities: vec![
                EntitySnapshot {
                    id: "mine".into(),
                    owner_id: "server".into(),
                    components: comps(json!({"x": 100})),
                },
                EntitySnapshot {
                    id: "theirs".into(),
                    owner_id: "them".into(),
                    components: comps(json!({"x": 7})),
                },
            ],
            checksum: None,
        });
        assert_eq!(sync.entity("mine").unwrap().components["x"], json!(1));
        assert_eq!(sync.entity("theirs").unwrap().components["x"], json!(7));
        assert_eq!(sync.current_frame(), 50);
    }

    #[test]
    fn spawn_echo_of_local_entity_is_ignored() {
        let mut sync = sync(SyncStrategy::Authoritative);
        let mut fx = Effects::new();
        sync.register_entity("mine", comps(json!({"x": 1})), &mut fx);
        sync.handle_entity_spawn("mine", "me".into(), comps(json!({"x": 0})));
        assert_eq!(sync.entity("mine").unwrap().components["x"], json!(1));

        sync.handle_entity_spawn("theirs", "them".into(), comps(json!({"hp": 3})));
        let owned: Vec<_> = sync.player_entities("them").map(|e| e.id.as_str()).collect();
        assert_eq!(owned, vec!["theirs"]);
    }

    #[test]
    fn unregister_sends_destroy_and_drops_staged_changes() {
        let mut sync = sync(SyncStrategy::ClientPrediction);
        let mut fx = Effects::new();
        sync.register_entity("a", comps(json!({"x": 0})), &mut fx);
        sync.update_entity("a", comps(json!({"x": 1})));
        assert!(sync.unregister_entity("a", &mut fx));
        assert!(matches!(
            fx.messages.last(),
            Some(Message::EntityDestroy { entity_id }) if entity_id == "a"
        ));
        assert!(sync.flush_changes().is_none());
        assert!(!sync.unregister_entity("a", &mut fx));
    }

    #[test]
    fn entities_registered_before_welcome_are_reowned() {
        let mut sync = StateSync::new(SyncConfig::default());
        let mut fx = Effects::new();
        sync.register_entity("a", Components::new(), &mut fx);
        assert_eq!(sync.entity("a").unwrap().owner_id, "");
        sync.set_local_player("p7");
        assert_eq!(sync.player_entities("p7").count(), 1);
    }

    #[test]
    fn delta_frames_track_ticks() {
        let mut sync = sync(SyncStrategy::ClientPrediction);
        let mut fx = Effects::new();
        sync.register_entity("a", comps(json!({"x": 0})), &mut fx);
        sync.tick();
        sync.tick();
        sync.update_entity("a", comps(json!({"x": 1})));
        let Some(Message::StateDelta(first)) = sync.flush_changes() else {
            panic!()
        };
        assert_eq!((first.frame, first.base_frame), (2, 0));
        sync.tick();
        sync.update_entity("a", comps(json!({"x": 2})));
        let Some(Message::StateDelta(second)) = sync.flush_changes() else {
            panic!()
        };
        assert_eq!((second.frame, second.base_frame), (3, 2));
    }

    #[test]
    fn rollback_restores_recorded_map() {
        let mut sync = sync(SyncStrategy::ClientPrediction);
        let mut fx = Effects::new();
        sync.register_entity("a", comps(json!({"x": 0})), &mut fx);
        let frame = sync.tick();
        let recorded = sync.snapshot(frame).unwrap().entities.clone();

        sync.update_entity("a", comps(json!({"x": 50})));
        sync.register_entity("b", comps(json!({"y": 1})), &mut fx);
        sync.tick();

        assert!(sync.rollback_to_frame(frame));
        assert_eq!(sync.current_frame(), frame);
        assert_eq!(sync.all_entities().count(), recorded.len());
        assert_eq!(sync.entity("a"), recorded.get("a"));
        assert!(!sync.is_local("b"));
        assert!(!sync.has_staged_changes());
    }

    #[test]
    fn rollback_restores_ownership_of_removed_local_entity() {
        let mut sync = sync(SyncStrategy::ClientPrediction);
        let mut fx = Effects::new();
        sync.register_entity("p1", comps(json!({"x": 0})), &mut fx);
        let frame = sync.tick();
        assert!(sync.unregister_entity("p1", &mut fx));
        assert!(!sync.is_local("p1"));

        assert!(sync.rollback_to_frame(frame));
        assert!(sync.is_local("p1"));
        assert!(sync.update_entity("p1", comps(json!({"x": 7}))));
        let Some(Message::StateDelta(delta)) = sync.flush_changes() else {
            panic!("expected a delta for the restored local entity")
        };
        assert_eq!(delta.changes.len(), 1);
        assert_eq!(delta.changes[0].entity_id, "p1");
        assert_eq!(delta.changes[0].components, Some(comps(json!({"x": 7}))));

        // Remote deltas no longer overwrite it under prediction.
        sync.handle_state_delta(self::delta("p1", ChangeOperation::Update, Some(json!({"x": 99}))));
        assert_eq!(sync.entity("p1").unwrap().components["x"], 7);
    }

    #[test]
    fn rollback_past_window_fails_and_leaves_state() {
        let mut sync = StateSync::new(SyncConfig {
            max_history_frames: 4,
            ..SyncConfig::default()
        });
        let mut fx = Effects::new();
        sync.register_entity("a", comps(json!({"x": 0})), &mut fx);
        for _ in 0..10 {
            sync.tick();
        }
        sync.update_entity("a", comps(json!({"x": 9})));
        let before: Vec<SyncedEntity> = sync.all_entities().cloned().collect();

        assert!(!sync.rollback_to_frame(3), "frame 3 evicted by frame 7");
        assert!(!sync.rollback_to_frame(11), "future frame");
        assert_eq!(sync.current_frame(), 10);
        let after: Vec<SyncedEntity> = sync.all_entities().cloned().collect();
        assert_eq!(before, after);

        assert!(sync.rollback_to_frame(7));
    }
}
