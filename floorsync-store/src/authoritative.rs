//! Authoritative state layer: last server-confirmed record per entity.
//!
//! The only write paths are inbound pushes, reconnect snapshots and explicit
//! server deletions. Each is guarded by the same rule: a version that is not
//! strictly newer than what is stored is dropped, which makes duplicate and
//! reordered delivery harmless.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::types::{AuthoritativeRecord, EntityId, Fields, ServerVersion};

/// Result of an authoritative write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Version not newer than the stored one; nothing changed.
    Stale,
    /// Deletion recorded for an entity with no record. Nothing renders
    /// differently, but an older push can no longer create it.
    Tombstoned,
}

impl ApplyOutcome {
    pub fn is_applied(self) -> bool {
        self == ApplyOutcome::Applied
    }
}

#[derive(Debug, Default)]
pub struct AuthoritativeLayer {
    records: HashMap<EntityId, AuthoritativeRecord>,
    /// Last version of entities the server deleted.
    tombstones: HashMap<EntityId, ServerVersion>,
    dirty: HashSet<EntityId>,
}

impl AuthoritativeLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest version seen for `entity_id`, including deletions.
    pub fn current_version(&self, entity_id: &str) -> ServerVersion {
        self.records
            .get(entity_id)
            .map(|r| r.server_version)
            .or_else(|| self.tombstones.get(entity_id).copied())
            .unwrap_or(ServerVersion::ZERO)
    }

    /// Replace the record for `entity_id` if `version` is newer.
    pub fn apply_server_update(
        &mut self,
        entity_id: &str,
        payload: Fields,
        version: ServerVersion,
        now: Instant,
    ) -> ApplyOutcome {
        let known = self.records.contains_key(entity_id) || self.tombstones.contains_key(entity_id);
        if known && version <= self.current_version(entity_id) {
            log::debug!(
                "Dropping stale update for {entity_id}: {version} <= {}",
                self.current_version(entity_id)
            );
            return ApplyOutcome::Stale;
        }

        self.tombstones.remove(entity_id);
        self.records.insert(
            entity_id.to_string(),
            AuthoritativeRecord {
                entity_id: entity_id.to_string(),
                payload,
                server_version: version,
                last_server_update_at: now,
            },
        );
        self.dirty.insert(entity_id.to_string());
        ApplyOutcome::Applied
    }

    /// Bulk-load after a reconnect. Returns the ids that were applied.
    pub fn replace_snapshot<I>(&mut self, entities: I, now: Instant) -> Vec<EntityId>
    where
        I: IntoIterator<Item = (EntityId, Fields, ServerVersion)>,
    {
        entities
            .into_iter()
            .filter_map(|(entity_id, payload, version)| {
                self.apply_server_update(&entity_id, payload, version, now)
                    .is_applied()
                    .then_some(entity_id)
            })
            .collect()
    }

    /// Delete an entity on explicit server instruction. The tombstone is
    /// kept even when the removal overtook the push that created the entity.
    pub fn remove_entity(&mut self, entity_id: &str, version: ServerVersion) -> ApplyOutcome {
        let known = self.records.contains_key(entity_id) || self.tombstones.contains_key(entity_id);
        if known && version <= self.current_version(entity_id) {
            return ApplyOutcome::Stale;
        }
        self.tombstones.insert(entity_id.to_string(), version);
        if self.records.remove(entity_id).is_none() {
            log::debug!("Tombstoned {entity_id} at {version} before its first push");
            return ApplyOutcome::Tombstoned;
        }
        self.dirty.insert(entity_id.to_string());
        ApplyOutcome::Applied
    }

    pub fn get(&self, entity_id: &str) -> Option<&AuthoritativeRecord> {
        self.records.get(entity_id)
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.records.contains_key(entity_id)
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.records.keys()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Entities changed since the last call.
    pub fn take_dirty(&mut self) -> HashSet<EntityId> {
        std::mem::take(&mut self.dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_first_update_applies() {
        let mut layer = AuthoritativeLayer::new();
        let outcome = layer.apply_server_update(
            "E1",
            fields(json!({"speed": 10})),
            ServerVersion(5),
            Instant::now(),
        );

        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(layer.current_version("E1"), ServerVersion(5));
        assert_eq!(layer.get("E1").unwrap().payload["speed"], 10);
        assert!(layer.take_dirty().contains("E1"));
    }

    #[test]
    fn test_version_zero_accepted_for_unknown_entity() {
        let mut layer = AuthoritativeLayer::new();
        let outcome = layer.apply_server_update(
            "E1",
            Fields::new(),
            ServerVersion::ZERO,
            Instant::now(),
        );
        assert!(outcome.is_applied());
        assert!(layer.contains("E1"));
    }

    #[test]
    fn test_stale_and_duplicate_dropped() {
        let mut layer = AuthoritativeLayer::new();
        let now = Instant::now();
        layer.apply_server_update("E1", fields(json!({"speed": 10})), ServerVersion(5), now);
        layer.take_dirty();

        assert_eq!(
            layer.apply_server_update("E1", fields(json!({"speed": 99})), ServerVersion(5), now),
            ApplyOutcome::Stale
        );
        assert_eq!(
            layer.apply_server_update("E1", fields(json!({"speed": 1})), ServerVersion(4), now),
            ApplyOutcome::Stale
        );

        assert_eq!(layer.get("E1").unwrap().payload["speed"], 10);
        assert!(layer.take_dirty().is_empty());
    }

    #[test]
    fn test_out_of_order_converges() {
        let mut layer = AuthoritativeLayer::new();
        let now = Instant::now();
        layer.apply_server_update("E1", fields(json!({"speed": 3})), ServerVersion(3), now);
        layer.apply_server_update("E1", fields(json!({"speed": 2})), ServerVersion(2), now);

        assert_eq!(layer.get("E1").unwrap().payload["speed"], 3);
    }

    #[test]
    fn test_snapshot_applies_per_entity_rule() {
        let mut layer = AuthoritativeLayer::new();
        let now = Instant::now();
        layer.apply_server_update("E1", fields(json!({"speed": 10})), ServerVersion(8), now);
        layer.take_dirty();

        let applied = layer.replace_snapshot(
            vec![
                ("E1".to_string(), fields(json!({"speed": 1})), ServerVersion(7)),
                ("E2".to_string(), fields(json!({"speed": 2})), ServerVersion(1)),
            ],
            now,
        );

        assert_eq!(applied, vec!["E2".to_string()]);
        assert_eq!(layer.get("E1").unwrap().payload["speed"], 10);
        assert_eq!(layer.len(), 2);
        let dirty = layer.take_dirty();
        assert!(dirty.contains("E2"));
        assert!(!dirty.contains("E1"));
    }

    #[test]
    fn test_remove_leaves_tombstone() {
        let mut layer = AuthoritativeLayer::new();
        let now = Instant::now();
        layer.apply_server_update("E1", fields(json!({"speed": 10})), ServerVersion(5), now);

        assert_eq!(layer.remove_entity("E1", ServerVersion(5)), ApplyOutcome::Stale);
        assert_eq!(layer.remove_entity("E1", ServerVersion(6)), ApplyOutcome::Applied);
        assert!(!layer.contains("E1"));
        assert!(layer.is_empty());

        // A delayed push from before the deletion cannot resurrect it.
        let outcome = layer.apply_server_update(
            "E1",
            fields(json!({"speed": 11})),
            ServerVersion(6),
            now,
        );
        assert_eq!(outcome, ApplyOutcome::Stale);

        let outcome = layer.apply_server_update(
            "E1",
            fields(json!({"speed": 12})),
            ServerVersion(7),
            now,
        );
        assert_eq!(outcome, ApplyOutcome::Applied);
    }

    #[test]
    fn test_remove_unknown_leaves_tombstone_only() {
        let mut layer = AuthoritativeLayer::new();
        assert_eq!(layer.remove_entity("nope", ServerVersion(1)), ApplyOutcome::Tombstoned);
        assert!(layer.take_dirty().is_empty());
        assert!(layer.is_empty());
        assert_eq!(layer.current_version("nope"), ServerVersion(1));
        assert_eq!(layer.remove_entity("nope", ServerVersion(1)), ApplyOutcome::Stale);
    }

    #[test]
    fn test_removal_overtaking_creation_blocks_late_push() {
        let mut layer = AuthoritativeLayer::new();
        let now = Instant::now();

        assert_eq!(layer.remove_entity("press-9", ServerVersion(10)), ApplyOutcome::Tombstoned);
        let late = layer.apply_server_update(
            "press-9",
            fields(json!({"tonnage": 1})),
            ServerVersion(8),
            now,
        );

        assert_eq!(late, ApplyOutcome::Stale);
        assert!(layer.get("press-9").is_none());
        assert!(layer.take_dirty().is_empty());

        // Recreated by the server later on.
        let recreated = layer.apply_server_update(
            "press-9",
            fields(json!({"tonnage": 2})),
            ServerVersion(11),
            now,
        );
        assert_eq!(recreated, ApplyOutcome::Applied);
    }
}
