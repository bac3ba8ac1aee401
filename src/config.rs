//! Immutable configuration snapshots published by the coordinator.
//!
//! A [`Configuration`] is the client's view of the cluster mapping at one
//! instant: which spaces exist, their dimension names, and which entity (and
//! therefore which instance) serves each role. The coordinator revises the
//! mapping at will; the client swaps in each new snapshot atomically and
//! compares already-dispatched operations against it to detect
//! reconfiguration.

use std::collections::HashMap;
use std::hash::Hasher;

use tracing::trace;
use twox_hash::XxHash64;

use crate::search::SearchPredicate;
use crate::types::{EntityId, Instance, SpaceId, NULLSPACE};

/// Placement of one space: dimension names and the entities serving it.
#[derive(Debug, Clone)]
pub struct SpaceLayout {
    /// Cluster-assigned space id.
    pub id: SpaceId,
    /// Ordered dimension names; dimension 0 is the key.
    pub dimensions: Vec<String>,
    /// Entities eligible to lead a point operation, selected by key hash.
    pub point_leaders: Vec<EntityId>,
    /// Entities serving search, grouped by subspace.
    pub subspaces: Vec<Vec<EntityId>>,
}

/// One immutable snapshot of the cluster mapping.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    version: u64,
    space_ids: HashMap<String, SpaceId>,
    spaces: HashMap<SpaceId, SpaceLayout>,
    instances: HashMap<EntityId, Instance>,
}

impl Configuration {
    /// Start building a snapshot.
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder {
            inner: Configuration::default(),
        }
    }

    /// Coordinator-assigned snapshot version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Resolve a space name, or [`NULLSPACE`] if no such space exists.
    pub fn lookup_space(&self, name: &str) -> SpaceId {
        self.space_ids.get(name).copied().unwrap_or(NULLSPACE)
    }

    /// Ordered dimension names of a space.
    pub fn dimensions(&self, space: SpaceId) -> Option<&[String]> {
        self.spaces.get(&space).map(|s| s.dimensions.as_slice())
    }

    /// The entity and instance responsible for point operations on `key`.
    pub fn point_leader(&self, space: SpaceId, key: &[u8]) -> Option<(EntityId, Instance)> {
        let layout = self.spaces.get(&space)?;
        if layout.point_leaders.is_empty() {
            return None;
        }

        let mut hasher = XxHash64::with_seed(0);
        hasher.write(key);
        let slot = (hasher.finish() % layout.point_leaders.len() as u64) as usize;
        let ent = layout.point_leaders[slot];

        let inst = self.instances.get(&ent)?.clone();
        trace!(space, entity = %ent, instance = %inst.inbound, "resolved point leader");
        Some((ent, inst))
    }

    /// Entities a search must visit, optionally restricted to one subspace.
    ///
    /// Which entities can answer a predicate is placement data computed by
    /// the coordinator; the snapshot only enumerates it. Entities with no
    /// instance in this snapshot are skipped. Results are ordered by entity
    /// id so repeated calls visit servers deterministically.
    pub fn search_entities(
        &self,
        space: SpaceId,
        _predicate: &SearchPredicate,
        subspace: Option<u16>,
    ) -> Vec<(EntityId, Instance)> {
        let layout = match self.spaces.get(&space) {
            Some(layout) => layout,
            None => return Vec::new(),
        };

        let groups: Vec<&Vec<EntityId>> = match subspace {
            Some(idx) => layout.subspaces.get(idx as usize).into_iter().collect(),
            None => layout.subspaces.iter().collect(),
        };

        let mut targets: Vec<(EntityId, Instance)> = groups
            .into_iter()
            .flatten()
            .filter_map(|ent| self.instances.get(ent).map(|inst| (*ent, inst.clone())))
            .collect();
        targets.sort_by_key(|(ent, _)| *ent);
        targets.dedup_by_key(|(ent, _)| *ent);
        targets
    }

    /// The instance currently serving an entity.
    pub fn instance_for(&self, ent: EntityId) -> Option<Instance> {
        self.instances.get(&ent).cloned()
    }
}

/// Builder for [`Configuration`] snapshots.
pub struct ConfigurationBuilder {
    inner: Configuration,
}

impl ConfigurationBuilder {
    /// Set the snapshot version.
    pub fn version(mut self, version: u64) -> Self {
        self.inner.version = version;
        self
    }

    /// Register a space under `name`.
    pub fn space(mut self, name: impl Into<String>, layout: SpaceLayout) -> Self {
        assert!(
            !layout.dimensions.is_empty(),
            "a space needs at least its key dimension"
        );
        self.inner.space_ids.insert(name.into(), layout.id);
        self.inner.spaces.insert(layout.id, layout);
        self
    }

    /// Map an entity to the instance serving it.
    pub fn instance(mut self, ent: EntityId, inst: Instance) -> Self {
        self.inner.instances.insert(ent, inst);
        self
    }

    /// Finish the snapshot.
    pub fn build(self) -> Configuration {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn inst(port: u16) -> Instance {
        Instance::new(format!("127.0.0.1:{port}").parse().unwrap(), 1)
    }

    fn sample() -> Configuration {
        let e1 = EntityId::new(1, 0, 1);
        let e2 = EntityId::new(1, 1, 1);
        Configuration::builder()
            .version(5)
            .space(
                "users",
                SpaceLayout {
                    id: 1,
                    dimensions: vec!["id".into(), "name".into()],
                    point_leaders: vec![e1],
                    subspaces: vec![vec![e1], vec![e2]],
                },
            )
            .instance(e1, inst(7001))
            .instance(e2, inst(7002))
            .build()
    }

    #[test]
    fn lookup_space_miss_is_nullspace() {
        let config = sample();
        assert_eq!(config.lookup_space("users"), 1);
        assert_eq!(config.lookup_space("bogus"), NULLSPACE);
    }

    #[test]
    fn point_leader_is_deterministic() {
        let config = sample();
        let (ent, inst_a) = config.point_leader(1, b"42").unwrap();
        let (ent_b, inst_b) = config.point_leader(1, b"42").unwrap();
        assert_eq!(ent, ent_b);
        assert_eq!(inst_a, inst_b);
        assert!(config.point_leader(99, b"42").is_none());
    }

    #[test]
    fn point_leader_requires_instance_mapping() {
        let e1 = EntityId::new(1, 0, 1);
        let config = Configuration::builder()
            .space(
                "users",
                SpaceLayout {
                    id: 1,
                    dimensions: vec!["id".into()],
                    point_leaders: vec![e1],
                    subspaces: vec![],
                },
            )
            .build();
        assert!(config.point_leader(1, b"42").is_none());
    }

    #[test]
    fn search_entities_honors_subspace_hint() {
        let config = sample();
        let pred =
            SearchPredicate::build(&["id".into(), "name".into()], &Map::new(), &Map::new())
                .unwrap();

        let all = config.search_entities(1, &pred, None);
        assert_eq!(all.len(), 2);

        let narrowed = config.search_entities(1, &pred, Some(1));
        assert_eq!(narrowed.len(), 1);
        assert_eq!(narrowed[0].0, EntityId::new(1, 1, 1));

        assert!(config.search_entities(1, &pred, Some(9)).is_empty());
    }

    #[test]
    fn instance_for_reflects_mapping() {
        let config = sample();
        assert_eq!(
            config.instance_for(EntityId::new(1, 0, 1)),
            Some(inst(7001))
        );
        assert_eq!(config.instance_for(EntityId::new(9, 9, 9)), None);
    }
}
