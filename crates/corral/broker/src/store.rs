//! Resource descriptor store.
//!
//! The immutable catalog of resource units plus, per unit, the assignment
//! that currently owns it. The catalog never changes after
//! [`DescriptorStore::initialize`]; ownership changes only through
//! [`DescriptorStore::mark`], which is visible to the broker alone and called
//! with its commit lock held.

use std::collections::{BTreeMap, BTreeSet};

use corral_types::{
    AssignmentId, HostTopology, ResourceKind, ResourceUnit, TopologyError, UnitConstraint, UnitId,
};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::{BrokerError, BrokerResult};

/// A unit together with its ownership state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitRecord {
    pub unit: ResourceUnit,

    /// Assignment currently holding the unit.
    pub owner: Option<AssignmentId>,

    /// Bumped on every ownership change; compared at commit time to detect
    /// claims racing on the same unit.
    pub generation: u64,
}

impl UnitRecord {
    pub fn id(&self) -> UnitId {
        self.unit.id
    }

    pub fn is_free(&self) -> bool {
        self.owner.is_none()
    }
}

/// Catalog of resource units and their owners.
#[derive(Debug)]
pub struct DescriptorStore {
    units: RwLock<BTreeMap<UnitId, UnitRecord>>,
}

impl DescriptorStore {
    /// Build the catalog from a host topology.
    pub fn initialize(topology: &HostTopology) -> Result<Self, TopologyError> {
        Self::from_units(topology.units()?)
    }

    /// Build the catalog from an explicit unit list.
    pub fn from_units(units: Vec<ResourceUnit>) -> Result<Self, TopologyError> {
        if units.is_empty() {
            return Err(TopologyError::Empty);
        }

        let mut catalog = BTreeMap::new();
        for unit in units {
            let id = unit.id;
            let record = UnitRecord {
                unit,
                owner: None,
                generation: 0,
            };
            if catalog.insert(id, record).is_some() {
                return Err(TopologyError::DuplicateUnit(id.to_string()));
            }
        }

        Ok(Self {
            units: RwLock::new(catalog),
        })
    }

    /// Units of `kind` matching every constraint, lowest identifier first.
    pub async fn lookup(
        &self,
        kind: ResourceKind,
        constraints: &[UnitConstraint],
    ) -> Vec<UnitRecord> {
        let units = self.units.read().await;
        units
            .values()
            .filter(|r| r.unit.kind() == kind)
            .filter(|r| constraints.iter().all(|c| c.matches(&r.unit)))
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: UnitId) -> Option<UnitRecord> {
        self.units.read().await.get(&id).cloned()
    }

    /// Every unit, lowest identifier first.
    pub async fn all(&self) -> Vec<UnitRecord> {
        self.units.read().await.values().cloned().collect()
    }

    /// Current generation and owner of each unit in `ids`.
    pub async fn generations(
        &self,
        ids: &BTreeSet<UnitId>,
    ) -> BTreeMap<UnitId, (u64, Option<AssignmentId>)> {
        let units = self.units.read().await;
        ids.iter()
            .filter_map(|id| units.get(id).map(|r| (*id, (r.generation, r.owner))))
            .collect()
    }

    /// Move every unit in `ids` from owner `expected` to `owner`.
    ///
    /// All units are checked before any is changed. A unit not currently
    /// owned by `expected` leaves the store untouched and is reported as
    /// corruption.
    pub(crate) async fn mark(
        &self,
        ids: &BTreeSet<UnitId>,
        owner: Option<AssignmentId>,
        expected: Option<AssignmentId>,
    ) -> BrokerResult<()> {
        let mut units = self.units.write().await;

        for id in ids {
            let record = units
                .get(id)
                .ok_or_else(|| BrokerError::StateCorrupted(format!("unknown unit {}", id)))?;
            if record.owner != expected {
                return Err(BrokerError::StateCorrupted(format!(
                    "unit {} owned by {:?}, expected {:?}",
                    id, record.owner, expected
                )));
            }
        }

        for id in ids {
            if let Some(record) = units.get_mut(id) {
                record.owner = owner;
                record.generation += 1;
            }
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.units.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.units.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> DescriptorStore {
        DescriptorStore::from_units(vec![
            ResourceUnit::cpu(3),
            ResourceUnit::cpu(0),
            ResourceUnit::cpu(1),
            ResourceUnit::priority_slot(0, "HIGH", 80),
            ResourceUnit::priority_slot(1, "LOW", 40),
        ])
        .unwrap()
    }

    #[test]
    fn test_initialize_rejects_empty_and_duplicates() {
        assert!(matches!(
            DescriptorStore::from_units(vec![]),
            Err(TopologyError::Empty)
        ));
        assert!(matches!(
            DescriptorStore::from_units(vec![ResourceUnit::cpu(1), ResourceUnit::cpu(1)]),
            Err(TopologyError::DuplicateUnit(_))
        ));
    }

    #[tokio::test]
    async fn test_initialize_from_topology() {
        let topology = HostTopology::from_yaml_str(
            "cpus: [0, 1, 2, 3]\npriority_bands:\n  - name: HIGH\n    priority: 80\n    capacity: 1\nmemory_lock:\n  block_mb: 64\n  blocks: 1\n",
        )
        .unwrap();
        let store = DescriptorStore::initialize(&topology).unwrap();
        assert_eq!(store.len().await, 6);
    }

    #[tokio::test]
    async fn test_lookup_orders_and_filters() {
        let store = store();

        let cpus: Vec<_> = store
            .lookup(ResourceKind::Cpu, &[])
            .await
            .iter()
            .map(|r| r.id())
            .collect();
        assert_eq!(cpus, vec![UnitId::cpu(0), UnitId::cpu(1), UnitId::cpu(3)]);

        let not_zero = store
            .lookup(ResourceKind::Cpu, &[UnitConstraint::exclude([0])])
            .await;
        assert_eq!(not_zero.len(), 2);

        let high = store
            .lookup(ResourceKind::Priority, &[UnitConstraint::band("HIGH")])
            .await;
        assert_eq!(high.len(), 1);
        assert_eq!(high[0].unit.band(), Some("HIGH"));
    }

    #[tokio::test]
    async fn test_mark_bumps_generation() {
        let store = store();
        let owner = AssignmentId::generate();
        let ids = BTreeSet::from([UnitId::cpu(0)]);

        store.mark(&ids, Some(owner), None).await.unwrap();
        let record = store.get(UnitId::cpu(0)).await.unwrap();
        assert_eq!(record.owner, Some(owner));
        assert_eq!(record.generation, 1);

        store.mark(&ids, None, Some(owner)).await.unwrap();
        let record = store.get(UnitId::cpu(0)).await.unwrap();
        assert!(record.is_free());
        assert_eq!(record.generation, 2);
    }

    #[tokio::test]
    async fn test_mark_foreign_owner_is_corruption() {
        let store = store();
        let first = AssignmentId::generate();
        let second = AssignmentId::generate();

        store
            .mark(&BTreeSet::from([UnitId::cpu(1)]), Some(first), None)
            .await
            .unwrap();

        let err = store
            .mark(
                &BTreeSet::from([UnitId::cpu(0), UnitId::cpu(1)]),
                Some(second),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::StateCorrupted(_)));

        // Validation runs before mutation: cpu:0 is untouched.
        assert!(store.get(UnitId::cpu(0)).await.unwrap().is_free());
    }

    #[tokio::test]
    async fn test_mark_unknown_unit_is_corruption() {
        let store = store();
        let err = store
            .mark(&BTreeSet::from([UnitId::cpu(42)]), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::StateCorrupted(_)));
    }
}
