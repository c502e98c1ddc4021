//! Resource requirements declared by clients

use crate::error::RequirementError;
use crate::resource::{ResourceKind, UnitConstraint};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One line of a requirement: `count` units of `kind` satisfying every constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementItem {
    pub kind: ResourceKind,
    pub count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<UnitConstraint>,
}

impl RequirementItem {
    pub fn new(kind: ResourceKind, count: u32) -> Self {
        Self {
            kind,
            count,
            constraints: Vec::new(),
        }
    }

    pub fn with_constraint(mut self, constraint: UnitConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }
}

/// A claim request, e.g. "2 CPU cores, 1 priority slot in band HIGH"
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    #[serde(default)]
    pub items: Vec<RequirementItem>,
}

impl ResourceRequirement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn item(mut self, item: RequirementItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn cpus(self, count: u32) -> Self {
        self.item(RequirementItem::new(ResourceKind::Cpu, count))
    }

    pub fn priority_slots(self, count: u32) -> Self {
        self.item(RequirementItem::new(ResourceKind::Priority, count))
    }

    pub fn priority_in_band(self, band: impl Into<String>, count: u32) -> Self {
        self.item(
            RequirementItem::new(ResourceKind::Priority, count)
                .with_constraint(UnitConstraint::band(band)),
        )
    }

    pub fn memory_blocks(self, count: u32) -> Self {
        self.item(RequirementItem::new(ResourceKind::MemoryLock, count))
    }

    /// Total number of units requested across all items
    pub fn total_units(&self) -> u32 {
        self.items.iter().map(|i| i.count).sum()
    }

    /// Number of units of one kind requested across all items
    pub fn count_of(&self, kind: ResourceKind) -> u32 {
        self.items
            .iter()
            .filter(|i| i.kind == kind)
            .map(|i| i.count)
            .sum()
    }

    pub fn validate(&self) -> Result<(), RequirementError> {
        if self.total_units() == 0 {
            return Err(RequirementError::Empty);
        }

        for item in &self.items {
            for constraint in &item.constraints {
                if matches!(constraint, UnitConstraint::Band { .. })
                    && item.kind != ResourceKind::Priority
                {
                    return Err(RequirementError::ConstraintKindMismatch {
                        kind: item.kind,
                        constraint: format!("{:?}", constraint),
                    });
                }
            }
        }

        Ok(())
    }
}

impl fmt::Display for ResourceRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .items
            .iter()
            .filter(|i| i.count > 0)
            .map(|i| format!("{}x{}", i.count, i.kind))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_counts() {
        let req = ResourceRequirement::new()
            .cpus(2)
            .priority_in_band("HIGH", 1)
            .cpus(1);
        assert_eq!(req.total_units(), 4);
        assert_eq!(req.count_of(ResourceKind::Cpu), 3);
        assert_eq!(req.count_of(ResourceKind::MemoryLock), 0);
        assert!(req.validate().is_ok());
        assert_eq!(req.to_string(), "[2xCPU, 1xPRIORITY, 1xCPU]");
    }

    #[test]
    fn test_empty_requirement_rejected() {
        assert!(matches!(
            ResourceRequirement::new().validate(),
            Err(RequirementError::Empty)
        ));
        assert!(matches!(
            ResourceRequirement::new().cpus(0).validate(),
            Err(RequirementError::Empty)
        ));
    }

    #[test]
    fn test_band_constraint_on_cpu_rejected() {
        let req = ResourceRequirement::new().item(
            RequirementItem::new(ResourceKind::Cpu, 1).with_constraint(UnitConstraint::band("HIGH")),
        );
        assert!(matches!(
            req.validate(),
            Err(RequirementError::ConstraintKindMismatch { .. })
        ));
    }

    #[test]
    fn test_deserialize_from_json() {
        let req: ResourceRequirement = serde_json::from_str(
            r#"{"items":[{"kind":"CPU","count":2,"constraints":[{"type":"exclude_indices","indices":[0]}]}]}"#,
        )
        .unwrap();
        assert_eq!(req.count_of(ResourceKind::Cpu), 2);
        assert_eq!(req.items[0].constraints, vec![UnitConstraint::exclude([0])]);
    }
}
