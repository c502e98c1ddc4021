//! Resource units: the indivisible allocatable items of a host
//!
//! Units are built once from the host topology and never change afterwards.
//! Only their ownership (tracked by the descriptor store) moves.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Kind of an allocatable host resource
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceKind {
    /// One CPU core
    Cpu,
    /// One slot in a real-time priority band
    Priority,
    /// One block of locked-memory quota
    MemoryLock,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Cpu,
        ResourceKind::Priority,
        ResourceKind::MemoryLock,
    ];

    fn prefix(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Priority => "prio",
            ResourceKind::MemoryLock => "mlock",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Cpu => write!(f, "CPU"),
            ResourceKind::Priority => write!(f, "PRIORITY"),
            ResourceKind::MemoryLock => write!(f, "MEMORY_LOCK"),
        }
    }
}

/// Identifier of a resource unit.
///
/// Ordered by kind, then index. "Lowest identifier first" selection relies on
/// this ordering. For CPU units the index is the core id; for priority slots
/// and memory blocks it is the ordinal in topology order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct UnitId {
    pub kind: ResourceKind,
    pub index: u32,
}

impl UnitId {
    pub fn new(kind: ResourceKind, index: u32) -> Self {
        Self { kind, index }
    }

    pub fn cpu(core: u32) -> Self {
        Self::new(ResourceKind::Cpu, core)
    }

    pub fn priority(slot: u32) -> Self {
        Self::new(ResourceKind::Priority, slot)
    }

    pub fn memory_lock(block: u32) -> Self {
        Self::new(ResourceKind::MemoryLock, block)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.prefix(), self.index)
    }
}

/// Kind-specific detail of a unit, used by enforcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitDetail {
    Cpu {
        core: u32,
    },
    Priority {
        band: String,
        /// Real-time priority (1..=99) applied under SCHED_FIFO
        sched_priority: i32,
    },
    MemoryLock {
        bytes: u64,
    },
}

/// An indivisible allocatable host resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUnit {
    pub id: UnitId,

    /// Amount this unit represents: 1 for cores and priority slots, the block
    /// size in bytes for memory-lock blocks.
    pub capacity: u64,

    pub detail: UnitDetail,
}

impl ResourceUnit {
    pub fn cpu(core: u32) -> Self {
        Self {
            id: UnitId::cpu(core),
            capacity: 1,
            detail: UnitDetail::Cpu { core },
        }
    }

    pub fn priority_slot(slot: u32, band: impl Into<String>, sched_priority: i32) -> Self {
        Self {
            id: UnitId::priority(slot),
            capacity: 1,
            detail: UnitDetail::Priority {
                band: band.into(),
                sched_priority,
            },
        }
    }

    pub fn memory_block(block: u32, bytes: u64) -> Self {
        Self {
            id: UnitId::memory_lock(block),
            capacity: bytes,
            detail: UnitDetail::MemoryLock { bytes },
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.id.kind
    }

    /// Name of the priority band, for priority slots
    pub fn band(&self) -> Option<&str> {
        match &self.detail {
            UnitDetail::Priority { band, .. } => Some(band.as_str()),
            _ => None,
        }
    }
}

/// Constraint narrowing which units of a kind may satisfy a requirement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitConstraint {
    /// Unit index must not be in the set (e.g. "CPU core not in S")
    ExcludeIndices { indices: BTreeSet<u32> },

    /// Unit index must be in the set
    OnlyIndices { indices: BTreeSet<u32> },

    /// Priority slot must belong to the named band
    Band { name: String },
}

impl UnitConstraint {
    pub fn matches(&self, unit: &ResourceUnit) -> bool {
        match self {
            UnitConstraint::ExcludeIndices { indices } => !indices.contains(&unit.id.index),
            UnitConstraint::OnlyIndices { indices } => indices.contains(&unit.id.index),
            UnitConstraint::Band { name } => unit.band() == Some(name.as_str()),
        }
    }

    pub fn exclude(indices: impl IntoIterator<Item = u32>) -> Self {
        UnitConstraint::ExcludeIndices {
            indices: indices.into_iter().collect(),
        }
    }

    pub fn only(indices: impl IntoIterator<Item = u32>) -> Self {
        UnitConstraint::OnlyIndices {
            indices: indices.into_iter().collect(),
        }
    }

    pub fn band(name: impl Into<String>) -> Self {
        UnitConstraint::Band { name: name.into() }
    }
}
