//! Host topology description
//!
//! The topology is read once at startup (YAML) and turned into the immutable
//! catalog of resource units. Anything malformed is a startup-fatal
//! [`TopologyError`].
//!
//! ```yaml
//! cpus: [0, 1, 2, 3]
//! priority_bands:
//!   - name: HIGH
//!     priority: 80
//!     capacity: 1
//! memory_lock:
//!   block_mb: 64
//!   blocks: 1
//! manager_cpu: 5
//! hugepages:
//!   size_kb: 2048
//!   count: 128
//! ```

use crate::error::TopologyError;
use crate::resource::{ResourceUnit, UnitId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Lowest and highest SCHED_FIFO priorities accepted by Linux
pub const MIN_RT_PRIORITY: i32 = 1;
pub const MAX_RT_PRIORITY: i32 = 99;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Description of the allocatable resources of the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostTopology {
    /// CPU cores that may be handed to clients
    #[serde(default)]
    pub cpus: Vec<u32>,

    /// Real-time priority bands, each with a number of slots
    #[serde(default)]
    pub priority_bands: Vec<PriorityBandSpec>,

    /// Locked-memory budget, split in equally sized blocks
    #[serde(default)]
    pub memory_lock: Option<MemoryLockSpec>,

    /// Core the manager pins itself to (never allocatable)
    #[serde(default)]
    pub manager_cpu: Option<u32>,

    /// Hugepages to reserve at startup
    #[serde(default)]
    pub hugepages: Option<HugepagesSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PriorityBandSpec {
    pub name: String,
    /// SCHED_FIFO priority (1..=99)
    pub priority: i32,
    /// Number of slots in the band
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryLockSpec {
    pub block_mb: u64,
    pub blocks: u32,
}

impl MemoryLockSpec {
    /// Bytes per block, `None` if it does not fit in a `u64`.
    pub fn block_bytes(&self) -> Option<u64> {
        self.block_mb.checked_mul(BYTES_PER_MB)
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.block_bytes()?.checked_mul(u64::from(self.blocks))
    }
}

/// Hugepage size options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HugepageSize {
    /// 2MB hugepages (2048 KB)
    Size2MB,
    /// 1GB hugepages (1048576 KB)
    Size1GB,
}

impl HugepageSize {
    /// Sysfs knob controlling the pool size for this hugepage size
    pub fn sysfs_path(&self) -> &'static str {
        match self {
            HugepageSize::Size2MB => "/sys/kernel/mm/hugepages/hugepages-2048kB/nr_hugepages",
            HugepageSize::Size1GB => "/sys/kernel/mm/hugepages/hugepages-1048576kB/nr_hugepages",
        }
    }

    pub fn size_kb(&self) -> u32 {
        match self {
            HugepageSize::Size2MB => 2048,
            HugepageSize::Size1GB => 1_048_576,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HugepagesSpec {
    /// 2048 for 2MB pages, 1048576 for 1GB pages
    pub size_kb: u32,
    pub count: u32,
}

impl HugepagesSpec {
    pub fn size(&self) -> Result<HugepageSize, TopologyError> {
        match self.size_kb {
            2048 => Ok(HugepageSize::Size2MB),
            1_048_576 => Ok(HugepageSize::Size1GB),
            other => Err(TopologyError::Invalid(format!(
                "invalid hugepage size: {}kB, must be 2048 (2MB) or 1048576 (1GB)",
                other
            ))),
        }
    }
}

impl HostTopology {
    /// Load and validate a topology from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TopologyError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| TopologyError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Parse and validate a topology from YAML text
    pub fn from_yaml_str(contents: &str) -> Result<Self, TopologyError> {
        let topology: HostTopology = serde_yaml::from_str(contents)?;
        topology.validate()?;
        Ok(topology)
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        self.units().map(|_| ())
    }

    /// Build the unit catalog, in identifier order within each kind.
    ///
    /// Priority slots are numbered in band declaration order, so bands
    /// declared first are preferred by lowest-identifier selection.
    pub fn units(&self) -> Result<Vec<ResourceUnit>, TopologyError> {
        let mut units = Vec::new();
        let mut seen = HashSet::new();

        let mut cpus = self.cpus.clone();
        cpus.sort_unstable();
        for core in cpus {
            if !seen.insert(UnitId::cpu(core)) {
                return Err(TopologyError::DuplicateUnit(UnitId::cpu(core).to_string()));
            }
            if self.manager_cpu == Some(core) {
                return Err(TopologyError::ManagerCoreAllocatable(core));
            }
            units.push(ResourceUnit::cpu(core));
        }

        let mut band_names = HashSet::new();
        let mut slot = 0u32;
        for band in &self.priority_bands {
            if band.name.is_empty() {
                return Err(TopologyError::Invalid(
                    "priority band name cannot be empty".to_string(),
                ));
            }
            if !band_names.insert(band.name.as_str()) {
                return Err(TopologyError::DuplicateBand(band.name.clone()));
            }
            if !(MIN_RT_PRIORITY..=MAX_RT_PRIORITY).contains(&band.priority) {
                return Err(TopologyError::InvalidPriority {
                    band: band.name.clone(),
                    priority: band.priority,
                });
            }
            if band.capacity == 0 {
                return Err(TopologyError::Invalid(format!(
                    "priority band '{}' must have capacity greater than 0",
                    band.name
                )));
            }
            for _ in 0..band.capacity {
                units.push(ResourceUnit::priority_slot(slot, &band.name, band.priority));
                slot = slot.checked_add(1).ok_or_else(|| {
                    TopologyError::Invalid("too many priority slots".to_string())
                })?;
            }
        }

        if let Some(mlock) = &self.memory_lock {
            if mlock.block_mb == 0 || mlock.blocks == 0 {
                return Err(TopologyError::Invalid(
                    "memory_lock block_mb and blocks must be greater than 0".to_string(),
                ));
            }
            let block_bytes = mlock.total_bytes().and(mlock.block_bytes()).ok_or_else(|| {
                TopologyError::Invalid(format!(
                    "memory_lock of {} x {}MB overflows a byte count",
                    mlock.blocks, mlock.block_mb
                ))
            })?;
            for block in 0..mlock.blocks {
                units.push(ResourceUnit::memory_block(block, block_bytes));
            }
        }

        if let Some(hugepages) = &self.hugepages {
            hugepages.size()?;
            if hugepages.count == 0 {
                return Err(TopologyError::Invalid(
                    "hugepage count must be greater than 0".to_string(),
                ));
            }
        }

        if units.is_empty() {
            return Err(TopologyError::Empty);
        }

        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_topology(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_parse_valid_topology() {
        let file = create_temp_topology(
            r#"
cpus: [3, 1, 2, 0]
priority_bands:
  - name: HIGH
    priority: 80
    capacity: 1
  - name: LOW
    priority: 10
    capacity: 2
memory_lock:
  block_mb: 64
  blocks: 1
manager_cpu: 5
hugepages:
  size_kb: 2048
  count: 128
"#,
        );
        let topology = HostTopology::from_file(file.path()).unwrap();
        let units = topology.units().unwrap();

        assert_eq!(units.len(), 4 + 3 + 1);
        let cores: Vec<u32> = units
            .iter()
            .filter(|u| u.kind() == ResourceKind::Cpu)
            .map(|u| u.id.index)
            .collect();
        assert_eq!(cores, vec![0, 1, 2, 3]);
        assert_eq!(units[4].band(), Some("HIGH"));
        assert_eq!(units[5].band(), Some("LOW"));
        assert_eq!(units[7].capacity, 64 * 1024 * 1024);
        assert_eq!(
            topology.hugepages.unwrap().size().unwrap(),
            HugepageSize::Size2MB
        );
    }

    #[test]
    fn test_empty_topology_rejected() {
        assert!(matches!(
            HostTopology::from_yaml_str("cpus: []"),
            Err(TopologyError::Empty)
        ));
        assert!(matches!(
            HostTopology::default().validate(),
            Err(TopologyError::Empty)
        ));
    }

    #[test]
    fn test_duplicate_cpu_rejected() {
        assert!(matches!(
            HostTopology::from_yaml_str("cpus: [0, 1, 1]"),
            Err(TopologyError::DuplicateUnit(_))
        ));
    }

    #[test]
    fn test_duplicate_band_rejected() {
        let yaml = r#"
priority_bands:
  - { name: HIGH, priority: 80, capacity: 1 }
  - { name: HIGH, priority: 70, capacity: 1 }
"#;
        assert!(matches!(
            HostTopology::from_yaml_str(yaml),
            Err(TopologyError::DuplicateBand(name)) if name == "HIGH"
        ));
    }

    #[test]
    fn test_priority_out_of_range_rejected() {
        let yaml = "priority_bands: [{ name: X, priority: 120, capacity: 1 }]";
        assert!(matches!(
            HostTopology::from_yaml_str(yaml),
            Err(TopologyError::InvalidPriority { priority: 120, .. })
        ));
    }

    #[test]
    fn test_manager_core_must_not_be_allocatable() {
        let yaml = "cpus: [0, 1]\nmanager_cpu: 1";
        assert!(matches!(
            HostTopology::from_yaml_str(yaml),
            Err(TopologyError::ManagerCoreAllocatable(1))
        ));
    }

    #[test]
    fn test_invalid_hugepage_size() {
        let yaml = "cpus: [0]\nhugepages: { size_kb: 4096, count: 10 }";
        assert!(HostTopology::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_memory_lock_overflow_rejected() {
        let result = HostTopology::from_yaml_str(
            "cpus: [0]\nmemory_lock:\n  block_mb: 18446744073709551615\n  blocks: 1\n",
        );
        assert!(matches!(result, Err(TopologyError::Invalid(_))));

        // Each block fits, the total does not.
        let result = HostTopology::from_yaml_str(
            "cpus: [0]\nmemory_lock:\n  block_mb: 17592186044415\n  blocks: 4096\n",
        );
        assert!(matches!(result, Err(TopologyError::Invalid(_))));
    }

    #[test]
    fn test_zero_hugepage_count() {
        let yaml = "cpus: [0]\nhugepages: { size_kb: 2048, count: 0 }";
        assert!(HostTopology::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            HostTopology::from_yaml_str("cpus: [0]\ngpus: [1]"),
            Err(TopologyError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            HostTopology::from_yaml_str("cpus: [invalid"),
            Err(TopologyError::Parse(_))
        ));
    }

    #[test]
    fn test_file_not_found() {
        assert!(matches!(
            HostTopology::from_file("/nonexistent/path/topology.yaml"),
            Err(TopologyError::Read { .. })
        ));
    }

    #[test]
    fn test_hugepage_sysfs_path() {
        assert_eq!(
            HugepageSize::Size1GB.sysfs_path(),
            "/sys/kernel/mm/hugepages/hugepages-1048576kB/nr_hugepages"
        );
        assert_eq!(HugepageSize::Size2MB.size_kb(), 2048);
    }
}
