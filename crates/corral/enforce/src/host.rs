//! Host-control seam.
//!
//! The enforcement engine never talks to the kernel directly; it goes through
//! [`HostControl`], which keeps the platform-specific primitives replaceable
//! (Linux syscalls in production, an in-memory recorder in tests and dry
//! runs). Calls are synchronous and may block; the engine runs them on the
//! blocking pool under a timeout.

use std::collections::BTreeSet;
use std::fmt;

use corral_types::ProcessId;
use serde::{Deserialize, Serialize};

use crate::error::HostError;

/// Scheduling policy of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedPolicy {
    /// SCHED_OTHER (default time-sharing)
    Other,
    /// SCHED_FIFO
    Fifo,
    /// SCHED_RR
    RoundRobin,
    /// SCHED_BATCH
    Batch,
    /// SCHED_IDLE
    Idle,
}

impl SchedPolicy {
    pub fn is_realtime(&self) -> bool {
        matches!(self, SchedPolicy::Fifo | SchedPolicy::RoundRobin)
    }
}

/// Scheduling class and static priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchedState {
    pub policy: SchedPolicy,
    /// 0 for non real-time policies, 1..=99 for real-time ones
    pub priority: i32,
}

impl SchedState {
    pub fn fifo(priority: i32) -> Self {
        Self {
            policy: SchedPolicy::Fifo,
            priority,
        }
    }

    pub fn normal() -> Self {
        Self {
            policy: SchedPolicy::Other,
            priority: 0,
        }
    }
}

impl fmt::Display for SchedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.policy, self.priority)
    }
}

/// RLIMIT_MEMLOCK of a process, in bytes. `u64::MAX` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemlockLimit {
    pub soft: u64,
    pub hard: u64,
}

impl fmt::Display for MemlockLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "soft={} hard={}", self.soft, self.hard)
    }
}

/// Platform primitives used to enforce assignments on another process.
pub trait HostControl: Send + Sync {
    fn get_affinity(&self, pid: ProcessId) -> Result<BTreeSet<u32>, HostError>;

    fn set_affinity(&self, pid: ProcessId, cores: &BTreeSet<u32>) -> Result<(), HostError>;

    fn get_scheduling(&self, pid: ProcessId) -> Result<SchedState, HostError>;

    fn set_scheduling(&self, pid: ProcessId, state: SchedState) -> Result<(), HostError>;

    fn get_memlock_limit(&self, pid: ProcessId) -> Result<MemlockLimit, HostError>;

    fn set_memlock_limit(&self, pid: ProcessId, limit: MemlockLimit) -> Result<(), HostError>;

    /// Whether the manager holds the privilege needed for the setters above.
    fn has_privilege(&self) -> bool;
}

/// Existence check for supervised processes.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: ProcessId) -> bool;
}

/// Probe that reports every process alive; liveness then rests on heartbeats only.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeartbeatOnlyProbe;

impl ProcessProbe for HeartbeatOnlyProbe {
    fn is_alive(&self, _pid: ProcessId) -> bool {
        true
    }
}
