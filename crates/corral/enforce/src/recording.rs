//! In-memory host control.
//!
//! Keeps a per-process record of affinity, scheduling and memlock limit so
//! enforcement can be exercised without privilege. Faults can be injected per
//! process to simulate directives that silently do not stick, host errors and
//! stalled calls. The daemon uses it for `--dry-run`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use corral_types::ProcessId;
use dashmap::DashMap;

use crate::error::HostError;
use crate::host::{HostControl, MemlockLimit, ProcessProbe, SchedState};

/// Default RLIMIT_MEMLOCK of an unprivileged Linux process.
const DEFAULT_MEMLOCK_BYTES: u64 = 8 * 1024 * 1024;

/// Recorded host state of one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostProcessState {
    pub affinity: BTreeSet<u32>,
    pub sched: SchedState,
    pub memlock: MemlockLimit,
}

/// Fault injected for one process.
#[derive(Debug, Clone)]
pub enum Fault {
    /// `set_affinity` reports success but leaves the mask unchanged.
    IgnoreAffinity,
    /// `set_scheduling` fails with the given error.
    FailScheduling(HostError),
    /// `set_memlock_limit` fails with the given error.
    FailMemlock(HostError),
    /// Every call for the process sleeps first.
    Stall(Duration),
}

/// Host control that records directives in memory.
#[derive(Debug)]
pub struct RecordingHostControl {
    online_cores: BTreeSet<u32>,
    processes: DashMap<ProcessId, HostProcessState>,
    faults: DashMap<ProcessId, Vec<Fault>>,
    privileged: AtomicBool,
    /// Unknown pids are created on first use instead of reported missing.
    auto_spawn: bool,
}

impl RecordingHostControl {
    /// Strict recorder: only pids added with [`spawn`](Self::spawn) exist.
    pub fn new(online_cores: impl IntoIterator<Item = u32>) -> Self {
        Self {
            online_cores: online_cores.into_iter().collect(),
            processes: DashMap::new(),
            faults: DashMap::new(),
            privileged: AtomicBool::new(true),
            auto_spawn: false,
        }
    }

    /// Permissive recorder for dry runs: every pid exists.
    pub fn permissive(online_cores: impl IntoIterator<Item = u32>) -> Self {
        Self {
            auto_spawn: true,
            ..Self::new(online_cores)
        }
    }

    fn initial_state(&self) -> HostProcessState {
        HostProcessState {
            affinity: self.online_cores.clone(),
            sched: SchedState::normal(),
            memlock: MemlockLimit {
                soft: DEFAULT_MEMLOCK_BYTES,
                hard: DEFAULT_MEMLOCK_BYTES,
            },
        }
    }

    /// Make a process exist with default host state.
    pub fn spawn(&self, pid: ProcessId) {
        self.processes.insert(pid, self.initial_state());
    }

    /// Make a process disappear, as if it crashed or exited.
    pub fn exit(&self, pid: ProcessId) {
        self.processes.remove(&pid);
    }

    pub fn state(&self, pid: ProcessId) -> Option<HostProcessState> {
        self.processes.get(&pid).map(|s| s.clone())
    }

    pub fn inject(&self, pid: ProcessId, fault: Fault) {
        self.faults.entry(pid).or_default().push(fault);
    }

    pub fn clear_faults(&self, pid: ProcessId) {
        self.faults.remove(&pid);
    }

    pub fn set_privileged(&self, privileged: bool) {
        self.privileged.store(privileged, Ordering::SeqCst);
    }

    fn faults_for(&self, pid: ProcessId) -> Vec<Fault> {
        let faults = self
            .faults
            .get(&pid)
            .map(|f| f.clone())
            .unwrap_or_default();

        for fault in &faults {
            if let Fault::Stall(delay) = fault {
                std::thread::sleep(*delay);
            }
        }
        faults
    }

    fn with_state<T>(
        &self,
        pid: ProcessId,
        f: impl FnOnce(&mut HostProcessState) -> T,
    ) -> Result<T, HostError> {
        if self.auto_spawn {
            let mut entry = self
                .processes
                .entry(pid)
                .or_insert_with(|| self.initial_state());
            return Ok(f(&mut entry));
        }

        let mut state = self
            .processes
            .get_mut(&pid)
            .ok_or(HostError::NoSuchProcess)?;
        Ok(f(&mut state))
    }

    fn require_privilege(&self) -> Result<(), HostError> {
        if self.privileged.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HostError::PermissionDenied)
        }
    }
}

impl HostControl for RecordingHostControl {
    fn get_affinity(&self, pid: ProcessId) -> Result<BTreeSet<u32>, HostError> {
        self.faults_for(pid);
        self.with_state(pid, |s| s.affinity.clone())
    }

    fn set_affinity(&self, pid: ProcessId, cores: &BTreeSet<u32>) -> Result<(), HostError> {
        let faults = self.faults_for(pid);
        self.require_privilege()?;
        if let Some(core) = cores.iter().find(|c| !self.online_cores.contains(c)) {
            return Err(HostError::Other(format!("core {} is not online", core)));
        }
        let ignore = faults.iter().any(|f| matches!(f, Fault::IgnoreAffinity));
        self.with_state(pid, |s| {
            if !ignore {
                s.affinity = cores.clone();
            }
        })
    }

    fn get_scheduling(&self, pid: ProcessId) -> Result<SchedState, HostError> {
        self.faults_for(pid);
        self.with_state(pid, |s| s.sched)
    }

    fn set_scheduling(&self, pid: ProcessId, state: SchedState) -> Result<(), HostError> {
        let faults = self.faults_for(pid);
        self.require_privilege()?;
        if let Some(Fault::FailScheduling(err)) = faults
            .iter()
            .find(|f| matches!(f, Fault::FailScheduling(_)))
        {
            return Err(err.clone());
        }
        self.with_state(pid, |s| s.sched = state)
    }

    fn get_memlock_limit(&self, pid: ProcessId) -> Result<MemlockLimit, HostError> {
        self.faults_for(pid);
        self.with_state(pid, |s| s.memlock)
    }

    fn set_memlock_limit(&self, pid: ProcessId, limit: MemlockLimit) -> Result<(), HostError> {
        let faults = self.faults_for(pid);
        self.require_privilege()?;
        if let Some(Fault::FailMemlock(err)) =
            faults.iter().find(|f| matches!(f, Fault::FailMemlock(_)))
        {
            return Err(err.clone());
        }
        self.with_state(pid, |s| s.memlock = limit)
    }

    fn has_privilege(&self) -> bool {
        self.privileged.load(Ordering::SeqCst)
    }
}

impl ProcessProbe for RecordingHostControl {
    fn is_alive(&self, pid: ProcessId) -> bool {
        self.auto_spawn || self.processes.contains_key(&pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_recorder_rejects_unknown_pid() {
        let host = RecordingHostControl::new(0..4);
        let pid = ProcessId::new(100);
        assert_eq!(host.get_affinity(pid), Err(HostError::NoSuchProcess));
        assert!(!host.is_alive(pid));

        host.spawn(pid);
        assert_eq!(host.get_affinity(pid).unwrap(), BTreeSet::from([0, 1, 2, 3]));
        assert!(host.is_alive(pid));

        host.exit(pid);
        assert!(!host.is_alive(pid));
    }

    #[test]
    fn test_permissive_recorder_creates_processes() {
        let host = RecordingHostControl::permissive(0..2);
        let pid = ProcessId::new(7);
        host.set_affinity(pid, &[1].into_iter().collect()).unwrap();
        assert_eq!(host.state(pid).unwrap().affinity, BTreeSet::from([1]));
    }

    #[test]
    fn test_ignore_affinity_fault() {
        let host = RecordingHostControl::new(0..4);
        let pid = ProcessId::new(1);
        host.spawn(pid);
        host.inject(pid, Fault::IgnoreAffinity);

        host.set_affinity(pid, &[2].into_iter().collect()).unwrap();
        assert_eq!(host.get_affinity(pid).unwrap(), BTreeSet::from([0, 1, 2, 3]));
    }

    #[test]
    fn test_unprivileged_setters_fail() {
        let host = RecordingHostControl::new(0..4);
        let pid = ProcessId::new(1);
        host.spawn(pid);
        host.set_privileged(false);

        assert_eq!(
            host.set_scheduling(pid, SchedState::fifo(50)),
            Err(HostError::PermissionDenied)
        );
        assert!(!host.has_privilege());
    }

    #[test]
    fn test_offline_core_rejected() {
        let host = RecordingHostControl::new(0..2);
        let pid = ProcessId::new(1);
        host.spawn(pid);
        assert!(host.set_affinity(pid, &[5].into_iter().collect()).is_err());
    }
}
