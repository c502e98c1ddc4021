//! Enforcement engine.
//!
//! Turns assignments into host directives on the owning process and takes
//! them back again. A process may hold several assignments at once, so the
//! engine tracks, per process, the host state it found before the first
//! apply (the baseline) and the directives of every assignment it has
//! applied. The host is always driven to the combination of the live
//! assignments, and back to the baseline once none is left.
//!
//! Every host call runs on the blocking pool under
//! [`EnforcementConfig::call_timeout`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corral_types::{Assignment, AssignmentId, ProcessId, ResourceUnit, UnitDetail};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{EnforcementError, EnforcementResult, HostError};
use crate::host::{HostControl, MemlockLimit, SchedState};

/// Enforcement configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementConfig {
    /// Upper bound for a single host call.
    pub call_timeout: Duration,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(2),
        }
    }
}

/// What an assignment asks of the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDirectives {
    /// Cores the process is pinned to. Empty leaves affinity alone.
    pub cores: BTreeSet<u32>,

    /// SCHED_FIFO priority, the highest of the assigned priority slots.
    pub sched_priority: Option<i32>,

    /// Locked-memory limit, the sum of the assigned memory-lock blocks.
    pub memlock_bytes: Option<u64>,
}

impl HostDirectives {
    /// Derive directives from the units of an assignment.
    pub fn for_units(units: &[ResourceUnit]) -> Self {
        let mut directives = Self::default();
        for unit in units {
            match &unit.detail {
                UnitDetail::Cpu { core } => {
                    directives.cores.insert(*core);
                }
                UnitDetail::Priority { sched_priority, .. } => {
                    directives.sched_priority = directives
                        .sched_priority
                        .max(Some(*sched_priority));
                }
                UnitDetail::MemoryLock { bytes } => {
                    directives.memlock_bytes =
                        Some(directives.memlock_bytes.unwrap_or(0).saturating_add(*bytes));
                }
            }
        }
        directives
    }

    /// Union of several directive sets held by the same process.
    pub fn combine<'a>(all: impl IntoIterator<Item = &'a HostDirectives>) -> Self {
        let mut combined = Self::default();
        for d in all {
            combined.cores.extend(d.cores.iter().copied());
            combined.sched_priority = combined.sched_priority.max(d.sched_priority);
            combined.memlock_bytes = match (combined.memlock_bytes, d.memlock_bytes) {
                (Some(a), Some(b)) => Some(a.saturating_add(b)),
                (a, b) => a.or(b),
            };
        }
        combined
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty() && self.sched_priority.is_none() && self.memlock_bytes.is_none()
    }
}

/// Applies and reverts assignments on the host.
#[async_trait]
pub trait Enforcer: Send + Sync {
    /// Enforce `directives` for the owner of `assignment` and confirm them by
    /// reading host state back. On error the host is left as it was.
    async fn apply(
        &self,
        assignment: &Assignment,
        directives: &HostDirectives,
    ) -> EnforcementResult<()>;

    /// Withdraw what `apply` did for `assignment`. Succeeds when the process
    /// is already gone.
    async fn revert(&self, assignment: &Assignment) -> EnforcementResult<()>;
}

/// Host state of one process, as read or as intended.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HostState {
    affinity: BTreeSet<u32>,
    sched: SchedState,
    memlock: MemlockLimit,
}

impl HostState {
    /// State the host should be in for `directives`, starting from `baseline`.
    fn target(baseline: &HostState, directives: &HostDirectives) -> Self {
        let affinity = if directives.cores.is_empty() {
            baseline.affinity.clone()
        } else {
            directives.cores.clone()
        };

        let sched = directives
            .sched_priority
            .map(SchedState::fifo)
            .unwrap_or(baseline.sched);

        let memlock = match directives.memlock_bytes {
            Some(bytes) => {
                let soft = bytes.max(baseline.memlock.soft);
                MemlockLimit {
                    soft,
                    hard: soft.max(baseline.memlock.hard),
                }
            }
            None => baseline.memlock,
        };

        Self {
            affinity,
            sched,
            memlock,
        }
    }
}

#[derive(Debug, Default)]
struct ProcessEnforcement {
    baseline: Option<HostState>,
    applied: BTreeMap<AssignmentId, HostDirectives>,
}

impl ProcessEnforcement {
    fn combined(&self) -> HostDirectives {
        HostDirectives::combine(self.applied.values())
    }
}

/// Enforcement engine driving a [`HostControl`].
pub struct EnforcementEngine {
    host: Arc<dyn HostControl>,
    config: EnforcementConfig,
    processes: DashMap<ProcessId, Arc<Mutex<ProcessEnforcement>>>,
}

impl EnforcementEngine {
    pub fn new(host: Arc<dyn HostControl>, config: EnforcementConfig) -> Self {
        Self {
            host,
            config,
            processes: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EnforcementConfig {
        &self.config
    }

    /// Whether the host still grants the privilege enforcement needs.
    pub fn has_privilege(&self) -> bool {
        self.host.has_privilege()
    }

    /// Assignments currently applied for `pid`.
    pub async fn applied(&self, pid: ProcessId) -> Vec<AssignmentId> {
        let Some(entry) = self.processes.get(&pid).map(|e| Arc::clone(e.value())) else {
            return Vec::new();
        };
        let state = entry.lock().await;
        state.applied.keys().copied().collect()
    }

    fn process(&self, pid: ProcessId) -> Arc<Mutex<ProcessEnforcement>> {
        Arc::clone(self.processes.entry(pid).or_default().value())
    }

    /// Drop the entry of `pid` once nothing is applied and no other task
    /// holds it. `process` is the caller's handle, already unlocked.
    fn forget_if_idle(&self, pid: ProcessId, process: &Arc<Mutex<ProcessEnforcement>>) {
        self.processes.remove_if(&pid, |_, entry| {
            Arc::ptr_eq(entry, process)
                && Arc::strong_count(entry) == 2
                && entry
                    .try_lock()
                    .map(|state| state.applied.is_empty())
                    .unwrap_or(false)
        });
    }

    /// Number of processes with enforcement state.
    pub fn tracked_processes(&self) -> usize {
        self.processes.len()
    }

    async fn call<T, F>(&self, pid: ProcessId, op: &'static str, f: F) -> EnforcementResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn HostControl) -> Result<T, HostError> + Send + 'static,
    {
        let host = Arc::clone(&self.host);
        let timeout = self.config.call_timeout;
        let task = tokio::task::spawn_blocking(move || f(host.as_ref()));

        match tokio::time::timeout(timeout, task).await {
            Err(_) => Err(EnforcementError::Timeout {
                process_id: pid,
                op,
                timeout_ms: timeout.as_millis() as u64,
            }),
            Ok(Err(join_err)) => Err(EnforcementError::Host {
                process_id: pid,
                op,
                reason: join_err.to_string(),
            }),
            Ok(Ok(result)) => result.map_err(|e| EnforcementError::from_host(pid, op, e)),
        }
    }

    async fn read_state(&self, pid: ProcessId) -> EnforcementResult<HostState> {
        let affinity = self
            .call(pid, "get_affinity", move |h| h.get_affinity(pid))
            .await?;
        let sched = self
            .call(pid, "get_scheduling", move |h| h.get_scheduling(pid))
            .await?;
        let memlock = self
            .call(pid, "get_memlock_limit", move |h| h.get_memlock_limit(pid))
            .await?;
        Ok(HostState {
            affinity,
            sched,
            memlock,
        })
    }

    /// Drive the host to `target` and confirm it by reading state back.
    async fn enforce(&self, pid: ProcessId, target: &HostState) -> EnforcementResult<()> {
        let cores = target.affinity.clone();
        self.call(pid, "set_affinity", move |h| h.set_affinity(pid, &cores))
            .await?;
        let sched = target.sched;
        self.call(pid, "set_scheduling", move |h| h.set_scheduling(pid, sched))
            .await?;
        let memlock = target.memlock;
        self.call(pid, "set_memlock_limit", move |h| {
            h.set_memlock_limit(pid, memlock)
        })
        .await?;

        let actual = self.read_state(pid).await?;
        if actual.affinity != target.affinity {
            return Err(EnforcementError::Mismatch {
                process_id: pid,
                what: "affinity",
                expected: format!("{:?}", target.affinity),
                actual: format!("{:?}", actual.affinity),
            });
        }
        if actual.sched != target.sched {
            return Err(EnforcementError::Mismatch {
                process_id: pid,
                what: "scheduling",
                expected: target.sched.to_string(),
                actual: actual.sched.to_string(),
            });
        }
        if actual.memlock != target.memlock {
            return Err(EnforcementError::Mismatch {
                process_id: pid,
                what: "memlock",
                expected: target.memlock.to_string(),
                actual: actual.memlock.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Enforcer for EnforcementEngine {
    #[instrument(skip(self, assignment, directives), fields(pid = %assignment.process_id, assignment_id = %assignment.id))]
    async fn apply(
        &self,
        assignment: &Assignment,
        directives: &HostDirectives,
    ) -> EnforcementResult<()> {
        let pid = assignment.process_id;
        let process = self.process(pid);
        let mut state = process.lock().await;

        let baseline = match &state.baseline {
            Some(baseline) => baseline.clone(),
            None => {
                let captured = match self.read_state(pid).await {
                    Ok(captured) => captured,
                    Err(err) => {
                        drop(state);
                        self.forget_if_idle(pid, &process);
                        return Err(err);
                    }
                };
                debug!(
                    affinity = ?captured.affinity,
                    sched = %captured.sched,
                    memlock = %captured.memlock,
                    "Captured baseline host state"
                );
                state.baseline = Some(captured.clone());
                captured
            }
        };

        let previous = HostState::target(&baseline, &state.combined());
        let mut next = state.applied.clone();
        next.insert(assignment.id, directives.clone());
        let target = HostState::target(&baseline, &HostDirectives::combine(next.values()));

        match self.enforce(pid, &target).await {
            Ok(()) => {
                state.applied = next;
                info!(
                    cores = ?target.affinity,
                    sched = %target.sched,
                    memlock = %target.memlock,
                    "Assignment enforced"
                );
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Enforcement failed, restoring previous host state");
                if !err.is_process_gone() {
                    if let Err(restore_err) = self.enforce(pid, &previous).await {
                        warn!(error = %restore_err, "Restoring previous host state failed");
                    }
                }
                let idle = state.applied.is_empty();
                if idle {
                    state.baseline = None;
                }
                drop(state);
                if idle {
                    self.forget_if_idle(pid, &process);
                }
                Err(err)
            }
        }
    }

    #[instrument(skip(self, assignment), fields(pid = %assignment.process_id, assignment_id = %assignment.id))]
    async fn revert(&self, assignment: &Assignment) -> EnforcementResult<()> {
        let pid = assignment.process_id;
        let Some(process) = self.processes.get(&pid).map(|e| Arc::clone(e.value())) else {
            debug!("Nothing applied for process");
            return Ok(());
        };
        let mut state = process.lock().await;

        if state.applied.remove(&assignment.id).is_none() {
            debug!("Assignment was never applied");
            return Ok(());
        }
        let Some(baseline) = state.baseline.clone() else {
            return Ok(());
        };

        let target = HostState::target(&baseline, &state.combined());
        if state.applied.is_empty() {
            state.baseline = None;
        }

        let result = match self.enforce(pid, &target).await {
            Ok(()) => {
                info!(
                    cores = ?target.affinity,
                    sched = %target.sched,
                    "Host state restored"
                );
                Ok(())
            }
            Err(err) if err.is_process_gone() => {
                debug!("Process already gone, nothing to restore");
                state.applied.clear();
                state.baseline = None;
                Ok(())
            }
            Err(err) => Err(err),
        };

        let idle = state.applied.is_empty();
        drop(state);
        if idle {
            self.forget_if_idle(pid, &process);
        }
        result
    }
}
