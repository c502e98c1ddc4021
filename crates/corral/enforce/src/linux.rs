//! Linux host control.
//!
//! Affinity and process existence go through `nix`; scheduling class and the
//! locked-memory limit of a foreign process need raw `libc` calls
//! (`sched_setscheduler`, `prlimit`).
//!
//! Affinity and scheduling are per-thread attributes, so both are applied to
//! every thread listed under `/proc/<pid>/task`. The locked-memory limit is
//! process-wide.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::PathBuf;

use corral_types::ProcessId;
use nix::errno::Errno;
use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{geteuid, Pid};

use crate::error::HostError;
use crate::host::{HostControl, MemlockLimit, ProcessProbe, SchedPolicy, SchedState};

/// Host control backed by Linux syscalls. Requires root (or CAP_SYS_NICE +
/// CAP_SYS_RESOURCE) to act on other processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxHostControl;

impl LinuxHostControl {
    pub fn new() -> Self {
        Self
    }
}

fn raw_pid(pid: ProcessId) -> libc::pid_t {
    pid.as_raw() as libc::pid_t
}

fn nix_pid(pid: ProcessId) -> Pid {
    Pid::from_raw(raw_pid(pid))
}

/// Thread ids of `pid`, leader first.
fn threads(pid: ProcessId) -> Result<Vec<libc::pid_t>, HostError> {
    let dir = PathBuf::from(format!("/proc/{}/task", pid.as_raw()));
    let entries = std::fs::read_dir(&dir).map_err(|e| match e.kind() {
        ErrorKind::NotFound => HostError::NoSuchProcess,
        ErrorKind::PermissionDenied => HostError::PermissionDenied,
        _ => HostError::Other(format!("{}: {}", dir.display(), e)),
    })?;

    let leader = raw_pid(pid);
    let mut tids: Vec<libc::pid_t> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<libc::pid_t>().ok())
        .collect();
    tids.sort_by_key(|tid| (*tid != leader, *tid));

    if tids.is_empty() {
        return Err(HostError::NoSuchProcess);
    }
    Ok(tids)
}

/// Run `f` on every thread of `pid`. Threads that exit mid-walk are skipped;
/// the process is gone only when no thread was reached.
fn for_each_thread<F>(pid: ProcessId, mut f: F) -> Result<(), HostError>
where
    F: FnMut(libc::pid_t) -> Result<(), Errno>,
{
    let mut reached = false;
    for tid in threads(pid)? {
        match f(tid) {
            Ok(()) => reached = true,
            Err(Errno::ESRCH) => continue,
            Err(errno) => return Err(map_errno(errno)),
        }
    }

    if reached {
        Ok(())
    } else {
        Err(HostError::NoSuchProcess)
    }
}

fn thread_affinity(tid: libc::pid_t) -> Result<BTreeSet<u32>, Errno> {
    let set = sched_getaffinity(Pid::from_raw(tid))?;
    Ok((0..CpuSet::count())
        .filter(|cpu| set.is_set(*cpu).unwrap_or(false))
        .map(|cpu| cpu as u32)
        .collect())
}

fn thread_scheduling(tid: libc::pid_t) -> Result<(libc::c_int, i32), Errno> {
    // SAFETY: plain syscall wrapper taking a tid by value.
    let policy = unsafe { libc::sched_getscheduler(tid) };
    if policy < 0 {
        return Err(Errno::last());
    }

    // SAFETY: sched_param is plain old data; zeroed is a valid value.
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    // SAFETY: `param` is a valid, writable sched_param.
    let rc = unsafe { libc::sched_getparam(tid, &mut param) };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok((policy, param.sched_priority))
}

fn map_errno(errno: Errno) -> HostError {
    match errno {
        Errno::ESRCH => HostError::NoSuchProcess,
        Errno::EPERM | Errno::EACCES => HostError::PermissionDenied,
        other => HostError::Other(other.to_string()),
    }
}

fn policy_from_raw(raw: libc::c_int) -> Result<SchedPolicy, HostError> {
    match raw & !libc::SCHED_RESET_ON_FORK {
        libc::SCHED_OTHER => Ok(SchedPolicy::Other),
        libc::SCHED_FIFO => Ok(SchedPolicy::Fifo),
        libc::SCHED_RR => Ok(SchedPolicy::RoundRobin),
        libc::SCHED_BATCH => Ok(SchedPolicy::Batch),
        libc::SCHED_IDLE => Ok(SchedPolicy::Idle),
        other => Err(HostError::Other(format!("unknown scheduling policy {}", other))),
    }
}

fn policy_to_raw(policy: SchedPolicy) -> libc::c_int {
    match policy {
        SchedPolicy::Other => libc::SCHED_OTHER,
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::RoundRobin => libc::SCHED_RR,
        SchedPolicy::Batch => libc::SCHED_BATCH,
        SchedPolicy::Idle => libc::SCHED_IDLE,
    }
}

fn rlim_to_u64(value: libc::rlim_t) -> u64 {
    if value == libc::RLIM_INFINITY {
        u64::MAX
    } else {
        value as u64
    }
}

fn u64_to_rlim(value: u64) -> libc::rlim_t {
    if value == u64::MAX {
        libc::RLIM_INFINITY
    } else {
        value as libc::rlim_t
    }
}

impl HostControl for LinuxHostControl {
    /// Union of the masks of all threads, so a thread left outside the
    /// assigned cores shows up on read-back.
    fn get_affinity(&self, pid: ProcessId) -> Result<BTreeSet<u32>, HostError> {
        let mut cores = BTreeSet::new();
        for_each_thread(pid, |tid| {
            cores.extend(thread_affinity(tid)?);
            Ok(())
        })?;
        Ok(cores)
    }

    fn set_affinity(&self, pid: ProcessId, cores: &BTreeSet<u32>) -> Result<(), HostError> {
        let mut set = CpuSet::new();
        for core in cores {
            set.set(*core as usize)
                .map_err(|e| HostError::Other(format!("core {}: {}", core, e)))?;
        }
        for_each_thread(pid, |tid| sched_setaffinity(Pid::from_raw(tid), &set))
    }

    /// State of the thread group leader, or of the first thread that
    /// disagrees with it.
    fn get_scheduling(&self, pid: ProcessId) -> Result<SchedState, HostError> {
        let mut leader: Option<(libc::c_int, i32)> = None;
        let mut divergent: Option<(libc::c_int, i32)> = None;
        for_each_thread(pid, |tid| {
            let state = thread_scheduling(tid)?;
            match leader {
                None => leader = Some(state),
                Some(first) if first != state && divergent.is_none() => divergent = Some(state),
                Some(_) => {}
            }
            Ok(())
        })?;

        let (policy, priority) = divergent.or(leader).ok_or(HostError::NoSuchProcess)?;
        Ok(SchedState {
            policy: policy_from_raw(policy)?,
            priority,
        })
    }

    fn set_scheduling(&self, pid: ProcessId, state: SchedState) -> Result<(), HostError> {
        // SAFETY: sched_param is plain old data; zeroed is a valid value.
        let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
        param.sched_priority = state.priority;
        let policy = policy_to_raw(state.policy);

        for_each_thread(pid, |tid| {
            // SAFETY: `param` is a valid sched_param that outlives the call.
            let rc = unsafe { libc::sched_setscheduler(tid, policy, &param) };
            if rc != 0 {
                return Err(Errno::last());
            }
            Ok(())
        })
    }

    fn get_memlock_limit(&self, pid: ProcessId) -> Result<MemlockLimit, HostError> {
        let mut old = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: null new-limit pointer means read-only; `old` is writable.
        let rc = unsafe {
            libc::prlimit(
                raw_pid(pid),
                libc::RLIMIT_MEMLOCK,
                std::ptr::null(),
                &mut old,
            )
        };
        if rc != 0 {
            return Err(map_errno(Errno::last()));
        }
        Ok(MemlockLimit {
            soft: rlim_to_u64(old.rlim_cur),
            hard: rlim_to_u64(old.rlim_max),
        })
    }

    fn set_memlock_limit(&self, pid: ProcessId, limit: MemlockLimit) -> Result<(), HostError> {
        let new = libc::rlimit {
            rlim_cur: u64_to_rlim(limit.soft),
            rlim_max: u64_to_rlim(limit.hard),
        };
        // SAFETY: `new` is a valid rlimit; null old-limit pointer is allowed.
        let rc = unsafe {
            libc::prlimit(
                raw_pid(pid),
                libc::RLIMIT_MEMLOCK,
                &new,
                std::ptr::null_mut(),
            )
        };
        if rc != 0 {
            return Err(map_errno(Errno::last()));
        }
        Ok(())
    }

    fn has_privilege(&self) -> bool {
        geteuid().is_root()
    }
}

impl ProcessProbe for LinuxHostControl {
    fn is_alive(&self, pid: ProcessId) -> bool {
        match kill(nix_pid(pid), None::<Signal>) {
            Ok(()) => true,
            // Exists but belongs to someone we may not signal.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}
