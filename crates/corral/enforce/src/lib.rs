//! Corral Enforce - Host-level enforcement of assignments
//!
//! Makes an assignment real on the host: the owning process is pinned to its
//! cores, switched to SCHED_FIFO at its band priority, and allowed to lock
//! its memory blocks. Host state is read back after every change and the
//! prior state is restored when the assignment ends.
//!
//! ## Layers
//!
//! - [`HostControl`]: platform primitives ([`LinuxHostControl`] on Linux,
//!   [`RecordingHostControl`] in memory)
//! - [`EnforcementEngine`]: apply/verify/revert with bounded host calls,
//!   exposed to the broker through the [`Enforcer`] trait
//! - [`isolation`]: startup isolation of the manager itself

pub mod engine;
pub mod error;
pub mod host;
pub mod isolation;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod recording;

pub use engine::{EnforcementConfig, EnforcementEngine, Enforcer, HostDirectives};
pub use error::{EnforcementError, EnforcementResult, HostError, IsolationError};
pub use host::{HeartbeatOnlyProbe, HostControl, MemlockLimit, ProcessProbe, SchedPolicy, SchedState};
#[cfg(target_os = "linux")]
pub use linux::LinuxHostControl;
pub use recording::{Fault, HostProcessState, RecordingHostControl};
