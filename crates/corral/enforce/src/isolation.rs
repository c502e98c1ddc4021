//! Isolation of the manager process itself.
//!
//! At startup the manager moves onto its own core, away from the cores it
//! hands out, and asks the kernel for the hugepage pool described in the
//! topology. Both steps are optional and both are startup-fatal on failure.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use corral_types::{HugepagesSpec, ProcessId};
use tracing::{info, warn};

use crate::error::IsolationError;
use crate::host::HostControl;

/// Pin the calling process to `core`.
pub fn pin_current_process(host: &dyn HostControl, core: u32) -> Result<(), IsolationError> {
    let pid = ProcessId::new(std::process::id());
    let cores = BTreeSet::from([core]);

    host.set_affinity(pid, &cores)
        .map_err(|source| IsolationError::Pin { core, source })?;

    info!(pid = %pid, core, "Manager pinned to dedicated core");
    Ok(())
}

/// Sysfs knob for `spec`, resolved under `sysfs_root` (normally `/`).
pub fn hugepages_knob(spec: &HugepagesSpec, sysfs_root: &Path) -> Result<PathBuf, IsolationError> {
    let size = spec.size()?;
    Ok(sysfs_root.join(size.sysfs_path().trim_start_matches('/')))
}

/// Reserve `spec.count` hugepages and return how many the kernel granted.
///
/// The kernel may grant fewer pages than requested when memory is
/// fragmented; that is reported as [`IsolationError::HugepagesShort`].
pub fn reserve_hugepages(spec: &HugepagesSpec, sysfs_root: &Path) -> Result<u32, IsolationError> {
    if spec.count == 0 {
        return Err(IsolationError::Config(corral_types::TopologyError::Invalid(
            "hugepage count must be greater than 0".to_string(),
        )));
    }
    let knob = hugepages_knob(spec, sysfs_root)?;
    let io_err = |source| IsolationError::Hugepages {
        path: knob.display().to_string(),
        source,
    };

    fs::write(&knob, spec.count.to_string()).map_err(io_err)?;

    let granted = fs::read_to_string(&knob)
        .map_err(io_err)?
        .trim()
        .parse::<u32>()
        .map_err(|e| {
            io_err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            ))
        })?;

    if granted < spec.count {
        warn!(requested = spec.count, granted, "Hugepage reservation short");
        return Err(IsolationError::HugepagesShort {
            requested: spec.count,
            granted,
        });
    }

    info!(
        size_kb = spec.size_kb,
        count = granted,
        path = %knob.display(),
        "Hugepages reserved"
    );
    Ok(granted)
}
