//! Linux capability management.

use crate::error::{ApplyPhase, SandboxError};
use crate::Result;
use caps::{CapSet, Capability};
use nix::errno::Errno;
use std::io;
use tracing::{debug, warn};

/// Capability numbers probed in the bounding set; the kernel rejects unknown ones with `EINVAL`.
const CAP_NUMBER_RANGE: std::ops::Range<libc::c_ulong> = 0..64;

/// Drop every capability the process holds, for good.
///
/// Clears the bounding set, then the ambient set, then the effective,
/// inheritable and permitted sets, and finally sets `PR_SET_NO_NEW_PRIVS`
/// so no later `execve` can grant anything back.
pub fn drop_all() -> Result<()> {
    debug!("Dropping all capabilities");

    drop_bounding_set()?;
    clear_ambient_set()?;

    for set in [CapSet::Effective, CapSet::Inheritable, CapSet::Permitted] {
        caps::clear(None, set).map_err(|e| {
            SandboxError::apply(
                ApplyPhase::Capabilities,
                format!("Failed to clear {set:?} capability set"),
                io::Error::new(io::ErrorKind::Other, e),
            )
        })?;
    }

    set_no_new_privs()
}

fn drop_bounding_set() -> Result<()> {
    for cap in CAP_NUMBER_RANGE {
        let ret = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0) };
        if ret < 0 {
            match Errno::last() {
                Errno::EINVAL => continue,
                errno => {
                    return Err(SandboxError::apply(
                        ApplyPhase::Capabilities,
                        format!("Failed to drop capability {cap} from the bounding set"),
                        errno,
                    ))
                }
            }
        }
    }
    Ok(())
}

fn clear_ambient_set() -> Result<()> {
    if caps::runtime::ambient_set_supported().is_err() {
        warn!("Ambient capability set is not supported by this kernel");
        return Ok(());
    }

    caps::clear(None, CapSet::Ambient).map_err(|e| {
        SandboxError::apply(
            ApplyPhase::Capabilities,
            "Failed to clear ambient capability set",
            io::Error::new(io::ErrorKind::Other, e),
        )
    })
}

fn set_no_new_privs() -> Result<()> {
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret < 0 {
        return Err(SandboxError::apply(
            ApplyPhase::Capabilities,
            "Failed to set PR_SET_NO_NEW_PRIVS",
            Errno::last(),
        ));
    }
    Ok(())
}

/// Make `CAP_SYS_ADMIN` effective if the process may use it.
///
/// Returns true when the capability is effective afterwards.
pub fn acquire_sys_admin() -> bool {
    match caps::has_cap(None, CapSet::Effective, Capability::CAP_SYS_ADMIN) {
        Ok(true) => return true,
        Ok(false) => {}
        Err(e) => {
            debug!("Failed to read process capabilities: {}", e);
            return false;
        }
    }

    if !caps::has_cap(None, CapSet::Permitted, Capability::CAP_SYS_ADMIN).unwrap_or(false) {
        return false;
    }

    match caps::raise(None, CapSet::Effective, Capability::CAP_SYS_ADMIN) {
        Ok(()) => true,
        Err(e) => {
            debug!("Failed to enable CAP_SYS_ADMIN despite it being permitted: {}", e);
            false
        }
    }
}
