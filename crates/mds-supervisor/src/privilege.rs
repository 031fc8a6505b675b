//! Privilege drop and process-group setup (spec §4.E steps 4-5).

use thiserror::Error;

/// Errors raised while dropping privileges or establishing the display's
/// process group.
#[derive(Error, Debug)]
pub enum PrivilegeError {
    /// `setgid`/`setuid` failed; this is always fatal, since continuing to
    /// run elevated would violate the one guarantee this binary makes.
    #[error("failed to drop privileges: {0}")]
    DropFailed(std::io::Error),
    /// `setpgid` failed.
    #[error("failed to create process group: {0}")]
    ProcessGroupFailed(std::io::Error),
}

/// The real (invoking) uid and gid, as opposed to whatever effective
/// identity this process may have inherited from a setuid binary.
#[must_use]
pub fn real_ids() -> (u32, u32) {
    // SAFETY: `getuid`/`getgid` take no arguments and cannot fail.
    #[allow(unsafe_code)]
    unsafe {
        (libc::getuid(), libc::getgid())
    }
}

/// Drop to the real uid/gid, group before user so the process never holds
/// only one of the two elevated identities (spec §4.E step 4: "only
/// directory and socket creation requires" elevated privilege).
///
/// A no-op if the process is not currently running with elevated
/// privileges.
///
/// # Errors
///
/// [`PrivilegeError::DropFailed`] if either `setgid` or `setuid` fails.
pub fn drop_to_real_identity() -> Result<(), PrivilegeError> {
    let (uid, gid) = real_ids();
    // SAFETY: `setgid`/`setuid` with the process's own real ids; this can
    // only narrow privilege, never escalate it.
    #[allow(unsafe_code)]
    unsafe {
        if libc::setgid(gid) != 0 {
            return Err(PrivilegeError::DropFailed(std::io::Error::last_os_error()));
        }
        if libc::setuid(uid) != 0 {
            return Err(PrivilegeError::DropFailed(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Put this process in its own new process group and return the group id,
/// so every module spawned under this display can be signalled together
/// (spec §4.E step 5, `MDS_PGROUP`).
///
/// # Errors
///
/// [`PrivilegeError::ProcessGroupFailed`] if `setpgid` fails.
pub fn new_process_group() -> Result<u32, PrivilegeError> {
    // SAFETY: `setpgid(0, 0)` only affects the calling process's own
    // process group membership.
    #[allow(unsafe_code)]
    unsafe {
        if libc::setpgid(0, 0) != 0 {
            return Err(PrivilegeError::ProcessGroupFailed(std::io::Error::last_os_error()));
        }
        Ok(libc::getpgid(0) as u32)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn real_ids_match_libc_directly() {
        #[allow(unsafe_code)]
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        assert_eq!(real_ids(), (uid, gid));
    }
}
