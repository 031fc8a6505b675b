//! Spawning and respawning the router image (spec §4.E step 6).

use std::os::fd::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use thiserror::Error;

/// How long a child must stay alive for a non-normal exit to count as a
/// crash worth respawning from, rather than a fast-failing image worth
/// giving up on (spec §4.E step 6 default: 5 seconds).
pub const DEFAULT_MIN_LIFETIME: Duration = Duration::from_secs(5);

/// Errors raised while spawning the router image.
#[derive(Error, Debug)]
pub enum SpawnError {
    /// Clearing the close-on-exec flag on the listening socket failed.
    #[error("failed to clear close-on-exec on socket fd {fd}: {source}")]
    ClearCloexec {
        /// The fd this operation targeted.
        fd: RawFd,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// `Command::spawn` failed.
    #[error("failed to spawn router image: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Which flag the router image should be started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFlag {
    /// First spawn of this display's lifetime.
    InitialSpawn,
    /// Respawn after an observed crash.
    Respawn,
}

impl StartFlag {
    fn as_arg(self) -> &'static str {
        match self {
            Self::InitialSpawn => "--initial-spawn",
            Self::Respawn => "--respawn",
        }
    }
}

/// Clear `FD_CLOEXEC` on `fd` so it survives across `exec` with the same
/// descriptor number in the child, letting every respawn reuse the one
/// listening socket the supervisor opened at startup.
///
/// # Errors
///
/// Any `fcntl` failure reading or writing the descriptor flags.
#[allow(unsafe_code)]
pub fn clear_cloexec(fd: RawFd) -> Result<(), SpawnError> {
    // SAFETY: `fd` is a valid open descriptor the caller owns for the
    // duration of this call; `fcntl` with `F_GETFD`/`F_SETFD` only reads
    // or writes that descriptor's flags.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(SpawnError::ClearCloexec { fd, source: std::io::Error::last_os_error() });
        }
        if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
            return Err(SpawnError::ClearCloexec { fd, source: std::io::Error::last_os_error() });
        }
    }
    Ok(())
}

/// Spawn the router image, returning the child and the instant it was
/// spawned at (the latter feeds [`wait_and_decide`]'s lifetime check).
///
/// # Errors
///
/// [`SpawnError::Spawn`] if `Command::spawn` fails.
pub fn spawn_router(
    router_image: &Path,
    socket_fd: RawFd,
    socket_path: &Path,
    flag: StartFlag,
) -> Result<(Child, Instant), SpawnError> {
    let child = Command::new(router_image)
        .arg(flag.as_arg())
        .arg(format!("--socket-fd={socket_fd}"))
        .arg("--socket-path")
        .arg(socket_path)
        .spawn()?;
    Ok((child, Instant::now()))
}

/// What the supervisor should do after a child exits (spec §4.E step 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespawnDecision {
    /// The child exited normally or was deliberately terminated; the
    /// supervisor should shut down too.
    Quit,
    /// The child crashed after living at least the minimum lifetime;
    /// spawn another one with `--respawn`.
    Respawn,
    /// The child crashed too quickly to be worth retrying; give up.
    Abandon,
}

/// Wait for `child` to exit and classify the outcome.
///
/// # Errors
///
/// Any I/O failure from `Child::wait`.
pub fn wait_and_decide(
    child: &mut Child,
    started: Instant,
    min_lifetime: Duration,
) -> std::io::Result<RespawnDecision> {
    let status = child.wait()?;
    if status.success() {
        return Ok(RespawnDecision::Quit);
    }
    if matches!(status.signal(), Some(libc::SIGTERM) | Some(libc::SIGINT)) {
        return Ok(RespawnDecision::Quit);
    }
    if started.elapsed() >= min_lifetime {
        Ok(RespawnDecision::Respawn)
    } else {
        Ok(RespawnDecision::Abandon)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn quick_clean_exit_quits() {
        let mut child = Command::new("/bin/true").spawn().unwrap();
        let decision = wait_and_decide(&mut child, Instant::now(), DEFAULT_MIN_LIFETIME).unwrap();
        assert_eq!(decision, RespawnDecision::Quit);
    }

    #[test]
    fn quick_crash_is_abandoned() {
        let mut child = Command::new("/bin/false").spawn().unwrap();
        let decision = wait_and_decide(&mut child, Instant::now(), DEFAULT_MIN_LIFETIME).unwrap();
        assert_eq!(decision, RespawnDecision::Abandon);
    }

    #[test]
    fn crash_after_min_lifetime_respawns() {
        let mut child = Command::new("/bin/false").spawn().unwrap();
        let started = Instant::now() - Duration::from_secs(10);
        let decision = wait_and_decide(&mut child, started, DEFAULT_MIN_LIFETIME).unwrap();
        assert_eq!(decision, RespawnDecision::Respawn);
    }
}
