//! Shared module argument parsing and startup lifecycle (spec §6.3).
//!
//! Every module binary — the router itself, and any domain module built
//! against this substrate — starts from the same small set of flags. This
//! mirrors `mds-base`'s option-parsing skeleton in the original
//! implementation: one struct, reused rather than re-derived per binary.

use std::process::Command;

use clap::Args;
use tracing::{info, warn};

/// CLI flags shared by every module binary (spec §6.3).
///
/// `--initial-spawn`, `--respawn`, and `--re-exec` are mutually exclusive;
/// `clap`'s derive enforces this with a conflict group rather than
/// hand-written validation.
#[derive(Debug, Clone, Args)]
pub struct ModuleArgs {
    /// First-time start.
    #[arg(long, conflicts_with_all = ["respawn", "re_exec"])]
    pub initial_spawn: bool,

    /// Restart after the supervisor observed a crash.
    #[arg(long = "respawn", conflicts_with_all = ["initial_spawn", "re_exec"])]
    pub respawn: bool,

    /// Reload from the re-exec shared-memory region.
    #[arg(long = "re-exec", conflicts_with_all = ["initial_spawn", "respawn"])]
    pub re_exec: bool,

    /// Inherited listening or connected file descriptor.
    #[arg(long)]
    pub socket_fd: Option<i32>,

    /// Schedule `SIGALRM` this many seconds out as a forced-abort ceiling.
    /// Capped at 60 seconds regardless of the requested value.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub alarm: Option<u64>,

    /// Fork to the background once initialized.
    #[arg(long)]
    pub on_init_fork: bool,

    /// Run this shell command once initialized.
    #[arg(long)]
    pub on_init_sh: Option<String>,

    /// Ignore the low-memory ("danger") self-shrink signal.
    #[arg(long)]
    pub immortal: bool,
}

/// The upper bound `--alarm` is clamped to (spec §6.3).
pub const MAX_ALARM_SECS: u64 = 60;

impl ModuleArgs {
    /// The effective alarm duration, clamped to [`MAX_ALARM_SECS`].
    #[must_use]
    pub fn alarm_secs(&self) -> Option<u64> {
        self.alarm.map(|secs| secs.min(MAX_ALARM_SECS))
    }

    /// Which of the three mutually exclusive start modes was requested.
    #[must_use]
    pub fn start_mode(&self) -> StartMode {
        if self.re_exec {
            StartMode::ReExec
        } else if self.respawn {
            StartMode::Respawn
        } else {
            StartMode::InitialSpawn
        }
    }
}

/// The mode a module binary was started in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// First-time start (`--initial-spawn`, or neither flag given).
    InitialSpawn,
    /// Restarted by the supervisor after a crash.
    Respawn,
    /// Resuming from a re-exec shared-memory blob.
    ReExec,
}

/// Runs the `--on-init-fork` / `--on-init-sh` one-shot hooks once a module
/// has finished initializing.
///
/// Grounded on the original implementation's post-init hook support:
/// optional, run at most once, failures are logged but non-fatal (a
/// misbehaving init hook must not take down an otherwise healthy module).
pub fn run_init_hooks(args: &ModuleArgs) {
    if args.on_init_fork {
        // SAFETY: justified in the supervisor, which actually forks; here
        // we only document that this flag exists for modules that choose
        // to implement backgrounding themselves. This substrate does not
        // fork on a module's behalf.
        info!("on-init-fork requested; module is responsible for backgrounding itself");
    }
    if let Some(command) = &args.on_init_sh {
        info!(command, "running on-init-sh hook");
        match Command::new("/bin/sh").arg("-c").arg(command).status() {
            Ok(status) if status.success() => {},
            Ok(status) => warn!(?status, command, "on-init-sh hook exited non-zero"),
            Err(error) => warn!(%error, command, "failed to spawn on-init-sh hook"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn alarm_is_clamped_to_sixty_seconds() {
        let args = ModuleArgs {
            initial_spawn: true,
            respawn: false,
            re_exec: false,
            socket_fd: None,
            alarm: Some(600),
            on_init_fork: false,
            on_init_sh: None,
            immortal: false,
        };
        assert_eq!(args.alarm_secs(), Some(MAX_ALARM_SECS));
    }

    #[test]
    fn start_mode_defaults_to_initial_spawn() {
        let args = ModuleArgs {
            initial_spawn: false,
            respawn: false,
            re_exec: false,
            socket_fd: None,
            alarm: None,
            on_init_fork: false,
            on_init_sh: None,
            immortal: false,
        };
        assert_eq!(args.start_mode(), StartMode::InitialSpawn);
    }

    #[test]
    fn start_mode_recognizes_re_exec() {
        let args = ModuleArgs {
            initial_spawn: false,
            respawn: false,
            re_exec: true,
            socket_fd: None,
            alarm: None,
            on_init_fork: false,
            on_init_sh: None,
            immortal: false,
        };
        assert_eq!(args.start_mode(), StartMode::ReExec);
    }
}
