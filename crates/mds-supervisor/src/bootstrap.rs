//! Display-index resolution and the runtime/storage directory layout
//! (spec §4.E steps 1-2, §6.4).

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors raised while preparing or tearing down a display's filesystem
/// state.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// A filesystem operation on `path` failed.
    #[error("{path}: {source}")]
    Io {
        /// The path the failing operation targeted.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl BootstrapError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io { path: path.to_path_buf(), source }
    }
}

/// The filesystem locations a single display owns (spec §6.4).
#[derive(Debug, Clone)]
pub struct DisplayPaths {
    /// The shared runtime directory (`<runtime>`), holding every display's
    /// PID file and socket.
    pub runtime_dir: PathBuf,
    /// The shared per-user storage root (`<storage>`), holding every
    /// display's persistent-data subtree.
    pub storage_root: PathBuf,
    /// The resolved display index, `N`.
    pub display: u32,
}

impl DisplayPaths {
    /// `<runtime>/N.pid`.
    #[must_use]
    pub fn pid_file(&self) -> PathBuf {
        self.runtime_dir.join(format!("{}.pid", self.display))
    }

    /// `<runtime>/N.socket`.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir.join(format!("{}.socket", self.display))
    }

    /// `<storage>/N.data/`.
    #[must_use]
    pub fn storage_dir(&self) -> PathBuf {
        self.storage_root.join(format!("{}.data", self.display))
    }

    /// The `MDS_DISPLAY` value this display exports (spec §6.5).
    #[must_use]
    pub fn display_env_value(&self) -> String {
        format!(":{}", self.display)
    }
}

/// Resolve a free display index by checking `<runtime>/N.pid` files in
/// order starting at 1; a file whose recorded PID is no longer alive may
/// be reused (spec §4.E step 1).
///
/// # Errors
///
/// Any I/O failure reading a candidate PID file other than "not found".
pub fn resolve_display(runtime_dir: &Path) -> Result<u32, BootstrapError> {
    let mut candidate = 1u32;
    loop {
        let pid_file = runtime_dir.join(format!("{candidate}.pid"));
        match fs::read_to_string(&pid_file) {
            Ok(contents) => {
                let recorded_pid = contents.trim().parse::<i32>().ok();
                if recorded_pid.is_none_or(|pid| !pid_is_alive(pid)) {
                    return Ok(candidate);
                }
                candidate += 1;
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(candidate),
            Err(err) => return Err(BootstrapError::io(&pid_file, err)),
        }
    }
}

#[allow(unsafe_code)]
fn pid_is_alive(pid: i32) -> bool {
    // SAFETY: signal 0 sends nothing; it only probes whether `pid` exists
    // and is visible to this process, which is exactly what this check
    // needs and never touches the target's memory.
    unsafe { libc::kill(pid, 0) == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM) }
}

/// Create the shared runtime and storage directories if they don't
/// already exist, and this display's storage subtree (spec §4.E step 2).
///
/// The root-owned/real-uid-owned modes the spec calls for only take effect
/// when the supervisor is actually running with elevated privileges;
/// this function applies the requested mode bits unconditionally and
/// leaves ownership to whatever process creates the directory first.
///
/// # Errors
///
/// Any I/O failure creating a directory or setting its permissions.
pub fn prepare_directories(paths: &DisplayPaths) -> Result<(), BootstrapError> {
    create_dir_with_mode(&paths.runtime_dir, 0o755)?;
    create_dir_with_mode(&paths.storage_root, 0o700)?;
    create_dir_with_mode(&paths.storage_dir(), 0o700)?;
    Ok(())
}

fn create_dir_with_mode(path: &Path, mode: u32) -> Result<(), BootstrapError> {
    match fs::create_dir_all(path) {
        Ok(()) => {},
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {},
        Err(err) => return Err(BootstrapError::io(path, err)),
    }
    let mut permissions = fs::metadata(path).map_err(|err| BootstrapError::io(path, err))?.permissions();
    permissions.set_mode(mode);
    fs::set_permissions(path, permissions).map_err(|err| BootstrapError::io(path, err))
}

/// Write this display's PID file (spec §6.4: mode 0644).
///
/// # Errors
///
/// Any I/O failure writing or chmod-ing the file.
pub fn write_pid_file(paths: &DisplayPaths, pid: u32) -> Result<(), BootstrapError> {
    let pid_file = paths.pid_file();
    fs::write(&pid_file, pid.to_string()).map_err(|err| BootstrapError::io(&pid_file, err))?;
    let mut permissions =
        fs::metadata(&pid_file).map_err(|err| BootstrapError::io(&pid_file, err))?.permissions();
    permissions.set_mode(0o644);
    fs::set_permissions(&pid_file, permissions).map_err(|err| BootstrapError::io(&pid_file, err))
}

/// Whether `path`'s owning uid matches `uid` — used after creating the
/// socket to verify the invoking user, not the supervisor's elevated
/// identity, owns it (spec §4.E step 3).
#[must_use]
pub fn owned_by(path: &Path, uid: u32) -> bool {
    fs::metadata(path).is_ok_and(|metadata| metadata.uid() == uid)
}

/// Tear down everything this display created (spec §4.E step 7): the
/// socket, the PID file, the storage subtree, and — best-effort — the
/// shared directories, ignoring "not empty" since another display may
/// still be using them.
pub fn cleanup(paths: &DisplayPaths) {
    let _ = fs::remove_file(paths.socket_path());
    let _ = fs::remove_file(paths.pid_file());
    let _ = fs::remove_dir_all(paths.storage_dir());
    ignore_not_empty(fs::remove_dir(&paths.runtime_dir));
    ignore_not_empty(fs::remove_dir(&paths.storage_root));
}

fn ignore_not_empty(result: std::io::Result<()>) {
    if let Err(err) = result {
        if !matches!(err.raw_os_error(), Some(libc::ENOTEMPTY)) && err.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(%err, "failed to remove shared directory");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn resolve_display_starts_at_one_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_display(dir.path()).unwrap(), 1);
    }

    #[test]
    fn resolve_display_skips_live_pid() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("1.pid"), std::process::id().to_string()).unwrap();
        assert_eq!(resolve_display(dir.path()).unwrap(), 2);
    }

    #[test]
    fn resolve_display_reuses_dead_pid() {
        let dir = tempfile::tempdir().unwrap();
        // PID 999999 is vanishingly unlikely to be alive in a test sandbox.
        fs::write(dir.path().join("1.pid"), "999999").unwrap();
        assert_eq!(resolve_display(dir.path()).unwrap(), 1);
    }

    #[test]
    fn prepare_directories_creates_expected_tree() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DisplayPaths {
            runtime_dir: dir.path().join("runtime"),
            storage_root: dir.path().join("storage"),
            display: 3,
        };
        prepare_directories(&paths).unwrap();
        assert!(paths.storage_dir().is_dir());
        assert_eq!(paths.display_env_value(), ":3");
    }

    #[test]
    fn cleanup_removes_pid_file_and_storage_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DisplayPaths {
            runtime_dir: dir.path().join("runtime"),
            storage_root: dir.path().join("storage"),
            display: 1,
        };
        prepare_directories(&paths).unwrap();
        write_pid_file(&paths, std::process::id()).unwrap();
        cleanup(&paths);
        assert!(!paths.pid_file().exists());
        assert!(!paths.storage_dir().exists());
    }
}
