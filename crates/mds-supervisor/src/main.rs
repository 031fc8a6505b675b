//! Supervisor entry point: bootstraps one display and owns it for its
//! entire lifetime (spec §4.E).

use std::os::unix::net::UnixListener;
use std::path::PathBuf;

use clap::Parser;
use mds_supervisor::{
    DisplayPaths, RespawnDecision, StartFlag, clear_cloexec, privilege, resolve_display,
    spawn_router, wait_and_decide,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Supervises one display: creates its runtime directory and socket,
/// drops privileges, and spawns/respawns the router image.
#[derive(Debug, Parser)]
#[command(name = "mds-supervisor")]
struct Args {
    /// Shared runtime directory holding every display's PID file and
    /// socket.
    #[arg(long, default_value = "/run/mds")]
    runtime_dir: PathBuf,

    /// Shared per-user storage root.
    #[arg(long)]
    storage_root: PathBuf,

    /// Path to the router binary to spawn.
    #[arg(long, default_value = "mds-router")]
    router_image: PathBuf,

    /// Minimum lifetime, in seconds, a crashed router must have reached
    /// before the supervisor will respawn it.
    #[arg(long, default_value_t = 5)]
    min_lifetime_secs: u64,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();
    init_tracing();

    let display = match resolve_display(&args.runtime_dir) {
        Ok(display) => display,
        Err(err) => {
            tracing::error!(%err, "failed to resolve a free display index");
            return std::process::ExitCode::FAILURE;
        },
    };
    let paths =
        DisplayPaths { runtime_dir: args.runtime_dir.clone(), storage_root: args.storage_root.clone(), display };
    tracing::info!(display, "supervisor starting");

    if let Err(err) = mds_supervisor::bootstrap::prepare_directories(&paths) {
        tracing::error!(%err, "failed to prepare runtime/storage directories");
        return std::process::ExitCode::FAILURE;
    }
    if let Err(err) = mds_supervisor::bootstrap::write_pid_file(&paths, std::process::id()) {
        tracing::error!(%err, "failed to write PID file");
        return std::process::ExitCode::FAILURE;
    }

    let listener = match UnixListener::bind(paths.socket_path()) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, "failed to bind display socket");
            mds_supervisor::bootstrap::cleanup(&paths);
            return std::process::ExitCode::FAILURE;
        },
    };
    if let Err(err) = apply_socket_ownership(&paths) {
        tracing::warn!(%err, "failed to set socket mode/ownership");
    }

    let socket_fd = {
        use std::os::fd::AsRawFd;
        listener.as_raw_fd()
    };
    if let Err(err) = clear_cloexec(socket_fd) {
        tracing::error!(%err, "failed to prepare listening socket for exec");
        mds_supervisor::bootstrap::cleanup(&paths);
        return std::process::ExitCode::FAILURE;
    }

    if let Err(err) = privilege::drop_to_real_identity() {
        tracing::error!(%err, "failed to drop privileges; refusing to spawn router");
        mds_supervisor::bootstrap::cleanup(&paths);
        return std::process::ExitCode::FAILURE;
    }

    let pgroup = match privilege::new_process_group() {
        Ok(pgroup) => pgroup,
        Err(err) => {
            tracing::error!(%err, "failed to create process group");
            mds_supervisor::bootstrap::cleanup(&paths);
            return std::process::ExitCode::FAILURE;
        },
    };
    // SAFETY: single-threaded at this point; no other thread observes a
    // torn environment read.
    #[allow(unsafe_code)]
    unsafe {
        std::env::set_var("MDS_DISPLAY", paths.display_env_value());
        std::env::set_var("MDS_PGROUP", pgroup.to_string());
    }

    let min_lifetime = std::time::Duration::from_secs(args.min_lifetime_secs);
    let mut flag = StartFlag::InitialSpawn;
    loop {
        let (mut child, started) =
            match spawn_router(&args.router_image, socket_fd, &paths.socket_path(), flag) {
                Ok(spawned) => spawned,
                Err(err) => {
                    tracing::error!(%err, "failed to spawn router image");
                    break;
                },
            };
        tracing::info!(pid = child.id(), ?flag, "router spawned");

        match wait_and_decide(&mut child, started, min_lifetime) {
            Ok(RespawnDecision::Quit) => {
                tracing::info!("router exited normally; supervisor shutting down");
                break;
            },
            Ok(RespawnDecision::Respawn) => {
                tracing::warn!("router crashed after surviving its minimum lifetime; respawning");
                flag = StartFlag::Respawn;
            },
            Ok(RespawnDecision::Abandon) => {
                tracing::error!("router crashed too quickly; abandoning this display");
                break;
            },
            Err(err) => {
                tracing::error!(%err, "failed to wait for router child");
                break;
            },
        }
    }

    drop(listener);
    mds_supervisor::bootstrap::cleanup(&paths);
    std::process::ExitCode::SUCCESS
}

fn apply_socket_ownership(paths: &DisplayPaths) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = std::fs::metadata(paths.socket_path())?.permissions();
    permissions.set_mode(0o700);
    std::fs::set_permissions(paths.socket_path(), permissions)
}
