//! Router process entry point (spec §4.E step 6, §6.3).
//!
//! Started by the supervisor with an inherited listening socket fd and one
//! of `--initial-spawn`/`--respawn`/`--re-exec`. Registers signal handlers,
//! accepts connections, and on the re-exec signal marshals its state into
//! shared memory and re-execs the same on-disk image.

use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use mds_core::lifecycle::run_init_hooks;
use mds_core::{ModuleArgs, StartMode};
use mds_router::Router;
use mds_router::reexec;
use mds_router::transport;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Router-specific flags, layered on top of the flags every module binary
/// shares.
#[derive(Debug, Parser)]
#[command(name = "mds-router")]
#[command(about = "Central message router for the micro-display-server runtime")]
struct Args {
    #[command(flatten)]
    module: ModuleArgs,

    /// Path of the listening socket this process's `--socket-fd` refers to,
    /// used only to open the naming-service seed connection to itself
    /// (spec §4.D.5).
    #[arg(long)]
    socket_path: PathBuf,
}

static TERMINATE_REQUESTED: AtomicBool = AtomicBool::new(false);
static REEXEC_REQUESTED: AtomicBool = AtomicBool::new(false);
static DANGER_REQUESTED: AtomicBool = AtomicBool::new(false);
static INFO_DUMP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_signum: i32) {
    TERMINATE_REQUESTED.store(true, Ordering::Release);
}

extern "C" fn on_reexec_signal(_signum: i32) {
    REEXEC_REQUESTED.store(true, Ordering::Release);
}

extern "C" fn on_danger_signal(_signum: i32) {
    DANGER_REQUESTED.store(true, Ordering::Release);
}

extern "C" fn on_info_signal(_signum: i32) {
    INFO_DUMP_REQUESTED.store(true, Ordering::Release);
}

/// Register the substrate's signal handlers (spec §5 "Signal discipline").
///
/// The re-exec, danger (low memory), and info (state dump) signals share
/// the real-time signal range starting at `SIGRTMIN()`; `SIGUSR1`/`SIGUSR2`
/// are left untouched here since spec §5 reserves them for the VT module's
/// TTY-switch protocol.
///
/// # Safety
///
/// Must run before any other thread is spawned; `libc::signal` is only
/// sound to call while the process is still single-threaded with respect
/// to signal disposition changes for these signals.
#[allow(unsafe_code)]
fn install_signal_handlers() {
    // SAFETY: handlers only store to atomics, which is async-signal-safe;
    // no heap allocation or locking happens inside either handler.
    unsafe {
        libc::signal(libc::SIGTERM, on_terminate as libc::sighandler_t);
        libc::signal(libc::SIGINT, on_terminate as libc::sighandler_t);
        libc::signal(libc::SIGRTMIN(), on_reexec_signal as libc::sighandler_t);
        libc::signal(libc::SIGRTMIN() + 1, on_danger_signal as libc::sighandler_t);
        libc::signal(libc::SIGRTMIN() + 2, on_info_signal as libc::sighandler_t);
    }
}

/// Schedule `SIGALRM` as the forced-abort ceiling `--alarm=SEC` requests
/// (spec §6.3); a module that hangs past this deadline is killed by the
/// signal's default disposition rather than wedging the host forever.
fn arm_alarm(args: &ModuleArgs) {
    if let Some(secs) = args.alarm_secs() {
        // SAFETY: `libc::alarm` has no preconditions beyond a valid `u32`.
        #[allow(unsafe_code)]
        let remaining = unsafe { libc::alarm(u32::try_from(secs).unwrap_or(u32::MAX)) };
        tracing::info!(secs, previous_remaining = remaining, "armed forced-abort alarm");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();
    init_tracing();
    install_signal_handlers();
    arm_alarm(&args.module);

    let pid = std::process::id();
    let start_mode = args.module.start_mode();
    tracing::info!(?start_mode, pid, "mds-router starting");

    let socket_fd = args.module.socket_fd.expect("supervisor always passes --socket-fd");

    let (router, restored_clients) = match start_mode {
        StartMode::ReExec => match reexec::read_snapshot(pid) {
            Ok(snapshot) => {
                let (router, clients) = Router::restore(snapshot);
                tracing::info!(clients = clients.len(), "restored router state after re-exec");
                (Arc::new(router), clients)
            },
            Err(err) => {
                tracing::error!(%err, "failed to read re-exec snapshot; starting fresh");
                (Arc::new(Router::new()), Vec::new())
            },
        },
        StartMode::InitialSpawn | StartMode::Respawn => (Arc::new(Router::new()), Vec::new()),
    };

    // SAFETY: resuming a client whose fd was preserved across exec by
    // number, per spec §4.F; each is wrapped exactly once.
    #[allow(unsafe_code)]
    for client in restored_clients {
        let router = Arc::clone(&router);
        std::thread::spawn(move || unsafe { transport::resume_client(router, client) });
    }

    // SAFETY: `socket_fd` was handed to this process by the supervisor,
    // which owns the listening socket and guarantees it is otherwise
    // unowned here.
    #[allow(unsafe_code)]
    let listener = unsafe { transport::from_inherited_fd(socket_fd as RawFd) };

    {
        let router = Arc::clone(&router);
        let listener_for_accept =
            listener.try_clone().expect("inherited listener supports try_clone");
        std::thread::spawn(move || transport::accept_loop(router, &listener_for_accept));
    }

    if matches!(start_mode, StartMode::InitialSpawn) {
        send_seed_messages(&args.socket_path);
    }

    run_init_hooks(&args.module);

    loop {
        std::thread::sleep(std::time::Duration::from_millis(200));
        if TERMINATE_REQUESTED.load(Ordering::Acquire) {
            router.begin_terminating();
            tracing::info!("terminating");
            break;
        }
        if REEXEC_REQUESTED.load(Ordering::Acquire) {
            router.begin_reexecing();
            tracing::info!("re-exec requested");
            if let Err(err) = perform_reexec(&router) {
                tracing::error!(%err, "re-exec failed; continuing to run");
                REEXEC_REQUESTED.store(false, Ordering::Release);
                continue;
            }
            unreachable!("perform_reexec only returns on failure");
        }
        if DANGER_REQUESTED.swap(false, Ordering::AcqRel) {
            if args.module.immortal {
                tracing::debug!("danger signal ignored (--immortal)");
            } else {
                tracing::info!("danger signal received; shrinking buffers");
                router.shrink_all_buffers();
            }
        }
        if INFO_DUMP_REQUESTED.swap(false, Ordering::AcqRel) {
            let summary = router.state_summary();
            tracing::info!(
                clients = summary.clients,
                subscriptions = summary.subscriptions,
                pending_rendezvous = summary.pending_rendezvous,
                "state dump"
            );
        }
    }

    std::process::ExitCode::SUCCESS
}

fn send_seed_messages(socket_path: &std::path::Path) {
    match UnixStream::connect(socket_path) {
        Ok(mut stream) => {
            for message in transport::seed_messages() {
                if let Err(err) = transport::write_message(&mut stream, &message) {
                    tracing::warn!(%err, "failed to send naming-service seed message");
                }
            }
            // The connection is deliberately leaked as a live client: the
            // accept loop has already spawned a reader thread for it, and
            // that thread owns `stream`'s peer from here on.
            std::mem::forget(stream);
        },
        Err(err) => tracing::warn!(%err, "failed to open naming-service seed connection"),
    }
}

fn perform_reexec(router: &Router) -> std::io::Result<()> {
    let snapshot = router.snapshot();
    reexec::write_snapshot(std::process::id(), &snapshot)?;
    let image = reexec::resolve_self_exe()?;
    let original_args: Vec<String> = std::env::args().skip(1).collect();
    Err(reexec::reexec_into(&image, &original_args))
}
