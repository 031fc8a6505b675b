//! A running router plus the listening socket clients connect to.

use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;

use mds_router::Router;

use crate::client::SimClient;

/// One in-process router, bound to a socket under a temporary directory
/// that is removed when the cluster drops.
pub struct SimCluster {
    router: Arc<Router>,
    listener: UnixListener,
    socket_path: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl SimCluster {
    /// Start a fresh router with an empty client table, listening on a
    /// freshly created temporary socket.
    #[must_use]
    pub fn start() -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir for simulated socket");
        let socket_path = temp_dir.path().join("mds.socket");
        let listener =
            mds_router::transport::bind(&socket_path).expect("bind simulated router socket");
        let router = Arc::new(Router::new());
        spawn_accept_loop(Arc::clone(&router), &listener);
        Self { router, listener, socket_path, _temp_dir: temp_dir }
    }

    /// Connect a new simulated client to this cluster's router.
    #[must_use]
    pub fn connect(&self) -> SimClient {
        SimClient::connect(&self.socket_path)
    }

    /// The router this cluster is driving, for invariant checks that need
    /// direct access to its client table.
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Trigger a re-exec in place (spec §4.F, scenario 6): snapshot the
    /// router's state, stop the current accept loop, rebuild a new
    /// [`Router`] from the snapshot, and resume reading for every restored
    /// client on the very socket that survived (the listener itself is
    /// never recreated — a real `exec` preserves it by descriptor number,
    /// and here it simply is the same Rust value).
    pub fn reexec_in_place(&mut self) {
        self.router.begin_reexecing();
        // Unblock the old accept loop's blocking `accept()` so it observes
        // `reexecing` and returns; the real process doesn't need this
        // nudge because `exec` tears the old image down outright.
        let _ = UnixStream::connect(&self.socket_path);

        let snapshot = self.router.snapshot();
        let (router, clients) = Router::restore(snapshot);
        let router = Arc::new(router);
        for client in clients {
            let router = Arc::clone(&router);
            // SAFETY: every restored client's fd is still open and owned
            // by this process; no real `exec` happened, so the connection
            // itself never moved.
            #[allow(unsafe_code)]
            std::thread::spawn(move || unsafe {
                mds_router::transport::resume_client(router, client);
            });
        }
        let listener = self.listener.try_clone().expect("clone simulated listener");
        spawn_accept_loop(Arc::clone(&router), &listener);
        self.router = router;
    }
}

fn spawn_accept_loop(router: Arc<Router>, listener: &UnixListener) {
    let listener = listener.try_clone().expect("clone listener for accept-loop thread");
    std::thread::spawn(move || mds_router::transport::accept_loop(router, &listener));
}
