//! Unix-domain-socket transport and the per-connection reader loop (spec
//! §4.D.1, §5).
//!
//! Each accepted connection gets its own OS thread. The loop alternates
//! between draining this client's queued work and attempting a read; the
//! read carries a short timeout so the thread notices `terminating` or
//! `reexecing` promptly without needing a dedicated signal-delivery
//! mechanism per socket.

use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use mds_proto::codec::{self, ReadOutcome};
use mds_proto::control;
use mds_proto::{HeaderList, Message};

use crate::router::Router;

/// How long a single read blocks before the reader thread re-checks the
/// router's shutdown/re-exec flags. Keeping this short trades a little CPU
/// for responsiveness; it plays the same role as the 1-second modify-reply
/// poll in spec §5 but doesn't need to match it exactly.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Bind the listening socket at `path`, per spec §4.E step 3. The caller is
/// responsible for the mode/ownership the supervisor applies before handing
/// control here.
pub fn bind(path: &std::path::Path) -> std::io::Result<UnixListener> {
    UnixListener::bind(path)
}

/// Adopt an already-open listening socket inherited via `--socket-fd=N`
/// (spec §6.3).
///
/// # Safety
///
/// `fd` must be a valid, open, otherwise-unowned file descriptor for a
/// bound Unix stream listening socket; ownership transfers to the returned
/// `UnixListener`, which will close it on drop.
#[allow(unsafe_code)]
pub unsafe fn from_inherited_fd(fd: RawFd) -> UnixListener {
    UnixListener::from_raw_fd(fd)
}

/// Accept connections on `listener` until the router begins terminating or
/// re-execing, spawning one reader thread per accepted connection.
pub fn accept_loop(router: Arc<Router>, listener: &UnixListener) {
    if let Err(err) = listener.set_nonblocking(false) {
        tracing::error!(%err, "failed to put listener into blocking mode");
        return;
    }
    loop {
        if router.is_terminating() || router.is_reexecing() {
            return;
        }
        match listener.accept() {
            Ok((stream, _addr)) => {
                let router = Arc::clone(&router);
                std::thread::spawn(move || run_client(router, stream));
            },
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::error!(%err, "accept failed");
                return;
            },
        }
    }
}

/// Drive one accepted connection for its entire lifetime: register it,
/// alternate draining queued work with reads, and deregister it on close
/// (spec §4.D.1).
pub fn run_client(router: Arc<Router>, stream: UnixStream) {
    let client = router.register(stream.as_raw_fd());
    tracing::debug!(conn_id = %client.conn_id(), "client connected");
    run_registered_client(router, client, stream);
}

/// Resume reading for a client that already exists in the router's table —
/// the case after a re-exec, where [`crate::reexec::RouterSnapshot`]
/// restoration already repopulated the client table and only a reader
/// thread is missing (spec §4.F step 5).
///
/// # Safety
///
/// `client.fd()` must be an open, connected Unix stream socket that this
/// process owns and has not already wrapped in another `UnixStream`;
/// `exec` is documented to preserve it by descriptor number, which is the
/// only reason this is sound here.
#[allow(unsafe_code)]
pub unsafe fn resume_client(router: Arc<Router>, client: Arc<crate::client::Client>) {
    // SAFETY: see function-level safety comment.
    let stream = unsafe { UnixStream::from_raw_fd(client.fd()) };
    tracing::debug!(conn_id = %client.conn_id(), "client resumed after re-exec");
    run_registered_client(router, client, stream);
}

fn run_registered_client(router: Arc<Router>, client: Arc<crate::client::Client>, mut stream: UnixStream) {
    if let Err(err) = stream.set_read_timeout(Some(READ_POLL_INTERVAL)) {
        tracing::warn!(%err, "failed to set read timeout; falling back to blocking reads");
    }

    let mut read_buf = [0u8; 4096];

    'reader: loop {
        if router.is_terminating() || router.is_reexecing() {
            break;
        }

        while router.advance_multicast(&client).unwrap_or(false) {}

        for message in client.drain_outbound() {
            if write_message(&mut stream, &message).is_err() {
                break 'reader;
            }
        }

        match stream.read(&mut read_buf) {
            Ok(0) => break,
            Ok(n) => {
                client.with_codec(|codec| codec.feed(&read_buf[..n]));
                loop {
                    match client.with_codec(mds_proto::Codec::poll) {
                        ReadOutcome::NeedMore => break,
                        ReadOutcome::Complete(message) => {
                            if let Err(err) = router.dispatch(&client, message) {
                                tracing::warn!(conn_id = %client.conn_id(), %err, "dispatch error");
                            }
                        },
                        ReadOutcome::Malformed(err) => {
                            tracing::warn!(conn_id = %client.conn_id(), %err, "malformed message");
                            break 'reader;
                        },
                    }
                }
            },
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                continue;
            },
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::debug!(conn_id = %client.conn_id(), %err, "read error");
                break;
            },
        }
    }

    router.announce_closed(&client);
    // Drain whatever the close announcement produced for clients whose
    // reader threads already moved past their last drain.
    for message in client.drain_outbound() {
        let _ = write_message(&mut stream, &message);
    }
    router.deregister(client.conn_id());
    tracing::debug!(conn_id = %client.conn_id(), "client disconnected");
}

/// Frame and write a single message to `stream`.
///
/// # Errors
///
/// Any I/O failure writing the framed bytes.
pub fn write_message(stream: &mut UnixStream, message: &Message) -> std::io::Result<()> {
    let mut buffer = BytesMut::with_capacity(codec::compose_size(message));
    codec::compose(message, &mut buffer);
    stream.write_all(&buffer)
}

/// Send the two naming-service seed messages (spec §4.D.5) over the
/// router's own loopback connection.
pub fn seed_messages() -> [Message; 2] {
    let mut closed_interest = HeaderList::new();
    closed_interest.push(control::COMMAND, control::COMMAND_INTERCEPT).ok();
    let client_closed = Message::with_payload(closed_interest, control::CLIENT_CLOSED);

    let mut reannounce = HeaderList::new();
    reannounce.push(control::COMMAND, control::COMMAND_INTERCEPT).ok();
    let reannounce_request = Message::with_payload(reannounce, control::COMMAND);

    [client_closed, reannounce_request]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn seed_messages_are_catch_all_intercepts() {
        let [closed, reannounce] = seed_messages();
        assert_eq!(closed.control().command(), Some(control::COMMAND_INTERCEPT));
        assert_eq!(reannounce.control().command(), Some(control::COMMAND_INTERCEPT));
    }
}
