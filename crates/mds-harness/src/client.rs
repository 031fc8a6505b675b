//! A simulated client: a real connected socket plus small helpers for the
//! handful of control messages end-to-end scenarios send most often.

use std::io::ErrorKind;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use mds_proto::{ClientId, Codec, HeaderList, Message, ReadOutcome, control};

/// How long [`SimClient::recv`] waits for a message before giving up.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// One simulated client connection.
pub struct SimClient {
    stream: UnixStream,
    codec: Codec,
    next_message_id: u64,
}

impl SimClient {
    /// Connect a new client to the router listening at `path`.
    #[must_use]
    pub fn connect(path: &Path) -> Self {
        let stream = UnixStream::connect(path).expect("connect simulated client");
        Self { stream, codec: Codec::new(), next_message_id: 1 }
    }

    fn fresh_message_id(&mut self) -> u64 {
        let id = self.next_message_id;
        self.next_message_id += 1;
        id
    }

    /// Send a message as-is.
    pub fn send(&mut self, message: &Message) {
        mds_router::transport::write_message(&mut self.stream, message)
            .expect("write to simulated router connection");
    }

    /// Block up to `timeout` for the next complete message on this
    /// connection.
    #[must_use]
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<Message> {
        self.stream.set_read_timeout(Some(timeout)).expect("set read timeout");
        let deadline = std::time::Instant::now() + timeout;
        let mut buf = [0u8; 4096];
        loop {
            match self.codec.poll() {
                ReadOutcome::Complete(message) => return Some(message),
                ReadOutcome::Malformed(_) => return None,
                ReadOutcome::NeedMore => {},
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            use std::io::Read;
            match self.stream.read(&mut buf) {
                Ok(0) => return None,
                Ok(n) => self.codec.feed(&buf[..n]),
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return None;
                },
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return None,
            }
        }
    }

    /// Block up to [`DEFAULT_RECV_TIMEOUT`] for the next complete message.
    #[must_use]
    pub fn recv(&mut self) -> Option<Message> {
        self.recv_timeout(DEFAULT_RECV_TIMEOUT)
    }

    /// Send `Command: assign-id` and wait for the `ID assignment` reply,
    /// returning the assigned [`ClientId`].
    #[must_use]
    pub fn assign_id(&mut self) -> ClientId {
        let message_id = self.fresh_message_id();
        let mut headers = HeaderList::new();
        headers.push(control::COMMAND, control::COMMAND_ASSIGN_ID).expect("header fits");
        headers.push(control::MESSAGE_ID, message_id.to_string()).expect("header fits");
        self.send(&Message::new(headers));

        let reply = self.recv().expect("assign-id reply");
        let raw = reply
            .headers
            .iter()
            .find(|(name, _)| *name == control::ID_ASSIGNMENT)
            .map(|(_, value)| value)
            .expect("ID assignment header in reply");
        ClientId::parse(raw).expect("well-formed assigned client id")
    }

    /// Send `Command: intercept` subscribing to `pattern` at `priority`,
    /// optionally as a modifying subscriber.
    pub fn intercept(&mut self, pattern: &str, priority: i64, modifying: bool) {
        let payload = format!("{pattern}\n");
        let mut headers = HeaderList::new();
        headers.push(control::COMMAND, control::COMMAND_INTERCEPT).expect("header fits");
        if priority != 0 {
            headers.push(control::PRIORITY, priority.to_string()).expect("header fits");
        }
        if modifying {
            headers.push(control::MODIFYING, control::YES).expect("header fits");
        }
        headers.push(control::LENGTH, payload.len().to_string()).expect("header fits");
        self.send(&Message::with_payload(headers, payload));
    }

    /// Reply to a pending modify rendezvous, rewriting the payload to
    /// `new_payload` (use an empty payload to consume the multicast).
    pub fn reply_modify(&mut self, modify_id: &str, new_payload: &str) {
        let mut headers = HeaderList::new();
        headers.push(control::MODIFYING, control::YES).expect("header fits");
        headers.push(control::MODIFY_ID, modify_id).expect("header fits");
        headers.push(control::MODIFY, control::YES).expect("header fits");
        headers.push(control::LENGTH, new_payload.len().to_string()).expect("header fits");
        self.send(&Message::with_payload(headers, new_payload.to_string()));
    }

    /// Send an arbitrary headers-only command message, returning its
    /// `Message ID` for correlating a reply.
    pub fn send_headers(&mut self, mut headers: HeaderList) -> u64 {
        let message_id = self.fresh_message_id();
        headers.push(control::MESSAGE_ID, message_id.to_string()).expect("header fits");
        self.send(&Message::new(headers));
        message_id
    }
}
