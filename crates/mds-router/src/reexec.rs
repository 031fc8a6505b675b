//! The re-exec controller (spec §4.F): snapshot every client's state into a
//! shared-memory object, `exec` the same on-disk image, and have the new
//! incarnation reconstruct the [`Router`] from that blob before resuming
//! reader threads.
//!
//! Client objects are identified in the snapshot by `conn_id` rather than
//! by memory address (spec §4.B's address-remapping technique exists
//! because the original implementation keys fd tables by pointer; this
//! port already keys everything by the stable [`ConnId`], so no remap
//! table is needed on unmarshal).

use std::collections::HashMap;
use std::ffi::CString;
use std::io::{Read, Write};
use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mds_core::marshal::{
    get_bytes, marshal_seq, marshal_seq_size, put_bytes, read_version_tag, unmarshal_seq,
};
use mds_core::{CoreError, Marshal, TicketId};
use mds_proto::codec::{marshal_message, message_marshal_size, unmarshal_codec, unmarshal_message};
use mds_proto::{ClientId, Message};

use crate::client::{Client, ConnId};
use crate::matcher::Condition;
use crate::multicast::MulticastInProgress;
use crate::router::Router;

/// One client's durable state, as carried across a re-exec.
struct ClientSnapshot {
    conn_id: u64,
    fd: RawFd,
    protocol_id: Option<u64>,
    conditions: Vec<Condition>,
    /// Already queued for delivery but not yet written to this client's
    /// socket (spec §8's "pending outbound buffers").
    outbound: Vec<Message>,
    /// Multicasts this client originated that have not yet finished fanning
    /// out to every target (spec §3's marshallable multicast container).
    multicast_queue: Vec<MulticastInProgress>,
    /// This client's in-flight frame-parser state, already marshalled via
    /// [`mds_proto::codec::marshal_codec`] (spec §4.A's partial read
    /// buffer).
    codec: Bytes,
}

impl Marshal for ClientSnapshot {
    const VERSION: u32 = 1;

    fn marshal_size(&self) -> usize {
        4 + 8
            + 4
            + 1
            + 8
            + marshal_seq_size(&self.conditions)
            + messages_marshal_size(&self.outbound)
            + marshal_seq_size(&self.multicast_queue)
            + 4
            + self.codec.len()
    }

    fn marshal(&self, buffer: &mut BytesMut) {
        buffer.put_u32(Self::VERSION);
        buffer.put_u64(self.conn_id);
        buffer.put_i32(self.fd);
        match self.protocol_id {
            Some(id) => {
                buffer.put_u8(1);
                buffer.put_u64(id);
            },
            None => {
                buffer.put_u8(0);
                buffer.put_u64(0);
            },
        }
        marshal_seq(buffer, &self.conditions);
        marshal_messages(buffer, &self.outbound);
        marshal_seq(buffer, &self.multicast_queue);
        put_bytes(buffer, &self.codec);
    }

    fn unmarshal(buffer: &mut Bytes) -> mds_core::marshal::Result<Self> {
        read_version_tag(buffer, Self::VERSION)?;
        if buffer.remaining() < 8 + 4 + 1 + 8 {
            return Err(CoreError::Truncated { context: "client snapshot" });
        }
        let conn_id = buffer.get_u64();
        let fd = buffer.get_i32();
        let has_id = buffer.get_u8() != 0;
        let raw_id = buffer.get_u64();
        let protocol_id = has_id.then_some(raw_id);
        let conditions = unmarshal_seq(buffer)?;
        let outbound = unmarshal_messages(buffer)?;
        let multicast_queue = unmarshal_seq(buffer)?;
        let codec = get_bytes(buffer, "client codec state")?;
        Ok(Self { conn_id, fd, protocol_id, conditions, outbound, multicast_queue, codec })
    }
}

/// Bytes [`marshal_messages`] would write for `messages`.
fn messages_marshal_size(messages: &[Message]) -> usize {
    4 + messages.iter().map(|message| 4 + message_marshal_size(message)).sum::<usize>()
}

/// Marshal a list of completed messages, each length-prefixed so its bytes
/// can be recovered without swallowing whatever follows in the buffer
/// (`Message` has no `Marshal` impl of its own; it already has a dedicated
/// wire-transport marshal pair in [`mds_proto::codec`]).
fn marshal_messages(buffer: &mut BytesMut, messages: &[Message]) {
    buffer.put_u32(u32::try_from(messages.len()).unwrap_or(u32::MAX));
    for message in messages {
        buffer.put_u32(u32::try_from(message_marshal_size(message)).unwrap_or(u32::MAX));
        marshal_message(message, buffer);
    }
}

/// Inverse of [`marshal_messages`].
fn unmarshal_messages(buffer: &mut Bytes) -> mds_core::marshal::Result<Vec<Message>> {
    if buffer.remaining() < 4 {
        return Err(CoreError::Truncated { context: "outbound queue" });
    }
    let count = buffer.get_u32() as usize;
    let mut messages = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        if buffer.remaining() < 4 {
            return Err(CoreError::Truncated { context: "outbound message length" });
        }
        let len = buffer.get_u32() as usize;
        if buffer.remaining() < len {
            return Err(CoreError::Truncated { context: "outbound message" });
        }
        let bytes = buffer.split_to(len);
        let message = unmarshal_message(bytes)
            .map_err(|_| CoreError::Truncated { context: "outbound message" })?;
        messages.push(message);
    }
    Ok(messages)
}

/// The whole router's durable state.
pub struct RouterSnapshot {
    next_client_id: u64,
    next_ticket: u64,
    /// Outstanding modify-rendezvous tickets, as `(ticket, originator
    /// conn_id)` pairs (spec §8's "rendezvous map").
    rendezvous: Vec<(u64, u64)>,
    clients: Vec<ClientSnapshot>,
}

impl Marshal for RouterSnapshot {
    const VERSION: u32 = 1;

    fn marshal_size(&self) -> usize {
        4 + 8 + 8 + 4 + self.rendezvous.len() * 16 + marshal_seq_size(&self.clients)
    }

    fn marshal(&self, buffer: &mut BytesMut) {
        buffer.put_u32(Self::VERSION);
        buffer.put_u64(self.next_client_id);
        buffer.put_u64(self.next_ticket);
        buffer.put_u32(u32::try_from(self.rendezvous.len()).unwrap_or(u32::MAX));
        for &(ticket, conn_id) in &self.rendezvous {
            buffer.put_u64(ticket);
            buffer.put_u64(conn_id);
        }
        marshal_seq(buffer, &self.clients);
    }

    fn unmarshal(buffer: &mut Bytes) -> mds_core::marshal::Result<Self> {
        read_version_tag(buffer, Self::VERSION)?;
        if buffer.remaining() < 20 {
            return Err(CoreError::Truncated { context: "router snapshot" });
        }
        let next_client_id = buffer.get_u64();
        let next_ticket = buffer.get_u64();
        let rendezvous_count = buffer.get_u32() as usize;
        let mut rendezvous = Vec::with_capacity(rendezvous_count.min(1 << 16));
        for _ in 0..rendezvous_count {
            if buffer.remaining() < 16 {
                return Err(CoreError::Truncated { context: "rendezvous entry" });
            }
            rendezvous.push((buffer.get_u64(), buffer.get_u64()));
        }
        let clients = unmarshal_seq(buffer)?;
        Ok(Self { next_client_id, next_ticket, rendezvous, clients })
    }
}

impl Router {
    /// Capture every client's durable state for a re-exec snapshot.
    #[must_use]
    pub fn snapshot(&self) -> RouterSnapshot {
        let (next_client_id, next_ticket) = self.counters();
        let rendezvous = self
            .rendezvous_snapshot()
            .into_iter()
            .map(|(ticket, conn_id)| (ticket.raw(), conn_id_raw(conn_id)))
            .collect();
        let clients = self
            .snapshot_clients()
            .into_iter()
            .map(|client| ClientSnapshot {
                conn_id: conn_id_raw(client.conn_id()),
                fd: client.fd(),
                protocol_id: client.protocol_id().map(ClientId::raw),
                conditions: client.conditions_snapshot(),
                outbound: client.outbound_snapshot(),
                multicast_queue: client.multicast_queue_snapshot(),
                codec: client.codec_snapshot(),
            })
            .collect();
        RouterSnapshot { next_client_id, next_ticket, rendezvous, clients }
    }

    /// Rebuild a router and its clients from a snapshot taken by a prior
    /// incarnation (spec §4.F step 5). The caller must spawn a reader
    /// thread for each returned client — sockets themselves survive `exec`
    /// by fd number, but this process has no thread reading them yet.
    #[must_use]
    pub fn restore(snapshot: RouterSnapshot) -> (Self, Vec<Arc<Client>>) {
        let rendezvous: HashMap<TicketId, ConnId> = snapshot
            .rendezvous
            .iter()
            .map(|&(ticket, conn_id)| (TicketId::from_raw(ticket), ConnId::from_raw(conn_id)))
            .collect();
        let router = Self::resume(snapshot.next_client_id, snapshot.next_ticket, rendezvous);
        let mut clients = Vec::with_capacity(snapshot.clients.len());
        for saved in snapshot.clients {
            let codec = unmarshal_codec(saved.codec).unwrap_or_else(|_| mds_proto::Codec::new());
            let client = Arc::new(Client::restore(
                ConnId::from_raw(saved.conn_id),
                saved.fd,
                saved.protocol_id.map(ClientId::from_raw),
                saved.conditions,
                saved.outbound,
                saved.multicast_queue,
                codec,
            ));
            router.reregister(Arc::clone(&client));
            clients.push(client);
        }
        (router, clients)
    }
}

fn conn_id_raw(conn_id: ConnId) -> u64 {
    conn_id.raw()
}

/// Name of the shared-memory object holding `pid`'s re-exec state (spec
/// §6.4).
fn shm_name(pid: u32) -> String {
    format!("/mds-reexec-{pid}")
}

/// Write `snapshot` into a freshly created shared-memory object named
/// after `pid`, leaving it linked for the new image to read (spec §4.F
/// step 3).
///
/// # Errors
///
/// Any I/O failure opening, sizing, or writing the shm object.
pub fn write_snapshot(pid: u32, snapshot: &RouterSnapshot) -> std::io::Result<()> {
    let mut buffer = BytesMut::with_capacity(snapshot.marshal_size());
    snapshot.marshal(&mut buffer);

    let name = shm_name(pid);
    let fd = shm_open_rw(&name)?;
    // SAFETY: `fd` was just returned by `shm_open` above and is owned by
    // this function; wrapping it in a `File` hands that ownership to the
    // standard library's `Drop` impl, which closes it exactly once.
    #[allow(unsafe_code)]
    let mut file = unsafe { <std::fs::File as std::os::fd::FromRawFd>::from_raw_fd(fd) };
    file.set_len(buffer.len() as u64)?;
    file.write_all(&buffer)?;
    Ok(())
}

/// Open, read, and unlink the shm object left by the previous incarnation
/// (spec §4.F step 5). Fatal if the object cannot be opened or read.
///
/// # Errors
///
/// Any I/O failure opening or reading the shm object, or a
/// [`mds_core::CoreError`] surfaced as [`std::io::Error`] if the bytes
/// don't unmarshal.
pub fn read_snapshot(pid: u32) -> std::io::Result<RouterSnapshot> {
    let name = shm_name(pid);
    let fd = shm_open_ro(&name)?;
    #[allow(unsafe_code)]
    let mut file = unsafe { <std::fs::File as std::os::fd::FromRawFd>::from_raw_fd(fd) };
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;
    drop(file);
    shm_unlink(&name);
    RouterSnapshot::unmarshal(&mut Bytes::from(contents))
        .map_err(|err| std::io::Error::other(err.to_string()))
}

#[allow(unsafe_code)]
fn shm_open_rw(name: &str) -> std::io::Result<RawFd> {
    let cname = CString::new(name).map_err(std::io::Error::other)?;
    // SAFETY: `cname` is a valid NUL-terminated C string for the lifetime
    // of this call; `shm_open` returns either a valid owned fd or -1.
    let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fd)
}

#[allow(unsafe_code)]
fn shm_open_ro(name: &str) -> std::io::Result<RawFd> {
    let cname = CString::new(name).map_err(std::io::Error::other)?;
    // SAFETY: see `shm_open_rw`.
    let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDONLY, 0o600) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fd)
}

#[allow(unsafe_code)]
fn shm_unlink(name: &str) {
    if let Ok(cname) = CString::new(name) {
        // SAFETY: `cname` is valid for the duration of this call; a
        // failing unlink (object already gone) is not actionable here.
        unsafe {
            libc::shm_unlink(cname.as_ptr());
        }
    }
}

/// Resolve the on-disk image this process was exec'd from, stripping the
/// `" (deleted)"` suffix the kernel appends when the original file has
/// been replaced since exec (spec §4.F step 4).
pub fn resolve_self_exe() -> std::io::Result<PathBuf> {
    let raw = std::fs::read_link("/proc/self/exe")?;
    let text = raw.to_string_lossy();
    let stripped = text.strip_suffix(" (deleted)").unwrap_or(&text);
    Ok(PathBuf::from(stripped))
}

/// Replace the current process image with `image`, preserving the
/// original argv (minus argv\[0\]) and appending `--re-exec` (spec §4.F
/// step 4). Never returns on success; returns the `exec` failure
/// otherwise.
pub fn reexec_into(image: &Path, original_args: &[String]) -> std::io::Error {
    std::process::Command::new(image).args(original_args).arg("--re-exec").exec()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn shm_name_encodes_pid() {
        assert_eq!(shm_name(4242), "/mds-reexec-4242");
    }

    #[test]
    fn snapshot_round_trips_through_marshal() {
        let mut codec = mds_proto::Codec::new();
        codec.feed(b"Command: ping\nLength: 5\n\nhel");
        let mut codec_bytes = BytesMut::new();
        mds_proto::codec::marshal_codec(&codec, &mut codec_bytes);

        let snapshot = RouterSnapshot {
            next_client_id: 7,
            next_ticket: 3,
            rendezvous: vec![(11, 1)],
            clients: vec![ClientSnapshot {
                conn_id: 1,
                fd: 9,
                protocol_id: Some(ClientId::from_raw(5).raw()),
                conditions: vec![Condition { pattern: "Command".into(), priority: 2, modifying: true }],
                outbound: vec![Message::new({
                    let mut headers = mds_proto::HeaderList::new();
                    headers.push("Command", "ping").unwrap();
                    headers
                })],
                multicast_queue: Vec::new(),
                codec: codec_bytes.freeze(),
            }],
        };
        let mut buffer = BytesMut::new();
        snapshot.marshal(&mut buffer);
        assert_eq!(buffer.len(), snapshot.marshal_size());
        let restored = RouterSnapshot::unmarshal(&mut buffer.freeze()).unwrap();
        assert_eq!(restored.next_client_id, 7);
        assert_eq!(restored.next_ticket, 3);
        assert_eq!(restored.rendezvous, vec![(11, 1)]);
        assert_eq!(restored.clients.len(), 1);
        assert_eq!(restored.clients[0].conditions[0].pattern, "Command");
        assert_eq!(restored.clients[0].outbound[0].control().command(), Some("ping"));

        let restored_codec = unmarshal_codec(restored.clients[0].codec.clone()).unwrap();
        let _ = restored_codec;
    }
}
