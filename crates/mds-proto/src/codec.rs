//! Incremental frame codec: parses the wire format of §3/§6.1 from an
//! arbitrarily-chunked byte stream, and composes messages back to wire
//! bytes. Also provides a marshal format for the codec's own in-flight
//! parse state, needed so a connection mid-read survives re-exec (§4.F).
//!
//! This type is sans-IO: callers feed it bytes read from a socket and poll
//! it for progress; it never touches a file descriptor itself.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::control::ControlHeaders;
use crate::errors::{ProtocolError, Result};
use crate::header::{self, HeaderList};
use crate::message::Message;

/// The outcome of polling a [`Codec`] for progress.
#[derive(Debug)]
pub enum ReadOutcome {
    /// More bytes are needed before a message can be produced.
    NeedMore,
    /// A complete message was parsed.
    Complete(Message),
    /// The stream contained a malformed message; the connection is
    /// terminal from this point (spec §4.A).
    Malformed(ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Collecting header lines until a blank line is seen.
    Headers,
    /// Collecting exactly `length` payload bytes.
    Payload { length: usize },
}

/// Parser state for one connection's read side.
///
/// Grows its internal buffer by doubling on exhaustion, per spec §4.A.
#[derive(Debug)]
pub struct Codec {
    buffer: BytesMut,
    stage: Stage,
    headers: HeaderList,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    /// A fresh codec with an empty read buffer, at the start of a message.
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: BytesMut::new(), stage: Stage::Headers, headers: HeaderList::new() }
    }

    /// Append newly read bytes to the internal buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.buffer.capacity() - self.buffer.len() < bytes.len() {
            self.buffer.reserve(self.buffer.capacity().max(bytes.len()).max(64));
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Attempt to make progress; call repeatedly (feeding more bytes
    /// between calls) until [`ReadOutcome::Complete`] or
    /// [`ReadOutcome::Malformed`].
    pub fn poll(&mut self) -> ReadOutcome {
        loop {
            match self.stage {
                Stage::Headers => match self.poll_header_line() {
                    HeaderStep::NeedMore => return ReadOutcome::NeedMore,
                    HeaderStep::Malformed(err) => return ReadOutcome::Malformed(err),
                    HeaderStep::HeadersDone(length) => {
                        self.stage = Stage::Payload { length };
                    },
                    HeaderStep::MoreHeaders => {},
                },
                Stage::Payload { length } => {
                    if self.buffer.len() < length {
                        return ReadOutcome::NeedMore;
                    }
                    let payload = self.buffer.split_to(length).freeze();
                    let headers = std::mem::replace(&mut self.headers, HeaderList::new());
                    self.stage = Stage::Headers;
                    return ReadOutcome::Complete(Message::with_payload(headers, payload));
                },
            }
        }
    }

    fn poll_header_line(&mut self) -> HeaderStep {
        let Some(newline_at) = self.buffer.iter().position(|&b| b == b'\n') else {
            return HeaderStep::NeedMore;
        };
        let line_bytes = self.buffer.split_to(newline_at + 1);
        let line_bytes = &line_bytes[..newline_at];
        let Ok(line) = std::str::from_utf8(line_bytes) else {
            return HeaderStep::Malformed(ProtocolError::HeaderNotUtf8);
        };
        if line.is_empty() {
            if self.headers.is_empty() {
                return HeaderStep::Malformed(ProtocolError::EmptyHeader);
            }
            let length = match ControlHeaders::new(&self.headers).length() {
                Ok(length) => length,
                Err(err) => return HeaderStep::Malformed(err),
            };
            return HeaderStep::HeadersDone(length);
        }
        match header::parse_header_line(line) {
            Ok((name, value)) => match self.headers.push(name, value) {
                Ok(()) => HeaderStep::MoreHeaders,
                Err(err) => HeaderStep::Malformed(err),
            },
            Err(err) => HeaderStep::Malformed(err),
        }
    }
}

enum HeaderStep {
    NeedMore,
    MoreHeaders,
    HeadersDone(usize),
    Malformed(ProtocolError),
}

/// Bytes required to compose `message` to the wire.
#[must_use]
pub fn compose_size(message: &Message) -> usize {
    let mut size = 1; // blank separator line
    for (name, value) in message.headers.iter() {
        size += name.len() + 2 + value.len() + 1; // "Name: value\n"
    }
    size + message.payload.len()
}

/// Write `message`'s exact wire bytes into `buffer`, appending.
pub fn compose(message: &Message, buffer: &mut BytesMut) {
    buffer.reserve(compose_size(message));
    for (name, value) in message.headers.iter() {
        buffer.put_slice(name.as_bytes());
        buffer.put_slice(b": ");
        buffer.put_slice(value.as_bytes());
        buffer.put_u8(b'\n');
    }
    buffer.put_u8(b'\n');
    buffer.put_slice(&message.payload);
}

const MARSHAL_VERSION: u32 = 1;

/// Bytes required to marshal `message` for re-exec transport.
#[must_use]
pub fn message_marshal_size(message: &Message) -> usize {
    let mut size = 4 + 4; // version + header count
    for (name, value) in message.headers.iter() {
        size += 4 + name.len() + 4 + value.len();
    }
    size + 4 + message.payload.len()
}

/// Serialize `message` into `buffer` in the versioned marshal format used
/// across re-exec (spec §4.B).
pub fn marshal_message(message: &Message, buffer: &mut BytesMut) {
    buffer.reserve(message_marshal_size(message));
    buffer.put_u32(MARSHAL_VERSION);
    buffer.put_u32(u32::try_from(message.headers.len()).unwrap_or(u32::MAX));
    for (name, value) in message.headers.iter() {
        put_string(buffer, name);
        put_string(buffer, value);
    }
    buffer.put_u32(u32::try_from(message.payload.len()).unwrap_or(u32::MAX));
    buffer.put_slice(&message.payload);
}

/// Deserialize a message previously written by [`marshal_message`].
///
/// # Errors
///
/// Returns [`ProtocolError::HeaderNotUtf8`] if the version tag does not
/// match or the stream is truncated.
pub fn unmarshal_message(mut buffer: Bytes) -> Result<Message> {
    if buffer.remaining() < 4 || buffer.get_u32() != MARSHAL_VERSION {
        return Err(ProtocolError::HeaderNotUtf8);
    }
    let count = buffer.get_u32() as usize;
    let mut headers = HeaderList::new();
    for _ in 0..count {
        let name = get_string(&mut buffer)?;
        let value = get_string(&mut buffer)?;
        headers.push(name, value)?;
    }
    let payload_len = buffer.get_u32() as usize;
    let payload = buffer.split_to(payload_len);
    Ok(Message::with_payload(headers, payload))
}

const CODEC_MARSHAL_VERSION: u32 = 1;

/// Bytes required to marshal `codec`'s in-flight parse state for re-exec
/// transport (spec §4.A's partial read buffer).
#[must_use]
pub fn codec_marshal_size(codec: &Codec) -> usize {
    let mut size = 4 + 4 + codec.buffer.len(); // version + buffer len + buffer bytes
    size += 1 + 8; // stage tag + payload length
    size += 4; // header count
    for (name, value) in codec.headers.iter() {
        size += 4 + name.len() + 4 + value.len();
    }
    size
}

/// Serialize `codec`'s unread buffer, parse stage, and partially-collected
/// headers into `buffer`, so a connection mid-frame survives a re-exec.
pub fn marshal_codec(codec: &Codec, buffer: &mut BytesMut) {
    buffer.reserve(codec_marshal_size(codec));
    buffer.put_u32(CODEC_MARSHAL_VERSION);
    buffer.put_u32(u32::try_from(codec.buffer.len()).unwrap_or(u32::MAX));
    buffer.put_slice(&codec.buffer);
    match codec.stage {
        Stage::Headers => {
            buffer.put_u8(0);
            buffer.put_u64(0);
        },
        Stage::Payload { length } => {
            buffer.put_u8(1);
            buffer.put_u64(length as u64);
        },
    }
    buffer.put_u32(u32::try_from(codec.headers.len()).unwrap_or(u32::MAX));
    for (name, value) in codec.headers.iter() {
        put_string(buffer, name);
        put_string(buffer, value);
    }
}

/// Deserialize a codec previously written by [`marshal_codec`].
///
/// # Errors
///
/// [`ProtocolError::HeaderNotUtf8`] if the version tag does not match or
/// the stream is truncated.
pub fn unmarshal_codec(mut buffer: Bytes) -> Result<Codec> {
    if buffer.remaining() < 4 || buffer.get_u32() != CODEC_MARSHAL_VERSION {
        return Err(ProtocolError::HeaderNotUtf8);
    }
    if buffer.remaining() < 4 {
        return Err(ProtocolError::HeaderNotUtf8);
    }
    let buf_len = buffer.get_u32() as usize;
    if buffer.remaining() < buf_len + 1 + 8 + 4 {
        return Err(ProtocolError::HeaderNotUtf8);
    }
    let mut inner = BytesMut::new();
    inner.extend_from_slice(&buffer.split_to(buf_len));
    let tag = buffer.get_u8();
    let length = buffer.get_u64() as usize;
    let stage = if tag == 0 { Stage::Headers } else { Stage::Payload { length } };
    let count = buffer.get_u32() as usize;
    let mut headers = HeaderList::new();
    for _ in 0..count {
        let name = get_string(&mut buffer)?;
        let value = get_string(&mut buffer)?;
        headers.push(name, value)?;
    }
    Ok(Codec { buffer: inner, stage, headers })
}

fn put_string(buffer: &mut BytesMut, value: &str) {
    buffer.put_u32(u32::try_from(value.len()).unwrap_or(u32::MAX));
    buffer.put_slice(value.as_bytes());
}

fn get_string(buffer: &mut Bytes) -> Result<String> {
    let len = buffer.get_u32() as usize;
    let bytes = buffer.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::HeaderNotUtf8)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        let mut headers = HeaderList::new();
        headers.push("Command", "ping").unwrap();
        headers.push("Message ID", "11").unwrap();
        Message::with_payload(headers, Bytes::from_static(b"hi"))
    }

    #[test]
    fn compose_then_parse_round_trips() {
        let message = sample_message();
        let mut buffer = BytesMut::new();
        let mut with_length = message.clone();
        with_length.headers.push("Length", "2").unwrap();
        compose(&with_length, &mut buffer);
        assert_eq!(buffer.len(), compose_size(&with_length));

        let mut codec = Codec::new();
        codec.feed(&buffer);
        match codec.poll() {
            ReadOutcome::Complete(parsed) => {
                assert_eq!(parsed.payload, Bytes::from_static(b"hi"));
                assert_eq!(parsed.control().command(), Some("ping"));
            },
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn incremental_feed_needs_more_until_payload_arrives() {
        let mut codec = Codec::new();
        codec.feed(b"Command: ping\nLength: 2\n");
        assert!(matches!(codec.poll(), ReadOutcome::NeedMore));
        codec.feed(b"\nh");
        assert!(matches!(codec.poll(), ReadOutcome::NeedMore));
        codec.feed(b"i");
        assert!(matches!(codec.poll(), ReadOutcome::Complete(_)));
    }

    #[test]
    fn message_with_zero_headers_is_malformed() {
        let mut codec = Codec::new();
        codec.feed(b"\n");
        assert!(matches!(codec.poll(), ReadOutcome::Malformed(ProtocolError::EmptyHeader)));
    }

    #[test]
    fn missing_colon_space_is_malformed() {
        let mut codec = Codec::new();
        codec.feed(b"Command ping\n\n");
        assert!(matches!(
            codec.poll(),
            ReadOutcome::Malformed(ProtocolError::MissingDelimiter(_))
        ));
    }

    #[test]
    fn non_numeric_length_is_malformed() {
        let mut codec = Codec::new();
        codec.feed(b"Length: abc\n\n");
        assert!(matches!(
            codec.poll(),
            ReadOutcome::Malformed(ProtocolError::InvalidLength(_))
        ));
    }

    #[test]
    fn marshal_then_unmarshal_reproduces_message() {
        let message = sample_message();
        let mut buffer = BytesMut::new();
        marshal_message(&message, &mut buffer);
        assert_eq!(buffer.len(), message_marshal_size(&message));
        let restored = unmarshal_message(buffer.freeze()).unwrap();
        assert_eq!(restored, message);
    }

    #[test]
    fn codec_marshal_round_trips_mid_frame_state() {
        let mut codec = Codec::new();
        codec.feed(b"Command: ping\nLength: 5\n\nhel");

        assert!(matches!(codec.poll(), ReadOutcome::NeedMore));

        let mut buffer = BytesMut::new();
        marshal_codec(&codec, &mut buffer);
        assert_eq!(buffer.len(), codec_marshal_size(&codec));

        let mut restored = unmarshal_codec(buffer.freeze()).unwrap();
        restored.feed(b"lo");
        match restored.poll() {
            ReadOutcome::Complete(message) => {
                assert_eq!(message.payload, Bytes::from_static(b"hello"));
                assert_eq!(message.control().command(), Some("ping"));
            },
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn two_messages_back_to_back_parse_independently() {
        let mut codec = Codec::new();
        codec.feed(b"Command: a\nLength: 1\n\nx");
        codec.feed(b"Command: b\nLength: 1\n\ny");
        let first = codec.poll();
        let second = codec.poll();
        match (first, second) {
            (ReadOutcome::Complete(a), ReadOutcome::Complete(b)) => {
                assert_eq!(a.payload, Bytes::from_static(b"x"));
                assert_eq!(b.payload, Bytes::from_static(b"y"));
            },
            other => panic!("expected two Complete outcomes, got {other:?}"),
        }
    }
}
