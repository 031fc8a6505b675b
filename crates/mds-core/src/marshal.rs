//! Versioned byte-level marshalling substrate (spec §4.B).
//!
//! Every composite type that must survive a re-exec implements [`Marshal`]:
//! `size()` predicts the exact byte count `marshal()` writes, and
//! `unmarshal()` reproduces the semantic value from those bytes. A 32-bit
//! version tag precedes every composite's fields so an image can refuse to
//! unmarshal state written by an incompatible version of itself (in
//! practice this never happens across a single re-exec, since the new
//! image is the same on-disk binary, but the check stays as a guard
//! against future format drift).
//!
//! Function-pointer fields (comparators, hashers, callbacks) are never part
//! of a marshalled record; the unmarshaller reinstates them from context.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CoreError;

/// Result alias for marshalling operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// A type that can be written to and read back from the re-exec state
/// blob.
pub trait Marshal: Sized {
    /// The version tag this implementation writes and accepts.
    const VERSION: u32;

    /// Exact number of bytes `marshal` will write for `self`.
    fn marshal_size(&self) -> usize;

    /// Append `self`'s bytes to `buffer`, version tag included.
    fn marshal(&self, buffer: &mut BytesMut);

    /// Reconstruct a value from the front of `buffer`, advancing it past
    /// the bytes consumed.
    ///
    /// # Errors
    ///
    /// [`CoreError::VersionMismatch`] if the leading version tag does not
    /// equal `Self::VERSION`; [`CoreError::Truncated`] if the buffer runs
    /// out before a full value is read.
    fn unmarshal(buffer: &mut Bytes) -> Result<Self>;
}

/// Read and check a version tag, shared by every `Marshal::unmarshal` body.
///
/// # Errors
///
/// [`CoreError::Truncated`] if fewer than 4 bytes remain;
/// [`CoreError::VersionMismatch`] if the tag read does not equal `expected`.
pub fn read_version_tag(buffer: &mut Bytes, expected: u32) -> Result<()> {
    if buffer.remaining() < 4 {
        return Err(CoreError::Truncated { context: "version tag" });
    }
    let found = buffer.get_u32();
    if found != expected {
        return Err(CoreError::VersionMismatch { expected, found });
    }
    Ok(())
}

/// Write a `u32` length prefix followed by `bytes`.
pub fn put_bytes(buffer: &mut BytesMut, bytes: &[u8]) {
    buffer.put_u32(u32::try_from(bytes.len()).unwrap_or(u32::MAX));
    buffer.put_slice(bytes);
}

/// Read a `u32`-length-prefixed byte run.
///
/// # Errors
///
/// [`CoreError::Truncated`] if the prefix or the declared byte run is cut
/// short.
pub fn get_bytes(buffer: &mut Bytes, context: &'static str) -> Result<Bytes> {
    if buffer.remaining() < 4 {
        return Err(CoreError::Truncated { context });
    }
    let len = buffer.get_u32() as usize;
    if buffer.remaining() < len {
        return Err(CoreError::Truncated { context });
    }
    Ok(buffer.split_to(len))
}

/// Write a `u32`-length-prefixed UTF-8 string.
pub fn put_string(buffer: &mut BytesMut, value: &str) {
    put_bytes(buffer, value.as_bytes());
}

/// Read a `u32`-length-prefixed UTF-8 string.
///
/// # Errors
///
/// As [`get_bytes`], plus [`CoreError::Truncated`] if the bytes are not
/// valid UTF-8 (there is no dedicated encoding-error variant; a truncated
/// or corrupt marshal stream is always fatal to re-exec, per spec §4.B).
pub fn get_string(buffer: &mut Bytes, context: &'static str) -> Result<String> {
    let bytes = get_bytes(buffer, context)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| CoreError::Truncated { context })
}

/// Marshal a homogeneous collection: count prefix, then each element via
/// its own `Marshal` impl. Mirrors the list/hash-table/fd-table marshal
/// contract of spec §4.B ("capacity, live-count, and entries").
pub fn marshal_seq<T: Marshal>(buffer: &mut BytesMut, items: &[T]) {
    buffer.put_u32(u32::try_from(items.len()).unwrap_or(u32::MAX));
    for item in items {
        item.marshal(buffer);
    }
}

/// Size in bytes that [`marshal_seq`] would write for `items`.
pub fn marshal_seq_size<T: Marshal>(items: &[T]) -> usize {
    4 + items.iter().map(Marshal::marshal_size).sum::<usize>()
}

/// Inverse of [`marshal_seq`].
///
/// # Errors
///
/// [`CoreError::Truncated`] if the count prefix or any element is cut
/// short; propagates any error from an element's own `unmarshal`.
pub fn unmarshal_seq<T: Marshal>(buffer: &mut Bytes) -> Result<Vec<T>> {
    if buffer.remaining() < 4 {
        return Err(CoreError::Truncated { context: "sequence count" });
    }
    let count = buffer.get_u32() as usize;
    let mut items = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        items.push(T::unmarshal(buffer)?);
    }
    Ok(items)
}

impl Marshal for u64 {
    const VERSION: u32 = 1;

    fn marshal_size(&self) -> usize {
        4 + 8
    }

    fn marshal(&self, buffer: &mut BytesMut) {
        buffer.put_u32(Self::VERSION);
        buffer.put_u64(*self);
    }

    fn unmarshal(buffer: &mut Bytes) -> Result<Self> {
        read_version_tag(buffer, Self::VERSION)?;
        if buffer.remaining() < 8 {
            return Err(CoreError::Truncated { context: "u64" });
        }
        Ok(buffer.get_u64())
    }
}

impl Marshal for i64 {
    const VERSION: u32 = 1;

    fn marshal_size(&self) -> usize {
        4 + 8
    }

    fn marshal(&self, buffer: &mut BytesMut) {
        buffer.put_u32(Self::VERSION);
        buffer.put_i64(*self);
    }

    fn unmarshal(buffer: &mut Bytes) -> Result<Self> {
        read_version_tag(buffer, Self::VERSION)?;
        if buffer.remaining() < 8 {
            return Err(CoreError::Truncated { context: "i64" });
        }
        Ok(buffer.get_i64())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn u64_round_trips() {
        let mut buffer = BytesMut::new();
        42u64.marshal(&mut buffer);
        assert_eq!(buffer.len(), 42u64.marshal_size());
        let mut bytes = buffer.freeze();
        assert_eq!(u64::unmarshal(&mut bytes).unwrap(), 42);
    }

    #[test]
    fn sequence_round_trips() {
        let items: Vec<i64> = vec![1, -2, 3];
        let mut buffer = BytesMut::new();
        marshal_seq(&mut buffer, &items);
        assert_eq!(buffer.len(), marshal_seq_size(&items));
        let mut bytes = buffer.freeze();
        let restored: Vec<i64> = unmarshal_seq(&mut bytes).unwrap();
        assert_eq!(restored, items);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut buffer = BytesMut::new();
        buffer.put_u32(99);
        buffer.put_u64(1);
        let mut bytes = buffer.freeze();
        assert!(matches!(
            u64::unmarshal(&mut bytes),
            Err(CoreError::VersionMismatch { expected: 1, found: 99 })
        ));
    }

    #[test]
    fn string_round_trips() {
        let mut buffer = BytesMut::new();
        put_string(&mut buffer, "hello");
        let mut bytes = buffer.freeze();
        assert_eq!(get_string(&mut bytes, "test").unwrap(), "hello");
    }
}
