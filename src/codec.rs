//! The serialization capability shared by the wire format, the byte-array
//! partition layout, spill files, and checkpoints.
//!
//! Values (vertex ids, vertex values, edge values, messages) travel as
//! length-prefixed binary blobs produced by the `encode`/`decode` pair below.
//! The pair is the single place the runtime commits to an encoding; every
//! other module works in terms of it.

use bytes::{Buf, BufMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Result, WorkerError};

/// Encode a value to bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| WorkerError::Deserialization(format!("encode: {e}")))
}

/// Decode a value from bytes. The whole slice must be consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, read) =
        bincode::serde::decode_from_slice::<T, _>(bytes, bincode::config::standard())
            .map_err(|e| WorkerError::Deserialization(format!("decode: {e}")))?;
    if read != bytes.len() {
        return Err(WorkerError::Deserialization(format!(
            "trailing bytes: consumed {read} of {}",
            bytes.len()
        )));
    }
    Ok(value)
}

/// Append `value` as a 4-byte length followed by its encoding.
pub fn put_value<T: Serialize, B: BufMut>(buf: &mut B, value: &T) -> Result<()> {
    let bytes = encode(value)?;
    put_bytes(buf, &bytes);
    Ok(())
}

/// Read a length-prefixed value written by [`put_value`].
pub fn get_value<T: DeserializeOwned, B: Buf>(buf: &mut B) -> Result<T> {
    let bytes = get_bytes(buf)?;
    decode(&bytes)
}

/// Append a raw 4-byte-length-prefixed byte run.
pub fn put_bytes<B: BufMut>(buf: &mut B, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Read a raw length-prefixed byte run.
pub fn get_bytes<B: Buf>(buf: &mut B) -> Result<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(short_buffer("length prefix"));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(short_buffer("length-prefixed bytes"));
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Append a UTF-8 string with a 4-byte length prefix.
pub fn put_utf<B: BufMut>(buf: &mut B, s: &str) {
    put_bytes(buf, s.as_bytes());
}

/// Read a UTF-8 string written by [`put_utf`].
pub fn get_utf<B: Buf>(buf: &mut B) -> Result<String> {
    let bytes = get_bytes(buf)?;
    String::from_utf8(bytes)
        .map_err(|e| WorkerError::Deserialization(format!("invalid utf-8: {e}")))
}

/// Read a 4-byte count prefix.
pub fn get_count<B: Buf>(buf: &mut B) -> Result<usize> {
    if buf.remaining() < 4 {
        return Err(short_buffer("count"));
    }
    Ok(buf.get_u32() as usize)
}

fn short_buffer(what: &str) -> WorkerError {
    WorkerError::Deserialization(format!("buffer too short reading {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_round_trip() {
        let mut buf = Vec::new();
        put_value(&mut buf, &(42u64, "hello".to_string())).unwrap();
        let mut slice = &buf[..];
        let (n, s): (u64, String) = get_value(&mut slice).unwrap();
        assert_eq!(n, 42);
        assert_eq!(s, "hello");
        assert!(slice.is_empty());
    }

    #[test]
    fn utf_round_trip() {
        let mut buf = Vec::new();
        put_utf(&mut buf, "<COUNT>");
        let mut slice = &buf[..];
        assert_eq!(get_utf(&mut slice).unwrap(), "<COUNT>");
    }

    #[test]
    fn short_buffer_is_an_error() {
        let mut slice: &[u8] = &[0, 0, 0, 9, 1, 2];
        assert!(get_bytes(&mut slice).is_err());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = encode(&7u32).unwrap();
        bytes.push(0xFF);
        assert!(decode::<u32>(&bytes).is_err());
    }
}
