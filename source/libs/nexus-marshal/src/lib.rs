// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Length-prefixed serializer for strings and string arrays
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (wire format shared with the RPC and URPC layers)
//!
//! WIRE FORMAT:
//!   - string: `{len: u64 LE}{len bytes of UTF-8}`
//!   - array:  `{count: i32 LE}{string}*count`
//!
//! The `serialize_*` functions write into a caller buffer and return the number of bytes
//! written, or 0 if the buffer is too small (nothing is written in that case).

/// Result alias for decoding.
pub type Result<T> = core::result::Result<T, MarshalError>;

/// Decoding failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MarshalError {
    /// The buffer ends before the encoded value does.
    #[error("truncated input: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required by the header just read.
        needed: usize,
        /// Bytes available.
        available: usize,
    },
    /// String bytes are not UTF-8.
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
    /// Array count is negative.
    #[error("negative array count {0}")]
    NegativeCount(i32),
}

const LEN_BYTES: usize = core::mem::size_of::<u64>();
const COUNT_BYTES: usize = core::mem::size_of::<i32>();

/// Bytes `serialize_string` needs for `s`.
pub fn serialize_size_string(s: &str) -> usize {
    LEN_BYTES + s.len()
}

/// Writes `s` into `buf`; returns bytes written or 0 if `buf` is too small.
pub fn serialize_string(s: &str, buf: &mut [u8]) -> usize {
    let size = serialize_size_string(s);
    if buf.len() < size {
        return 0;
    }
    buf[..LEN_BYTES].copy_from_slice(&(s.len() as u64).to_le_bytes());
    buf[LEN_BYTES..size].copy_from_slice(s.as_bytes());
    size
}

fn take<'a>(buf: &'a [u8], at: usize, len: usize) -> Result<&'a [u8]> {
    let needed = at.checked_add(len).ok_or(MarshalError::Truncated {
        needed: usize::MAX,
        available: buf.len(),
    })?;
    buf.get(at..needed).ok_or(MarshalError::Truncated { needed, available: buf.len() })
}

/// Reads one string from the front of `buf`; returns it with the bytes consumed.
pub fn unserialize_string(buf: &[u8]) -> Result<(String, usize)> {
    let mut len = [0u8; LEN_BYTES];
    len.copy_from_slice(take(buf, 0, LEN_BYTES)?);
    let len = usize::try_from(u64::from_le_bytes(len))
        .map_err(|_| MarshalError::Truncated { needed: usize::MAX, available: buf.len() })?;
    let bytes = take(buf, LEN_BYTES, len)?;
    let s = core::str::from_utf8(bytes).map_err(|_| MarshalError::InvalidUtf8)?;
    Ok((s.to_owned(), LEN_BYTES + len))
}

/// Bytes `serialize_string_array` needs for `items`.
pub fn serialize_size_string_array<S: AsRef<str>>(items: &[S]) -> usize {
    COUNT_BYTES + items.iter().map(|s| serialize_size_string(s.as_ref())).sum::<usize>()
}

/// Writes `items` into `buf`; returns bytes written or 0 if `buf` is too small.
pub fn serialize_string_array<S: AsRef<str>>(items: &[S], buf: &mut [u8]) -> usize {
    let Ok(count) = i32::try_from(items.len()) else {
        return 0;
    };
    if buf.len() < serialize_size_string_array(items) {
        return 0;
    }
    buf[..COUNT_BYTES].copy_from_slice(&count.to_le_bytes());
    let mut pos = COUNT_BYTES;
    for item in items {
        pos += serialize_string(item.as_ref(), &mut buf[pos..]);
    }
    pos
}

/// Reads a string array from the front of `buf`; returns it with the bytes consumed.
pub fn unserialize_string_array(buf: &[u8]) -> Result<(Vec<String>, usize)> {
    let mut count = [0u8; COUNT_BYTES];
    count.copy_from_slice(take(buf, 0, COUNT_BYTES)?);
    let count = i32::from_le_bytes(count);
    if count < 0 {
        return Err(MarshalError::NegativeCount(count));
    }
    let mut pos = COUNT_BYTES;
    // Every element needs at least its length word.
    let mut items = Vec::with_capacity((count as usize).min(buf.len() / LEN_BYTES));
    for _ in 0..count {
        let (item, used) = unserialize_string(&buf[pos..])?;
        items.push(item);
        pos += used;
    }
    Ok((items, pos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn string_layout_is_length_prefixed() {
        let mut buf = [0u8; 16];
        assert_eq!(serialize_string("milan", &mut buf), 13);
        assert_eq!(&buf[..8], &5u64.to_le_bytes());
        assert_eq!(&buf[8..13], b"milan");
        assert_eq!(unserialize_string(&buf).unwrap(), ("milan".to_string(), 13));
    }

    #[test]
    fn too_small_buffer_writes_nothing() {
        let mut buf = [0xaau8; 12];
        assert_eq!(serialize_string("milan", &mut buf), 0);
        assert!(buf.iter().all(|b| *b == 0xaa));
        assert_eq!(serialize_string_array(&["a", "bc"], &mut buf), 0);
    }

    #[test]
    fn array_layout_has_i32_count() {
        let argv = ["hello", "-n", ""];
        let mut buf = vec![0u8; serialize_size_string_array(&argv)];
        assert_eq!(serialize_string_array(&argv, &mut buf), 4 + 13 + 10 + 8);
        assert_eq!(&buf[..4], &3i32.to_le_bytes());
        let (out, used) = unserialize_string_array(&buf).unwrap();
        assert_eq!(out, argv);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert_eq!(
            unserialize_string(&[1, 0, 0]),
            Err(MarshalError::Truncated { needed: 8, available: 3 })
        );
        let mut buf = [0u8; 10];
        buf[0] = 4;
        assert_eq!(
            unserialize_string(&buf),
            Err(MarshalError::Truncated { needed: 12, available: 10 })
        );
        buf[..8].copy_from_slice(&2u64.to_le_bytes());
        buf[8..10].copy_from_slice(&[0xff, 0xfe]);
        assert_eq!(unserialize_string(&buf), Err(MarshalError::InvalidUtf8));
        assert_eq!(
            unserialize_string_array(&(-1i32).to_le_bytes()),
            Err(MarshalError::NegativeCount(-1))
        );
    }

    proptest! {
        #[test]
        fn array_roundtrip(items in prop::collection::vec(".{0,24}", 0..8)) {
            let mut buf = vec![0u8; serialize_size_string_array(&items)];
            let written = serialize_string_array(&items, &mut buf);
            prop_assert_eq!(written, buf.len());
            let (out, used) = unserialize_string_array(&buf).unwrap();
            prop_assert_eq!(out, items);
            prop_assert_eq!(used, written);
        }

        #[test]
        fn short_buffer_returns_zero(s in ".{1,32}", cut in 1usize..8) {
            let need = serialize_size_string(&s);
            let mut buf = vec![0u8; need.saturating_sub(cut)];
            prop_assert_eq!(serialize_string(&s, &mut buf), 0);
        }
    }
}
