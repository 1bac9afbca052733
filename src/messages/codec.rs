use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ProxyError, ProxyResult};

/// Upper bound for regular protocol messages. Anything larger is treated as
/// a protocol violation rather than buffered indefinitely.
pub const DEFAULT_MESSAGE_SIZE_LIMIT: usize = 64 * 1024 * 1024;

/// Startup-family packets are tiny; postgres itself caps them at 10000
/// bytes.
pub const STARTUP_MESSAGE_SIZE_LIMIT: usize = 10000;

/// Get null-terminated string, returns None when an empty cstring is read.
///
/// The cursor is advanced past the terminator either way, which matches how
/// the wire protocol ends key/value lists with a single `\0`.
pub(crate) fn get_cstring(buf: &mut BytesMut) -> Option<String> {
    let mut i = 0;

    // bounded scan to survive malformed input
    while i < buf.remaining() && buf[i] != b'\0' {
        i += 1;
    }

    if i >= buf.remaining() {
        // unterminated, consume nothing
        return None;
    }

    let string_buf = buf.split_to(i + 1);

    if i == 0 {
        None
    } else {
        Some(String::from_utf8_lossy(&string_buf[..i]).into_owned())
    }
}

/// Put null-terminated string. An empty string writes a single `\0`.
pub(crate) fn put_cstring(buf: &mut BytesMut, input: &str) {
    buf.put_slice(input.as_bytes());
    buf.put_u8(b'\0');
}

/// Wire length of an optional name field: empty name encodes as `\0`.
pub(crate) fn option_string_len(s: &Option<String>) -> usize {
    1 + s.as_ref().map(|s| s.len()).unwrap_or(0)
}

pub(crate) fn put_option_cstring(buf: &mut BytesMut, input: &Option<String>) {
    if let Some(input) = input {
        put_cstring(buf, input);
    } else {
        put_cstring(buf, "");
    }
}

/// Check buffered data against the length header and hand a complete packet
/// body to `decode_fn`. Returns `Ok(None)` while the packet is incomplete.
///
/// `offset` is 1 for typed messages (skip the tag byte) and 0 for the
/// untyped startup family. The length header counts itself but not the tag.
pub(crate) fn decode_packet<T, F>(
    buf: &mut BytesMut,
    offset: usize,
    max_len: usize,
    decode_fn: F,
) -> ProxyResult<Option<T>>
where
    F: Fn(&mut BytesMut, usize) -> ProxyResult<T>,
{
    if buf.remaining() < offset + 4 {
        return Ok(None);
    }

    let full_len = (&buf[offset..offset + 4]).get_i32() as isize;
    if full_len < 4 {
        return Err(ProxyError::InvalidPacketLength(full_len.max(0) as usize));
    }
    let full_len = full_len as usize;
    if full_len > max_len {
        return Err(ProxyError::MessageTooLarge(full_len, max_len));
    }

    if buf.remaining() < offset + full_len {
        // more data to come
        return Ok(None);
    }

    buf.advance(offset + 4);
    let mut body = buf.split_to(full_len - 4);
    decode_fn(&mut body, full_len).map(Some)
}
