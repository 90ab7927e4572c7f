//! Bencode helpers layered on top of `serde_bencode`.
//!
//! `serde_bencode` (the teacher's existing dependency) handles decode/encode
//! of the four bencoded types (integers, byte strings, lists, dictionaries).
//! What it doesn't give us is the exact byte span of a nested dictionary as
//! it appeared in the original input, which we need to recover the `info`
//! dict byte-for-byte so its SHA-1 is reproducible regardless of how our
//! decoder would re-order or re-serialize keys (spec.md §4.1, invariant #1).

/// Errors that can occur while scanning a bencoded byte string for a nested
/// dictionary's span.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ScanError {
    /// The input ended before a complete bencoded value could be parsed.
    UnexpectedEof,
    /// A byte string length prefix or integer was not valid ASCII decimal.
    Malformed { offset: usize },
    /// The requested dictionary key was not found at the top level.
    KeyNotFound,
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::UnexpectedEof => write!(f, "unexpected end of input"),
            ScanError::Malformed { offset } => {
                write!(f, "malformed bencode at offset {}", offset)
            }
            ScanError::KeyNotFound => write!(f, "key not found"),
        }
    }
}

/// Returns the raw byte span (start, end) of the value associated with
/// `key` in the top-level dictionary `buf`, without doing a full decode.
///
/// This walks the bencode grammar structurally (skipping over nested lists
/// and dictionaries by matching `e` terminators) so that it is robust to
/// however the `info` dict's own keys are ordered.
pub(crate) fn raw_value_span(
    buf: &[u8],
    key: &[u8],
) -> Result<(usize, usize), ScanError> {
    if buf.first() != Some(&b'd') {
        return Err(ScanError::Malformed { offset: 0 });
    }
    let mut cursor = 1;
    loop {
        if cursor >= buf.len() {
            return Err(ScanError::UnexpectedEof);
        }
        if buf[cursor] == b'e' {
            return Err(ScanError::KeyNotFound);
        }
        let (k, next) = parse_bytestring(buf, cursor)?;
        let value_start = next;
        let value_end = skip_value(buf, next)?;
        if k == key {
            return Ok((value_start, value_end));
        }
        cursor = value_end;
    }
}

/// Parses a bencoded byte string (`<len>:<bytes>`) starting at `offset`,
/// returning the string's bytes and the offset just past it.
fn parse_bytestring(
    buf: &[u8],
    offset: usize,
) -> Result<(&[u8], usize), ScanError> {
    let colon = buf[offset..]
        .iter()
        .position(|&b| b == b':')
        .ok_or(ScanError::Malformed { offset })?
        + offset;
    let len: usize = std::str::from_utf8(&buf[offset..colon])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ScanError::Malformed { offset })?;
    let start = colon + 1;
    let end = start
        .checked_add(len)
        .ok_or(ScanError::Malformed { offset })?;
    if end > buf.len() {
        return Err(ScanError::UnexpectedEof);
    }
    Ok((&buf[start..end], end))
}

/// Returns the offset just past the bencoded value starting at `offset`,
/// without interpreting its contents beyond what's needed to find its end.
fn skip_value(buf: &[u8], offset: usize) -> Result<usize, ScanError> {
    if offset >= buf.len() {
        return Err(ScanError::UnexpectedEof);
    }
    match buf[offset] {
        b'i' => {
            let end = buf[offset..]
                .iter()
                .position(|&b| b == b'e')
                .ok_or(ScanError::UnexpectedEof)?
                + offset;
            Ok(end + 1)
        }
        b'l' => {
            let mut cursor = offset + 1;
            while buf.get(cursor) != Some(&b'e') {
                cursor = skip_value(buf, cursor)?;
            }
            Ok(cursor + 1)
        }
        b'd' => {
            let mut cursor = offset + 1;
            while buf.get(cursor) != Some(&b'e') {
                let (_, next) = parse_bytestring(buf, cursor)?;
                cursor = skip_value(buf, next)?;
            }
            Ok(cursor + 1)
        }
        b'0'..=b'9' => {
            let (_, next) = parse_bytestring(buf, offset)?;
            Ok(next)
        }
        _ => Err(ScanError::Malformed { offset }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_value_span_simple() {
        // d4:infod6:lengthi10eee
        let buf = b"d4:infod6:lengthi10eee";
        let (start, end) = raw_value_span(buf, b"info").unwrap();
        assert_eq!(&buf[start..end], b"d6:lengthi10ee");
    }

    #[test]
    fn test_raw_value_span_key_not_found() {
        let buf = b"d4:name3:fooe";
        assert_eq!(raw_value_span(buf, b"info"), Err(ScanError::KeyNotFound));
    }

    #[test]
    fn test_raw_value_span_with_preceding_keys() {
        // d8:announce3:url4:infoli1ei2eee
        let buf = b"d8:announce3:url4:infoli1ei2eee";
        let (start, end) = raw_value_span(buf, b"info").unwrap();
        assert_eq!(&buf[start..end], b"li1ei2ee");
    }
}
