//! Byte-preserving text for values taken from the wire.
//!
//! Variables hold `String`s, but request data is arbitrary bytes. Valid
//! UTF-8 is kept as is. Each byte of an invalid sequence is stored as one
//! escape character in `U+10FF80..=U+10FFFF`, so [`wire_bytes`] gives back
//! exactly what the client sent.

use std::borrow::Cow;

const ESCAPE_BASE: u32 = 0x10_FF00;

fn escape(byte: u8) -> char {
    char::from_u32(ESCAPE_BASE + byte as u32).unwrap_or(char::REPLACEMENT_CHARACTER)
}

fn unescape(c: char) -> Option<u8> {
    let code = c as u32;
    if (ESCAPE_BASE + 0x80..=ESCAPE_BASE + 0xFF).contains(&code) {
        Some((code - ESCAPE_BASE) as u8)
    } else {
        None
    }
}

/// Text view of `bytes` that round-trips through [`wire_bytes`].
pub fn lossless_text(bytes: &[u8]) -> Cow<'_, str> {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(bytes.len() + 8);
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(text) => {
                out.push_str(text);
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                let bad = e.error_len().unwrap_or(after.len());
                out.extend(after[..bad].iter().copied().map(escape));
                rest = &after[bad..];
            }
        }
    }
    Cow::Owned(out)
}

/// Owned form of [`lossless_text`].
pub fn lossless_string(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => lossless_text(e.as_bytes()).into_owned(),
    }
}

/// The bytes a value stands for.
pub fn wire_bytes(text: &str) -> Cow<'_, [u8]> {
    if !text.chars().any(|c| unescape(c).is_some()) {
        return Cow::Borrowed(text.as_bytes());
    }
    let mut out = Vec::with_capacity(text.len());
    let mut buf = [0u8; 4];
    for c in text.chars() {
        match unescape(c) {
            Some(byte) => out.push(byte),
            None => out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes()),
        }
    }
    Cow::Owned(out)
}

/// Whether `text` carries bytes that were not valid UTF-8.
pub fn has_invalid_utf8(text: &str) -> bool {
    text.chars().any(|c| unescape(c).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_utf8_is_borrowed() {
        assert!(matches!(lossless_text("café".as_bytes()), Cow::Borrowed("café")));
        assert!(matches!(wire_bytes("café"), Cow::Borrowed(_)));
        assert!(!has_invalid_utf8("café"));
    }

    #[test]
    fn test_invalid_bytes_round_trip() {
        for raw in [&b"\xff"[..], b"a\xffb", b"bad\xc0\xafpath", b"\xe2\x82", b"ok\xf0\x9f\x98\x80\x80"] {
            let text = lossless_text(raw);
            assert!(has_invalid_utf8(&text), "{:?}", raw);
            assert_eq!(&*wire_bytes(&text), raw);
        }
        assert_eq!(wire_bytes(&lossless_string(vec![0xff])).len(), 1);
    }
}
