//! Decoding transformations.

use super::{TransformResult, Transformation, TransformationError};
use crate::variables::lossless_string;
use std::borrow::Cow;

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn hex_pair(a: u8, b: u8) -> Option<u8> {
    Some(hex_val(a)? << 4 | hex_val(b)?)
}

fn hex4(bytes: &[u8]) -> Option<u32> {
    if bytes.len() < 4 {
        return None;
    }
    bytes[..4]
        .iter()
        .try_fold(0u32, |acc, b| Some(acc << 4 | hex_val(*b)? as u32))
}

/// Full-width ASCII (U+FF01..U+FF5E) folds to its ASCII counterpart.
fn fold_unicode(code: u32) -> Option<char> {
    if (0xFF01..=0xFF5E).contains(&code) {
        char::from_u32(code - 0xFEE0)
    } else {
        char::from_u32(code)
    }
}

fn finish(input: &str, out: Vec<u8>, changed: bool) -> Cow<'_, str> {
    if changed {
        Cow::Owned(lossless_string(out))
    } else {
        Cow::Borrowed(input)
    }
}

/// Percent-decode `input`, turning `+` into a space. Invalid escapes are
/// kept literally; bytes that are not UTF-8 survive as escapes.
pub fn url_decode(input: &str) -> Cow<'_, str> {
    let bytes = input.as_bytes();
    if !bytes.iter().any(|b| *b == b'%' || *b == b'+') {
        return Cow::Borrowed(input);
    }
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match hex_pair(bytes[i + 1], bytes[i + 2]) {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                        continue;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    finish(input, out, true)
}

/// URL decode transformation.
pub struct UrlDecode;

impl Transformation for UrlDecode {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        Ok(url_decode(input))
    }

    fn name(&self) -> &'static str {
        "urlDecode"
    }
}

/// URL decode that also understands IIS-style `%uXXXX` escapes.
pub struct UrlDecodeUni;

impl Transformation for UrlDecodeUni {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        let bytes = input.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut changed = false;
        let mut i = 0;
        while i < bytes.len() {
            let b = bytes[i];
            if b == b'+' {
                out.push(b' ');
                changed = true;
                i += 1;
                continue;
            }
            if b == b'%' {
                let rest = &bytes[i + 1..];
                if matches!(rest.first(), Some(b'u') | Some(b'U')) {
                    if let Some(c) = hex4(&rest[1..]).and_then(fold_unicode) {
                        let mut buf = [0u8; 4];
                        out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                        changed = true;
                        i += 6;
                        continue;
                    }
                } else if rest.len() >= 2 {
                    if let Some(v) = hex_pair(rest[0], rest[1]) {
                        out.push(v);
                        changed = true;
                        i += 3;
                        continue;
                    }
                }
            }
            out.push(b);
            i += 1;
        }
        Ok(finish(input, out, changed))
    }

    fn name(&self) -> &'static str {
        "urlDecodeUni"
    }
}

fn is_b64(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'+' || b == b'/'
}

fn b64_prefix(data: &[u8]) -> Option<Vec<u8>> {
    use base64::Engine;
    let mut len = data.len();
    if len % 4 == 1 {
        len -= 1;
    }
    base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(&data[..len])
        .ok()
}

/// Base64 decode; decoding stops at the first character outside the
/// alphabet.
pub struct Base64Decode;

impl Transformation for Base64Decode {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        let bytes = input.as_bytes();
        let end = bytes.iter().position(|b| !is_b64(*b)).unwrap_or(bytes.len());
        match b64_prefix(&bytes[..end]) {
            Some(decoded) => Ok(Cow::Owned(lossless_string(decoded))),
            None => Err(TransformationError::new(self.name(), "invalid base64 input")),
        }
    }

    fn name(&self) -> &'static str {
        "base64Decode"
    }
}

/// Forgiving base64 decode: skips characters outside the alphabet and
/// accepts the URL-safe alphabet.
pub struct Base64DecodeExt;

impl Transformation for Base64DecodeExt {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        let cleaned: Vec<u8> = input
            .bytes()
            .map(|b| match b {
                b'-' => b'+',
                b'_' => b'/',
                other => other,
            })
            .filter(|b| is_b64(*b))
            .collect();
        match b64_prefix(&cleaned) {
            Some(decoded) => Ok(Cow::Owned(lossless_string(decoded))),
            None => Err(TransformationError::new(self.name(), "invalid base64 input")),
        }
    }

    fn name(&self) -> &'static str {
        "base64DecodeExt"
    }
}

/// Hex decode transformation. Odd-length or non-hex input is a soft error.
pub struct HexDecode;

impl Transformation for HexDecode {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        let bytes = input.as_bytes();
        if bytes.len() % 2 != 0 {
            return Err(TransformationError::new(self.name(), "odd length hex input"));
        }
        let decoded = bytes
            .chunks(2)
            .map(|pair| hex_pair(pair[0], pair[1]))
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| TransformationError::new(self.name(), "invalid hex digit"))?;
        Ok(Cow::Owned(lossless_string(decoded)))
    }

    fn name(&self) -> &'static str {
        "hexDecode"
    }
}

/// Decodes `0x`-prefixed hex runs as found in SQL literals.
pub struct SqlHexDecode;

impl Transformation for SqlHexDecode {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        let bytes = input.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut changed = false;
        let mut i = 0;
        while i < bytes.len() {
            let is_prefix = bytes[i] == b'0'
                && matches!(bytes.get(i + 1), Some(b'x') | Some(b'X'))
                && bytes.len() > i + 3
                && hex_pair(bytes[i + 2], bytes[i + 3]).is_some();
            if !is_prefix {
                out.push(bytes[i]);
                i += 1;
                continue;
            }
            i += 2;
            while i + 1 < bytes.len() {
                match hex_pair(bytes[i], bytes[i + 1]) {
                    Some(v) => {
                        out.push(v);
                        i += 2;
                    }
                    None => break,
                }
            }
            changed = true;
        }
        Ok(finish(input, out, changed))
    }

    fn name(&self) -> &'static str {
        "sqlHexDecode"
    }
}

/// HTML entity decode transformation.
pub struct HtmlEntityDecode;

impl Transformation for HtmlEntityDecode {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        if !input.contains('&') {
            return Ok(Cow::Borrowed(input));
        }
        Ok(match html_escape::decode_html_entities(input) {
            Cow::Borrowed(_) => Cow::Borrowed(input),
            Cow::Owned(s) => Cow::Owned(s),
        })
    }

    fn name(&self) -> &'static str {
        "htmlEntityDecode"
    }
}

/// Shared C-style escape handling for `jsDecode` and `escapeSeqDecode`.
///
/// Returns the decoded bytes and how many input bytes were consumed after
/// the backslash, or `None` if the sequence is not recognised.
fn c_escape(rest: &[u8], js: bool) -> Option<(Vec<u8>, usize)> {
    let first = *rest.first()?;
    let simple = |b: u8| Some((vec![b], 1));
    match first {
        b'a' => simple(0x07),
        b'b' => simple(0x08),
        b'f' => simple(0x0c),
        b'n' => simple(b'\n'),
        b'r' => simple(b'\r'),
        b't' => simple(b'\t'),
        b'v' => simple(0x0b),
        b'x' | b'X' if rest.len() >= 3 => {
            hex_pair(rest[1], rest[2]).map(|v| (vec![v], 3))
        }
        b'u' if js => {
            let c = hex4(&rest[1..]).and_then(fold_unicode)?;
            let mut buf = [0u8; 4];
            Some((c.encode_utf8(&mut buf).as_bytes().to_vec(), 5))
        }
        b'0'..=b'7' => {
            let digits = rest
                .iter()
                .take(3)
                .take_while(|b| (b'0'..=b'7').contains(*b))
                .count();
            let value = rest[..digits]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + (b - b'0') as u32);
            Some((vec![(value & 0xff) as u8], digits))
        }
        _ => None,
    }
}

/// JavaScript escape decoding (`\xHH`, `\uHHHH`, octal, single-char).
pub struct JsDecode;

impl Transformation for JsDecode {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        let bytes = input.as_bytes();
        if !bytes.contains(&b'\\') {
            return Ok(Cow::Borrowed(input));
        }
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] != b'\\' || i + 1 == bytes.len() {
                out.push(bytes[i]);
                i += 1;
                continue;
            }
            match c_escape(&bytes[i + 1..], true) {
                Some((decoded, used)) => {
                    out.extend_from_slice(&decoded);
                    i += 1 + used;
                }
                None => {
                    // Unknown escape: drop the backslash.
                    out.push(bytes[i + 1]);
                    i += 2;
                }
            }
        }
        Ok(finish(input, out, true))
    }

    fn name(&self) -> &'static str {
        "jsDecode"
    }
}

/// ANSI C escape sequence decoding.
pub struct EscapeSeqDecode;

impl Transformation for EscapeSeqDecode {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        let bytes = input.as_bytes();
        if !bytes.contains(&b'\\') {
            return Ok(Cow::Borrowed(input));
        }
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'\\' && i + 1 < bytes.len() {
                let next = bytes[i + 1];
                if matches!(next, b'\\' | b'?' | b'\'' | b'"') {
                    out.push(next);
                    i += 2;
                    continue;
                }
                if let Some((decoded, used)) = c_escape(&bytes[i + 1..], false) {
                    out.extend_from_slice(&decoded);
                    i += 1 + used;
                    continue;
                }
            }
            out.push(bytes[i]);
            i += 1;
        }
        Ok(finish(input, out, true))
    }

    fn name(&self) -> &'static str {
        "escapeSeqDecode"
    }
}

/// CSS 2.x escape decoding.
pub struct CssDecode;

impl Transformation for CssDecode {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        let bytes = input.as_bytes();
        if !bytes.contains(&b'\\') {
            return Ok(Cow::Borrowed(input));
        }
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] != b'\\' {
                out.push(bytes[i]);
                i += 1;
                continue;
            }
            i += 1;
            let digits = bytes[i..]
                .iter()
                .take(6)
                .take_while(|b| b.is_ascii_hexdigit())
                .count();
            if digits == 0 {
                match bytes.get(i) {
                    // Escaped newline is a line continuation.
                    Some(b'\n') => i += 1,
                    Some(b) => {
                        out.push(*b);
                        i += 1;
                    }
                    None => {}
                }
                continue;
            }
            let code = bytes[i..i + digits]
                .iter()
                .fold(0u32, |acc, b| acc << 4 | hex_val(*b).unwrap_or(0) as u32);
            i += digits;
            let c = fold_unicode(code).unwrap_or(char::REPLACEMENT_CHARACTER);
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            if matches!(bytes.get(i), Some(b' ') | Some(b'\t') | Some(b'\n')) {
                i += 1;
            }
        }
        Ok(finish(input, out, true))
    }

    fn name(&self) -> &'static str {
        "cssDecode"
    }
}

/// Replaces every non-ASCII character with a `%uXXXX` escape.
pub struct Utf8ToUnicode;

impl Transformation for Utf8ToUnicode {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        if input.is_ascii() {
            return Ok(Cow::Borrowed(input));
        }
        let mut out = String::with_capacity(input.len() * 2);
        for c in input.chars() {
            if c.is_ascii() {
                out.push(c);
            } else {
                out.push_str(&format!("%u{:04x}", c as u32));
            }
        }
        Ok(Cow::Owned(out))
    }

    fn name(&self) -> &'static str {
        "utf8toUnicode"
    }
}
