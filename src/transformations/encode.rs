//! Encoding and hashing transformations.
//!
//! Hash digests are emitted as lowercase hex so they stay printable in
//! logs and comparable with `@streq`.

use super::{TransformResult, Transformation};
use base64::Engine;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::borrow::Cow;
use std::fmt::Write;

/// Characters left untouched by `urlEncode`.
const URL_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

fn digest_hex<D: sha1::Digest>(input: &str) -> String {
    to_hex(&D::digest(input.as_bytes()))
}

/// Base64 encode transformation.
pub struct Base64Encode;

impl Transformation for Base64Encode {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        Ok(Cow::Owned(
            base64::engine::general_purpose::STANDARD.encode(input),
        ))
    }

    fn name(&self) -> &'static str {
        "base64Encode"
    }
}

/// Hex encode transformation.
pub struct HexEncode;

impl Transformation for HexEncode {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        Ok(Cow::Owned(to_hex(input.as_bytes())))
    }

    fn name(&self) -> &'static str {
        "hexEncode"
    }
}

/// URL encode transformation (spaces become `+`).
pub struct UrlEncode;

impl Transformation for UrlEncode {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        let encoded = utf8_percent_encode(input, URL_ENCODE_SET)
            .to_string()
            .replace("%20", "+");
        Ok(if encoded == input {
            Cow::Borrowed(input)
        } else {
            Cow::Owned(encoded)
        })
    }

    fn name(&self) -> &'static str {
        "urlEncode"
    }
}

/// MD5 digest transformation.
pub struct Md5;

impl Transformation for Md5 {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        Ok(Cow::Owned(digest_hex::<md5::Md5>(input)))
    }

    fn name(&self) -> &'static str {
        "md5"
    }
}

/// SHA1 digest transformation.
pub struct Sha1;

impl Transformation for Sha1 {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        Ok(Cow::Owned(digest_hex::<sha1::Sha1>(input)))
    }

    fn name(&self) -> &'static str {
        "sha1"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(t: &dyn Transformation, input: &str) -> String {
        t.transform(input).unwrap().into_owned()
    }

    #[test]
    fn test_base64_and_hex_encode() {
        assert_eq!(apply(&Base64Encode, "hello"), "aGVsbG8=");
        assert_eq!(apply(&HexEncode, "AB"), "4142");
    }

    #[test]
    fn test_url_encode() {
        assert_eq!(apply(&UrlEncode, "a b&c"), "a+b%26c");
        assert!(matches!(UrlEncode.transform("abc-1.2").unwrap(), Cow::Borrowed(_)));
    }

    #[test]
    fn test_digests() {
        assert_eq!(apply(&Md5, "hello"), "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(apply(&Sha1, "hello"), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
    }
}
