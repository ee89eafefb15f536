//! Cross-site scripting detection.
//!
//! The value is decoded (HTML entities, percent escapes) and scanned like
//! an HTML tokenizer would: tag names, attribute names and attribute values.
//! A value is flagged when it opens a script-capable element, carries an
//! event handler attribute, or puts a script URL where a browser would
//! follow it.

use phf::phf_set;
use std::borrow::Cow;

static DANGEROUS_TAGS: phf::Set<&'static str> = phf_set! {
    "script", "iframe", "frame", "frameset", "object", "embed", "applet",
    "base", "link", "meta", "style", "svg", "math", "form", "isindex",
    "xml", "import", "vmlframe", "xss", "layer", "ilayer", "bgsound",
    "template", "portal",
};

/// Attributes whose value a browser navigates to or loads.
static URL_ATTRIBUTES: phf::Set<&'static str> = phf_set! {
    "href", "src", "action", "formaction", "data", "background", "dynsrc",
    "lowsrc", "xlink:href", "poster", "codebase", "srcdoc", "to", "values",
};

static SCHEMES: &[&str] = &["javascript:", "vbscript:", "livescript:", "mocha:", "data:text/html"];

static STYLE_MARKERS: &[&str] = &["expression(", "-moz-binding", "behavior:", "javascript:"];

/// HTML-entity and percent decode, drop NULs and lowercase.
fn normalize(input: &str) -> String {
    let entities = html_escape::decode_html_entities(input);
    let percent: Cow<'_, str> = percent_encoding::percent_decode_str(&entities).decode_utf8_lossy();
    percent.replace('\0', "").to_lowercase()
}

/// Strip whitespace and control characters a browser ignores inside URLs.
fn compact(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace() && !c.is_control()).collect()
}

fn script_scheme(value: &str) -> Option<&'static str> {
    let compacted = compact(value);
    SCHEMES.iter().copied().find(|s| compacted.starts_with(s))
}

struct Scanner<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn skip_while(&mut self, pred: impl Fn(u8) -> bool) {
        while self.pos < self.bytes.len() && pred(self.bytes[self.pos]) {
            self.pos += 1;
        }
    }

    fn take_while(&mut self, pred: impl Fn(u8) -> bool) -> &'a str {
        let text = self.text;
        let start = self.pos;
        self.skip_while(pred);
        &text[start..self.pos]
    }

    fn at(&self, b: u8) -> bool {
        self.bytes.get(self.pos) == Some(&b)
    }

    /// Scan one tag starting right after `<`.
    fn tag(&mut self) -> Option<String> {
        if self.at(b'/') {
            self.pos += 1;
        }
        if !self.bytes.get(self.pos).map_or(false, |b| b.is_ascii_alphabetic()) {
            return None;
        }
        let name = self.take_while(|b| b.is_ascii_alphanumeric() || b == b':' || b == b'-');
        if DANGEROUS_TAGS.contains(name) {
            return Some(format!("tag:{}", name));
        }
        loop {
            self.skip_while(|b| b.is_ascii_whitespace() || b == b'/');
            if self.pos >= self.bytes.len() || self.at(b'>') {
                return None;
            }
            let attr = self.take_while(|b| {
                !b.is_ascii_whitespace() && b != b'=' && b != b'>' && b != b'/'
            });
            if attr.is_empty() {
                self.pos += 1;
                continue;
            }
            if attr.len() > 2 && attr.starts_with("on") {
                return Some(format!("attr:{}", attr));
            }
            self.skip_while(|b| b.is_ascii_whitespace());
            if !self.at(b'=') {
                continue;
            }
            self.pos += 1;
            self.skip_while(|b| b.is_ascii_whitespace());
            let value = match self.bytes.get(self.pos) {
                Some(&q @ (b'"' | b'\'' | b'`')) => {
                    self.pos += 1;
                    let v = self.take_while(|b| b != q);
                    if self.pos < self.bytes.len() {
                        self.pos += 1;
                    }
                    v
                }
                _ => self.take_while(|b| !b.is_ascii_whitespace() && b != b'>'),
            };
            if URL_ATTRIBUTES.contains(attr) {
                if let Some(scheme) = script_scheme(value) {
                    return Some(format!("scheme:{}", scheme.trim_end_matches(':')));
                }
            }
            if attr == "style" {
                let compacted = compact(value);
                if STYLE_MARKERS.iter().any(|m| compacted.contains(m)) {
                    return Some("attr:style".to_string());
                }
            }
        }
    }
}

/// Detect XSS; returns a short description of what was found
/// (`tag:script`, `attr:onerror`, `scheme:javascript`).
pub fn detect_xss(input: &str) -> Option<String> {
    if input.is_empty() {
        return None;
    }
    let text = normalize(input);
    if let Some(scheme) = script_scheme(&text) {
        return Some(format!("scheme:{}", scheme.trim_end_matches(':')));
    }

    let mut scanner = Scanner {
        text: &text,
        bytes: text.as_bytes(),
        pos: 0,
    };
    while let Some(offset) = memchr::memchr(b'<', &scanner.bytes[scanner.pos..]) {
        scanner.pos += offset + 1;
        if let Some(found) = scanner.tag() {
            return Some(found);
        }
    }
    None
}
