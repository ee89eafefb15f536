//! Normalization transformations.

use super::{TransformResult, Transformation};
use std::borrow::Cow;

fn changed_or_borrowed(input: &str, out: String) -> Cow<'_, str> {
    if out == input {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(out)
    }
}

/// ASCII whitespace plus NBSP, as seen by the whitespace transformations.
fn is_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r' | '\x0b' | '\x0c' | '\u{a0}')
}

/// Lowercase transformation.
pub struct Lowercase;

impl Transformation for Lowercase {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        if !input.chars().any(char::is_uppercase) {
            return Ok(Cow::Borrowed(input));
        }
        Ok(Cow::Owned(input.to_lowercase()))
    }

    fn name(&self) -> &'static str {
        "lowercase"
    }
}

/// Uppercase transformation.
pub struct Uppercase;

impl Transformation for Uppercase {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        if !input.chars().any(char::is_lowercase) {
            return Ok(Cow::Borrowed(input));
        }
        Ok(Cow::Owned(input.to_uppercase()))
    }

    fn name(&self) -> &'static str {
        "uppercase"
    }
}

/// Collapses whitespace runs into one space.
pub struct CompressWhitespace;

impl Transformation for CompressWhitespace {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        let mut out = String::with_capacity(input.len());
        let mut in_space = false;
        for c in input.chars() {
            if is_space(c) {
                if !in_space {
                    out.push(' ');
                }
                in_space = true;
            } else {
                out.push(c);
                in_space = false;
            }
        }
        Ok(changed_or_borrowed(input, out))
    }

    fn name(&self) -> &'static str {
        "compressWhitespace"
    }
}

/// Remove whitespace transformation.
pub struct RemoveWhitespace;

impl Transformation for RemoveWhitespace {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        if !input.chars().any(is_space) {
            return Ok(Cow::Borrowed(input));
        }
        Ok(Cow::Owned(input.chars().filter(|c| !is_space(*c)).collect()))
    }

    fn name(&self) -> &'static str {
        "removeWhitespace"
    }
}

/// Remove null bytes transformation.
pub struct RemoveNulls;

impl Transformation for RemoveNulls {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        if !input.contains('\0') {
            return Ok(Cow::Borrowed(input));
        }
        Ok(Cow::Owned(input.replace('\0', "")))
    }

    fn name(&self) -> &'static str {
        "removeNulls"
    }
}

/// Replace null bytes with spaces transformation.
pub struct ReplaceNulls;

impl Transformation for ReplaceNulls {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        if !input.contains('\0') {
            return Ok(Cow::Borrowed(input));
        }
        Ok(Cow::Owned(input.replace('\0', " ")))
    }

    fn name(&self) -> &'static str {
        "replaceNulls"
    }
}

fn trimmed<'a>(input: &'a str, out: &'a str) -> Cow<'a, str> {
    // A trimmed slice borrows from the input, so report a change by length.
    if out.len() == input.len() {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(out.to_string())
    }
}

/// Trim transformation.
pub struct Trim;

impl Transformation for Trim {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        Ok(trimmed(input, input.trim_matches(is_space)))
    }

    fn name(&self) -> &'static str {
        "trim"
    }
}

/// Trim left transformation.
pub struct TrimLeft;

impl Transformation for TrimLeft {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        Ok(trimmed(input, input.trim_start_matches(is_space)))
    }

    fn name(&self) -> &'static str {
        "trimLeft"
    }
}

/// Trim right transformation.
pub struct TrimRight;

impl Transformation for TrimRight {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        Ok(trimmed(input, input.trim_end_matches(is_space)))
    }

    fn name(&self) -> &'static str {
        "trimRight"
    }
}

/// Resolve `.`/`..` segments and collapse repeated slashes.
fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let trailing = path.ends_with('/') || path.ends_with("/.") || path.ends_with("/..");
    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if stack.last().map_or(false, |s| *s != "..") {
                    stack.pop();
                } else if !absolute {
                    stack.push("..");
                }
            }
            other => stack.push(other),
        }
    }
    let mut out = String::with_capacity(path.len());
    if absolute {
        out.push('/');
    }
    out.push_str(&stack.join("/"));
    if trailing && !stack.is_empty() {
        out.push('/');
    }
    out
}

/// Normalize path transformation (Unix-style).
pub struct NormalizePath;

impl Transformation for NormalizePath {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        if input.is_empty() {
            return Ok(Cow::Borrowed(input));
        }
        Ok(changed_or_borrowed(input, normalize_path(input)))
    }

    fn name(&self) -> &'static str {
        "normalizePath"
    }
}

/// Normalize path after turning backslashes into forward slashes.
pub struct NormalizePathWin;

impl Transformation for NormalizePathWin {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        if input.is_empty() {
            return Ok(Cow::Borrowed(input));
        }
        Ok(changed_or_borrowed(
            input,
            normalize_path(&input.replace('\\', "/")),
        ))
    }

    fn name(&self) -> &'static str {
        "normalizePathWin"
    }
}

/// Strip comments. `replacement` is pushed once per C comment.
fn strip_comments(input: &str, replacement: Option<char>, line_comments: bool) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while !rest.is_empty() {
        if let Some(body) = rest.strip_prefix("/*") {
            if let Some(r) = replacement {
                out.push(r);
            }
            rest = body.find("*/").map_or("", |end| &body[end + 2..]);
        } else if line_comments && rest.starts_with("<!--") {
            rest = rest[4..].find("-->").map_or("", |end| &rest[4 + end + 3..]);
        } else if line_comments && (rest.starts_with("--") || rest.starts_with('#')) {
            rest = "";
        } else {
            let c = rest.chars().next().unwrap_or_default();
            out.push(c);
            rest = &rest[c.len_utf8()..];
        }
    }
    out
}

/// Removes C, HTML and SQL line comments.
pub struct RemoveComments;

impl Transformation for RemoveComments {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        Ok(changed_or_borrowed(input, strip_comments(input, None, true)))
    }

    fn name(&self) -> &'static str {
        "removeComments"
    }
}

/// Replaces each C comment with a single space.
pub struct ReplaceComments;

impl Transformation for ReplaceComments {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        if !input.contains("/*") {
            return Ok(Cow::Borrowed(input));
        }
        Ok(Cow::Owned(strip_comments(input, Some(' '), false)))
    }

    fn name(&self) -> &'static str {
        "replaceComments"
    }
}

/// Removes comment delimiters (`/*`, `*/`, `--`, `#`, `<!--`, `-->`)
/// but keeps the commented text.
pub struct RemoveCommentsChar;

impl Transformation for RemoveCommentsChar {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        const DELIMITERS: [&str; 6] = ["<!--", "-->", "/*", "*/", "--", "#"];
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        'outer: while !rest.is_empty() {
            for d in DELIMITERS {
                if let Some(r) = rest.strip_prefix(d) {
                    rest = r;
                    continue 'outer;
                }
            }
            let c = rest.chars().next().unwrap_or_default();
            out.push(c);
            rest = &rest[c.len_utf8()..];
        }
        Ok(changed_or_borrowed(input, out))
    }

    fn name(&self) -> &'static str {
        "removeCommentsChar"
    }
}

/// Windows/Unix command line normalization.
///
/// Deletes `\ " ' ^`, turns `,` `;` and whitespace into a single space,
/// drops spaces before `/` and `(`, and lowercases.
pub struct CmdLine;

impl Transformation for CmdLine {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        let mut out = String::with_capacity(input.len());
        let mut space = false;
        for c in input.chars() {
            match c {
                '\\' | '"' | '\'' | '^' => {}
                ',' | ';' | ' ' | '\t' | '\r' | '\n' => {
                    if !space {
                        out.push(' ');
                        space = true;
                    }
                }
                '/' | '(' => {
                    if space {
                        out.pop();
                    }
                    out.push(c);
                    space = false;
                }
                other => {
                    out.push(other.to_ascii_lowercase());
                    space = false;
                }
            }
        }
        Ok(changed_or_borrowed(input, out))
    }

    fn name(&self) -> &'static str {
        "cmdLine"
    }
}

/// 7-bit parity transformations. Bytes with the high bit set after the
/// transformation are surfaced as the Latin-1 character of the same value.
#[derive(Debug, Clone, Copy)]
pub enum Parity {
    /// Set bit 7 so the byte has even parity.
    Even,
    /// Set bit 7 so the byte has odd parity.
    Odd,
    /// Clear bit 7.
    Zero,
}

impl Transformation for Parity {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        let out: String = input
            .bytes()
            .map(|b| {
                let low = b & 0x7f;
                let odd = low.count_ones() % 2 == 1;
                let byte = match self {
                    Parity::Even if odd => low | 0x80,
                    Parity::Odd if !odd => low | 0x80,
                    _ => low,
                };
                char::from(byte)
            })
            .collect();
        Ok(changed_or_borrowed(input, out))
    }

    fn name(&self) -> &'static str {
        match self {
            Parity::Even => "parityEven7bit",
            Parity::Odd => "parityOdd7bit",
            Parity::Zero => "parityZero7bit",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(t: &dyn Transformation, input: &str) -> String {
        t.transform(input).unwrap().into_owned()
    }

    #[test]
    fn test_case() {
        assert_eq!(apply(&Lowercase, "Hello World"), "hello world");
        assert!(matches!(Lowercase.transform("already lower").unwrap(), Cow::Borrowed(_)));
        assert_eq!(apply(&Uppercase, "abc"), "ABC");
    }

    #[test]
    fn test_whitespace() {
        assert_eq!(apply(&CompressWhitespace, "hello   world"), "hello world");
        assert_eq!(apply(&CompressWhitespace, "a\t\nb"), "a b");
        assert_eq!(apply(&RemoveWhitespace, "hello world\u{a0}!"), "helloworld!");
        assert_eq!(apply(&Trim, "  x  "), "x");
        assert_eq!(apply(&TrimLeft, "  x  "), "x  ");
        assert_eq!(apply(&TrimRight, "  x  "), "  x");
    }

    #[test]
    fn test_nulls() {
        assert_eq!(apply(&RemoveNulls, "a\0b"), "ab");
        assert_eq!(apply(&ReplaceNulls, "a\0b"), "a b");
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(apply(&NormalizePath, "/a/b/../c"), "/a/c");
        assert_eq!(apply(&NormalizePath, "/a//b/./c"), "/a/b/c");
        assert_eq!(apply(&NormalizePath, "/a/b/"), "/a/b/");
        assert_eq!(apply(&NormalizePath, "/../../etc/passwd"), "/etc/passwd");
        assert_eq!(apply(&NormalizePath, "../x"), "../x");
        assert_eq!(apply(&NormalizePathWin, "C:\\a\\..\\b"), "C:/b");
    }

    #[test]
    fn test_comments() {
        assert_eq!(apply(&RemoveComments, "sel/*x*/ect"), "select");
        assert_eq!(apply(&RemoveComments, "1 -- drop"), "1 ");
        assert_eq!(apply(&RemoveComments, "a<!-- b -->c"), "ac");
        assert_eq!(apply(&ReplaceComments, "sel/*x*/ect"), "sel ect");
        assert_eq!(apply(&ReplaceComments, "a/*unterminated"), "a ");
        assert_eq!(apply(&RemoveCommentsChar, "/*x*/ a#b--"), "x ab");
    }

    #[test]
    fn test_cmdline() {
        assert_eq!(apply(&CmdLine, "CMD;/C"), "cmd/c");
        assert_eq!(apply(&CmdLine, "echo^hello"), "echohello");
        assert_eq!(apply(&CmdLine, "C\"M\"D  ,  dir"), "cmd dir");
        assert_eq!(apply(&CmdLine, "ping (x)"), "ping(x)");
    }

    #[test]
    fn test_parity() {
        // 'a' = 0x61 has three bits set.
        assert_eq!(apply(&Parity::Even, "a"), "\u{e1}");
        assert_eq!(apply(&Parity::Odd, "a"), "a");
        assert_eq!(apply(&Parity::Zero, "a"), "a");
        assert_eq!(apply(&Parity::Zero, "\u{e1}"), "C!");
    }
}
