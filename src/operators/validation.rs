//! Validation operators.
//!
//! These match when the value is *invalid* (`@validateByteRange`,
//! `@validateUrlEncoding`, `@validateUtf8Encoding`, `@validateSchema`) or
//! when it contains a *valid* identifier that should not leak
//! (`@validateNid`, `@verifyCC`).

use super::cache;
use super::traits::{Operator, OperatorContext, OperatorOptions, MAX_CAPTURES};
use crate::engine::Phase;
use crate::error::{Error, Result};
use crate::variables::{has_invalid_utf8, wire_bytes};
use jsonschema::JSONSchema;
use regex::Regex;
use tracing::debug;

fn bad_argument(operator: &str, message: impl Into<String>) -> Error {
    Error::InvalidOperatorArgument {
        operator: operator.to_string(),
        message: message.into(),
    }
}

/// Byte range validation (`@validateByteRange 9,10,13,32-126`).
pub struct ValidateByteRangeOperator {
    allowed: [bool; 256],
}

impl ValidateByteRangeOperator {
    /// Parse a comma separated list of bytes and inclusive ranges.
    pub fn new(spec: &str) -> Result<Self> {
        let mut allowed = [false; 256];
        let parse = |s: &str| {
            s.trim()
                .parse::<u8>()
                .map_err(|_| bad_argument("validateByteRange", format!("invalid byte '{}'", s)))
        };
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (start, end) = match part.split_once('-') {
                Some((a, b)) => (parse(a)?, parse(b)?),
                None => {
                    let b = parse(part)?;
                    (b, b)
                }
            };
            if start > end {
                return Err(bad_argument(
                    "validateByteRange",
                    format!("empty range '{}'", part),
                ));
            }
            for b in start..=end {
                allowed[b as usize] = true;
            }
        }
        Ok(Self { allowed })
    }
}

impl Operator for ValidateByteRangeOperator {
    fn evaluate(&self, ctx: &mut OperatorContext<'_>, value: &str) -> bool {
        match wire_bytes(value).iter().find(|b| !self.allowed[**b as usize]) {
            Some(b) => {
                ctx.capture_field(0, &b.to_string());
                true
            }
            None => false,
        }
    }

    fn name(&self) -> &'static str {
        "validateByteRange"
    }
}

/// URL encoding validation (`@validateUrlEncoding`).
pub struct ValidateUrlEncodingOperator;

/// Every `%` must be followed by two hex digits.
fn is_valid_url_encoding(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut i = 0;
    while let Some(offset) = memchr::memchr(b'%', &bytes[i..]) {
        let at = i + offset;
        match bytes.get(at + 1..at + 3) {
            Some([h, l]) if h.is_ascii_hexdigit() && l.is_ascii_hexdigit() => i = at + 3,
            _ => return false,
        }
    }
    true
}

impl Operator for ValidateUrlEncodingOperator {
    fn evaluate(&self, _ctx: &mut OperatorContext<'_>, value: &str) -> bool {
        !is_valid_url_encoding(value)
    }

    fn name(&self) -> &'static str {
        "validateUrlEncoding"
    }
}

/// UTF-8 validation (`@validateUtf8Encoding`). Matches when the bytes
/// behind the value are not well-formed UTF-8.
pub struct ValidateUtf8EncodingOperator;

impl Operator for ValidateUtf8EncodingOperator {
    fn evaluate(&self, _ctx: &mut OperatorContext<'_>, value: &str) -> bool {
        has_invalid_utf8(value)
    }

    fn name(&self) -> &'static str {
        "validateUtf8Encoding"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Nid {
    /// Chilean RUT.
    Cl,
    /// US social security number.
    Us,
}

/// National id detection (`@validateNid cl|us <regex>`).
pub struct ValidateNidOperator {
    kind: Nid,
    regex: Regex,
}

impl ValidateNidOperator {
    /// Parse `<country> <regex>`.
    pub fn new(argument: &str) -> Result<Self> {
        let (country, pattern) = argument
            .trim()
            .split_once(char::is_whitespace)
            .ok_or_else(|| bad_argument("validateNid", "expected '<country> <regex>'"))?;
        let kind = match country.to_ascii_lowercase().as_str() {
            "cl" => Nid::Cl,
            "us" => Nid::Us,
            other => return Err(bad_argument("validateNid", format!("unsupported country '{}'", other))),
        };
        let pattern = pattern.trim();
        let regex = cache::regex(pattern).map_err(|source| Error::RegexCompile {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self { kind, regex })
    }
}

fn valid_rut(candidate: &str) -> bool {
    let cleaned: Vec<char> = candidate
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == 'k' || *c == 'K')
        .collect();
    let Some((check, body)) = cleaned.split_last() else {
        return false;
    };
    if body.is_empty() || !body.iter().all(char::is_ascii_digit) {
        return false;
    }
    let mut sum = 0u32;
    for (i, c) in body.iter().rev().enumerate() {
        sum += c.to_digit(10).unwrap_or(0) * (2 + (i as u32 % 6));
    }
    let expected = match 11 - sum % 11 {
        11 => '0',
        10 => 'K',
        d => char::from_digit(d, 10).unwrap_or('?'),
    };
    check.to_ascii_uppercase() == expected
}

fn valid_ssn(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() != 9 {
        return false;
    }
    let number = |r: std::ops::Range<usize>| digits[r].iter().fold(0u32, |acc, d| acc * 10 + d);
    let (area, group, serial) = (number(0..3), number(3..5), number(5..9));
    if area == 0 || area == 666 || area >= 900 || group == 0 || serial == 0 {
        return false;
    }
    // Repeated and sequential numbers are never issued.
    let repeated = digits.iter().all(|d| *d == digits[0]);
    let ascending = digits.windows(2).all(|w| w[1] == w[0] + 1);
    !repeated && !ascending
}

impl Operator for ValidateNidOperator {
    fn evaluate(&self, ctx: &mut OperatorContext<'_>, value: &str) -> bool {
        let mut found = 0;
        for m in self.regex.find_iter(value) {
            let valid = match self.kind {
                Nid::Cl => valid_rut(m.as_str()),
                Nid::Us => valid_ssn(m.as_str()),
            };
            if valid {
                ctx.capture_field(found, m.as_str());
                found += 1;
                if found == MAX_CAPTURES {
                    break;
                }
            }
        }
        found > 0
    }

    fn name(&self) -> &'static str {
        "validateNid"
    }
}

/// Credit card detection (`@verifyCC <regex>`): candidates found by the
/// regex that pass the Luhn check.
pub struct VerifyCcOperator {
    regex: Regex,
}

impl VerifyCcOperator {
    /// Compile the candidate regex.
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = cache::regex(pattern).map_err(|source| Error::RegexCompile {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self { regex })
    }
}

/// Luhn checksum over the digits of `candidate` (13 to 19 digits).
pub(crate) fn luhn(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

impl Operator for VerifyCcOperator {
    fn evaluate(&self, ctx: &mut OperatorContext<'_>, value: &str) -> bool {
        match self.regex.find_iter(value).find(|m| luhn(m.as_str())) {
            Some(m) => {
                ctx.capture_field(0, m.as_str());
                true
            }
            None => false,
        }
    }

    fn name(&self) -> &'static str {
        "verifyCC"
    }
}

/// Transaction variable holding the raw JSON request body.
pub const JSON_REQUEST_BODY: &str = "json_request_body";
/// Transaction variable holding the raw JSON response body.
pub const JSON_RESPONSE_BODY: &str = "json_response_body";

/// JSON Schema validation (`@validateSchema /path/schema.json`).
///
/// Reads the body stored by the JSON processor, not the operator value.
/// Matches on invalid JSON or a schema violation; no data means no match.
pub struct ValidateSchemaOperator {
    schema: JSONSchema,
}

impl ValidateSchemaOperator {
    /// Load and compile the schema file.
    pub fn new(opts: &OperatorOptions) -> Result<Self> {
        let path = opts.resolve_path(opts.argument.trim());
        let text = std::fs::read_to_string(&path).map_err(|source| Error::RuleFileLoad {
            path: path.clone(),
            source,
        })?;
        let document: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| bad_argument("validateSchema", format!("{}: {}", path.display(), e)))?;
        Self::from_value(&document)
    }

    /// Compile an in-memory schema document.
    pub fn from_value(document: &serde_json::Value) -> Result<Self> {
        let schema = JSONSchema::compile(document)
            .map_err(|e| bad_argument("validateSchema", e.to_string()))?;
        Ok(Self { schema })
    }
}

impl Operator for ValidateSchemaOperator {
    fn evaluate(&self, ctx: &mut OperatorContext<'_>, _value: &str) -> bool {
        let key = if ctx.phase >= Phase::ResponseBody {
            JSON_RESPONSE_BODY
        } else if ctx.phase >= Phase::RequestBody {
            JSON_REQUEST_BODY
        } else {
            return false;
        };
        let Some(body) = ctx.variables.tx().first(key) else {
            return false;
        };
        match serde_json::from_str::<serde_json::Value>(body) {
            Ok(doc) => !self.schema.is_valid(&doc),
            Err(e) => {
                debug!(error = %e, "validateSchema: body is not JSON");
                true
            }
        }
    }

    fn name(&self) -> &'static str {
        "validateSchema"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CancellationToken;
    use crate::operators::traits::testing::{eval, eval_with};
    use crate::variables::{lossless_text, TransactionVariables};

    #[test]
    fn test_byte_range() {
        let op = ValidateByteRangeOperator::new("9,10,13,32-126").unwrap();
        assert!(!eval(&op, "plain text\n"));
        assert!(eval(&op, "nul\0byte"));
        assert!(eval(&op, "caf\u{e9}"));
        let high = ValidateByteRangeOperator::new("0-255").unwrap();
        assert!(!eval(&high, &lossless_text(b"\xff")));
        let ascii = ValidateByteRangeOperator::new("32-126").unwrap();
        assert!(eval(&ascii, &lossless_text(b"a\xffb")));
        assert!(ValidateByteRangeOperator::new("10-5").is_err());
        assert!(ValidateByteRangeOperator::new("300").is_err());
    }

    #[test]
    fn test_url_encoding() {
        assert!(is_valid_url_encoding("hello%20world"));
        assert!(is_valid_url_encoding("test%2Fpath"));
        assert!(!is_valid_url_encoding("hello%2"));
        assert!(!is_valid_url_encoding("hello%GG"));
        assert!(eval(&ValidateUrlEncodingOperator, "100%"));
        assert!(!eval(&ValidateUrlEncodingOperator, "a%41b"));
    }

    #[test]
    fn test_utf8() {
        assert!(!eval(&ValidateUtf8EncodingOperator, "caf\u{e9}"));
        let raw = lossless_text(b"bad\xc0\xafpath").into_owned();
        assert!(eval(&ValidateUtf8EncodingOperator, &raw));
        assert!(!eval(&ValidateUtf8EncodingOperator, "\u{fffd}"));
    }

    #[test]
    fn test_nid_cl() {
        assert!(valid_rut("12.345.678-5"));
        assert!(!valid_rut("12.345.678-4"));
        assert!(valid_rut("6-K"));
        assert!(valid_rut("6-k"));
        let op = ValidateNidOperator::new(r"cl \d{1,2}\.?\d{3}\.?\d{3}-?[\dkK]").unwrap();
        assert!(eval(&op, "rut: 12.345.678-5"));
        assert!(!eval(&op, "rut: 12.345.678-4"));
    }

    #[test]
    fn test_nid_us() {
        assert!(valid_ssn("078-05-1120"));
        assert!(!valid_ssn("666-12-3456"));
        assert!(!valid_ssn("900-12-3456"));
        assert!(!valid_ssn("123-45-6789"));
        assert!(!valid_ssn("111-11-1111"));
        let mut vars = TransactionVariables::new();
        let op = ValidateNidOperator::new(r"us \d{3}-\d{2}-\d{4}").unwrap();
        assert!(eval_with(&op, &mut vars, "ssn 078-05-1120", true));
        assert_eq!(vars.tx().first("0"), Some("078-05-1120"));
        assert!(ValidateNidOperator::new("xx \\d+").is_err());
    }

    #[test]
    fn test_verify_cc() {
        assert!(luhn("4111 1111 1111 1111"));
        assert!(!luhn("4111 1111 1111 1112"));
        assert!(!luhn("4111"));
        let op = VerifyCcOperator::new(r"\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{4}").unwrap();
        assert!(eval(&op, "card=4111-1111-1111-1111"));
        assert!(!eval(&op, "card=4111-1111-1111-1112"));
    }

    #[test]
    fn test_validate_schema() {
        let schema = serde_json::json!({
            "type": "object",
            "required": ["name"],
            "properties": {"name": {"type": "string"}}
        });
        let op = ValidateSchemaOperator::from_value(&schema).unwrap();
        let cancel = CancellationToken::new();
        let run = |vars: &mut TransactionVariables, phase| {
            let mut ctx = OperatorContext::new(vars, phase, false, &cancel);
            op.evaluate(&mut ctx, "")
        };

        let mut vars = TransactionVariables::new();
        assert!(!run(&mut vars, Phase::RequestBody), "missing data");
        vars.tx_mut().set_one(JSON_REQUEST_BODY, r#"{"name":"x"}"#);
        assert!(!run(&mut vars, Phase::RequestBody));
        assert!(!run(&mut vars, Phase::RequestHeaders), "too early");
        vars.tx_mut().set_one(JSON_REQUEST_BODY, r#"{"name":1}"#);
        assert!(run(&mut vars, Phase::RequestBody));
        vars.tx_mut().set_one(JSON_REQUEST_BODY, "{not json");
        assert!(run(&mut vars, Phase::RequestBody));
        assert!(!run(&mut vars, Phase::ResponseBody), "response body not stored");
    }
}
