//! `application/x-www-form-urlencoded` bodies and query strings.

use super::{read_text, BodyProcessor, BodyProcessorError, BodyProcessorOptions};
use crate::variables::{lossless_string, TransactionVariables, VariableName};
use std::io::Read;

/// Parse a query string into `(key, value)` pairs.
///
/// `+` decodes to a space. The second element is `true` when a `%` is not
/// followed by two hex digits; such sequences are kept literally.
pub fn parse_query(query: &str) -> (Vec<(String, String)>, bool) {
    let mut pairs = Vec::new();
    let mut invalid = false;

    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.find('=') {
            Some(pos) => (&pair[..pos], &pair[pos + 1..]),
            None => (pair, ""),
        };
        invalid |= has_invalid_escape(key) || has_invalid_escape(value);
        pairs.push((decode(key), decode(value)));
    }

    (pairs, invalid)
}

fn decode(s: &str) -> String {
    let s = s.replace('+', " ");
    lossless_string(percent_encoding::percent_decode_str(&s).collect())
}

fn has_invalid_escape(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.iter().enumerate().any(|(i, &b)| {
        b == b'%'
            && !(bytes.get(i + 1).is_some_and(u8::is_ascii_hexdigit)
                && bytes.get(i + 2).is_some_and(u8::is_ascii_hexdigit))
    })
}

/// URL-encoded form processor. Fills `ARGS_POST` (requests) or
/// `RESPONSE_ARGS` (responses) and keeps the text in `REQUEST_BODY`.
#[derive(Debug, Default)]
pub struct UrlEncodedProcessor;

impl UrlEncodedProcessor {
    fn fill(
        &self,
        reader: &mut dyn Read,
        vars: &mut TransactionVariables,
        target: VariableName,
    ) -> Result<String, BodyProcessorError> {
        let body = read_text(reader, self.name())?;
        let (pairs, invalid) = parse_query(&body);
        if invalid {
            vars.set(VariableName::UrlencodedError, "1");
        }
        let map = vars.map_mut(target);
        for (key, value) in pairs {
            map.add(key, value);
        }
        Ok(body)
    }
}

impl BodyProcessor for UrlEncodedProcessor {
    fn name(&self) -> &'static str {
        "urlencoded"
    }

    fn process_request(
        &self,
        reader: &mut dyn Read,
        vars: &mut TransactionVariables,
        _opts: &BodyProcessorOptions,
    ) -> Result<(), BodyProcessorError> {
        let body = self.fill(reader, vars, VariableName::ArgsPost)?;
        vars.set(VariableName::RequestBodyLength, body.len().to_string());
        vars.set(VariableName::RequestBody, body);
        Ok(())
    }

    fn process_response(
        &self,
        reader: &mut dyn Read,
        vars: &mut TransactionVariables,
        _opts: &BodyProcessorOptions,
    ) -> Result<(), BodyProcessorError> {
        self.fill(reader, vars, VariableName::ResponseArgs).map(|_| ())
    }
}
