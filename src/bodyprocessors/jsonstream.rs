//! Streamed JSON: NDJSON / JSON Lines and JSON text sequences (RFC 7464).

use super::json::flatten_json;
use super::{BodyProcessor, BodyProcessorError, BodyProcessorOptions, Record};
use crate::variables::{TransactionVariables, VariableName};
use std::io::{BufRead, BufReader, Read};

/// ASCII record separator that starts every JSON-Seq record.
const RS: u8 = 0x1e;

/// Bytes inspected for a record separator before assuming NDJSON.
const SNIFF_LEN: usize = 4096;

/// One JSON document per line, or per `RS` for JSON-Seq. Record `n` is
/// flattened under `json.n`.
#[derive(Debug, Default)]
pub struct JsonStreamProcessor;

impl JsonStreamProcessor {
    fn for_each(
        &self,
        reader: &mut dyn Read,
        on_record: &mut dyn FnMut(usize, Record) -> bool,
    ) -> Result<(), BodyProcessorError> {
        let mut reader = BufReader::with_capacity(2 * SNIFF_LEN, reader);
        let head = reader
            .fill_buf()
            .map_err(|e| BodyProcessorError::new(self.name(), format!("read failed: {}", e)))?;
        let delimiter = if head.iter().take(SNIFF_LEN).any(|&b| b == RS) {
            RS
        } else {
            b'\n'
        };

        let mut index = 0;
        let mut chunk = Vec::new();
        loop {
            chunk.clear();
            let n = reader
                .read_until(delimiter, &mut chunk)
                .map_err(|e| BodyProcessorError::new(self.name(), format!("read failed: {}", e)))?;
            if n == 0 {
                return Ok(());
            }
            let text = String::from_utf8_lossy(&chunk);
            let text = text.trim_matches(|c: char| c == RS as char || c.is_whitespace());
            if text.is_empty() {
                continue;
            }
            let value: serde_json::Value = serde_json::from_str(text).map_err(|e| {
                BodyProcessorError::new(self.name(), format!("invalid JSON in record {}: {}", index, e))
            })?;
            let record = flatten_json(&value, &format!("json.{}", index));
            if !on_record(index, record) {
                return Ok(());
            }
            index += 1;
        }
    }

    fn fill(
        &self,
        reader: &mut dyn Read,
        vars: &mut TransactionVariables,
        target: VariableName,
    ) -> Result<(), BodyProcessorError> {
        self.for_each(reader, &mut |_, record| {
            for (key, value) in record {
                if target == VariableName::ArgsPost {
                    vars.map_mut(VariableName::Json).add(key.clone(), value.clone());
                }
                vars.map_mut(target).add(key, value);
            }
            true
        })
    }
}

impl BodyProcessor for JsonStreamProcessor {
    fn name(&self) -> &'static str {
        "jsonstream"
    }

    fn process_request(
        &self,
        reader: &mut dyn Read,
        vars: &mut TransactionVariables,
        _opts: &BodyProcessorOptions,
    ) -> Result<(), BodyProcessorError> {
        self.fill(reader, vars, VariableName::ArgsPost)
    }

    fn process_response(
        &self,
        reader: &mut dyn Read,
        vars: &mut TransactionVariables,
        _opts: &BodyProcessorOptions,
    ) -> Result<(), BodyProcessorError> {
        self.fill(reader, vars, VariableName::ResponseArgs)
    }

    fn supports_records(&self) -> bool {
        true
    }

    fn process_records(
        &self,
        reader: &mut dyn Read,
        on_record: &mut dyn FnMut(usize, Record) -> bool,
    ) -> Result<(), BodyProcessorError> {
        self.for_each(reader, on_record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(body: &[u8]) -> TransactionVariables {
        let mut vars = TransactionVariables::new();
        let mut reader = body;
        JsonStreamProcessor
            .process_request(&mut reader, &mut vars, &BodyProcessorOptions::default())
            .unwrap();
        vars
    }

    #[test]
    fn test_ndjson() {
        let vars = args(b"{\"name\":\"jose\"}\n{\"name\":\"juan\"}\n");
        let post = vars.map(VariableName::ArgsPost);
        assert_eq!(post.first("json.0.name"), Some("jose"));
        assert_eq!(post.first("json.1.name"), Some("juan"));
        assert_eq!(post.len(), 2);
    }

    #[test]
    fn test_json_seq() {
        let vars = args(b"\x1e{\"a\":1}\n\x1e{\"a\":2}\n");
        let post = vars.map(VariableName::ArgsPost);
        assert_eq!(post.first("json.0.a"), Some("1"));
        assert_eq!(post.first("json.1.a"), Some("2"));
    }

    #[test]
    fn test_blank_lines_skipped() {
        let vars = args(b"\n{\"a\":1}\r\n\n{\"a\":2}");
        assert_eq!(vars.map(VariableName::ArgsPost).first("json.1.a"), Some("2"));
    }

    #[test]
    fn test_records_stop_early() {
        let mut body: &[u8] = b"{\"a\":1}\n{\"a\":2}\n{\"a\":3}\n";
        let mut seen = Vec::new();
        JsonStreamProcessor
            .process_records(&mut body, &mut |i, record| {
                seen.push((i, record));
                i < 1
            })
            .unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].1, vec![("json.1.a".to_string(), "2".to_string())]);
    }

    #[test]
    fn test_invalid_record() {
        let mut vars = TransactionVariables::new();
        let mut body: &[u8] = b"{\"a\":1}\n{oops\n";
        let err = JsonStreamProcessor
            .process_request(&mut body, &mut vars, &BodyProcessorOptions::default())
            .unwrap_err();
        assert!(err.message.contains("record 1"));
        assert_eq!(vars.map(VariableName::ArgsPost).first("json.0.a"), Some("1"));
    }
}
