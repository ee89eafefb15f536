//! CSV bodies (RFC 4180).

use super::{read_text, BodyProcessor, BodyProcessorError, BodyProcessorOptions};
use crate::variables::{TransactionVariables, VariableName};
use std::io::Read;

const NAME: &str = "csv";

/// Split a document into rows of fields. Quoted fields may contain
/// separators, line breaks and doubled quotes.
fn parse_rows(text: &str) -> Result<Vec<Vec<String>>, BodyProcessorError> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = text.chars().peekable();
    let mut line = 1;

    while let Some(c) = chars.next() {
        if quoted {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => quoted = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                c => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => quoted = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                line += 1;
                row.push(std::mem::take(&mut field));
                if !(row.len() == 1 && row[0].is_empty()) {
                    rows.push(std::mem::take(&mut row));
                }
                row.clear();
            }
            c => field.push(c),
        }
    }

    if quoted {
        return Err(BodyProcessorError::new(
            NAME,
            format!("unterminated quoted field starting before line {}", line),
        ));
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    Ok(rows)
}

/// CSV processor. Field `c` of row `r` is stored as `csv.r.c`.
#[derive(Debug, Default)]
pub struct CsvProcessor;

impl CsvProcessor {
    fn fill(
        &self,
        reader: &mut dyn Read,
        vars: &mut TransactionVariables,
        target: VariableName,
    ) -> Result<(), BodyProcessorError> {
        let body = read_text(reader, self.name())?;
        let map = vars.map_mut(target);
        for (r, row) in parse_rows(&body)?.into_iter().enumerate() {
            for (c, field) in row.into_iter().enumerate() {
                map.add(format!("csv.{}.{}", r, c), field);
            }
        }
        Ok(())
    }
}

impl BodyProcessor for CsvProcessor {
    fn name(&self) -> &'static str {
        NAME
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows() {
        let rows = parse_rows("a,b\r\n\"x, y\",\"say \"\"hi\"\"\"\n\nlast,").unwrap();
        assert_eq!(
            rows,
            vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["x, y".to_string(), "say \"hi\"".to_string()],
                vec!["last".to_string(), String::new()],
            ]
        );
    }

    #[test]
    fn test_unterminated_quote() {
        assert!(parse_rows("a,\"b\n").is_err());
    }

    #[test]
    fn test_process_request() {
        let mut vars = TransactionVariables::new();
        let mut body: &[u8] = b"id,name\n1,<script>\n";
        CsvProcessor
            .process_request(&mut body, &mut vars, &BodyProcessorOptions::default())
            .unwrap();
        let post = vars.map(VariableName::ArgsPost);
        assert_eq!(post.first("csv.0.1"), Some("name"));
        assert_eq!(post.first("csv.1.1"), Some("<script>"));
        assert_eq!(post.len(), 4);
    }
}
