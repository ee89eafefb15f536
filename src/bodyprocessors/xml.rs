//! XML bodies.

use super::{read_text, BodyProcessor, BodyProcessorError, BodyProcessorOptions};
use crate::variables::{TransactionVariables, VariableName};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::Read;

/// Key holding every text node.
pub const TEXT_KEY: &str = "/*";
/// Key holding every attribute value.
pub const ATTRIBUTE_KEY: &str = "//@*";

const NAME: &str = "xml";

/// Collected contents of a well-formed document.
#[derive(Debug, Default, PartialEq)]
struct Document {
    text: Vec<String>,
    attributes: Vec<String>,
}

fn parse(body: &str) -> Result<Document, BodyProcessorError> {
    let err = |pos: usize, e: &dyn std::fmt::Display| {
        BodyProcessorError::new(NAME, format!("malformed XML at byte {}: {}", pos, e))
    };

    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut doc = Document::default();
    let mut depth = 0usize;
    let mut roots = 0usize;
    loop {
        let event = reader
            .read_event()
            .map_err(|e| err(reader.buffer_position(), &e))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                if depth == 0 {
                    roots += 1;
                }
                for attr in e.attributes() {
                    let attr = attr.map_err(|e| err(reader.buffer_position(), &e))?;
                    let value = attr
                        .unescape_value()
                        .map_err(|e| err(reader.buffer_position(), &e))?;
                    doc.attributes.push(value.into_owned());
                }
                if matches!(event, Event::Start(_)) {
                    depth += 1;
                }
            }
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Text(t) => {
                let text = t.unescape().map_err(|e| err(reader.buffer_position(), &e))?;
                if depth > 0 && !text.is_empty() {
                    doc.text.push(text.into_owned());
                }
            }
            Event::CData(c) => {
                let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                if !text.is_empty() {
                    doc.text.push(text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth != 0 {
        return Err(err(body.len(), &"unclosed element"));
    }
    if roots != 1 {
        return Err(BodyProcessorError::new(
            NAME,
            format!("expected one root element, found {}", roots),
        ));
    }
    Ok(doc)
}

/// XML processor. Text nodes are stored under `/*` and attribute values
/// under `//@*` in `REQUEST_XML` or `RESPONSE_XML`.
#[derive(Debug, Default)]
pub struct XmlProcessor;

impl XmlProcessor {
    fn fill(
        &self,
        reader: &mut dyn Read,
        vars: &mut TransactionVariables,
        target: VariableName,
    ) -> Result<(), BodyProcessorError> {
        let body = read_text(reader, self.name())?;
        let doc = parse(&body)?;
        let map = vars.map_mut(target);
        map.set(TEXT_KEY, doc.text);
        map.set(ATTRIBUTE_KEY, doc.attributes);
        Ok(())
    }
}

impl BodyProcessor for XmlProcessor {
    fn name(&self) -> &'static str {
        NAME
    }

    fn process_request(
        &self,
        reader: &mut dyn Read,
        vars: &mut TransactionVariables,
        _opts: &BodyProcessorOptions,
    ) -> Result<(), BodyProcessorError> {
        self.fill(reader, vars, VariableName::RequestXml)
    }

    fn process_response(
        &self,
        reader: &mut dyn Read,
        vars: &mut TransactionVariables,
        _opts: &BodyProcessorOptions,
    ) -> Result<(), BodyProcessorError> {
        self.fill(reader, vars, VariableName::ResponseXml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_and_attributes() {
        let doc = parse(
            r#"<?xml version="1.0"?>
            <order id="42"><item sku="a&amp;b">pen</item><note><![CDATA[<b>x</b>]]></note><empty flag="1"/></order>"#,
        )
        .unwrap();
        assert_eq!(doc.text, vec!["pen", "<b>x</b>"]);
        assert_eq!(doc.attributes, vec!["42", "a&b", "1"]);
    }

    #[test]
    fn test_malformed() {
        assert!(parse("<a><b></a>").is_err());
        assert!(parse("<a>").is_err());
        assert!(parse("just text").is_err());
        assert!(parse("<a/><b/>").is_err());
    }

    #[test]
    fn test_request_variables() {
        let mut vars = TransactionVariables::new();
        let mut body: &[u8] = b"<q lang=\"en\">select * from users</q>";
        XmlProcessor
            .process_request(&mut body, &mut vars, &BodyProcessorOptions::default())
            .unwrap();
        let xml = vars.map(VariableName::RequestXml);
        assert_eq!(xml.first(TEXT_KEY), Some("select * from users"));
        assert_eq!(xml.first(ATTRIBUTE_KEY), Some("en"));
    }
}
