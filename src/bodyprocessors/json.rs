//! JSON bodies.

use super::{read_text, BodyProcessor, BodyProcessorError, BodyProcessorOptions};
use crate::operators::{JSON_REQUEST_BODY, JSON_RESPONSE_BODY};
use crate::variables::{TransactionVariables, VariableName};
use serde_json::Value;
use std::io::Read;

/// Flatten a document into `(path, value)` pairs under `prefix`.
///
/// Object members append `.name`, array elements `.index`. Arrays also
/// get an entry of their own holding their length. `null` becomes the
/// empty string, booleans and numbers their JSON literal.
pub fn flatten_json(value: &Value, prefix: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    flatten_into(value, prefix.to_string(), &mut out);
    out
}

fn flatten_into(value: &Value, path: String, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(members) => {
            for (name, member) in members {
                flatten_into(member, format!("{}.{}", path, name), out);
            }
        }
        Value::Array(items) => {
            out.push((path.clone(), items.len().to_string()));
            for (i, item) in items.iter().enumerate() {
                flatten_into(item, format!("{}.{}", path, i), out);
            }
        }
        Value::Null => out.push((path, String::new())),
        Value::String(s) => out.push((path, s.clone())),
        Value::Bool(b) => out.push((path, b.to_string())),
        Value::Number(n) => out.push((path, n.to_string())),
    }
}

/// JSON processor. Request fields land in `ARGS_POST` and `JSON` with
/// `json.` keys; the raw document is kept in `TX` for `@validateSchema`.
#[derive(Debug, Default)]
pub struct JsonProcessor;

impl JsonProcessor {
    fn parse(&self, reader: &mut dyn Read) -> Result<(String, Value), BodyProcessorError> {
        let body = read_text(reader, self.name())?;
        let value = serde_json::from_str(&body)
            .map_err(|e| BodyProcessorError::new(self.name(), format!("invalid JSON: {}", e)))?;
        Ok((body, value))
    }
}

impl BodyProcessor for JsonProcessor {
    fn name(&self) -> &'static str {
        "json"
    }

    fn process_request(
        &self,
        reader: &mut dyn Read,
        vars: &mut TransactionVariables,
        _opts: &BodyProcessorOptions,
    ) -> Result<(), BodyProcessorError> {
        let (body, value) = self.parse(reader)?;
        for (key, v) in flatten_json(&value, "json") {
            vars.map_mut(VariableName::Json).add(key.clone(), v.clone());
            vars.map_mut(VariableName::ArgsPost).add(key, v);
        }
        vars.tx_mut().set_one(JSON_REQUEST_BODY, body);
        Ok(())
    }

    fn process_response(
        &self,
        reader: &mut dyn Read,
        vars: &mut TransactionVariables,
        _opts: &BodyProcessorOptions,
    ) -> Result<(), BodyProcessorError> {
        let (body, value) = self.parse(reader)?;
        let args = vars.map_mut(VariableName::ResponseArgs);
        for (key, v) in flatten_json(&value, "json") {
            args.add(key, v);
        }
        vars.tx_mut().set_one(JSON_RESPONSE_BODY, body);
        Ok(())
    }
}
