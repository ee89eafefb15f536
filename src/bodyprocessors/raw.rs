//! Raw bodies: no parsing, the text is exposed as is.

use super::{read_text, BodyProcessor, BodyProcessorError, BodyProcessorOptions};
use crate::variables::{wire_bytes, TransactionVariables, VariableName};
use std::io::Read;

/// Stores the body in `REQUEST_BODY` / `RESPONSE_BODY`.
#[derive(Debug, Default)]
pub struct RawProcessor;

impl BodyProcessor for RawProcessor {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn process_request(
        &self,
        reader: &mut dyn Read,
        vars: &mut TransactionVariables,
        _opts: &BodyProcessorOptions,
    ) -> Result<(), BodyProcessorError> {
        let body = read_text(reader, self.name())?;
        vars.set(VariableName::RequestBodyLength, wire_bytes(&body).len().to_string());
        vars.set(VariableName::RequestBody, body);
        Ok(())
    }

    fn process_response(
        &self,
        reader: &mut dyn Read,
        vars: &mut TransactionVariables,
        _opts: &BodyProcessorOptions,
    ) -> Result<(), BodyProcessorError> {
        let body = read_text(reader, self.name())?;
        vars.set(VariableName::ResponseBody, body);
        Ok(())
    }
}
