//! Body processors: parse request and response bodies into variables.
//!
//! A processor reads the buffered body and writes what it finds into the
//! transaction variables. Failures are returned as [`BodyProcessorError`]
//! and recorded by the transaction in `REQBODY_PROCESSOR_ERROR` /
//! `RESBODY_PROCESSOR_ERROR`; they never abort the transaction.

mod csv;
mod json;
mod jsonstream;
mod multipart;
mod raw;
mod urlencoded;
mod xml;

pub use self::csv::CsvProcessor;
pub use json::{flatten_json, JsonProcessor};
pub use jsonstream::JsonStreamProcessor;
pub use multipart::MultipartProcessor;
pub use raw::RawProcessor;
pub use urlencoded::{parse_query, UrlEncodedProcessor};
pub use xml::XmlProcessor;

use crate::variables::TransactionVariables;
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// A body processor failure.
#[derive(Debug, Error)]
#[error("{processor}: {message}")]
pub struct BodyProcessorError {
    /// Processor name.
    pub processor: &'static str,
    /// What went wrong.
    pub message: String,
}

impl BodyProcessorError {
    /// Create an error.
    pub fn new(processor: &'static str, message: impl Into<String>) -> Self {
        Self {
            processor,
            message: message.into(),
        }
    }
}

/// Settings handed to a processor.
#[derive(Debug, Clone, Default)]
pub struct BodyProcessorOptions {
    /// Full `Content-Type` of the body.
    pub mime: String,
    /// Directory uploaded files are written to.
    pub upload_dir: PathBuf,
    /// Whether uploaded files may be written to disk.
    pub disk_access: bool,
}

/// One record of a streamed body: flattened `(key, value)` pairs.
pub type Record = Vec<(String, String)>;

/// Parses a body into variables.
pub trait BodyProcessor: Send + Sync {
    /// Processor name as used by `ctl:requestBodyProcessor`.
    fn name(&self) -> &'static str;

    /// Parse a request body.
    fn process_request(
        &self,
        reader: &mut dyn Read,
        vars: &mut TransactionVariables,
        opts: &BodyProcessorOptions,
    ) -> Result<(), BodyProcessorError>;

    /// Parse a response body.
    fn process_response(
        &self,
        reader: &mut dyn Read,
        vars: &mut TransactionVariables,
        opts: &BodyProcessorOptions,
    ) -> Result<(), BodyProcessorError>;

    /// Whether [`BodyProcessor::process_records`] is supported.
    fn supports_records(&self) -> bool {
        false
    }

    /// Parse a request body record by record, handing each record to
    /// `on_record`. Stops when `on_record` returns `false`.
    fn process_records(
        &self,
        _reader: &mut dyn Read,
        _on_record: &mut dyn FnMut(usize, Record) -> bool,
    ) -> Result<(), BodyProcessorError> {
        Err(BodyProcessorError::new(self.name(), "record mode is not supported"))
    }
}

/// Name to processor map. Names are case-insensitive.
#[derive(Clone, Default)]
pub struct BodyProcessorRegistry {
    processors: HashMap<String, Arc<dyn BodyProcessor>>,
}

impl BodyProcessorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in processor.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtins();
        registry
    }

    /// Register `processor` under `name`.
    pub fn register(&mut self, name: &str, processor: Arc<dyn BodyProcessor>) {
        self.processors.insert(name.to_ascii_lowercase(), processor);
    }

    /// Look a processor up.
    pub fn get(&self, name: &str) -> Option<Arc<dyn BodyProcessor>> {
        self.processors.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.processors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Register every built-in processor.
    pub fn register_builtins(&mut self) {
        self.register("urlencoded", Arc::new(UrlEncodedProcessor));
        self.register("multipart", Arc::new(MultipartProcessor));
        self.register("json", Arc::new(JsonProcessor));
        let stream: Arc<dyn BodyProcessor> = Arc::new(JsonStreamProcessor);
        for name in ["jsonstream", "ndjson", "jsonlines"] {
            self.register(name, Arc::clone(&stream));
        }
        self.register("xml", Arc::new(XmlProcessor));
        self.register("raw", Arc::new(RawProcessor));
        self.register("csv", Arc::new(CsvProcessor));
    }
}

impl std::fmt::Debug for BodyProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyProcessorRegistry")
            .field("processors", &self.names())
            .finish()
    }
}

/// Processor picked for a request `Content-Type` when no `ctl` names one.
pub fn processor_for_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "application/x-www-form-urlencoded" => Some("urlencoded"),
        "application/x-ndjson" | "application/ndjson" | "application/jsonlines"
        | "application/x-jsonlines" | "application/json-seq" => Some("jsonstream"),
        "application/json" => Some("json"),
        "text/xml" | "application/xml" => Some("xml"),
        "text/csv" => Some("csv"),
        m if m.starts_with("multipart/") => Some("multipart"),
        m if m.ends_with("+json") => Some("json"),
        m if m.ends_with("+xml") => Some("xml"),
        _ => None,
    }
}

/// Read everything into a string, escaping bytes that are not UTF-8.
pub(crate) fn read_text(reader: &mut dyn Read, processor: &'static str) -> Result<String, BodyProcessorError> {
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .map_err(|e| BodyProcessorError::new(processor, format!("read failed: {}", e)))?;
    Ok(crate::variables::lossless_string(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        let registry = BodyProcessorRegistry::with_builtins();
        for name in ["URLENCODED", "multipart", "json", "ndjson", "jsonlines", "xml", "raw", "csv"] {
            assert!(registry.get(name).is_some(), "{} missing", name);
        }
        assert_eq!(registry.get("ndjson").unwrap().name(), "jsonstream");
        assert!(registry.get("yaml").is_none());
    }

    #[test]
    fn test_content_type_detection() {
        assert_eq!(
            processor_for_content_type("application/x-www-form-urlencoded; charset=utf-8"),
            Some("urlencoded")
        );
        assert_eq!(
            processor_for_content_type("multipart/form-data; boundary=a"),
            Some("multipart")
        );
        assert_eq!(processor_for_content_type("application/vnd.api+json"), Some("json"));
        assert_eq!(processor_for_content_type("application/x-ndjson"), Some("jsonstream"));
        assert_eq!(processor_for_content_type("application/soap+xml"), Some("xml"));
        assert_eq!(processor_for_content_type("application/octet-stream"), None);
    }
}
