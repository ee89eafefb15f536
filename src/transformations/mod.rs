//! Transformation functions applied to values before an operator sees them.

mod decode;
mod encode;
mod normalize;
mod pipeline;

pub use decode::*;
pub use encode::*;
pub use normalize::*;
pub use pipeline::TransformationPipeline;

use crate::error::{Error, Result};
use crate::variables::wire_bytes;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// A soft transformation failure. The pipeline logs it and keeps the
/// previous value; it never aborts a rule.
#[derive(Debug, Error)]
#[error("t:{name}: {message}")]
pub struct TransformationError {
    /// Transformation name.
    pub name: &'static str,
    /// What went wrong.
    pub message: String,
}

impl TransformationError {
    /// Create an error for transformation `name`.
    pub fn new(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            message: message.into(),
        }
    }
}

/// Result of a single transformation step. `Cow::Borrowed` means unchanged.
pub type TransformResult<'a> = std::result::Result<Cow<'a, str>, TransformationError>;

/// Trait for transformations.
pub trait Transformation: Send + Sync {
    /// Apply the transformation.
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a>;

    /// Get the transformation name.
    fn name(&self) -> &'static str;
}

/// Transformations keyed by lowercase name.
#[derive(Clone, Default)]
pub struct TransformationRegistry {
    entries: HashMap<String, Arc<dyn Transformation>>,
}

impl TransformationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding every built-in transformation.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtins();
        registry
    }

    /// Register (or replace) a transformation under its own name.
    pub fn register(&mut self, transformation: Arc<dyn Transformation>) {
        self.entries
            .insert(transformation.name().to_lowercase(), transformation);
    }

    /// Look up a transformation by name (case-insensitive).
    pub fn get(&self, name: &str) -> Result<Arc<dyn Transformation>> {
        self.entries
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| Error::UnknownTransformation {
                name: name.to_string(),
            })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.values().map(|t| t.name()).collect();
        names.sort_unstable();
        names
    }

    /// Register every built-in transformation.
    pub fn register_builtins(&mut self) {
        let builtins: Vec<Arc<dyn Transformation>> = vec![
            // Decoding
            Arc::new(UrlDecode),
            Arc::new(UrlDecodeUni),
            Arc::new(Base64Decode),
            Arc::new(Base64DecodeExt),
            Arc::new(HexDecode),
            Arc::new(HtmlEntityDecode),
            Arc::new(JsDecode),
            Arc::new(CssDecode),
            Arc::new(EscapeSeqDecode),
            Arc::new(SqlHexDecode),
            Arc::new(Utf8ToUnicode),
            // Encoding
            Arc::new(Base64Encode),
            Arc::new(HexEncode),
            Arc::new(UrlEncode),
            Arc::new(Md5),
            Arc::new(Sha1),
            // Normalization
            Arc::new(Lowercase),
            Arc::new(Uppercase),
            Arc::new(CompressWhitespace),
            Arc::new(RemoveWhitespace),
            Arc::new(RemoveNulls),
            Arc::new(ReplaceNulls),
            Arc::new(Trim),
            Arc::new(TrimLeft),
            Arc::new(TrimRight),
            Arc::new(NormalizePath),
            Arc::new(NormalizePathWin),
            Arc::new(RemoveComments),
            Arc::new(RemoveCommentsChar),
            Arc::new(ReplaceComments),
            Arc::new(CmdLine),
            Arc::new(Parity::Even),
            Arc::new(Parity::Odd),
            Arc::new(Parity::Zero),
            // Special
            Arc::new(Length),
            Arc::new(None_),
        ];
        for t in builtins {
            self.register(t);
        }
    }
}

impl std::fmt::Debug for TransformationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformationRegistry")
            .field("len", &self.entries.len())
            .finish()
    }
}

/// None transformation (clears the transformation chain).
pub struct None_;

impl Transformation for None_ {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        Ok(Cow::Borrowed(input))
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Length transformation (returns the byte length of the input).
pub struct Length;

impl Transformation for Length {
    fn transform<'a>(&self, input: &'a str) -> TransformResult<'a> {
        Ok(Cow::Owned(wire_bytes(input).len().to_string()))
    }

    fn name(&self) -> &'static str {
        "length"
    }
}
