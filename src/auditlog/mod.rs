//! Audit logging.
//!
//! When a transaction finishes, the engine builds an [`AuditLog`] record
//! from the selected [`AuditLogParts`], hands it to the configured
//! [`Formatter`] and passes the bytes to a [`Writer`]. Failures are logged
//! and never reach the transaction.

mod formatter;
mod parts;
mod record;
mod writer;

pub use formatter::{Formatter, JsonFormatter, JsonLegacyFormatter, NativeFormatter, OcsfFormatter};
pub use parts::{AuditLogParts, DEFAULT_PARTS};
pub use record::{
    AuditFile, AuditLog, AuditMessage, AuditMessageData, AuditProducer, AuditRequest,
    AuditResponse, AuditTransaction, Headers, Sanitisation, TIMESTAMP_FORMAT,
};
pub use writer::{
    ConcurrentWriter, HttpsWriter, NoopWriter, SerialWriter, SyslogWriter, Writer, WriterConfig,
    NETWORK_TIMEOUT,
};

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Audit logging failure.
#[derive(Debug, Error)]
pub enum AuditLogError {
    /// File or socket failure.
    #[error("audit log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be serialized.
    #[error("audit log serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// HTTP transport failure.
    #[error("audit log transport failed: {0}")]
    Http(#[from] reqwest::Error),

    /// No formatter with this name.
    #[error("unknown audit log format: {0}")]
    UnknownFormatter(String),

    /// No writer with this name.
    #[error("unknown audit log type: {0}")]
    UnknownWriter(String),

    /// Writer settings are unusable.
    #[error("audit log configuration: {0}")]
    Config(String),
}

/// Builds a writer from its settings.
pub type WriterFactory = Arc<dyn Fn(&WriterConfig) -> Result<Box<dyn Writer>, AuditLogError> + Send + Sync>;

/// Formatters and writers by name.
#[derive(Clone, Default)]
pub struct AuditLogRegistry {
    formatters: HashMap<String, Arc<dyn Formatter>>,
    writers: HashMap<String, WriterFactory>,
}

impl AuditLogRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in formatters and writers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_formatter(Arc::new(JsonFormatter));
        registry.register_formatter(Arc::new(JsonLegacyFormatter));
        registry.register_formatter(Arc::new(NativeFormatter));
        registry.register_formatter(Arc::new(OcsfFormatter));

        registry.register_writer("serial", |cfg| Ok(Box::new(SerialWriter::new(cfg)?)));
        registry.register_writer("concurrent", |cfg| Ok(Box::new(ConcurrentWriter::new(cfg)?)));
        registry.register_writer("syslog", |cfg| Ok(Box::new(SyslogWriter::new(cfg)?)));
        registry.register_writer("https", |cfg| Ok(Box::new(HttpsWriter::new(cfg)?)));
        registry.register_writer("noop", |_| Ok(Box::new(NoopWriter)));
        registry
    }

    /// Register a formatter under its own name.
    pub fn register_formatter(&mut self, formatter: Arc<dyn Formatter>) {
        self.formatters.insert(formatter.name().to_string(), formatter);
    }

    /// Register a writer factory.
    pub fn register_writer<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&WriterConfig) -> Result<Box<dyn Writer>, AuditLogError> + Send + Sync + 'static,
    {
        self.writers.insert(name.to_ascii_lowercase(), Arc::new(factory));
    }

    /// Look a formatter up.
    pub fn formatter(&self, name: &str) -> Option<Arc<dyn Formatter>> {
        self.formatters.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Build a writer.
    pub fn writer(&self, name: &str, cfg: &WriterConfig) -> Result<Box<dyn Writer>, AuditLogError> {
        let factory = self
            .writers
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| AuditLogError::UnknownWriter(name.to_string()))?;
        factory(cfg)
    }
}

impl std::fmt::Debug for AuditLogRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut formatters: Vec<&str> = self.formatters.keys().map(String::as_str).collect();
        let mut writers: Vec<&str> = self.writers.keys().map(String::as_str).collect();
        formatters.sort_unstable();
        writers.sort_unstable();
        f.debug_struct("AuditLogRegistry")
            .field("formatters", &formatters)
            .field("writers", &writers)
            .finish()
    }
}

/// A formatter and a writer bound together.
pub struct AuditPipeline {
    formatter: Arc<dyn Formatter>,
    writer: Box<dyn Writer>,
}

impl AuditPipeline {
    /// Resolve `format` and `kind` in `registry`.
    ///
    /// File based writers without a target fall back to [`NoopWriter`].
    pub fn new(
        registry: &AuditLogRegistry,
        format: &str,
        kind: &str,
        mut cfg: WriterConfig,
    ) -> Result<Self, AuditLogError> {
        let formatter = registry
            .formatter(format)
            .ok_or_else(|| AuditLogError::UnknownFormatter(format.to_string()))?;
        cfg.mime = formatter.mime();

        let kind = kind.to_ascii_lowercase();
        let unconfigured = cfg.target.is_none() && cfg.storage_dir.is_none();
        let writer = if unconfigured && matches!(kind.as_str(), "serial" | "concurrent") {
            debug!(writer = %kind, "no audit log target configured, records are discarded");
            Box::new(NoopWriter)
        } else {
            registry.writer(&kind, &cfg)?
        };
        Ok(Self { formatter, writer })
    }

    /// Format and write one record. Errors are logged.
    pub fn emit(&self, log: &AuditLog) {
        let data = match self.formatter.format(log) {
            Ok(data) => data,
            Err(e) => {
                warn!(tx_id = %log.transaction.id, error = %e, "audit log record not formatted");
                return;
            }
        };
        if let Err(e) = self.writer.write(log, &data) {
            warn!(tx_id = %log.transaction.id, error = %e, "audit log record not written");
        }
    }

    /// Close the writer.
    pub fn close(&self) {
        if let Err(e) = self.writer.close() {
            warn!(error = %e, "audit log writer close failed");
        }
    }
}

impl std::fmt::Debug for AuditPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditPipeline")
            .field("formatter", &self.formatter.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_builtins() {
        let registry = AuditLogRegistry::with_builtins();
        for name in ["json", "JSONLEGACY", "native", "ocsf"] {
            assert!(registry.formatter(name).is_some(), "{} missing", name);
        }
        assert!(registry.formatter("xml").is_none());
        assert!(matches!(
            registry.writer("kafka", &WriterConfig::default()),
            Err(AuditLogError::UnknownWriter(_))
        ));
    }

    #[test]
    fn test_pipeline_without_target_discards() {
        let registry = AuditLogRegistry::with_builtins();
        let pipeline = AuditPipeline::new(&registry, "json", "serial", WriterConfig::default()).unwrap();
        pipeline.emit(&AuditLog {
            parts: AuditLogParts::default(),
            transaction: AuditTransaction::default(),
            messages: Vec::new(),
        });
        pipeline.close();
    }

    #[test]
    fn test_pipeline_unknown_format() {
        let registry = AuditLogRegistry::with_builtins();
        assert!(matches!(
            AuditPipeline::new(&registry, "yaml", "serial", WriterConfig::default()),
            Err(AuditLogError::UnknownFormatter(_))
        ));
    }

    #[test]
    fn test_pipeline_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let registry = AuditLogRegistry::with_builtins();
        let cfg = WriterConfig {
            target: Some(path.display().to_string()),
            ..Default::default()
        };
        let pipeline = AuditPipeline::new(&registry, "json", "serial", cfg).unwrap();
        pipeline.emit(&AuditLog {
            parts: AuditLogParts::default(),
            transaction: AuditTransaction {
                id: "abc".to_string(),
                ..Default::default()
            },
            messages: Vec::new(),
        });
        let text = std::fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(doc["transaction"]["id"], "abc");
        assert_eq!(doc["messages"], serde_json::json!([]));
    }
}
