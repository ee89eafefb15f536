//! WAF configuration.
//!
//! [`WafConfig`] holds every scalar setting, the registries and the rule
//! sources. Directives found in the rule sources are applied on top of it
//! when [`crate::Waf::new`] builds the engine.

use crate::actions::ActionRegistry;
use crate::auditlog::{AuditLogParts, AuditLogRegistry};
use crate::bodyprocessors::BodyProcessorRegistry;
use crate::engine::MatchedRule;
use crate::operators::{GeoResolver, OperatorRegistry};
use crate::parser::{parse_actions, Directive, RawAction};
use crate::persistence::PersistenceEngine;
use crate::transformations::TransformationRegistry;
use regex::Regex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Called once per auditable matched rule when a transaction closes.
pub type ErrorCallback = Arc<dyn Fn(&MatchedRule) + Send + Sync>;

/// Rule engine operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleEngineMode {
    /// Rules are enabled and disruptive actions take effect.
    #[default]
    On,
    /// Rules are disabled.
    Off,
    /// Rules run but never interrupt.
    DetectionOnly,
}

impl RuleEngineMode {
    /// Parse `On`, `Off` or `DetectionOnly`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            "detectiononly" | "detection_only" => Some(Self::DetectionOnly),
            _ => None,
        }
    }

    /// Directive spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "On",
            Self::Off => "Off",
            Self::DetectionOnly => "DetectionOnly",
        }
    }
}

/// What to do with a request body over `request_body_limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyLimitAction {
    /// Interrupt with status 413.
    #[default]
    Reject,
    /// Inspect the first `request_body_limit` bytes only.
    ProcessPartial,
}

impl BodyLimitAction {
    /// Parse `Reject` or `ProcessPartial`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Some(Self::Reject),
            "processpartial" => Some(Self::ProcessPartial),
            _ => None,
        }
    }
}

/// Audit logging mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuditEngine {
    /// Log every transaction.
    On,
    /// Log nothing.
    #[default]
    Off,
    /// Log transactions with auditable matches or a relevant status.
    RelevantOnly,
}

impl AuditEngine {
    /// Parse `On`, `Off` or `RelevantOnly`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            "relevantonly" | "relevant_only" => Some(Self::RelevantOnly),
            _ => None,
        }
    }
}

/// Whether uploaded files survive the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadKeepFiles {
    /// Keep every upload.
    On,
    /// Delete uploads on close.
    #[default]
    Off,
    /// Keep uploads of transactions with auditable matches.
    RelevantOnly,
}

impl UploadKeepFiles {
    /// Parse `On`, `Off` or `RelevantOnly`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            "relevantonly" | "relevant_only" => Some(Self::RelevantOnly),
            _ => None,
        }
    }
}

/// Where rules come from.
#[derive(Debug, Clone)]
pub(crate) enum RuleSource {
    /// Inline SecLang text.
    Text(String),
    /// A file or glob pattern.
    File(PathBuf),
}

/// Engine configuration.
///
/// `Default` matches the usual ModSecurity defaults with the rule engine on.
#[derive(Clone)]
pub struct WafConfig {
    /// Rule engine mode.
    pub rule_engine: RuleEngineMode,
    /// Whether request bodies are buffered and processed.
    pub request_body_access: bool,
    /// Maximum request body size in bytes.
    pub request_body_limit: u64,
    /// Request body bytes kept in memory before spilling to disk.
    pub request_body_in_memory_limit: u64,
    /// Behaviour above `request_body_limit`.
    pub request_body_limit_action: BodyLimitAction,
    /// Run phase 2 once per record for processors that stream records.
    /// Off by default: all records are loaded and phase 2 runs once.
    pub request_body_records: bool,
    /// Whether response bodies are buffered and processed.
    pub response_body_access: bool,
    /// Maximum response body size kept for inspection.
    pub response_body_limit: u64,
    /// Response content types that are buffered.
    pub response_body_mime_types: Vec<String>,
    /// Default actions for phases without a `SecDefaultAction`.
    pub default_actions: Vec<RawAction>,
    /// Audit log mode.
    pub audit_engine: AuditEngine,
    /// Audit log parts.
    pub audit_log_parts: AuditLogParts,
    /// Audit log formatter name.
    pub audit_log_format: String,
    /// Audit log writer name.
    pub audit_log_type: String,
    /// Audit log target: a file for `serial`/`concurrent`, `host:port` for
    /// `syslog`.
    pub audit_log_target: Option<String>,
    /// Directory for `concurrent` audit records.
    pub audit_log_storage_dir: Option<PathBuf>,
    /// Response statuses that make a transaction relevant.
    pub audit_log_relevant_status: Option<Regex>,
    /// Store for persistent collections; an in-memory engine is created
    /// when unset.
    pub persistence: Option<Arc<dyn PersistenceEngine>>,
    /// Lifetime of persistent collections without updates.
    pub collection_timeout: Duration,
    /// Directory for body spill files.
    pub temp_dir: PathBuf,
    /// Directory for multipart uploads (defaults to `temp_dir`).
    pub upload_dir: Option<PathBuf>,
    /// Upload retention.
    pub upload_keep_files: UploadKeepFiles,
    /// SecDebugLogLevel (0-9).
    pub debug_log_level: u8,
    /// Rule ids removed from the ruleset.
    pub rule_remove_by_id: Vec<RangeInclusive<u64>>,
    /// Rules with a matching tag are removed from the ruleset.
    pub rule_remove_by_tag: Vec<Regex>,
    /// Rules with a matching msg are removed from the ruleset.
    pub rule_remove_by_msg: Vec<Regex>,
    /// Hook for matched rules.
    pub error_callback: Option<ErrorCallback>,
    /// Named datasets for `@pmFromDataset` and `@ipMatchFromDataset`.
    pub datasets: HashMap<String, Vec<String>>,
    /// Geo resolver for `@geoLookup`.
    pub geo: Option<Arc<dyn GeoResolver>>,
    /// DNS server for `@rbl` (defaults to the system resolver).
    pub nameserver: Option<SocketAddr>,
    /// Component signatures reported in the audit log.
    pub component_signatures: Vec<String>,
    /// Operator registry.
    pub operators: OperatorRegistry,
    /// Transformation registry.
    pub transformations: TransformationRegistry,
    /// Action registry.
    pub actions: ActionRegistry,
    /// Body processor registry.
    pub body_processors: BodyProcessorRegistry,
    /// Audit log formatters and writers.
    pub audit_log: AuditLogRegistry,
    pub(crate) sources: Vec<RuleSource>,
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            rule_engine: RuleEngineMode::On,
            request_body_access: false,
            request_body_limit: 128 * 1024 * 1024,
            request_body_in_memory_limit: 128 * 1024,
            request_body_limit_action: BodyLimitAction::Reject,
            request_body_records: false,
            response_body_access: false,
            response_body_limit: 512 * 1024,
            response_body_mime_types: vec!["text/plain".to_string(), "text/html".to_string()],
            default_actions: parse_actions("phase:2,log,auditlog,pass").unwrap_or_default(),
            audit_engine: AuditEngine::Off,
            audit_log_parts: AuditLogParts::default(),
            audit_log_format: "native".to_string(),
            audit_log_type: "serial".to_string(),
            audit_log_target: None,
            audit_log_storage_dir: None,
            audit_log_relevant_status: None,
            persistence: None,
            collection_timeout: Duration::from_secs(3600),
            temp_dir: std::env::temp_dir(),
            upload_dir: None,
            upload_keep_files: UploadKeepFiles::Off,
            debug_log_level: 0,
            rule_remove_by_id: Vec::new(),
            rule_remove_by_tag: Vec::new(),
            rule_remove_by_msg: Vec::new(),
            error_callback: None,
            datasets: HashMap::new(),
            geo: None,
            nameserver: None,
            component_signatures: Vec::new(),
            operators: OperatorRegistry::with_builtins(),
            transformations: TransformationRegistry::with_builtins(),
            actions: ActionRegistry::with_builtins(),
            body_processors: BodyProcessorRegistry::with_builtins(),
            audit_log: AuditLogRegistry::with_builtins(),
            sources: Vec::new(),
        }
    }
}

impl WafConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append SecLang directives.
    pub fn with_directives(mut self, text: impl Into<String>) -> Self {
        self.sources.push(RuleSource::Text(text.into()));
        self
    }

    /// Append a directive file or glob pattern.
    pub fn with_directives_from_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.sources.push(RuleSource::File(path.into()));
        self
    }

    /// Set the rule engine mode.
    pub fn with_rule_engine(mut self, mode: RuleEngineMode) -> Self {
        self.rule_engine = mode;
        self
    }

    /// Enable or disable request body processing.
    pub fn with_request_body_access(mut self, on: bool) -> Self {
        self.request_body_access = on;
        self
    }

    /// Set the request body limit and what to do above it.
    pub fn with_request_body_limit(mut self, limit: u64, action: BodyLimitAction) -> Self {
        self.request_body_limit = limit;
        self.request_body_limit_action = action;
        self
    }

    /// Evaluate streamed request bodies record by record.
    pub fn with_request_body_records(mut self, on: bool) -> Self {
        self.request_body_records = on;
        self
    }

    /// Set the in-memory part of body buffers.
    pub fn with_request_body_in_memory_limit(mut self, limit: u64) -> Self {
        self.request_body_in_memory_limit = limit;
        self
    }

    /// Enable or disable response body processing.
    pub fn with_response_body_access(mut self, on: bool) -> Self {
        self.response_body_access = on;
        self
    }

    /// Set the response body limit.
    pub fn with_response_body_limit(mut self, limit: u64) -> Self {
        self.response_body_limit = limit;
        self
    }

    /// Replace the buffered response content types.
    pub fn with_response_body_mime_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.response_body_mime_types = types.into_iter().map(|t| t.into().to_ascii_lowercase()).collect();
        self
    }

    /// Set the audit engine, parts and formatter.
    pub fn with_audit_log(mut self, engine: AuditEngine, parts: AuditLogParts, format: &str) -> Self {
        self.audit_engine = engine;
        self.audit_log_parts = parts;
        self.audit_log_format = format.to_ascii_lowercase();
        self
    }

    /// Set the audit writer and its target.
    pub fn with_audit_log_writer(mut self, kind: &str, target: impl Into<String>) -> Self {
        self.audit_log_type = kind.to_ascii_lowercase();
        self.audit_log_target = Some(target.into());
        self
    }

    /// Use a custom persistence engine.
    pub fn with_persistence(mut self, engine: Arc<dyn PersistenceEngine>) -> Self {
        self.persistence = Some(engine);
        self
    }

    /// Set the temp directory.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    /// Set the upload directory and retention.
    pub fn with_uploads(mut self, dir: impl Into<PathBuf>, keep: UploadKeepFiles) -> Self {
        self.upload_dir = Some(dir.into());
        self.upload_keep_files = keep;
        self
    }

    /// Set SecDebugLogLevel.
    pub fn with_debug_log_level(mut self, level: u8) -> Self {
        self.debug_log_level = level.min(9);
        self
    }

    /// Install the matched-rule hook.
    pub fn with_error_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MatchedRule) + Send + Sync + 'static,
    {
        self.error_callback = Some(Arc::new(callback));
        self
    }

    /// Add a named dataset.
    pub fn with_dataset<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.datasets
            .insert(name.to_string(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Install a geo resolver.
    pub fn with_geo_resolver(mut self, resolver: Arc<dyn GeoResolver>) -> Self {
        self.geo = Some(resolver);
        self
    }

    /// Use a fixed DNS server for `@rbl`.
    pub fn with_nameserver(mut self, server: SocketAddr) -> Self {
        self.nameserver = Some(server);
        self
    }

    /// Directory multipart uploads are written to.
    pub fn upload_dir(&self) -> &std::path::Path {
        self.upload_dir.as_deref().unwrap_or(&self.temp_dir)
    }

    /// Whether `content_type` is buffered for response inspection.
    pub fn is_response_mime_allowed(&self, content_type: &str) -> bool {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.response_body_mime_types.iter().any(|t| *t == mime)
    }

    /// Apply a setting directive. Returns `false` for directives that are
    /// not settings (rules, markers, default actions, includes).
    pub(crate) fn apply(&mut self, directive: &Directive) -> bool {
        match directive {
            Directive::SecRuleEngine(mode) => self.rule_engine = *mode,
            Directive::SecRequestBodyAccess(on) => self.request_body_access = *on,
            Directive::SecRequestBodyLimit(n) => self.request_body_limit = *n,
            Directive::SecRequestBodyInMemoryLimit(n) => self.request_body_in_memory_limit = *n,
            Directive::SecRequestBodyLimitAction(a) => self.request_body_limit_action = *a,
            Directive::SecResponseBodyAccess(on) => self.response_body_access = *on,
            Directive::SecResponseBodyLimit(n) => self.response_body_limit = *n,
            Directive::SecResponseBodyMimeType(types) => {
                for t in types {
                    if !self.response_body_mime_types.contains(t) {
                        self.response_body_mime_types.push(t.clone());
                    }
                }
            }
            Directive::SecResponseBodyMimeTypesClear => self.response_body_mime_types.clear(),
            Directive::SecRuleRemoveById(ids) => self.rule_remove_by_id.extend(ids.iter().cloned()),
            Directive::SecRuleRemoveByTag(re) => self.rule_remove_by_tag.push(re.clone()),
            Directive::SecRuleRemoveByMsg(re) => self.rule_remove_by_msg.push(re.clone()),
            Directive::SecAuditEngine(engine) => self.audit_engine = *engine,
            Directive::SecAuditLog(path) => {
                self.audit_log_target = Some(path.to_string_lossy().into_owned())
            }
            Directive::SecAuditLogParts(parts) => {
                self.audit_log_parts = AuditLogParts::parse(parts);
            }
            Directive::SecAuditLogFormat(format) => {
                self.audit_log_format = format.to_ascii_lowercase()
            }
            Directive::SecAuditLogType(kind) => self.audit_log_type = kind.to_ascii_lowercase(),
            Directive::SecAuditLogStorageDir(dir) => self.audit_log_storage_dir = Some(dir.clone()),
            Directive::SecAuditLogRelevantStatus(re) => {
                self.audit_log_relevant_status = Some(re.clone())
            }
            Directive::SecTmpDir(dir) => self.temp_dir = dir.clone(),
            Directive::SecUploadDir(dir) => self.upload_dir = Some(dir.clone()),
            Directive::SecUploadKeepFiles(keep) => self.upload_keep_files = *keep,
            Directive::SecDebugLogLevel(level) => self.debug_log_level = *level,
            Directive::SecDataset { name, values } => {
                self.datasets.insert(name.clone(), values.clone());
            }
            Directive::SecComponentSignature(sig) => self.component_signatures.push(sig.clone()),
            Directive::SecCollectionTimeout(secs) => {
                self.collection_timeout = Duration::from_secs(*secs)
            }
            Directive::Ignored(_) => {}
            Directive::SecRule(_)
            | Directive::SecAction(_)
            | Directive::SecMarker(_)
            | Directive::SecDefaultAction(_)
            | Directive::SecRuleUpdateTargetById { .. }
            | Directive::Include(_) => return false,
        }
        true
    }
}

impl std::fmt::Debug for WafConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WafConfig")
            .field("rule_engine", &self.rule_engine)
            .field("request_body_access", &self.request_body_access)
            .field("request_body_limit", &self.request_body_limit)
            .field("request_body_limit_action", &self.request_body_limit_action)
            .field("response_body_access", &self.response_body_access)
            .field("audit_engine", &self.audit_engine)
            .field("audit_log_format", &self.audit_log_format)
            .field("debug_log_level", &self.debug_log_level)
            .field("sources", &self.sources.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WafConfig::default();
        assert_eq!(config.rule_engine, RuleEngineMode::On);
        assert!(!config.request_body_access);
        assert_eq!(config.request_body_limit, 134_217_728);
        assert_eq!(config.request_body_in_memory_limit, 131_072);
        assert_eq!(config.request_body_limit_action, BodyLimitAction::Reject);
        assert!(!config.request_body_records);
        assert_eq!(config.audit_engine, AuditEngine::Off);
        assert_eq!(config.audit_log_parts.to_string(), "ABCFHZ");
        assert_eq!(config.default_actions.len(), 4);
        assert!(config.operators.contains("rx"));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(RuleEngineMode::parse("detectiononly"), Some(RuleEngineMode::DetectionOnly));
        assert_eq!(RuleEngineMode::parse("maybe"), None);
        assert_eq!(BodyLimitAction::parse("ProcessPartial"), Some(BodyLimitAction::ProcessPartial));
        assert_eq!(AuditEngine::parse("RelevantOnly"), Some(AuditEngine::RelevantOnly));
        assert_eq!(UploadKeepFiles::parse("On"), Some(UploadKeepFiles::On));
    }

    #[test]
    fn test_response_mime_filter() {
        let config = WafConfig::default();
        assert!(config.is_response_mime_allowed("text/html; charset=utf-8"));
        assert!(!config.is_response_mime_allowed("application/json"));
        let config = config.with_response_body_mime_types(["Application/JSON"]);
        assert!(config.is_response_mime_allowed("application/json"));
    }

    #[test]
    fn test_apply_settings() {
        let mut config = WafConfig::default();
        assert!(config.apply(&Directive::SecRequestBodyAccess(true)));
        assert!(config.apply(&Directive::SecAuditLogParts("+E".to_string())));
        assert!(!config.apply(&Directive::SecDefaultAction(Vec::new())));
        assert!(config.request_body_access);
        assert!(config.audit_log_parts.contains('E'));
    }
}
