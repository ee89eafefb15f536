//! Directive types for SecLang configuration.

use super::{OperatorSpec, RawAction};
use crate::engine::config::{AuditEngine, BodyLimitAction, RuleEngineMode, UploadKeepFiles};
use crate::error::SourceLocation;
use crate::variables::VariableSpec;
use regex::Regex;
use std::ops::RangeInclusive;
use std::path::PathBuf;

/// A parsed SecLang directive.
#[derive(Debug, Clone)]
pub enum Directive {
    /// SecRule directive - the main rule type.
    SecRule(SecRule),
    /// SecAction directive - actions without matching.
    SecAction(SecAction),
    /// SecMarker directive - named marker for skipAfter.
    SecMarker(SecMarker),
    /// SecDefaultAction directive - default actions for one phase.
    SecDefaultAction(Vec<RawAction>),
    /// SecRuleEngine directive.
    SecRuleEngine(RuleEngineMode),
    /// SecRequestBodyAccess directive.
    SecRequestBodyAccess(bool),
    /// SecRequestBodyLimit directive.
    SecRequestBodyLimit(u64),
    /// SecRequestBodyInMemoryLimit directive.
    SecRequestBodyInMemoryLimit(u64),
    /// SecRequestBodyLimitAction directive.
    SecRequestBodyLimitAction(BodyLimitAction),
    /// SecResponseBodyAccess directive.
    SecResponseBodyAccess(bool),
    /// SecResponseBodyLimit directive.
    SecResponseBodyLimit(u64),
    /// SecResponseBodyMimeType directive (adds to the set).
    SecResponseBodyMimeType(Vec<String>),
    /// SecResponseBodyMimeTypesClear directive.
    SecResponseBodyMimeTypesClear,
    /// SecRuleRemoveById directive - ids and id ranges.
    SecRuleRemoveById(Vec<RangeInclusive<u64>>),
    /// SecRuleRemoveByTag directive.
    SecRuleRemoveByTag(Regex),
    /// SecRuleRemoveByMsg directive.
    SecRuleRemoveByMsg(Regex),
    /// SecRuleUpdateTargetById directive.
    SecRuleUpdateTargetById {
        /// Rule id.
        id: u64,
        /// Targets to add (or exclude, with `!`).
        targets: String,
    },
    /// SecAuditEngine directive.
    SecAuditEngine(AuditEngine),
    /// SecAuditLog directive.
    SecAuditLog(PathBuf),
    /// SecAuditLogParts directive.
    SecAuditLogParts(String),
    /// SecAuditLogFormat directive.
    SecAuditLogFormat(String),
    /// SecAuditLogType directive.
    SecAuditLogType(String),
    /// SecAuditLogStorageDir directive.
    SecAuditLogStorageDir(PathBuf),
    /// SecAuditLogRelevantStatus directive.
    SecAuditLogRelevantStatus(Regex),
    /// SecTmpDir directive.
    SecTmpDir(PathBuf),
    /// SecUploadDir directive.
    SecUploadDir(PathBuf),
    /// SecUploadKeepFiles directive.
    SecUploadKeepFiles(UploadKeepFiles),
    /// SecDebugLogLevel directive.
    SecDebugLogLevel(u8),
    /// SecDataset directive.
    SecDataset {
        /// Dataset name.
        name: String,
        /// One entry per non-empty line.
        values: Vec<String>,
    },
    /// SecComponentSignature directive.
    SecComponentSignature(String),
    /// SecCollectionTimeout directive.
    SecCollectionTimeout(u64),
    /// Include directive - the included file's directives follow it.
    Include(PathBuf),
    /// Directive accepted for compatibility with no effect here.
    Ignored(String),
}

/// A SecRule directive.
#[derive(Debug, Clone)]
pub struct SecRule {
    /// Variables to inspect.
    pub variables: Vec<VariableSpec>,
    /// Operator to apply.
    pub operator: OperatorSpec,
    /// Actions as written.
    pub actions: Vec<RawAction>,
    /// Source location for error reporting.
    pub location: SourceLocation,
    /// Directive text for the audit log.
    pub raw: String,
}

/// A SecAction directive.
#[derive(Debug, Clone)]
pub struct SecAction {
    /// Actions as written.
    pub actions: Vec<RawAction>,
    /// Source location for error reporting.
    pub location: SourceLocation,
    /// Directive text for the audit log.
    pub raw: String,
}

/// A SecMarker directive.
#[derive(Debug, Clone)]
pub struct SecMarker {
    /// Marker name.
    pub name: String,
    /// Source location.
    pub location: SourceLocation,
}

impl SecRule {
    /// Whether this rule has the chain action.
    pub fn is_chained(&self) -> bool {
        self.actions.iter().any(|a| a.key() == "chain")
    }

    /// The rule id if present and numeric.
    pub fn id(&self) -> Option<u64> {
        find_id(&self.actions)
    }
}

impl SecAction {
    /// The id if present and numeric.
    pub fn id(&self) -> Option<u64> {
        find_id(&self.actions)
    }
}

fn find_id(actions: &[RawAction]) -> Option<u64> {
    actions
        .iter()
        .find(|a| a.key() == "id")
        .and_then(|a| a.arg().trim().parse().ok())
}
