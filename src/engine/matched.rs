//! Records of matched rules.

use super::Phase;
use crate::actions::RuleMetadata;
use crate::variables::VariableName;
use std::sync::Arc;

/// One value that satisfied the rule's operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedData {
    /// Variable the value came from.
    pub variable: VariableName,
    /// Key inside the collection, empty for single variables.
    pub key: String,
    /// Value after transformations.
    pub value: String,
}

impl MatchedData {
    /// `NAME:key`, or `NAME` when there is no key.
    pub fn full_name(&self) -> String {
        if self.key.is_empty() {
            self.variable.name().to_string()
        } else {
            format!("{}:{}", self.variable.name(), self.key)
        }
    }
}

/// A rule (or whole chain) that matched during a transaction.
#[derive(Debug, Clone)]
pub struct MatchedRule {
    /// Metadata of the rule; the chain starter for chains.
    pub rule: Arc<RuleMetadata>,
    /// Phase the match happened in.
    pub phase: Phase,
    /// Expanded `msg`.
    pub message: String,
    /// Expanded `logdata`.
    pub data: String,
    /// Values that matched, for every link of a chain.
    pub matched: Vec<MatchedData>,
    /// Disruptive action the rule runs.
    pub disruptive_action: Option<&'static str>,
    /// Whether the rule interrupted the transaction.
    pub disruptive: bool,
    /// Transaction id.
    pub tx_id: String,
    /// Request URI.
    pub uri: String,
    /// Client address.
    pub client_ip: String,
    /// Server name or address.
    pub server: String,
}

impl MatchedRule {
    /// Whether the match goes to the error log.
    pub fn is_logged(&self) -> bool {
        self.rule.log
    }

    /// Whether the match goes to the audit log.
    pub fn is_audited(&self) -> bool {
        self.rule.audit_log
    }

    /// ModSecurity style error log line.
    pub fn error_log(&self) -> String {
        let mut parts = Vec::new();

        parts.push(format!("[client {}]", self.client_ip));
        let verdict = if self.disruptive {
            "Access denied"
        } else {
            "Warning"
        };
        match self.matched.last() {
            Some(m) => parts.push(format!(
                "ModSecurity: {}. Matched \"{}\" at {}.",
                verdict,
                truncate(&m.value, 200),
                m.full_name()
            )),
            None => parts.push(format!("ModSecurity: {}. Unconditional match.", verdict)),
        }

        if let Some(file) = &self.rule.file {
            parts.push(format!("[file \"{}\"]", file.display()));
        }
        if self.rule.line > 0 {
            parts.push(format!("[line \"{}\"]", self.rule.line));
        }
        parts.push(format!("[id \"{}\"]", self.rule.effective_id()));

        if let Some(ref rev) = self.rule.rev {
            parts.push(format!("[rev \"{}\"]", rev));
        }

        if !self.message.is_empty() {
            parts.push(format!("[msg \"{}\"]", self.message));
        }

        if !self.data.is_empty() {
            parts.push(format!("[data \"{}\"]", truncate(&self.data, 200)));
        }

        if let Some(sev) = self.rule.severity {
            parts.push(format!("[severity \"{}\"]", sev.name()));
        }

        if let Some(ref ver) = self.rule.ver {
            parts.push(format!("[ver \"{}\"]", ver));
        }

        if let Some(maturity) = self.rule.maturity {
            parts.push(format!("[maturity \"{}\"]", maturity));
        }

        if let Some(accuracy) = self.rule.accuracy {
            parts.push(format!("[accuracy \"{}\"]", accuracy));
        }

        for tag in &self.rule.tags {
            parts.push(format!("[tag \"{}\"]", tag));
        }

        parts.push(format!("[hostname \"{}\"]", self.server));
        parts.push(format!("[uri \"{}\"]", self.uri));
        parts.push(format!("[unique_id \"{}\"]", self.tx_id));

        parts.join(" ")
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
