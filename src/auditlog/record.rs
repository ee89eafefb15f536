//! The audit record handed to formatters.

use super::AuditLogParts;
use crate::engine::{Interruption, MatchedRule};
use crate::variables::VariableName;
use serde::Serialize;
use std::collections::BTreeMap;

/// Timestamp layout used across audit formats.
pub const TIMESTAMP_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// Header name to values, sorted by name.
pub type Headers = BTreeMap<String, Vec<String>>;

/// One audited transaction.
#[derive(Debug, Clone, Serialize)]
pub struct AuditLog {
    /// Parts selected for this transaction.
    #[serde(skip)]
    pub parts: AuditLogParts,
    /// Transaction section.
    pub transaction: AuditTransaction,
    /// One entry per auditable matched rule.
    pub messages: Vec<AuditMessage>,
}

/// Transaction section of an audit record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditTransaction {
    /// Start time formatted with [`TIMESTAMP_FORMAT`].
    pub timestamp: String,
    /// Start time in nanoseconds since the Unix epoch.
    pub unix_timestamp: i64,
    /// Transaction id.
    pub id: String,
    /// Client address.
    pub client_ip: String,
    /// Client port.
    pub client_port: u16,
    /// Server address.
    pub host_ip: String,
    /// Server port.
    pub host_port: u16,
    /// Server name.
    pub server_id: String,
    /// Request section (parts B, C, I, J).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<AuditRequest>,
    /// Response section (parts E, F).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<AuditResponse>,
    /// Producer section (part H).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer: Option<AuditProducer>,
    /// Numeric highest severity of the matched rules, 255 for none.
    pub highest_severity: String,
    /// Whether a rule interrupted the transaction.
    pub is_interrupted: bool,
    /// The interruption, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interruption: Option<Interruption>,
}

/// Request section of an audit record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditRequest {
    /// Request method.
    pub method: String,
    /// Request protocol.
    pub protocol: String,
    /// Request URI.
    pub uri: String,
    /// Request headers.
    pub headers: Headers,
    /// Request body.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body: String,
    /// Uploaded file names.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<AuditFile>,
}

/// An uploaded file.
#[derive(Debug, Clone, Serialize)]
pub struct AuditFile {
    /// Client-side file name.
    pub name: String,
    /// Size in bytes.
    pub size: usize,
}

/// Response section of an audit record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditResponse {
    /// Response protocol.
    pub protocol: String,
    /// Response status.
    pub status: u16,
    /// Response headers.
    pub headers: Headers,
    /// Response body.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body: String,
}

/// Who produced the record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditProducer {
    /// Connector identifier.
    pub connector: String,
    /// Engine version.
    pub version: String,
    /// Server name.
    pub server: String,
    /// `On`, `Off` or `DetectionOnly`.
    pub rule_engine: String,
    /// Elapsed time in microseconds.
    pub stopwatch: String,
    /// Component signatures.
    pub rulesets: Vec<String>,
}

/// One matched rule.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditMessage {
    /// Disruptive action of the rule, empty for none.
    pub actionset: String,
    /// Expanded `msg`.
    pub message: String,
    /// Rule details.
    pub data: AuditMessageData,
    /// Error log line, used by the native format.
    #[serde(skip)]
    pub log_line: String,
}

impl From<&MatchedRule> for AuditMessage {
    fn from(m: &MatchedRule) -> Self {
        let rule = &m.rule;
        Self {
            actionset: m.disruptive_action.unwrap_or_default().to_string(),
            message: m.message.clone(),
            data: AuditMessageData {
                file: rule
                    .file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                line: rule.line,
                id: rule.effective_id(),
                rev: rule.rev.clone().unwrap_or_default(),
                msg: m.message.clone(),
                data: m.data.clone(),
                severity: rule.severity.map_or(0, |s| s.level()),
                ver: rule.ver.clone().unwrap_or_default(),
                maturity: rule.maturity.unwrap_or_default(),
                accuracy: rule.accuracy.unwrap_or_default(),
                tags: rule.tags.clone(),
                raw: rule.raw.clone(),
            },
            log_line: m.error_log(),
        }
    }
}

/// Rule details of an [`AuditMessage`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditMessageData {
    /// Rule file.
    pub file: String,
    /// Line in the rule file.
    pub line: usize,
    /// Rule id.
    pub id: u64,
    /// `rev`.
    pub rev: String,
    /// Expanded `msg`.
    pub msg: String,
    /// Expanded `logdata`.
    pub data: String,
    /// Numeric severity.
    pub severity: u8,
    /// `ver`.
    pub ver: String,
    /// `maturity`.
    pub maturity: u8,
    /// `accuracy`.
    pub accuracy: u8,
    /// `tag` values.
    pub tags: Vec<String>,
    /// Rule source text.
    pub raw: String,
}

/// A value to mask before the record is written (`sanitise*` actions).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitisation {
    /// Variable holding the value.
    pub variable: VariableName,
    /// Key inside the variable.
    pub key: String,
    /// Leading characters left visible.
    pub keep_prefix: usize,
    /// Trailing characters left visible.
    pub keep_suffix: usize,
}

impl Sanitisation {
    /// Mask `variable:key` completely.
    pub fn new(variable: VariableName, key: String) -> Self {
        Self {
            variable,
            key,
            keep_prefix: 0,
            keep_suffix: 0,
        }
    }

    /// `value` with every character outside the kept prefix and suffix
    /// replaced by `*`.
    pub fn mask(&self, value: &str) -> String {
        let len = value.chars().count();
        if self.keep_prefix + self.keep_suffix >= len {
            return "*".repeat(len);
        }
        value
            .chars()
            .enumerate()
            .map(|(i, c)| {
                if i < self.keep_prefix || i >= len - self.keep_suffix {
                    c
                } else {
                    '*'
                }
            })
            .collect()
    }

    fn masks_header(&self, response: bool) -> bool {
        let variable = if response {
            VariableName::ResponseHeaders
        } else {
            VariableName::RequestHeaders
        };
        self.variable == variable
    }
}

fn mask_headers(headers: &mut Headers, s: &Sanitisation) {
    for (name, values) in headers.iter_mut() {
        if name.eq_ignore_ascii_case(&s.key) {
            for value in values.iter_mut() {
                *value = s.mask(value);
            }
        }
    }
}

impl AuditLog {
    /// Mask a value everywhere it appears in the record.
    ///
    /// Header sanitisations rewrite the matching header. Anything else
    /// replaces each occurrence of `values` in the URI, body and messages.
    pub fn sanitise(&mut self, s: &Sanitisation, values: &[String]) {
        if let Some(request) = self.transaction.request.as_mut() {
            if s.masks_header(false) {
                mask_headers(&mut request.headers, s);
            }
        }
        if let Some(response) = self.transaction.response.as_mut() {
            if s.masks_header(true) {
                mask_headers(&mut response.headers, s);
            }
        }

        for value in values.iter().filter(|v| !v.is_empty()) {
            let masked = s.mask(value);
            let replace = |text: &mut String| {
                if text.contains(value.as_str()) {
                    *text = text.replace(value.as_str(), &masked);
                }
            };
            if let Some(request) = self.transaction.request.as_mut() {
                replace(&mut request.uri);
                replace(&mut request.body);
            }
            for message in &mut self.messages {
                replace(&mut message.data.data);
                replace(&mut message.log_line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask() {
        let s = Sanitisation::new(VariableName::Args, "pwd".to_string());
        assert_eq!(s.mask("secret"), "******");

        let mut s = Sanitisation::new(VariableName::Args, "card".to_string());
        s.keep_prefix = 2;
        s.keep_suffix = 4;
        assert_eq!(s.mask("4111111111111111"), "41**********1111");
        assert_eq!(s.mask("abc"), "***");
    }

    #[test]
    fn test_sanitise_record() {
        let mut request = AuditRequest {
            uri: "/login?pwd=hunter2".to_string(),
            body: "user=bob&pwd=hunter2".to_string(),
            ..Default::default()
        };
        request
            .headers
            .insert("Authorization".to_string(), vec!["Basic abc".to_string()]);
        let mut log = AuditLog {
            parts: AuditLogParts::default(),
            transaction: AuditTransaction {
                request: Some(request),
                ..Default::default()
            },
            messages: vec![AuditMessage {
                log_line: "Matched \"hunter2\" at ARGS:pwd".to_string(),
                ..Default::default()
            }],
        };

        log.sanitise(
            &Sanitisation::new(VariableName::Args, "pwd".to_string()),
            &["hunter2".to_string()],
        );
        log.sanitise(
            &Sanitisation::new(VariableName::RequestHeaders, "authorization".to_string()),
            &[],
        );

        let request = log.transaction.request.as_ref().unwrap();
        assert_eq!(request.uri, "/login?pwd=*******");
        assert_eq!(request.body, "user=bob&pwd=*******");
        assert_eq!(request.headers["Authorization"], vec!["*********"]);
        assert_eq!(log.messages[0].log_line, "Matched \"*******\" at ARGS:pwd");
    }
}
