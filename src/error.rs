//! Configuration-time errors.
//!
//! [`Error`] is returned while building a [`Waf`](crate::Waf): reading rule
//! files, parsing directives and compiling rules. Transactions do not fail
//! through it; body processors, operators, actions and audit writers have
//! their own small error types that are recorded on the transaction or
//! logged.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading and compiling rules.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed directive text.
    #[error("parse error at {location}: {message}")]
    Parse {
        /// What is wrong.
        message: String,
        /// `file:line:col` or `line:col`.
        location: String,
    },

    /// A directive is well formed but cannot be applied.
    #[error("invalid configuration{}: {message}", Where(file.as_ref(), *line))]
    InvalidConfig {
        /// What is wrong.
        message: String,
        /// Rule file, when the directive came from one.
        file: Option<PathBuf>,
        /// Directive line, 0 when unknown.
        line: usize,
    },

    /// A rule, data or include file could not be read.
    #[error("failed to load file {path}: {source}")]
    RuleFileLoad {
        /// File that failed.
        path: PathBuf,
        /// Cause.
        #[source]
        source: std::io::Error,
    },

    /// `@rx` or a regex selector that does not compile.
    #[error("invalid regex pattern '{pattern}': {source}")]
    RegexCompile {
        /// Offending pattern.
        pattern: String,
        /// Cause.
        #[source]
        source: regex::Error,
    },

    /// Phrase list for `@pm` and friends.
    #[error("invalid pattern set: {message}")]
    PatternSet {
        /// What is wrong.
        message: String,
    },

    /// Address or CIDR for `@ipMatch`.
    #[error("invalid IP address or network '{value}': {message}")]
    InvalidIp {
        /// Offending text.
        value: String,
        /// What is wrong.
        message: String,
    },

    /// Variable name outside the catalog.
    #[error("unknown variable: {name}")]
    UnknownVariable {
        /// Name as written.
        name: String,
    },

    /// Operator not in the registry.
    #[error("unknown operator: @{name}")]
    UnknownOperator {
        /// Name as written.
        name: String,
    },

    /// Transformation not in the registry.
    #[error("unknown transformation: t:{name}")]
    UnknownTransformation {
        /// Name as written.
        name: String,
    },

    /// Action not in the registry.
    #[error("unknown action: {name}")]
    UnknownAction {
        /// Name as written.
        name: String,
    },

    /// Body processor not in the registry.
    #[error("unknown body processor: {name}")]
    UnknownBodyProcessor {
        /// Name as written.
        name: String,
    },

    /// Action argument rejected by the action.
    #[error("invalid argument for action '{action}': {message}")]
    InvalidActionArgument {
        /// Action name.
        action: String,
        /// What is wrong.
        message: String,
    },

    /// Operator argument rejected by the operator.
    #[error("invalid argument for operator '@{operator}': {message}")]
    InvalidOperatorArgument {
        /// Operator name.
        operator: String,
        /// What is wrong.
        message: String,
    },

    /// SecRule or SecAction without `id`.
    #[error("rule is missing required 'id' action")]
    MissingRuleId,

    /// Two rules share an id.
    #[error("duplicate rule id: {id}")]
    DuplicateRuleId {
        /// The id.
        id: u64,
    },

    /// The last rule of a file carries `chain`.
    #[error("incomplete rule chain: chain action without following rule")]
    IncompleteChain,

    /// Body buffering or temp file failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// ` at file:line`, ` at line N` or nothing.
struct Where<'a>(Option<&'a PathBuf>, usize);

impl fmt::Display for Where<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Where(Some(path), line) => write!(f, " at {}:{}", path.display(), line),
            Where(None, 0) => Ok(()),
            Where(None, line) => write!(f, " at line {}", line),
        }
    }
}

impl Error {
    /// [`Error::Parse`] at `location`.
    pub fn parse(message: impl Into<String>, location: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            location: location.into(),
        }
    }

    /// [`Error::InvalidConfig`] with no location.
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            file: None,
            line: 0,
        }
    }

    /// Attach the location of the directive a compile error came from.
    /// Errors that already carry a location pass through.
    pub fn at(self, location: &SourceLocation) -> Self {
        match self {
            Self::InvalidConfig { .. } | Self::Parse { .. } | Self::RuleFileLoad { .. } => self,
            other => Self::InvalidConfig {
                message: other.to_string(),
                file: location.file.clone(),
                line: location.line,
            },
        }
    }
}

/// Where a directive was read from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceLocation {
    /// Rule file, `None` for inline text.
    pub file: Option<PathBuf>,
    /// 1-based line.
    pub line: usize,
    /// 1-based column.
    pub column: usize,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{}:{}:{}", file.display(), self.line, self.column),
            None => write!(f, "{}:{}", self.line, self.column),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_display() {
        let err = Error::InvalidConfig {
            message: "bad directive".to_string(),
            file: Some(PathBuf::from("rules.conf")),
            line: 12,
        };
        assert_eq!(err.to_string(), "invalid configuration at rules.conf:12: bad directive");
        assert_eq!(Error::config("oops").to_string(), "invalid configuration: oops");

        let err = Error::InvalidConfig {
            message: "x".to_string(),
            file: None,
            line: 4,
        };
        assert_eq!(err.to_string(), "invalid configuration at line 4: x");
    }

    #[test]
    fn test_at_wraps_with_location() {
        let location = SourceLocation {
            file: None,
            line: 3,
            column: 1,
        };
        let err = Error::UnknownOperator {
            name: "nope".to_string(),
        }
        .at(&location);
        match err {
            Error::InvalidConfig { message, line, .. } => {
                assert_eq!(line, 3);
                assert!(message.contains("@nope"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_at_keeps_existing_location() {
        let err = Error::parse("unterminated", "rules.conf:7:1").at(&SourceLocation::default());
        assert_eq!(err.to_string(), "parse error at rules.conf:7:1: unterminated");
    }

    #[test]
    fn test_location_display() {
        let mut location = SourceLocation {
            file: None,
            line: 2,
            column: 5,
        };
        assert_eq!(location.to_string(), "2:5");
        location.file = Some(PathBuf::from("crs.conf"));
        assert_eq!(location.to_string(), "crs.conf:2:5");
    }
}
