//! Rule metadata and the metadata actions (id, msg, severity, tag, etc.).

use super::{ActionKind, RuleAction};
use crate::engine::{Phase, Transaction};
use crate::error::{Error, Result};
use crate::macros::Macro;
use std::path::PathBuf;

/// Severity levels as defined in ModSecurity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Severity {
    /// 0
    Emergency = 0,
    /// 1
    Alert = 1,
    /// 2
    Critical = 2,
    /// 3
    Error = 3,
    /// 4
    Warning = 4,
    /// 5
    Notice = 5,
    /// 6
    Info = 6,
    /// 7
    Debug = 7,
}

impl From<u8> for Severity {
    fn from(value: u8) -> Self {
        match value {
            0 => Severity::Emergency,
            1 => Severity::Alert,
            2 => Severity::Critical,
            3 => Severity::Error,
            4 => Severity::Warning,
            5 => Severity::Notice,
            6 => Severity::Info,
            _ => Severity::Debug,
        }
    }
}

impl Severity {
    /// Get severity name.
    pub fn name(&self) -> &'static str {
        match self {
            Severity::Emergency => "EMERGENCY",
            Severity::Alert => "ALERT",
            Severity::Critical => "CRITICAL",
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Notice => "NOTICE",
            Severity::Info => "INFO",
            Severity::Debug => "DEBUG",
        }
    }

    /// Numeric level.
    pub fn level(&self) -> u8 {
        *self as u8
    }

    /// Parse a name (`CRITICAL`, case-insensitive) or a number (`2`).
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return (n <= 7).then(|| Severity::from(n));
        }
        match s.to_ascii_uppercase().as_str() {
            "EMERGENCY" => Some(Severity::Emergency),
            "ALERT" => Some(Severity::Alert),
            "CRITICAL" => Some(Severity::Critical),
            "ERROR" => Some(Severity::Error),
            "WARNING" => Some(Severity::Warning),
            "NOTICE" => Some(Severity::Notice),
            "INFO" => Some(Severity::Info),
            "DEBUG" => Some(Severity::Debug),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything known about a rule at compile time.
///
/// Filled by the `init` step of each of the rule's actions.
#[derive(Debug, Clone)]
pub struct RuleMetadata {
    /// Rule id; 0 for chain children.
    pub id: u64,
    /// Id of the chain starter, for chain children.
    pub parent_id: Option<u64>,
    /// Phase the rule runs in.
    pub phase: Phase,
    /// Message, expanded on match.
    pub msg: Option<Macro>,
    /// Log data, expanded on match.
    pub logdata: Option<Macro>,
    /// Severity.
    pub severity: Option<Severity>,
    /// Tags.
    pub tags: Vec<String>,
    /// Maturity level.
    pub maturity: Option<u8>,
    /// Accuracy level.
    pub accuracy: Option<u8>,
    /// Revision.
    pub rev: Option<String>,
    /// Version.
    pub ver: Option<String>,
    /// Status used by deny, drop, redirect and proxy.
    pub status: Option<u16>,
    /// Transformation names in order (`t:none` already applied).
    pub transformations: Vec<String>,
    /// Whether the operator stores captures in `TX.0`..`TX.9`.
    pub capture: bool,
    /// Whether the operator runs after every transformation step.
    pub multi_match: bool,
    /// Whether the next rule is a chain child.
    pub chain: bool,
    /// Whether matches are logged.
    pub log: bool,
    /// Whether matches are written to the audit log.
    pub audit_log: bool,
    /// Whether the rule used `block`.
    pub block: bool,
    /// Name of the disruptive action the rule runs on match.
    pub disruptive: Option<&'static str>,
    /// File the rule came from.
    pub file: Option<PathBuf>,
    /// Line of the rule in `file`.
    pub line: usize,
    /// Directive text.
    pub raw: String,
}

impl Default for RuleMetadata {
    fn default() -> Self {
        Self {
            id: 0,
            parent_id: None,
            phase: Phase::RequestBody,
            msg: None,
            logdata: None,
            severity: None,
            tags: Vec::new(),
            maturity: None,
            accuracy: None,
            rev: None,
            ver: None,
            status: None,
            transformations: Vec::new(),
            capture: false,
            multi_match: false,
            chain: false,
            log: true,
            audit_log: true,
            block: false,
            disruptive: None,
            file: None,
            line: 0,
            raw: String::new(),
        }
    }
}

impl RuleMetadata {
    /// Id reported for matches: the chain starter's for children.
    pub fn effective_id(&self) -> u64 {
        self.parent_id.unwrap_or(self.id)
    }

    /// Whether `tag` is one of the rule's tags.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Unexpanded message text.
    pub fn msg_text(&self) -> &str {
        self.msg.as_ref().map(Macro::raw).unwrap_or_default()
    }
}

macro_rules! metadata_action {
    ($(#[$doc:meta])* $ty:ident, $name:literal, |$meta:ident, $arg:ident| $body:block) => {
        $(#[$doc])*
        #[derive(Debug, Default)]
        pub struct $ty;

        impl RuleAction for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn kind(&self) -> ActionKind {
                ActionKind::Metadata
            }

            fn init(&mut self, $meta: &mut RuleMetadata, $arg: &str) -> Result<()> $body

            fn evaluate(&self, _: &RuleMetadata, _: &mut Transaction) {}
        }
    };
}

fn invalid(action: &str, message: impl Into<String>) -> Error {
    Error::InvalidActionArgument {
        action: action.to_string(),
        message: message.into(),
    }
}

fn small_int(action: &str, arg: &str, max: u8) -> Result<u8> {
    match arg.trim().parse::<u8>() {
        Ok(n) if n <= max => Ok(n),
        _ => Err(invalid(action, format!("expected 0..={}, got {:?}", max, arg))),
    }
}

metadata_action!(
    /// `id:N`
    IdAction, "id", |meta, arg| {
        let id: u64 = arg
            .trim()
            .parse()
            .map_err(|_| invalid("id", format!("not a number: {:?}", arg)))?;
        if id == 0 {
            return Err(invalid("id", "id must be positive"));
        }
        meta.id = id;
        Ok(())
    }
);

metadata_action!(
    /// `phase:N`, also `request`, `response` and `logging`.
    PhaseAction, "phase", |meta, arg| {
        meta.phase = Phase::parse(arg).ok_or_else(|| invalid("phase", format!("unknown phase {:?}", arg)))?;
        Ok(())
    }
);

metadata_action!(
    /// `msg:'text'`
    MsgAction, "msg", |meta, arg| {
        meta.msg = Some(Macro::compile(arg));
        Ok(())
    }
);

metadata_action!(
    /// `logdata:'text'`
    LogDataAction, "logdata", |meta, arg| {
        meta.logdata = Some(Macro::compile(arg));
        Ok(())
    }
);

metadata_action!(
    /// `severity:CRITICAL` or `severity:2`
    SeverityAction, "severity", |meta, arg| {
        meta.severity = Some(
            Severity::parse(arg).ok_or_else(|| invalid("severity", format!("unknown severity {:?}", arg)))?,
        );
        Ok(())
    }
);

metadata_action!(
    /// `tag:'name'`
    TagAction, "tag", |meta, arg| {
        meta.tags.push(arg.to_string());
        Ok(())
    }
);

metadata_action!(
    /// `maturity:0..9`
    MaturityAction, "maturity", |meta, arg| {
        meta.maturity = Some(small_int("maturity", arg, 9)?);
        Ok(())
    }
);

metadata_action!(
    /// `accuracy:0..9`
    AccuracyAction, "accuracy", |meta, arg| {
        meta.accuracy = Some(small_int("accuracy", arg, 9)?);
        Ok(())
    }
);

metadata_action!(
    /// `rev:'2'`
    RevAction, "rev", |meta, arg| {
        meta.rev = Some(arg.to_string());
        Ok(())
    }
);

metadata_action!(
    /// `ver:'OWASP_CRS/4.0.0'`
    VerAction, "ver", |meta, arg| {
        meta.ver = Some(arg.to_string());
        Ok(())
    }
);

#[cfg(test)]
mod tests {
    use super::*;

    fn init<A: RuleAction + Default>(arg: &str) -> Result<RuleMetadata> {
        let mut meta = RuleMetadata::default();
        A::default().init(&mut meta, arg)?;
        Ok(meta)
    }

    #[test]
    fn test_severity_from_u8() {
        assert_eq!(Severity::from(0), Severity::Emergency);
        assert_eq!(Severity::from(2), Severity::Critical);
        assert_eq!(Severity::from(4), Severity::Warning);
        assert_eq!(Severity::from(99), Severity::Debug);
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!(Severity::parse("critical"), Some(Severity::Critical));
        assert_eq!(Severity::parse("5"), Some(Severity::Notice));
        assert_eq!(Severity::parse("8"), None);
        assert_eq!(Severity::parse("loud"), None);
    }

    #[test]
    fn test_metadata_actions() {
        assert_eq!(init::<IdAction>("942100").unwrap().id, 942100);
        assert!(init::<IdAction>("abc").is_err());
        assert!(init::<IdAction>("0").is_err());
        assert_eq!(init::<PhaseAction>("request").unwrap().phase, Phase::RequestBody);
        assert_eq!(init::<PhaseAction>("1").unwrap().phase, Phase::RequestHeaders);
        assert!(init::<PhaseAction>("6").is_err());
        assert_eq!(
            init::<SeverityAction>("WARNING").unwrap().severity,
            Some(Severity::Warning)
        );
        assert_eq!(init::<MaturityAction>("9").unwrap().maturity, Some(9));
        assert!(init::<AccuracyAction>("10").is_err());
        assert_eq!(init::<MsgAction>("SQLi in %{MATCHED_VAR_NAME}").unwrap().msg_text(), "SQLi in %{MATCHED_VAR_NAME}");
    }

    #[test]
    fn test_effective_id() {
        let meta = RuleMetadata {
            id: 0,
            parent_id: Some(10),
            ..Default::default()
        };
        assert_eq!(meta.effective_id(), 10);
        assert!(RuleMetadata::default().log);
    }
}
