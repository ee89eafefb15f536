//! SecLang parser.
//!
//! Turns configuration text into [`Directive`]s:
//! - SecRule: The main rule directive
//! - SecAction: Actions without matching
//! - SecMarker: Named markers for skipAfter
//! - Engine, body, audit and upload settings (`SecRuleEngine`, ...)
//! - Include: File inclusion (glob patterns allowed)
//!
//! ## SecRule Syntax
//!
//! ```text
//! SecRule VARIABLES "OPERATOR" "ACTIONS"
//! ```
//!
//! Where:
//! - VARIABLES: `|`-separated list of variables to inspect
//! - OPERATOR: Pattern to match (e.g., @rx, @contains)
//! - ACTIONS: Comma-separated list of actions (e.g., id:1,deny,log)
//!
//! The parser does not resolve operator or action names; that happens when
//! the ruleset is compiled against the registries.

mod action;
mod directive;
mod lexer;
mod operator;
mod variable;

pub use action::{parse_actions, RawAction};
pub use directive::{Directive, SecAction, SecMarker, SecRule};
pub use lexer::{Lexer, Token, TokenKind};
pub use operator::{parse_operator, OperatorSpec};
pub use variable::{parse_variable, parse_variables};
pub(crate) use variable::split_targets;

use crate::engine::config::{AuditEngine, BodyLimitAction, RuleEngineMode, UploadKeepFiles};
use crate::error::{Error, Result, SourceLocation};
use regex::Regex;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

/// Directives accepted for compatibility that change nothing here.
const IGNORED_DIRECTIVES: &[&str] = &[
    "secargumentseparator",
    "secauditlogdirmode",
    "secauditlogfilemode",
    "seccookieformat",
    "secdebuglog",
    "secgeolookupdb",
    "sechashengine",
    "secpcrematchlimit",
    "secpcrematchlimitrecursion",
    "secrequestbodynofileslimit",
    "secrequestbodyjsondepthlimit",
    "secserversignature",
    "secstatusengine",
    "secunicodemapfile",
    "secuploadfilelimit",
    "secuploadfilemode",
    "secwebappid",
    "secxmlexternalentity",
];

/// Parser for SecLang configuration files.
pub struct Parser {
    /// Parsed directives.
    directives: Vec<Directive>,
    /// Current source location for error reporting.
    location: SourceLocation,
    /// Nesting depth of Include.
    depth: usize,
}

const MAX_INCLUDE_DEPTH: usize = 32;

impl Parser {
    /// Create a new parser.
    pub fn new() -> Self {
        Self {
            directives: Vec::new(),
            location: SourceLocation::default(),
            depth: 0,
        }
    }

    /// Parse a configuration string.
    pub fn parse(&mut self, input: &str) -> Result<()> {
        self.parse_with_location(input, None)
    }

    /// Parse a configuration string with file location.
    pub fn parse_with_location(&mut self, input: &str, file: Option<&Path>) -> Result<()> {
        let saved = std::mem::take(&mut self.location);
        self.location.file = file.map(|p| p.to_path_buf());
        self.location.line = 1;
        self.location.column = 1;

        let result = self.parse_tokens(input);
        self.location = saved;
        result
    }

    fn parse_tokens(&mut self, input: &str) -> Result<()> {
        let mut lexer = Lexer::new(input);

        while let Some(token) = lexer.next_token() {
            self.location.line = token.line;
            self.location.column = token.column;

            match token.kind {
                TokenKind::Directive(name) => {
                    if let Some(directive) = self.parse_directive(&name, &mut lexer)? {
                        self.directives.push(directive);
                    }
                }
                TokenKind::Comment | TokenKind::Newline => {}
                other => {
                    return Err(Error::parse(
                        format!("unexpected token: {:?}", other),
                        self.location.to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Parse a configuration file.
    pub fn parse_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::RuleFileLoad {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.parse_with_location(&content, Some(path))
    }

    /// Parse files matching a glob pattern, in sorted order.
    pub fn parse_glob(&mut self, pattern: &str) -> Result<()> {
        let paths = glob::glob(pattern)
            .map_err(|e| Error::parse(format!("invalid glob pattern: {}", e), pattern))?;

        let mut matched = 0;
        for entry in paths {
            match entry {
                Ok(path) => {
                    if path.is_file() {
                        matched += 1;
                        self.parse_file(&path)?;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "error reading glob entry");
                }
            }
        }

        if matched == 0 && !pattern.contains(['*', '?', '[']) {
            return Err(Error::RuleFileLoad {
                path: PathBuf::from(pattern),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }

        Ok(())
    }

    /// Get the parsed directives.
    pub fn into_directives(self) -> Vec<Directive> {
        self.directives
    }

    /// Get a reference to the parsed directives.
    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::InvalidConfig {
            message: message.into(),
            file: self.location.file.clone(),
            line: self.location.line,
        }
    }

    /// Parse a directive starting from the directive name.
    fn parse_directive(&mut self, name: &str, lexer: &mut Lexer) -> Result<Option<Directive>> {
        let lower = name.to_ascii_lowercase();
        let directive = match lower.as_str() {
            "secrule" => self.parse_secrule(lexer)?,
            "secaction" => self.parse_secaction(lexer)?,
            "secmarker" => {
                let name = self.expect_argument(lexer, "SecMarker name")?;
                Directive::SecMarker(SecMarker {
                    name,
                    location: self.location.clone(),
                })
            }
            "secdefaultaction" => {
                let actions = self.expect_quoted_argument(lexer, "SecDefaultAction")?;
                Directive::SecDefaultAction(parse_actions(&actions)?)
            }
            "secruleengine" => {
                let value = self.expect_argument(lexer, "SecRuleEngine mode")?;
                let mode = RuleEngineMode::parse(&value)
                    .ok_or_else(|| self.error(format!("invalid SecRuleEngine mode: {}", value)))?;
                Directive::SecRuleEngine(mode)
            }
            "secrequestbodyaccess" => {
                Directive::SecRequestBodyAccess(self.parse_on_off(lexer, name)?)
            }
            "secresponsebodyaccess" => {
                Directive::SecResponseBodyAccess(self.parse_on_off(lexer, name)?)
            }
            "secrequestbodylimit" => Directive::SecRequestBodyLimit(self.parse_number(lexer, name)?),
            "secrequestbodyinmemorylimit" => {
                Directive::SecRequestBodyInMemoryLimit(self.parse_number(lexer, name)?)
            }
            "secresponsebodylimit" => {
                Directive::SecResponseBodyLimit(self.parse_number(lexer, name)?)
            }
            "secrequestbodylimitaction" | "secresponsebodylimitaction" => {
                let value = self.expect_argument(lexer, name)?;
                let action = BodyLimitAction::parse(&value)
                    .ok_or_else(|| self.error(format!("invalid {} value: {}", name, value)))?;
                if lower == "secresponsebodylimitaction" {
                    Directive::Ignored(name.to_string())
                } else {
                    Directive::SecRequestBodyLimitAction(action)
                }
            }
            "secresponsebodymimetype" => {
                let types = self.rest_of_line(lexer);
                Directive::SecResponseBodyMimeType(
                    types.split_whitespace().map(|t| t.to_ascii_lowercase()).collect(),
                )
            }
            "secresponsebodymimetypesclear" => Directive::SecResponseBodyMimeTypesClear,
            "secruleremovebyid" => {
                let ids = self.rest_of_line(lexer);
                let ranges = ids
                    .split_whitespace()
                    .map(parse_id_range)
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| self.error(format!("invalid rule id list: {}", ids)))?;
                Directive::SecRuleRemoveById(ranges)
            }
            "secruleremovebytag" => {
                let tag = self.expect_argument(lexer, name)?;
                Directive::SecRuleRemoveByTag(self.regex(&tag)?)
            }
            "secruleremovebymsg" => {
                let msg = self.expect_argument(lexer, name)?;
                Directive::SecRuleRemoveByMsg(self.regex(&msg)?)
            }
            "secruleupdatetargetbyid" => {
                let id = self.expect_argument(lexer, name)?;
                let id = id
                    .parse()
                    .map_err(|_| self.error(format!("invalid rule id: {}", id)))?;
                let targets = self.expect_argument(lexer, name)?;
                Directive::SecRuleUpdateTargetById { id, targets }
            }
            "secauditengine" => {
                let value = self.expect_argument(lexer, name)?;
                let engine = AuditEngine::parse(&value)
                    .ok_or_else(|| self.error(format!("invalid SecAuditEngine value: {}", value)))?;
                Directive::SecAuditEngine(engine)
            }
            "secauditlog" => Directive::SecAuditLog(self.expect_argument(lexer, name)?.into()),
            "secauditlogparts" => Directive::SecAuditLogParts(self.expect_argument(lexer, name)?),
            "secauditlogformat" => Directive::SecAuditLogFormat(self.expect_argument(lexer, name)?),
            "secauditlogtype" => Directive::SecAuditLogType(self.expect_argument(lexer, name)?),
            "secauditlogstoragedir" => {
                Directive::SecAuditLogStorageDir(self.expect_argument(lexer, name)?.into())
            }
            "secauditlogrelevantstatus" => {
                let status = self.expect_argument(lexer, name)?;
                Directive::SecAuditLogRelevantStatus(self.regex(&status)?)
            }
            "sectmpdir" => Directive::SecTmpDir(self.expect_argument(lexer, name)?.into()),
            "secuploaddir" => Directive::SecUploadDir(self.expect_argument(lexer, name)?.into()),
            "secuploadkeepfiles" => {
                let value = self.expect_argument(lexer, name)?;
                let keep = UploadKeepFiles::parse(&value)
                    .ok_or_else(|| self.error(format!("invalid SecUploadKeepFiles value: {}", value)))?;
                Directive::SecUploadKeepFiles(keep)
            }
            "secdebugloglevel" => {
                let level = self.parse_number(lexer, name)?;
                if level > 9 {
                    return Err(self.error(format!("invalid SecDebugLogLevel: {}", level)));
                }
                Directive::SecDebugLogLevel(level as u8)
            }
            "secdataset" => {
                let name = self.expect_argument(lexer, "SecDataset name")?;
                let body = self.expect_argument(lexer, "SecDataset values")?;
                let values = body
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect();
                Directive::SecDataset { name, values }
            }
            "seccomponentsignature" => {
                Directive::SecComponentSignature(self.expect_argument(lexer, name)?)
            }
            "seccollectiontimeout" => {
                Directive::SecCollectionTimeout(self.parse_number(lexer, name)?)
            }
            "include" => return self.parse_include(lexer).map(Some),
            other if IGNORED_DIRECTIVES.contains(&other) => {
                tracing::debug!(directive = name, location = %self.location, "directive ignored");
                self.skip_to_end_of_line(lexer);
                Directive::Ignored(name.to_string())
            }
            _ => return Err(self.error(format!("unknown directive: {}", name))),
        };
        Ok(Some(directive))
    }

    /// Parse a SecRule directive.
    fn parse_secrule(&mut self, lexer: &mut Lexer) -> Result<Directive> {
        let location = self.location.clone();
        let variables_str = self.expect_argument(lexer, "SecRule variables")?;
        let variables = parse_variables(&variables_str).map_err(|e| e.at(&location))?;

        let operator_str = self.expect_argument(lexer, "SecRule operator")?;
        let operator = parse_operator(&operator_str).map_err(|e| e.at(&location))?;

        let (actions_str, actions) = if self.peek_quoted(lexer) {
            let actions_str = self.expect_quoted_argument(lexer, "SecRule actions")?;
            let actions = parse_actions(&actions_str).map_err(|e| e.at(&location))?;
            (actions_str, actions)
        } else {
            (String::new(), Vec::new())
        };

        let raw = format!(
            "SecRule {} \"{}\" \"{}\"",
            variables_str,
            operator_str.replace('"', "\\\""),
            actions_str.replace('"', "\\\"")
        );

        Ok(Directive::SecRule(SecRule {
            variables,
            operator,
            actions,
            location,
            raw,
        }))
    }

    /// Parse a SecAction directive.
    fn parse_secaction(&mut self, lexer: &mut Lexer) -> Result<Directive> {
        let location = self.location.clone();
        let actions_str = self.expect_quoted_argument(lexer, "SecAction")?;
        let actions = parse_actions(&actions_str).map_err(|e| e.at(&location))?;

        Ok(Directive::SecAction(SecAction {
            actions,
            raw: format!("SecAction \"{}\"", actions_str.replace('"', "\\\"")),
            location,
        }))
    }

    fn parse_on_off(&mut self, lexer: &mut Lexer, name: &str) -> Result<bool> {
        let value = self.expect_argument(lexer, name)?;
        match value.to_ascii_lowercase().as_str() {
            "on" => Ok(true),
            "off" => Ok(false),
            _ => Err(self.error(format!("invalid {} value: {} (expected On/Off)", name, value))),
        }
    }

    fn parse_number(&mut self, lexer: &mut Lexer, name: &str) -> Result<u64> {
        let value = self.expect_argument(lexer, name)?;
        value
            .trim()
            .parse()
            .map_err(|_| self.error(format!("invalid {} value: {}", name, value)))
    }

    fn regex(&self, pattern: &str) -> Result<Regex> {
        Regex::new(pattern).map_err(|source| {
            Error::RegexCompile {
                pattern: pattern.to_string(),
                source,
            }
            .at(&self.location)
        })
    }

    /// Parse an Include directive.
    fn parse_include(&mut self, lexer: &mut Lexer) -> Result<Directive> {
        let path = self.expect_argument(lexer, "Include path")?;

        if self.depth >= MAX_INCLUDE_DEPTH {
            return Err(self.error(format!("Include nested too deeply: {}", path)));
        }

        // Relative paths resolve against the including file.
        let resolved_path = match self.location.file.as_ref().and_then(|f| f.parent()) {
            Some(parent) if Path::new(&path).is_relative() => {
                parent.join(&path).to_string_lossy().to_string()
            }
            _ => path,
        };

        self.depth += 1;
        let result = self.parse_glob(&resolved_path);
        self.depth -= 1;
        result?;

        Ok(Directive::Include(resolved_path.into()))
    }

    /// Expect an unquoted or quoted argument.
    fn expect_argument(&mut self, lexer: &mut Lexer, context: &str) -> Result<String> {
        lexer.skip_whitespace();

        match lexer.next_token() {
            Some(token) => match token.kind {
                TokenKind::Word(s) | TokenKind::Quoted(s) => Ok(s),
                other => Err(Error::parse(
                    format!("expected {} but got {:?}", context, other),
                    self.location.to_string(),
                )),
            },
            None => Err(Error::parse(
                format!("expected {} but got end of input", context),
                self.location.to_string(),
            )),
        }
    }

    /// Expect a quoted argument.
    fn expect_quoted_argument(&mut self, lexer: &mut Lexer, context: &str) -> Result<String> {
        lexer.skip_whitespace();

        match lexer.next_token() {
            Some(token) => match token.kind {
                TokenKind::Quoted(s) => Ok(s),
                other => Err(Error::parse(
                    format!("expected quoted {} but got {:?}", context, other),
                    self.location.to_string(),
                )),
            },
            None => Err(Error::parse(
                format!("expected quoted {} but got end of input", context),
                self.location.to_string(),
            )),
        }
    }

    /// Check if next token is a quoted string.
    fn peek_quoted(&self, lexer: &mut Lexer) -> bool {
        lexer.skip_whitespace();
        lexer.peek().map(|c| c == '"' || c == '\'').unwrap_or(false)
    }

    /// Collect the remaining words of the line.
    fn rest_of_line(&self, lexer: &mut Lexer) -> String {
        let mut words = Vec::new();
        while let Some(token) = lexer.next_token() {
            match token.kind {
                TokenKind::Word(s) | TokenKind::Quoted(s) => words.push(s),
                _ => break,
            }
        }
        words.join(" ")
    }

    /// Skip to end of current line.
    fn skip_to_end_of_line(&self, lexer: &mut Lexer) {
        while let Some(token) = lexer.next_token() {
            if matches!(token.kind, TokenKind::Newline) {
                break;
            }
        }
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a rule id (`N`) or an inclusive id range (`N-M`).
pub fn parse_id_range(s: &str) -> Option<RangeInclusive<u64>> {
    match s.split_once('-') {
        Some((a, b)) => {
            let (a, b) = (a.trim().parse().ok()?, b.trim().parse().ok()?);
            (a <= b).then_some(a..=b)
        }
        None => {
            let id = s.trim().parse().ok()?;
            Some(id..=id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::VariableName;

    fn parse(input: &str) -> Vec<Directive> {
        let mut parser = Parser::new();
        parser.parse(input).unwrap();
        parser.into_directives()
    }

    #[test]
    fn test_parse_simple_rule() {
        let directives = parse(r#"SecRule REQUEST_URI "@contains /admin" "id:1,deny,status:403""#);
        assert_eq!(directives.len(), 1);
        match &directives[0] {
            Directive::SecRule(rule) => {
                assert_eq!(rule.variables.len(), 1);
                assert_eq!(rule.variables[0].name, VariableName::RequestUri);
                assert_eq!(rule.operator.name, "contains");
                assert_eq!(rule.id(), Some(1));
                assert!(!rule.is_chained());
            }
            _ => panic!("expected SecRule"),
        }
    }

    #[test]
    fn test_parse_rule_without_actions() {
        let directives = parse(
            "SecRule REQUEST_METHOD \"@streq POST\" \"id:10,chain,deny\"\n  SecRule REQUEST_HEADERS:Host \"@streq evil.example\" \"\"",
        );
        assert_eq!(directives.len(), 2);
        let Directive::SecRule(child) = &directives[1] else {
            panic!("expected SecRule");
        };
        assert!(child.actions.is_empty());
    }

    #[test]
    fn test_parse_settings() {
        let directives = parse(
            "SecRuleEngine DetectionOnly\nSecRequestBodyAccess On\nSecRequestBodyLimit 1024\nSecRuleRemoveById 1 5-7\nSecResponseBodyMimeType text/plain application/json",
        );
        assert!(matches!(directives[0], Directive::SecRuleEngine(RuleEngineMode::DetectionOnly)));
        assert!(matches!(directives[1], Directive::SecRequestBodyAccess(true)));
        assert!(matches!(directives[2], Directive::SecRequestBodyLimit(1024)));
        match &directives[3] {
            Directive::SecRuleRemoveById(ranges) => assert_eq!(ranges, &vec![1..=1, 5..=7]),
            _ => panic!("expected SecRuleRemoveById"),
        }
        match &directives[4] {
            Directive::SecResponseBodyMimeType(types) => {
                assert_eq!(types, &vec!["text/plain".to_string(), "application/json".to_string()])
            }
            _ => panic!("expected SecResponseBodyMimeType"),
        }
    }

    #[test]
    fn test_parse_dataset() {
        let directives = parse("SecDataset office `\n10.0.0.0/8\n\n192.168.1.1\n`");
        match &directives[0] {
            Directive::SecDataset { name, values } => {
                assert_eq!(name, "office");
                assert_eq!(values, &vec!["10.0.0.0/8".to_string(), "192.168.1.1".to_string()]);
            }
            _ => panic!("expected SecDataset"),
        }
    }

    #[test]
    fn test_unknown_directive_is_config_error() {
        let mut parser = Parser::new();
        let err = parser.parse("SecRuleEngine On\nSecNoSuchThing 1").unwrap_err();
        match err {
            Error::InvalidConfig { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_ignored_directive() {
        let directives = parse("SecPcreMatchLimit 1000\nSecRuleEngine On");
        assert!(matches!(directives[0], Directive::Ignored(_)));
        assert!(matches!(directives[1], Directive::SecRuleEngine(RuleEngineMode::On)));
    }

    #[test]
    fn test_include_relative_to_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("inner.conf"), "SecRule ARGS \"@rx a\" \"id:2\"\n").unwrap();
        let main = dir.path().join("main.conf");
        std::fs::write(&main, "Include inner.conf\nSecAction \"id:3\"\n").unwrap();

        let mut parser = Parser::new();
        parser.parse_file(&main).unwrap();
        let directives = parser.into_directives();
        assert_eq!(directives.len(), 3);
        assert!(matches!(&directives[0], Directive::SecRule(r) if r.location.line == 1));
        assert!(matches!(directives[1], Directive::Include(_)));
        assert!(matches!(&directives[2], Directive::SecAction(a) if a.id() == Some(3)));
    }

    #[test]
    fn test_missing_include_fails() {
        let mut parser = Parser::new();
        assert!(matches!(
            parser.parse("Include /definitely/not/here.conf"),
            Err(Error::RuleFileLoad { .. })
        ));
    }

    #[test]
    fn test_id_ranges() {
        assert_eq!(parse_id_range("10"), Some(10..=10));
        assert_eq!(parse_id_range("10-20"), Some(10..=20));
        assert_eq!(parse_id_range("20-10"), None);
        assert_eq!(parse_id_range("x"), None);
    }
}
