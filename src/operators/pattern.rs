//! Pattern matching operators (`@rx`, `@pm` family, `@restpath`).
//!
//! Compiled matchers come from the shared cache, so identical patterns in
//! different rules share one automaton.

use super::cache;
use super::traits::{Operator, OperatorContext, OperatorOptions, MAX_CAPTURES};
use crate::error::{Error, Result};
use crate::macros::Macro;
use crate::variables::VariableName;
use aho_corasick::AhoCorasick;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

fn compile_regex(pattern: &str) -> Result<Regex> {
    cache::regex(pattern).map_err(|source| Error::RegexCompile {
        pattern: pattern.to_string(),
        source,
    })
}

/// Regex operator (`@rx`).
///
/// Dot matches newline by default; `(?m)` can be used inline. Capture
/// groups 0..9 land in `TX.0`..`TX.9` when the rule captures.
pub struct RxOperator {
    compiled: Option<Regex>,
    dynamic: Option<Macro>,
}

impl RxOperator {
    /// Compile a regex operator. Patterns with macros compile per evaluation
    /// and are not cached.
    pub fn new(pattern: &str) -> Result<Self> {
        let m = Macro::compile(pattern);
        if m.is_dynamic() {
            return Ok(Self {
                compiled: None,
                dynamic: Some(m),
            });
        }
        Ok(Self {
            compiled: Some(compile_regex(pattern)?),
            dynamic: None,
        })
    }
}

impl Operator for RxOperator {
    fn evaluate(&self, ctx: &mut OperatorContext<'_>, value: &str) -> bool {
        let regex = match (&self.compiled, &self.dynamic) {
            (Some(re), _) => re.clone(),
            (None, Some(m)) => match cache::build_regex(&m.expand(ctx.variables)) {
                Ok(re) => re,
                Err(e) => {
                    debug!(error = %e, "dynamic @rx pattern failed to compile");
                    return false;
                }
            },
            (None, None) => return false,
        };

        if !ctx.capture {
            return regex.is_match(value);
        }
        let Some(caps) = regex.captures(value) else {
            return false;
        };
        for (i, group) in caps.iter().take(MAX_CAPTURES).enumerate() {
            if let Some(g) = group {
                ctx.capture_field(i, g.as_str());
            }
        }
        true
    }

    fn name(&self) -> &'static str {
        "rx"
    }
}

/// Phrase match operator (`@pm`, `@pmFromFile`, `@pmFromDataset`).
///
/// Case-insensitive, leftmost-longest. Up to ten hits are captured.
pub struct PmOperator {
    name: &'static str,
    automaton: Arc<AhoCorasick>,
}

impl PmOperator {
    fn build(name: &'static str, patterns: Vec<String>) -> Result<Self> {
        if patterns.is_empty() {
            return Err(Error::PatternSet {
                message: format!("@{}: empty pattern list", name),
            });
        }
        let automaton = cache::phrases(&patterns).map_err(|e| Error::PatternSet {
            message: e.to_string(),
        })?;
        Ok(Self { name, automaton })
    }

    /// Space-separated phrases.
    pub fn new(patterns: &str) -> Result<Self> {
        Self::build("pm", patterns.split_whitespace().map(str::to_string).collect())
    }

    /// One phrase per line from one or more space-separated files.
    pub fn from_file(opts: &OperatorOptions) -> Result<Self> {
        let mut patterns = Vec::new();
        for file in opts.argument.split_whitespace() {
            let path = opts.resolve_path(file);
            let content = std::fs::read_to_string(&path)
                .map_err(|source| Error::RuleFileLoad { path, source })?;
            patterns.extend(data_lines(&content).map(str::to_string));
        }
        Self::build("pmFromFile", patterns)
    }

    /// Phrases from a `SecDataset`.
    pub fn from_dataset(opts: &OperatorOptions) -> Result<Self> {
        let name = opts.argument.trim();
        let items = opts
            .datasets
            .get(name)
            .ok_or_else(|| Error::InvalidOperatorArgument {
                operator: "pmFromDataset".to_string(),
                message: format!("unknown dataset '{}'", name),
            })?;
        Self::build("pmFromDataset", items.clone())
    }
}

/// Non-empty, non-comment lines of a data file.
pub(crate) fn data_lines(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
}

impl Operator for PmOperator {
    fn evaluate(&self, ctx: &mut OperatorContext<'_>, value: &str) -> bool {
        if !ctx.capture {
            return self.automaton.is_match(value);
        }
        let mut found = false;
        for (i, m) in self.automaton.find_iter(value).take(MAX_CAPTURES).enumerate() {
            ctx.capture_field(i, &value[m.start()..m.end()]);
            found = true;
        }
        found
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// REST path templating (`@restpath /api/{id}/items/{name}`).
///
/// On match every `{name}` segment is stored in `ARGS_PATH`.
pub struct RestPathOperator {
    regex: Regex,
    names: Vec<String>,
}

impl RestPathOperator {
    /// Compile a path template.
    pub fn new(template: &str) -> Result<Self> {
        let mut pattern = String::from("^");
        let mut names = Vec::new();
        let mut rest = template.trim();
        while let Some(open) = rest.find('{') {
            let close = rest[open..].find('}').map(|c| open + c).ok_or_else(|| {
                Error::InvalidOperatorArgument {
                    operator: "restpath".to_string(),
                    message: format!("unterminated parameter in '{}'", template),
                }
            })?;
            pattern.push_str(&regex::escape(&rest[..open]));
            let name = &rest[open + 1..close];
            if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return Err(Error::InvalidOperatorArgument {
                    operator: "restpath".to_string(),
                    message: format!("invalid parameter name '{}'", name),
                });
            }
            pattern.push_str(&format!("(?P<{}>[^/?]+)", name));
            names.push(name.to_string());
            rest = &rest[close + 1..];
        }
        pattern.push_str(&regex::escape(rest));
        pattern.push_str("/?$");
        Ok(Self {
            regex: compile_regex(&pattern)?,
            names,
        })
    }
}

impl Operator for RestPathOperator {
    fn evaluate(&self, ctx: &mut OperatorContext<'_>, value: &str) -> bool {
        let Some(caps) = self.regex.captures(value) else {
            return false;
        };
        let args = ctx.variables.map_mut(VariableName::ArgsPath);
        for name in &self.names {
            if let Some(m) = caps.name(name) {
                args.set_one(name.clone(), m.as_str());
            }
        }
        true
    }

    fn name(&self) -> &'static str {
        "restpath"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::traits::testing::{eval, eval_with};
    use crate::variables::TransactionVariables;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_rx_simple() {
        let op = RxOperator::new("^admin").unwrap();
        assert!(eval(&op, "admin"));
        assert!(!eval(&op, "user"));
    }

    #[test]
    fn test_rx_dotall() {
        let op = RxOperator::new("a.b").unwrap();
        assert!(eval(&op, "a\nb"));
        let op = RxOperator::new("^b").unwrap();
        assert!(!eval(&op, "a\nb"));
        let op = RxOperator::new("(?m)^b").unwrap();
        assert!(eval(&op, "a\nb"));
    }

    #[test]
    fn test_rx_captures() {
        let mut vars = TransactionVariables::new();
        let op = RxOperator::new(r"user=(\w+)&id=(\d+)").unwrap();
        assert!(eval_with(&op, &mut vars, "user=john&id=7", true));
        assert_eq!(vars.tx().first("0"), Some("user=john&id=7"));
        assert_eq!(vars.tx().first("1"), Some("john"));
        assert_eq!(vars.tx().first("2"), Some("7"));
    }

    #[test]
    fn test_rx_captures_truncated_to_ten() {
        let mut vars = TransactionVariables::new();
        let pattern = "(a)".repeat(12);
        let op = RxOperator::new(&pattern).unwrap();
        assert!(eval_with(&op, &mut vars, &"a".repeat(12), true));
        assert!(vars.tx().contains_key("9"));
        assert!(!vars.tx().contains_key("10"));
    }

    #[test]
    fn test_rx_macro_pattern() {
        let mut vars = TransactionVariables::new();
        vars.tx_mut().set_one("word", "secret");
        let op = RxOperator::new("^%{tx.word}$").unwrap();
        assert!(eval_with(&op, &mut vars, "secret", false));
        assert!(!eval_with(&op, &mut vars, "public", false));
    }

    #[test]
    fn test_rx_invalid() {
        assert!(matches!(RxOperator::new("(oops"), Err(Error::RegexCompile { .. })));
    }

    #[test]
    fn test_pm_case_insensitive_longest() {
        let mut vars = TransactionVariables::new();
        let op = PmOperator::new("admin administrator root").unwrap();
        assert!(eval_with(&op, &mut vars, "the ADMINISTRATOR and root", true));
        assert_eq!(vars.tx().first("0"), Some("ADMINISTRATOR"));
        assert_eq!(vars.tx().first("1"), Some("root"));
        assert!(!eval(&op, "guest"));
    }

    #[test]
    fn test_pm_from_file_and_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("words.data")).unwrap();
        writeln!(file, "# comment\nbad phrase\n\nworse").unwrap();

        let opts = OperatorOptions {
            argument: "words.data".to_string(),
            root: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let op = PmOperator::from_file(&opts).unwrap();
        assert!(eval(&op, "a BAD PHRASE here"));
        assert!(!eval(&op, "bad"));

        let mut datasets = HashMap::new();
        datasets.insert("agents".to_string(), vec!["nikto".to_string()]);
        let opts = OperatorOptions {
            argument: "agents".to_string(),
            datasets: Arc::new(datasets),
            ..Default::default()
        };
        assert!(eval(&PmOperator::from_dataset(&opts).unwrap(), "Nikto/2.1"));
        let missing = OperatorOptions::new("nope");
        assert!(PmOperator::from_dataset(&missing).is_err());
    }

    #[test]
    fn test_pm_from_missing_file() {
        let opts = OperatorOptions::new("/definitely/not/here.data");
        assert!(matches!(PmOperator::from_file(&opts), Err(Error::RuleFileLoad { .. })));
    }

    #[test]
    fn test_restpath() {
        let mut vars = TransactionVariables::new();
        let op = RestPathOperator::new("/api/{id}/items/{name}").unwrap();
        assert!(eval_with(&op, &mut vars, "/api/42/items/book", false));
        assert_eq!(vars.map(VariableName::ArgsPath).first("id"), Some("42"));
        assert_eq!(vars.map(VariableName::ArgsPath).first("name"), Some("book"));

        let mut vars = TransactionVariables::new();
        assert!(!eval_with(&op, &mut vars, "/api/42/other/book", false));
        assert!(vars.map(VariableName::ArgsPath).is_empty());
    }
}
