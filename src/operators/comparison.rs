//! String and numeric comparison operators.
//!
//! Arguments may contain macros (`@streq %{TX.expected}`); they are expanded
//! against the transaction on each evaluation.

use super::traits::{Operator, OperatorContext};
use crate::macros::Macro;
use memchr::memmem;

/// How a string operator compares the value with its argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringMatch {
    /// `@beginsWith`
    BeginsWith,
    /// `@endsWith`
    EndsWith,
    /// `@contains`
    Contains,
    /// `@containsWord`
    ContainsWord,
    /// `@streq`
    Equals,
    /// `@strmatch`
    StrMatch,
    /// `@within`: the argument contains the value.
    Within,
}

impl StringMatch {
    fn name(&self) -> &'static str {
        match self {
            StringMatch::BeginsWith => "beginsWith",
            StringMatch::EndsWith => "endsWith",
            StringMatch::Contains => "contains",
            StringMatch::ContainsWord => "containsWord",
            StringMatch::Equals => "streq",
            StringMatch::StrMatch => "strmatch",
            StringMatch::Within => "within",
        }
    }
}

/// A string comparison operator.
pub struct StringOperator {
    kind: StringMatch,
    argument: Macro,
}

impl StringOperator {
    /// Create a string operator.
    pub fn new(kind: StringMatch, argument: &str) -> Self {
        Self {
            kind,
            argument: Macro::compile(argument),
        }
    }
}

fn contains_word(haystack: &str, word: &str) -> bool {
    if word.is_empty() {
        return true;
    }
    let is_word = |c: Option<char>| c.map_or(false, |c| c.is_alphanumeric() || c == '_');
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(word) {
        let at = start + pos;
        let end = at + word.len();
        let before = haystack[..at].chars().next_back();
        let after = haystack[end..].chars().next();
        if !is_word(before) && !is_word(after) {
            return true;
        }
        start = at + word.chars().next().map_or(1, char::len_utf8);
    }
    false
}

impl Operator for StringOperator {
    fn evaluate(&self, ctx: &mut OperatorContext<'_>, value: &str) -> bool {
        let arg = self.argument.expand(ctx.variables);
        let matched = match self.kind {
            StringMatch::BeginsWith => value.starts_with(arg.as_str()),
            StringMatch::EndsWith => value.ends_with(arg.as_str()),
            StringMatch::Contains => value.contains(arg.as_str()),
            StringMatch::ContainsWord => contains_word(value, &arg),
            StringMatch::Equals => value == arg,
            StringMatch::StrMatch => memmem::find(value.as_bytes(), arg.as_bytes()).is_some(),
            StringMatch::Within => arg.contains(value),
        };
        if matched {
            let captured = if self.kind == StringMatch::Within { value } else { arg.as_str() };
            ctx.capture_field(0, captured);
        }
        matched
    }

    fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Numeric relation tested by a [`NumericOperator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// `@eq`
    Eq,
    /// `@ne`
    Ne,
    /// `@gt`
    Gt,
    /// `@ge`
    Ge,
    /// `@lt`
    Lt,
    /// `@le`
    Le,
}

/// Numeric comparison; unparseable numbers count as 0.
pub struct NumericOperator {
    comparison: Comparison,
    argument: Macro,
}

impl NumericOperator {
    /// Create a numeric operator.
    pub fn new(comparison: Comparison, argument: &str) -> Self {
        Self {
            comparison,
            argument: Macro::compile(argument),
        }
    }
}

fn to_int(s: &str) -> i64 {
    s.trim().parse().unwrap_or(0)
}

impl Operator for NumericOperator {
    fn evaluate(&self, ctx: &mut OperatorContext<'_>, value: &str) -> bool {
        let expected = to_int(&self.argument.expand(ctx.variables));
        let actual = to_int(value);
        match self.comparison {
            Comparison::Eq => actual == expected,
            Comparison::Ne => actual != expected,
            Comparison::Gt => actual > expected,
            Comparison::Ge => actual >= expected,
            Comparison::Lt => actual < expected,
            Comparison::Le => actual <= expected,
        }
    }

    fn name(&self) -> &'static str {
        match self.comparison {
            Comparison::Eq => "eq",
            Comparison::Ne => "ne",
            Comparison::Gt => "gt",
            Comparison::Ge => "ge",
            Comparison::Lt => "lt",
            Comparison::Le => "le",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::traits::testing::{eval, eval_with};
    use crate::variables::TransactionVariables;

    #[test]
    fn test_string_operators() {
        assert!(eval(&StringOperator::new(StringMatch::BeginsWith, "/admin"), "/admin/x"));
        assert!(!eval(&StringOperator::new(StringMatch::EndsWith, ".php"), "a.phps"));
        assert!(eval(&StringOperator::new(StringMatch::Contains, "select"), "1 select 2"));
        assert!(eval(&StringOperator::new(StringMatch::Equals, "POST"), "POST"));
        assert!(!eval(&StringOperator::new(StringMatch::Equals, "POST"), "post"));
        assert!(eval(&StringOperator::new(StringMatch::StrMatch, "WebZIP"), "agent WebZIP/1"));
    }

    #[test]
    fn test_contains_word() {
        let op = StringOperator::new(StringMatch::ContainsWord, "select");
        assert!(eval(&op, "1 select 2"));
        assert!(eval(&op, "select"));
        assert!(!eval(&op, "selection"));
        assert!(eval(&op, "selection or select"));
    }

    #[test]
    fn test_within_checks_argument() {
        let op = StringOperator::new(StringMatch::Within, "GET POST HEAD");
        assert!(eval(&op, "POST"));
        assert!(!eval(&op, "DELETE"));
    }

    #[test]
    fn test_macro_argument_and_capture() {
        let mut vars = TransactionVariables::new();
        vars.tx_mut().set_one("expected", "evil.example");
        let op = StringOperator::new(StringMatch::Equals, "%{tx.expected}");
        assert!(eval_with(&op, &mut vars, "evil.example", true));
        assert_eq!(vars.tx().first("0"), Some("evil.example"));
        assert!(!eval_with(&op, &mut vars, "good.example", true));
    }

    #[test]
    fn test_numeric_operators() {
        assert!(eval(&NumericOperator::new(Comparison::Eq, "0"), "0"));
        assert!(eval(&NumericOperator::new(Comparison::Eq, "0"), "abc"));
        assert!(eval(&NumericOperator::new(Comparison::Gt, "5"), "10"));
        assert!(!eval(&NumericOperator::new(Comparison::Lt, "5"), "10"));
        assert!(eval(&NumericOperator::new(Comparison::Ge, "10"), " 10 "));
        assert!(eval(&NumericOperator::new(Comparison::Le, "-1"), "-3"));
        assert!(eval(&NumericOperator::new(Comparison::Ne, "1"), "2"));
    }

    #[test]
    fn test_numeric_macro() {
        let mut vars = TransactionVariables::new();
        vars.tx_mut().set_one("threshold", "5");
        let op = NumericOperator::new(Comparison::Ge, "%{tx.threshold}");
        assert!(eval_with(&op, &mut vars, "7", false));
        assert!(!eval_with(&op, &mut vars, "4", false));
    }
}
