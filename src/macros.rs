//! `%{VAR}` / `%{VAR.key}` macro expansion.
//!
//! Macros are compiled once when a rule is built and expanded against the
//! transaction variables each time an action or operator argument needs
//! them. Expansion is a single left-to-right pass; expanded text is never
//! re-scanned.

use crate::variables::{TransactionVariables, VariableName};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Variable {
        name: VariableName,
        key: Option<String>,
    },
}

/// A compiled macro string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Macro {
    raw: String,
    tokens: Vec<Token>,
}

impl Macro {
    /// Compile `input`. Unknown variables and unterminated `%{` are kept as
    /// literal text; compilation never fails.
    pub fn compile(input: &str) -> Self {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut rest = input;

        while let Some(start) = rest.find("%{") {
            let after = &rest[start + 2..];
            let Some((end, nested)) = closing_brace(after) else {
                break;
            };
            literal.push_str(&rest[..start]);
            let body = &after[..end];
            let reference = if nested { None } else { parse_reference(body) };
            match reference {
                Some((name, key)) => {
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(Token::Variable { name, key });
                }
                None => {
                    literal.push_str(&rest[start..start + 2 + end + 1]);
                }
            }
            rest = &after[end + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        Self {
            raw: input.to_string(),
            tokens,
        }
    }

    /// Whether the string contains at least one variable reference.
    pub fn is_dynamic(&self) -> bool {
        self.tokens.iter().any(|t| matches!(t, Token::Variable { .. }))
    }

    /// The uncompiled text.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Expand against `vars`. A known variable with no value expands to "".
    pub fn expand(&self, vars: &TransactionVariables) -> String {
        if !self.is_dynamic() {
            return self.raw.clone();
        }
        let mut out = String::with_capacity(self.raw.len());
        for token in &self.tokens {
            match token {
                Token::Literal(s) => out.push_str(s),
                Token::Variable { name, key: None } => {
                    out.push_str(&vars.value(*name).unwrap_or_default())
                }
                Token::Variable {
                    name,
                    key: Some(key),
                } => out.push_str(&vars.value_of(*name, key).unwrap_or_default()),
            }
        }
        out
    }
}

impl std::fmt::Display for Macro {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Offset of the `}` closing a reference body, and whether the body holds
/// another `%{`. Nested references pair up their braces.
fn closing_brace(body: &str) -> Option<(usize, bool)> {
    let bytes = body.as_bytes();
    let mut depth = 1usize;
    let mut nested = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if bytes.get(i + 1) == Some(&b'{') => {
                depth += 1;
                nested = true;
                i += 2;
                continue;
            }
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some((i, nested));
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// `VAR`, `VAR.key` or `VAR:key`.
fn parse_reference(body: &str) -> Option<(VariableName, Option<String>)> {
    let body = body.trim();
    let (name, key) = match body.find(&['.', ':'][..]) {
        Some(pos) => (&body[..pos], Some(&body[pos + 1..])),
        None => (body, None),
    };
    let name = VariableName::from_name(name)?;
    match key {
        Some(k) if k.is_empty() => None,
        Some(k) => Some((name, Some(k.to_string()))),
        None => Some((name, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> TransactionVariables {
        let mut vars = TransactionVariables::new();
        vars.tx_mut().set_one("x", "42");
        vars.tx_mut().set_one("anomaly_score", "5");
        vars.set(VariableName::RemoteAddr, "10.0.0.1");
        vars
    }

    #[test]
    fn test_expand_one_pass() {
        let m = Macro::compile("a%{TX.x}b");
        assert!(m.is_dynamic());
        assert_eq!(m.expand(&vars()), "a42b");
    }

    #[test]
    fn test_expand_single_and_case() {
        assert_eq!(Macro::compile("ip=%{remote_addr}").expand(&vars()), "ip=10.0.0.1");
        assert_eq!(Macro::compile("%{tx.ANOMALY_SCORE}").expand(&vars()), "5");
    }

    #[test]
    fn test_unknown_stays_literal() {
        let m = Macro::compile("%{NOPE.x} and %{unterminated");
        assert!(!m.is_dynamic());
        assert_eq!(m.expand(&vars()), "%{NOPE.x} and %{unterminated");
    }

    #[test]
    fn test_nested_reference_stays_literal() {
        let m = Macro::compile("a%{TX.%{TX.x}}b");
        assert!(!m.is_dynamic());
        assert_eq!(m.expand(&vars()), "a%{TX.%{TX.x}}b");
        assert_eq!(Macro::compile("%{TX.%{TX.x}}-%{TX.x}").expand(&vars()), "%{TX.%{TX.x}}-42");
        assert_eq!(Macro::compile("%{TX.%{TX.x}").expand(&vars()), "%{TX.%{TX.x}");
    }

    #[test]
    fn test_missing_value_is_empty() {
        assert_eq!(Macro::compile("[%{TX.missing}]").expand(&vars()), "[]");
    }

    #[test]
    fn test_expanded_text_not_rescanned() {
        let mut v = vars();
        v.tx_mut().set_one("loop", "%{TX.x}");
        assert_eq!(Macro::compile("%{TX.loop}").expand(&v), "%{TX.x}");
    }
}
