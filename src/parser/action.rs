//! Action list parsing for SecRule, SecAction and SecDefaultAction.
//!
//! The parser only splits the list into `name[:argument]` pairs. Names are
//! resolved against the action registry when the rule is compiled, so
//! plug-in actions need no parser support.

use crate::error::{Error, Result};

/// One `name[:argument]` entry of an action list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAction {
    /// Action name as written.
    pub name: String,
    /// Argument with surrounding quotes removed.
    pub argument: Option<String>,
}

impl RawAction {
    /// Create an action entry.
    pub fn new(name: impl Into<String>, argument: Option<&str>) -> Self {
        Self {
            name: name.into(),
            argument: argument.map(str::to_string),
        }
    }

    /// Lowercase name, the registry key.
    pub fn key(&self) -> String {
        self.name.to_ascii_lowercase()
    }

    /// Argument or "".
    pub fn arg(&self) -> &str {
        self.argument.as_deref().unwrap_or("")
    }
}

impl std::fmt::Display for RawAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.argument {
            Some(arg) if arg.contains([',', ' ']) => write!(f, "{}:'{}'", self.name, arg),
            Some(arg) => write!(f, "{}:{}", self.name, arg),
            None => f.write_str(&self.name),
        }
    }
}

/// Parse a comma-separated action list.
///
/// Commas inside quotes or parentheses do not split.
pub fn parse_actions(input: &str) -> Result<Vec<RawAction>> {
    let mut actions = Vec::new();
    let mut chars = input.chars().peekable();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quote_char = '"';
    let mut paren_depth: u32 = 0;

    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' if !in_quotes => {
                in_quotes = true;
                quote_char = c;
                current.push(c);
            }
            c if in_quotes && c == quote_char => {
                in_quotes = false;
                current.push(c);
            }
            '(' if !in_quotes => {
                paren_depth += 1;
                current.push(c);
            }
            ')' if !in_quotes => {
                paren_depth = paren_depth.saturating_sub(1);
                current.push(c);
            }
            ',' if !in_quotes && paren_depth == 0 => {
                if !current.trim().is_empty() {
                    actions.push(parse_single_action(current.trim())?);
                }
                current.clear();
            }
            _ => {
                current.push(c);
            }
        }
    }

    if in_quotes {
        return Err(Error::parse(
            format!("unterminated quote in action list: {}", input),
            "actions",
        ));
    }

    if !current.trim().is_empty() {
        actions.push(parse_single_action(current.trim())?);
    }

    Ok(actions)
}

/// Parse `name` or `name:argument`.
fn parse_single_action(input: &str) -> Result<RawAction> {
    let (name, argument) = match input.find(':') {
        Some(pos) => (input[..pos].trim(), Some(unquote(input[pos + 1..].trim()))),
        None => (input.trim(), None),
    };

    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::parse(format!("invalid action name: '{}'", name), input));
    }

    Ok(RawAction::new(name, argument))
}

/// Strip one pair of matching surrounding quotes.
fn unquote(s: &str) -> &str {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' || first == b'"') && first == last {
            return &s[1..s.len() - 1];
        }
    }
    s
}
