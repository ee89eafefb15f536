//! Operator parsing for SecRule.
//!
//! The operator name is kept as text; it is resolved through the operator
//! registry when the rule is compiled, which is what lets plug-in
//! operators work without parser changes.

use crate::error::{Error, Result};

/// An operator specification in a SecRule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorSpec {
    /// Whether the operator is negated (! prefix).
    pub negated: bool,
    /// Operator name without `@`, lowercased.
    pub name: String,
    /// The operator argument.
    pub argument: String,
}

impl std::fmt::Display for OperatorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.negated {
            f.write_str("!")?;
        }
        write!(f, "@{}", self.name)?;
        if !self.argument.is_empty() {
            write!(f, " {}", self.argument)?;
        }
        Ok(())
    }
}

/// Parse an operator string (e.g., "@rx pattern", "!@contains foo").
///
/// A string without `@` is an implicit `@rx`.
pub fn parse_operator(input: &str) -> Result<OperatorSpec> {
    let input = input.trim();
    let bytes = input.as_bytes();

    let (negated, input) = if bytes.first() == Some(&b'!') {
        (true, input[1..].trim_start())
    } else {
        (false, input)
    };

    let Some(rest) = input.strip_prefix('@') else {
        return Ok(OperatorSpec {
            negated,
            name: "rx".to_string(),
            argument: input.to_string(),
        });
    };

    let space_pos = rest.bytes().position(|b| b.is_ascii_whitespace());
    let (name, argument) = match space_pos {
        Some(pos) => (&rest[..pos], rest[pos..].trim_start().to_string()),
        None => (rest, String::new()),
    };

    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::UnknownOperator {
            name: name.to_string(),
        });
    }

    Ok(OperatorSpec {
        negated,
        name: name.to_ascii_lowercase(),
        argument,
    })
}
