//! Rule targets: a variable plus an optional key selection.

use super::name::VariableName;
use regex::Regex;

/// Key selection on a collection variable.
#[derive(Debug, Clone)]
pub enum Selection {
    /// Exact key (`ARGS:foo`), compared case-insensitively.
    Key(String),
    /// Keys matching a regex (`ARGS:/^user/`).
    Regex(Regex),
}

impl Selection {
    /// Whether `key` is selected.
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Selection::Key(k) => k.eq_ignore_ascii_case(key),
            Selection::Regex(re) => re.is_match(key),
        }
    }
}

impl std::fmt::Display for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selection::Key(k) => f.write_str(k),
            Selection::Regex(re) => {
                let pattern = re.as_str();
                write!(f, "/{}/", pattern.strip_prefix("(?i)").unwrap_or(pattern))
            }
        }
    }
}

/// A variable reference in a rule's target list.
#[derive(Debug, Clone)]
pub struct VariableSpec {
    /// The variable name.
    pub name: VariableName,
    /// Optional key selection.
    pub selection: Option<Selection>,
    /// Count mode (`&` prefix).
    pub count_mode: bool,
    /// Keys removed with `!NAME:key`.
    pub exclusions: Vec<Selection>,
}

impl VariableSpec {
    /// Target the whole variable.
    pub fn new(name: VariableName) -> Self {
        Self {
            name,
            selection: None,
            count_mode: false,
            exclusions: Vec::new(),
        }
    }

    /// Target one key of the variable.
    pub fn with_key(name: VariableName, key: impl Into<String>) -> Self {
        Self {
            selection: Some(Selection::Key(key.into())),
            ..Self::new(name)
        }
    }

    /// Whether `key` was excluded from this target.
    pub fn is_excluded(&self, key: &str) -> bool {
        self.exclusions.iter().any(|e| e.matches(key))
    }
}

impl std::fmt::Display for VariableSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count_mode {
            f.write_str("&")?;
        }
        f.write_str(self.name.name())?;
        if let Some(sel) = &self.selection {
            write!(f, ":{}", sel)?;
        }
        for excl in &self.exclusions {
            write!(f, "|!{}:{}", self.name.name(), excl)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_matches() {
        assert!(Selection::Key("Host".into()).matches("host"));
        let re = Selection::Regex(Regex::new("(?i)^user").unwrap());
        assert!(re.matches("USERNAME"));
        assert!(!re.matches("name"));
    }

    #[test]
    fn test_display() {
        let mut spec = VariableSpec::with_key(VariableName::Args, "id");
        spec.count_mode = true;
        assert_eq!(spec.to_string(), "&ARGS:id");

        let mut spec = VariableSpec::new(VariableName::RequestHeaders);
        spec.exclusions.push(Selection::Key("Cookie".into()));
        assert_eq!(spec.to_string(), "REQUEST_HEADERS|!REQUEST_HEADERS:Cookie");
        assert!(spec.is_excluded("cookie"));
    }
}
