//! Target list parsing for SecRule (`ARGS|!ARGS:foo|&REQUEST_HEADERS:/^x-/`).

use crate::error::{Error, Result};
use crate::variables::{Selection, VariableName, VariableSpec};
use regex::RegexBuilder;

/// Parse a `|`-separated target list.
///
/// `!NAME:key` entries remove keys from the earlier target of the same
/// variable; they never add a target of their own.
pub fn parse_variables(input: &str) -> Result<Vec<VariableSpec>> {
    let mut variables: Vec<VariableSpec> = Vec::new();

    for part in split_targets(input) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some(excl) = part.strip_prefix('!') {
            let spec = parse_variable(excl)?;
            let selection = spec.selection.ok_or_else(|| {
                Error::parse(format!("exclusion needs a key: {}", part), input)
            })?;
            match variables.iter_mut().rev().find(|v| v.name == spec.name) {
                Some(target) => target.exclusions.push(selection),
                None => {
                    return Err(Error::parse(
                        format!("exclusion without a matching target: {}", part),
                        input,
                    ))
                }
            }
            continue;
        }

        variables.push(parse_variable(part)?);
    }

    Ok(variables)
}

/// Parse one target (`&NAME:selector`).
pub fn parse_variable(input: &str) -> Result<VariableSpec> {
    let input = input.trim();

    let (count_mode, input) = match input.strip_prefix('&') {
        Some(rest) => (true, rest),
        None => (false, input),
    };

    let (name_str, selection) = match input.find(':') {
        Some(pos) => (&input[..pos], Some(parse_selection(&input[pos + 1..])?)),
        None => (input, None),
    };

    let name = VariableName::from_name(name_str).ok_or_else(|| Error::UnknownVariable {
        name: name_str.to_string(),
    })?;

    if selection.is_some() && !name.is_collection() {
        return Err(Error::parse(
            format!("{} is not a collection and takes no key", name),
            input,
        ));
    }

    Ok(VariableSpec {
        name,
        selection,
        count_mode,
        exclusions: Vec::new(),
    })
}

fn parse_selection(sel: &str) -> Result<Selection> {
    let sel = sel.trim().trim_matches('\'');
    if sel.len() >= 2 && sel.starts_with('/') && sel.ends_with('/') {
        let pattern = &sel[1..sel.len() - 1];
        let re = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| Error::RegexCompile {
                pattern: pattern.to_string(),
                source,
            })?;
        return Ok(Selection::Regex(re));
    }
    Ok(Selection::Key(sel.to_string()))
}

/// Split on `|` outside of `/regex/` selectors.
pub(crate) fn split_targets(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_regex = false;
    let mut prev = '\0';
    for (i, c) in input.char_indices() {
        match c {
            '/' if prev == ':' => in_regex = true,
            '/' if in_regex && prev != '\\' => in_regex = false,
            '|' if !in_regex => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        prev = c;
    }
    parts.push(&input[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_variable() {
        let vars = parse_variables("REQUEST_URI").unwrap();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].name, VariableName::RequestUri);
        assert!(vars[0].selection.is_none());
        assert!(!vars[0].count_mode);
    }

    #[test]
    fn test_parse_variable_with_selection() {
        let vars = parse_variables("ARGS:username").unwrap();
        assert_eq!(vars[0].name, VariableName::Args);
        assert!(matches!(&vars[0].selection, Some(Selection::Key(k)) if k == "username"));
    }

    #[test]
    fn test_parse_variable_with_regex() {
        let vars = parse_variables(r"ARGS_POST:/json\.\d+\.name/").unwrap();
        assert_eq!(vars.len(), 1);
        let Some(Selection::Regex(re)) = &vars[0].selection else {
            panic!("expected regex selection");
        };
        assert!(re.is_match("json.1.name"));
        assert!(re.is_match("JSON.0.NAME"));
    }

    #[test]
    fn test_regex_may_contain_pipe() {
        let vars = parse_variables("ARGS:/^(a|b)$/|REQUEST_URI").unwrap();
        assert_eq!(vars.len(), 2);
        assert_eq!(vars[1].name, VariableName::RequestUri);
    }

    #[test]
    fn test_parse_count_mode() {
        let vars = parse_variables("&ARGS").unwrap();
        assert!(vars[0].count_mode);
    }

    #[test]
    fn test_parse_multiple_variables() {
        let vars = parse_variables("REQUEST_URI|ARGS|REQUEST_HEADERS").unwrap();
        assert_eq!(vars.len(), 3);
    }

    #[test]
    fn test_exclusion_attaches_to_target() {
        let vars = parse_variables("ARGS|REQUEST_HEADERS|!ARGS:password").unwrap();
        assert_eq!(vars.len(), 2);
        assert!(vars[0].is_excluded("PASSWORD"));
        assert!(vars[1].exclusions.is_empty());
        assert!(parse_variables("ARGS|!REQUEST_HEADERS:host").is_err());
    }

    #[test]
    fn test_unknown_and_invalid() {
        assert!(matches!(
            parse_variables("NOT_A_VAR"),
            Err(Error::UnknownVariable { .. })
        ));
        assert!(parse_variables("REQUEST_METHOD:x").is_err());
    }
}
