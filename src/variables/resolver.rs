//! Variable resolution: turn a [`VariableSpec`] into `(variable, key, value)`
//! triples.

use super::collection::Map;
use super::name::{VariableKind, VariableName};
use super::selector::{Selection, VariableSpec};
use super::store::TransactionVariables;

/// One resolved value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchData {
    /// Variable the value came from.
    pub variable: VariableName,
    /// Key inside the collection, empty for single variables.
    pub key: String,
    /// The value.
    pub value: String,
}

impl MatchData {
    /// `NAME:key`, or `NAME` when there is no key.
    pub fn full_name(&self) -> String {
        if self.key.is_empty() {
            self.variable.name().to_string()
        } else {
            format!("{}:{}", self.variable.name(), self.key)
        }
    }
}

/// Resolve a target against the transaction variables.
///
/// Values are returned in declaration order: maps in key insertion order,
/// views in the order of their parts.
pub fn resolve(vars: &TransactionVariables, spec: &VariableSpec) -> Vec<MatchData> {
    let name = spec.name;
    let mut out = Vec::new();

    match name.kind() {
        VariableKind::Single => {
            if let Some(v) = vars.get(name) {
                out.push(single(name, v.to_string()));
            }
        }
        VariableKind::Computed => out.push(single(name, vars.computed(name))),
        VariableKind::Map => select_map(vars.map(name), name, spec.selection.as_ref(), &mut out),
        VariableKind::Concat(parts) => {
            for part in parts {
                select_map(vars.map(*part), name, spec.selection.as_ref(), &mut out);
            }
        }
        VariableKind::Names(parts) => {
            for part in parts {
                for key in vars.map(*part).keys() {
                    if spec.selection.as_ref().map_or(true, |s| s.matches(key)) {
                        out.push(MatchData {
                            variable: name,
                            key: key.to_string(),
                            value: key.to_string(),
                        });
                    }
                }
            }
        }
    }

    if !spec.exclusions.is_empty() {
        out.retain(|m| !spec.is_excluded(&m.key));
    }

    if spec.count_mode {
        let key = match &spec.selection {
            Some(Selection::Key(k)) => k.clone(),
            _ => String::new(),
        };
        return vec![MatchData {
            variable: name,
            key,
            value: out.len().to_string(),
        }];
    }

    out
}

fn single(variable: VariableName, value: String) -> MatchData {
    MatchData {
        variable,
        key: String::new(),
        value,
    }
}

fn select_map(map: &Map, variable: VariableName, selection: Option<&Selection>, out: &mut Vec<MatchData>) {
    let push = |out: &mut Vec<MatchData>, (k, v): (&str, &str)| {
        out.push(MatchData {
            variable,
            key: k.to_string(),
            value: v.to_string(),
        })
    };
    match selection {
        None => map.iter().for_each(|kv| push(out, kv)),
        Some(Selection::Key(key)) => {
            // Keep the stored casing of the key for MATCHED_VAR_NAME.
            let stored = map
                .keys()
                .find(|k| k.eq_ignore_ascii_case(key))
                .unwrap_or(key.as_str());
            for v in map.get(key) {
                push(out, (stored, v));
            }
        }
        Some(Selection::Regex(re)) => map.find_regex(re).for_each(|kv| push(out, kv)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn vars() -> TransactionVariables {
        let mut vars = TransactionVariables::new();
        vars.set(VariableName::RequestMethod, "POST");
        vars.map_mut(VariableName::ArgsGet).add("id", "0");
        vars.map_mut(VariableName::ArgsGet).add("user_name", "bob");
        vars.map_mut(VariableName::ArgsPost).add("user_pass", "secret");
        vars.map_mut(VariableName::RequestHeaders).add("Host", "example.com");
        vars
    }

    #[test]
    fn test_single() {
        let found = resolve(&vars(), &VariableSpec::new(VariableName::RequestMethod));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, "POST");
        assert_eq!(found[0].full_name(), "REQUEST_METHOD");

        let found = resolve(&vars(), &VariableSpec::new(VariableName::RequestBody));
        assert!(found.is_empty());
    }

    #[test]
    fn test_concat_view() {
        let found = resolve(&vars(), &VariableSpec::new(VariableName::Args));
        let names: Vec<_> = found.iter().map(|m| m.full_name()).collect();
        assert_eq!(names, vec!["ARGS:id", "ARGS:user_name", "ARGS:user_pass"]);
    }

    #[test]
    fn test_key_and_regex_selection() {
        let found = resolve(&vars(), &VariableSpec::with_key(VariableName::RequestHeaders, "HOST"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].full_name(), "REQUEST_HEADERS:Host");

        let mut spec = VariableSpec::new(VariableName::Args);
        spec.selection = Some(Selection::Regex(Regex::new("(?i)^user_").unwrap()));
        let found = resolve(&vars(), &spec);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_names_view_and_exclusion() {
        let mut spec = VariableSpec::new(VariableName::ArgsNames);
        spec.exclusions.push(Selection::Key("id".into()));
        let found = resolve(&vars(), &spec);
        let values: Vec<_> = found.iter().map(|m| m.value.as_str()).collect();
        assert_eq!(values, vec!["user_name", "user_pass"]);
    }

    #[test]
    fn test_count_mode() {
        let mut spec = VariableSpec::new(VariableName::Args);
        spec.count_mode = true;
        let found = resolve(&vars(), &spec);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, "3");

        let mut spec = VariableSpec::with_key(VariableName::Args, "missing");
        spec.count_mode = true;
        assert_eq!(resolve(&vars(), &spec)[0].value, "0");
    }
}
