//! Compiled rules and rule removal.

use crate::actions::{RuleAction, RuleMetadata};
use crate::operators::Operator;
use crate::transformations::TransformationPipeline;
use crate::variables::VariableSpec;
use regex::Regex;
use std::ops::RangeInclusive;
use std::sync::Arc;

/// The operator of a compiled rule.
#[derive(Clone)]
pub struct RuleOperator {
    /// Built operator.
    pub operator: Arc<dyn Operator>,
    /// Whether the result is inverted (`!@rx`).
    pub negated: bool,
    /// Operator name as registered.
    pub name: String,
    /// Operator argument as written.
    pub argument: String,
}

impl std::fmt::Debug for RuleOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{} {}",
            if self.negated { "!" } else { "" },
            self.name,
            self.argument
        )
    }
}

/// A compiled rule in the ruleset arena.
pub struct Rule {
    /// Compile-time metadata.
    pub metadata: Arc<RuleMetadata>,
    /// Targets in declaration order.
    pub targets: Vec<VariableSpec>,
    /// Transformations applied to every value.
    pub transformations: TransformationPipeline,
    /// `None` for SecAction and SecMarker.
    pub operator: Option<RuleOperator>,
    /// Runtime actions in execution order (non-disruptive, flow, disruptive).
    pub actions: Vec<Box<dyn RuleAction>>,
    /// Arena index of the chain child.
    pub chain: Option<usize>,
    /// Marker name for SecMarker entries.
    pub marker: Option<String>,
}

impl Rule {
    /// Whether this entry is a SecMarker.
    pub fn is_marker(&self) -> bool {
        self.marker.is_some()
    }

    /// Rule id.
    pub fn id(&self) -> u64 {
        self.metadata.id
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.metadata.id)
            .field("phase", &self.metadata.phase)
            .field("targets", &self.targets.iter().map(ToString::to_string).collect::<Vec<_>>())
            .field("transformations", &self.transformations)
            .field("operator", &self.operator)
            .field("actions", &self.actions.iter().map(|a| a.name()).collect::<Vec<_>>())
            .field("chain", &self.chain)
            .field("marker", &self.marker)
            .finish()
    }
}

/// Decides per transaction whether a rule is skipped.
pub trait RuleFilter: Send + Sync {
    /// Return `true` to skip `rule`.
    fn should_ignore(&self, rule: &RuleMetadata) -> bool;
}

impl<F> RuleFilter for F
where
    F: Fn(&RuleMetadata) -> bool + Send + Sync,
{
    fn should_ignore(&self, rule: &RuleMetadata) -> bool {
        self(rule)
    }
}

/// Selects rules by id range, tag or message.
#[derive(Debug, Clone)]
pub enum RuleMatcher {
    /// Id or id range.
    Id(RangeInclusive<u64>),
    /// Any tag matching the regex.
    Tag(Regex),
    /// Message matching the regex.
    Msg(Regex),
}

impl RuleMatcher {
    /// Whether `rule` is selected.
    pub fn matches(&self, rule: &RuleMetadata) -> bool {
        match self {
            RuleMatcher::Id(ids) => ids.contains(&rule.effective_id()),
            RuleMatcher::Tag(re) => rule.tags.iter().any(|t| re.is_match(t)),
            RuleMatcher::Msg(re) => rule.msg.is_some() && re.is_match(rule.msg_text()),
        }
    }
}

/// A target taken out of the rules a matcher selects.
#[derive(Debug, Clone)]
pub struct TargetRemoval {
    /// Rules affected.
    pub rule: RuleMatcher,
    /// `ARGS:foo` drops the key, `ARGS` drops the whole target.
    pub target: VariableSpec,
}

/// Rules and targets removed for the rest of a transaction.
#[derive(Debug, Clone, Default)]
pub struct RuleRemovals {
    /// Removed id ranges.
    pub ids: Vec<RangeInclusive<u64>>,
    /// Removed tags.
    pub tags: Vec<Regex>,
    /// Removed messages.
    pub msgs: Vec<Regex>,
    /// Removed targets.
    pub targets: Vec<TargetRemoval>,
}

impl RuleRemovals {
    /// Whether nothing was removed.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.tags.is_empty() && self.msgs.is_empty() && self.targets.is_empty()
    }

    /// Whether `rule` is removed.
    pub fn removes(&self, rule: &RuleMetadata) -> bool {
        let id = rule.effective_id();
        self.ids.iter().any(|r| r.contains(&id))
            || self.tags.iter().any(|re| rule.tags.iter().any(|t| re.is_match(t)))
            || (rule.msg.is_some() && self.msgs.iter().any(|re| re.is_match(rule.msg_text())))
    }

    /// `targets` with the target removals for `rule` applied, or `None`
    /// when none apply.
    pub fn targets_for(&self, rule: &RuleMetadata, targets: &[VariableSpec]) -> Option<Vec<VariableSpec>> {
        let mut applicable = self.targets.iter().filter(|t| t.rule.matches(rule)).peekable();
        applicable.peek()?;
        let mut out = targets.to_vec();
        for removal in applicable {
            remove_target(&mut out, &removal.target);
        }
        Some(out)
    }
}

/// Apply a `!TARGET` update: drop the key from matching targets, or the
/// whole target when `removal` has no key.
pub fn remove_target(targets: &mut Vec<VariableSpec>, removal: &VariableSpec) {
    match &removal.selection {
        None => targets.retain(|t| t.name != removal.name),
        Some(selection) => {
            for target in targets.iter_mut().filter(|t| t.name == removal.name) {
                target.exclusions.push(selection.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macros::Macro;
    use crate::parser::parse_variables;
    use crate::variables::VariableName;

    fn meta() -> RuleMetadata {
        RuleMetadata {
            id: 942100,
            tags: vec!["attack-sqli".to_string()],
            msg: Some(Macro::compile("SQL Injection Attack Detected")),
            ..Default::default()
        }
    }

    #[test]
    fn test_matchers() {
        let m = meta();
        assert!(RuleMatcher::Id(942000..=942999).matches(&m));
        assert!(!RuleMatcher::Id(1..=2).matches(&m));
        assert!(RuleMatcher::Tag(Regex::new("^attack-").unwrap()).matches(&m));
        assert!(RuleMatcher::Msg(Regex::new("Injection").unwrap()).matches(&m));
    }

    #[test]
    fn test_removals() {
        let mut removals = RuleRemovals::default();
        assert!(removals.is_empty());
        assert!(!removals.removes(&meta()));
        removals.tags.push(Regex::new("sqli").unwrap());
        assert!(removals.removes(&meta()));
    }

    #[test]
    fn test_target_removal() {
        let targets = parse_variables("ARGS|REQUEST_HEADERS").unwrap();
        let mut removals = RuleRemovals::default();
        assert!(removals.targets_for(&meta(), &targets).is_none());

        removals.targets.push(TargetRemoval {
            rule: RuleMatcher::Id(942100..=942100),
            target: crate::parser::parse_variable("ARGS:password").unwrap(),
        });
        removals.targets.push(TargetRemoval {
            rule: RuleMatcher::Id(942100..=942100),
            target: crate::parser::parse_variable("REQUEST_HEADERS").unwrap(),
        });
        let out = removals.targets_for(&meta(), &targets).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, VariableName::Args);
        assert!(out[0].is_excluded("password"));
    }

    #[test]
    fn test_closure_filter() {
        let filter = |m: &RuleMetadata| m.id == 942100;
        assert!(filter.should_ignore(&meta()));
    }
}
