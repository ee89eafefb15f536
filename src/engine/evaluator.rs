//! Rule evaluation for one phase of a transaction.

use std::borrow::Cow;
use std::sync::Arc;

use tracing::{debug, info, trace};

use super::matched::{MatchedData, MatchedRule};
use super::phase::Phase;
use super::rule::Rule;
use super::ruleset::Ruleset;
use super::transaction::Transaction;
use crate::actions::{ActionKind, Flow, RuleMetadata};
use crate::operators::OperatorContext;
use crate::variables::{resolve, VariableName, VariableSpec};

/// `ctl:debugLogLevel` from which per-rule trace lines are emitted.
const TRACE_LEVEL: u8 = 9;

impl Transaction {
    /// Run the rules of `phase` in order, honouring skip, skipAfter, allow
    /// and the rule filter.
    pub(crate) fn evaluate_phase(&mut self, phase: Phase) {
        let waf = Arc::clone(&self.waf);
        let ruleset = &waf.ruleset;
        let entries = ruleset.phase(phase);
        debug!(tx_id = %self.id(), %phase, rules = entries.len(), "evaluating phase");

        // Logging runs after an interruption; only a new one stops it.
        let already_interrupted = self.interruption.is_some();
        let mut i = 0;
        while i < entries.len() {
            if let Some((scope, issued)) = self.allow {
                if scope.covers(issued, phase) {
                    debug!(tx_id = %self.id(), %phase, "remaining rules allowed");
                    break;
                }
            }
            let rule = ruleset.rule(entries[i]);
            if rule.is_marker() || self.is_skipped(&rule.metadata) {
                i += 1;
                continue;
            }

            self.flow = None;
            self.evaluate_rule(ruleset, entries[i], phase);
            if !already_interrupted && self.interruption.is_some() {
                break;
            }

            match self.flow.take() {
                Some(Flow::Skip(count)) => i += count + 1,
                Some(Flow::SkipAfter(label)) => match ruleset.find_label(phase, i, &label) {
                    Some(position) => i = position + 1,
                    None => {
                        debug!(tx_id = %self.id(), label = %label, "skipAfter target not found, phase stopped");
                        break;
                    }
                },
                None => i += 1,
            }
        }
    }

    fn is_skipped(&self, rule: &RuleMetadata) -> bool {
        self.removals.removes(rule) || self.filter.as_ref().is_some_and(|f| f.should_ignore(rule))
    }

    /// Evaluate the rule at arena `index` and its chain.
    fn evaluate_rule(&mut self, ruleset: &Ruleset, index: usize, phase: Phase) {
        let starter = ruleset.rule(index);
        let tracing = self.settings().debug_log_level >= TRACE_LEVEL;

        self.vars.map_mut(VariableName::MatchedVars).clear();
        self.vars.unset(VariableName::MatchedVar);
        self.vars.unset(VariableName::MatchedVarName);

        let mut links = Vec::new();
        let mut matched = Vec::new();
        let mut inherited: &[VariableSpec] = &starter.targets;
        let mut current = Some(index);
        while let Some(idx) = current {
            let rule = ruleset.rule(idx);
            let targets = if rule.targets.is_empty() && rule.metadata.parent_id.is_some() {
                inherited
            } else {
                &rule.targets
            };
            if !self.match_rule(rule, targets, phase, &mut matched) {
                if tracing {
                    trace!(tx_id = %self.id(), rule_id = starter.metadata.effective_id(), link = links.len(), "no match");
                }
                return;
            }
            if !rule.targets.is_empty() {
                inherited = &rule.targets;
            }
            links.push(idx);
            current = rule.chain;
        }

        let meta = Arc::clone(&starter.metadata);
        let interrupted = self.interruption.is_some();
        for &idx in &links {
            let rule = ruleset.rule(idx);
            for action in rule
                .actions
                .iter()
                .filter(|a| matches!(a.kind(), ActionKind::Flow | ActionKind::Disruptive))
            {
                action.evaluate(&meta, self);
            }
        }

        let record = MatchedRule {
            rule: Arc::clone(&meta),
            phase,
            message: meta.msg.as_ref().map(|m| m.expand(&self.vars)).unwrap_or_default(),
            data: meta.logdata.as_ref().map(|m| m.expand(&self.vars)).unwrap_or_default(),
            matched,
            disruptive_action: meta.disruptive,
            disruptive: !interrupted && self.interruption.is_some(),
            tx_id: self.id().to_string(),
            uri: self.vars.get(VariableName::RequestUri).unwrap_or_default().to_string(),
            client_ip: self.vars.get(VariableName::RemoteAddr).unwrap_or_default().to_string(),
            server: self
                .vars
                .get(VariableName::ServerName)
                .or_else(|| self.vars.get(VariableName::ServerAddr))
                .unwrap_or_default()
                .to_string(),
        };

        if let Some(severity) = meta.severity {
            if severity.level() < self.vars.highest_severity() {
                self.vars.set(VariableName::HighestSeverity, severity.level().to_string());
            }
        }
        if record.is_logged() {
            let line = record.error_log();
            info!(tx_id = %record.tx_id, rule_id = meta.effective_id(), "{}", line);
            self.vars
                .map_mut(VariableName::WebserverErrorLog)
                .add(meta.effective_id().to_string(), line);
        }
        self.vars.map_mut(VariableName::Rule).clear();
        self.matched.push(record);
    }

    /// Match one link against its targets. Non-disruptive actions run for
    /// every matching value; without `multiMatch` the first one ends the
    /// search.
    fn match_rule(
        &mut self,
        rule: &Rule,
        targets: &[VariableSpec],
        phase: Phase,
        matched: &mut Vec<MatchedData>,
    ) -> bool {
        let meta = &rule.metadata;
        self.fill_rule_collection(meta);

        let Some(operator) = &rule.operator else {
            self.run_match_actions(rule);
            return true;
        };

        let targets: Cow<'_, [VariableSpec]> = match self.removals.targets_for(meta, targets) {
            Some(updated) => Cow::Owned(updated),
            None => Cow::Borrowed(targets),
        };
        let tracing = self.settings().debug_log_level >= TRACE_LEVEL;

        let mut any = false;
        for spec in targets.iter() {
            for data in resolve(&self.vars, spec) {
                if self.cancel.is_cancelled() {
                    return false;
                }
                let candidates = if meta.multi_match {
                    rule.transformations.apply_all(&data.value)
                } else {
                    vec![rule.transformations.apply(&data.value).into_owned()]
                };

                let mut hit = None;
                for candidate in candidates {
                    let mut ctx = OperatorContext::new(&mut self.vars, phase, meta.capture, &self.cancel);
                    let result = operator.operator.evaluate(&mut ctx, &candidate) != operator.negated;
                    if tracing {
                        trace!(
                            tx_id = %self.id(),
                            rule_id = meta.effective_id(),
                            operator = ?operator,
                            value = %candidate,
                            result,
                            "operator evaluated"
                        );
                    }
                    if result {
                        hit = Some(candidate);
                        break;
                    }
                }
                let Some(value) = hit else {
                    continue;
                };

                any = true;
                let found = MatchedData {
                    variable: data.variable,
                    key: data.key,
                    value,
                };
                let name = found.full_name();
                self.vars.set(VariableName::MatchedVar, found.value.as_str());
                self.vars.set(VariableName::MatchedVarName, name.as_str());
                self.vars
                    .map_mut(VariableName::MatchedVars)
                    .add(name, found.value.as_str());
                matched.push(found);

                self.run_match_actions(rule);
                if !meta.multi_match {
                    return true;
                }
            }
        }
        any
    }

    fn run_match_actions(&mut self, rule: &Rule) {
        let meta = Arc::clone(&rule.metadata);
        for action in rule
            .actions
            .iter()
            .filter(|a| a.kind() == ActionKind::NonDisruptive)
        {
            action.evaluate(&meta, self);
        }
    }

    /// Expose the running rule as the `RULE` collection.
    fn fill_rule_collection(&mut self, meta: &RuleMetadata) {
        let map = self.vars.map_mut(VariableName::Rule);
        map.clear();
        map.set_one("id", meta.effective_id().to_string());
        map.set_one("phase", meta.phase.number().to_string());
        if let Some(msg) = &meta.msg {
            map.set_one("msg", msg.raw());
        }
        if let Some(logdata) = &meta.logdata {
            map.set_one("logdata", logdata.raw());
        }
        if let Some(severity) = meta.severity {
            map.set_one("severity", severity.level().to_string());
        }
        if let Some(rev) = &meta.rev {
            map.set_one("rev", rev.as_str());
        }
        if let Some(ver) = &meta.ver {
            map.set_one("ver", ver.as_str());
        }
        if let Some(maturity) = meta.maturity {
            map.set_one("maturity", maturity.to_string());
        }
        if let Some(accuracy) = meta.accuracy {
            map.set_one("accuracy", accuracy.to_string());
        }
    }
}
