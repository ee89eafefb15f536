//! Rule compilation.
//!
//! [`Ruleset::compile`] turns parsed directives into an arena of [`Rule`]s
//! plus, per phase, the ordered list of top-level entries the evaluator
//! walks. Chain children live in the arena only and are reached through
//! [`Rule::chain`]. Markers are listed in every phase so `skipAfter` can
//! find them from any phase.

use super::config::WafConfig;
use super::phase::Phase;
use super::rule::{remove_target, Rule, RuleOperator};
use crate::actions::{ActionKind, RuleAction, RuleMetadata};
use crate::error::{Error, Result, SourceLocation};
use crate::operators::OperatorOptions;
use crate::parser::{parse_variable, split_targets, Directive, OperatorSpec, RawAction};
use crate::transformations::TransformationPipeline;
use crate::variables::VariableSpec;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Compiled, immutable rules shared by every transaction of a WAF.
#[derive(Debug, Default)]
pub struct Ruleset {
    rules: Vec<Rule>,
    phases: [Vec<usize>; 5],
    labels: [HashMap<String, Vec<usize>>; 5],
    count: usize,
}

impl Ruleset {
    /// Compile `directives` with the registries and defaults of `config`.
    ///
    /// Setting directives are expected to be applied to `config` already;
    /// they are ignored here.
    pub fn compile(directives: &[Directive], config: &WafConfig) -> Result<Self> {
        let mut compiler = Compiler::new(config);
        for directive in directives {
            compiler.directive(directive)?;
        }
        let ruleset = compiler.finish()?;
        debug!(rules = ruleset.count, "ruleset compiled");
        Ok(ruleset)
    }

    /// Arena entry `index`.
    pub fn rule(&self, index: usize) -> &Rule {
        &self.rules[index]
    }

    /// Arena indices of the top-level entries of `phase`, in order.
    pub fn phase(&self, phase: Phase) -> &[usize] {
        &self.phases[phase.index()]
    }

    /// Position in `phase` of the first entry after `position` labelled
    /// `label` (marker name, rule id or tag).
    pub fn find_label(&self, phase: Phase, position: usize, label: &str) -> Option<usize> {
        let positions = self.labels[phase.index()].get(label)?;
        let next = positions.partition_point(|&p| p <= position);
        positions.get(next).copied()
    }

    /// Number of top-level rules, markers excluded.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether there are no rules.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Top-level rules in phase order.
    pub fn rules(&self) -> impl Iterator<Item = &Rule> + '_ {
        Phase::ALL
            .iter()
            .flat_map(move |p| self.phase(*p).iter())
            .map(move |&i| &self.rules[i])
            .filter(|r| !r.is_marker())
    }
}

struct Compiler<'a> {
    config: &'a WafConfig,
    datasets: Arc<HashMap<String, Vec<String>>>,
    defaults: [Option<Vec<RawAction>>; 5],
    rules: Vec<Rule>,
    listed: Vec<usize>,
    ids: HashMap<u64, usize>,
    /// Last link of an open chain.
    pending: Option<usize>,
    /// Metadata of the open chain's starter.
    starter: Option<Arc<RuleMetadata>>,
    updates: Vec<(u64, String)>,
}

impl<'a> Compiler<'a> {
    fn new(config: &'a WafConfig) -> Self {
        Self {
            config,
            datasets: Arc::new(config.datasets.clone()),
            defaults: Default::default(),
            rules: Vec::new(),
            listed: Vec::new(),
            ids: HashMap::new(),
            pending: None,
            starter: None,
            updates: Vec::new(),
        }
    }

    fn directive(&mut self, directive: &Directive) -> Result<()> {
        match directive {
            Directive::SecRule(rule) => {
                let raw = RuleSource {
                    targets: rule.variables.clone(),
                    operator: Some(&rule.operator),
                    actions: &rule.actions,
                    location: &rule.location,
                    raw: &rule.raw,
                };
                match self.pending {
                    Some(parent) => self.add_child(parent, raw),
                    None => self.add_rule(raw),
                }
            }
            Directive::SecAction(action) => {
                self.ensure_no_open_chain()?;
                self.add_rule(RuleSource {
                    targets: Vec::new(),
                    operator: None,
                    actions: &action.actions,
                    location: &action.location,
                    raw: &action.raw,
                })
            }
            Directive::SecMarker(marker) => {
                self.ensure_no_open_chain()?;
                let index = self.rules.len();
                self.rules.push(Rule {
                    metadata: Arc::new(RuleMetadata {
                        file: marker.location.file.clone(),
                        line: marker.location.line,
                        raw: format!("SecMarker {}", marker.name),
                        ..Default::default()
                    }),
                    targets: Vec::new(),
                    transformations: TransformationPipeline::new(),
                    operator: None,
                    actions: Vec::new(),
                    chain: None,
                    marker: Some(marker.name.clone()),
                });
                self.listed.push(index);
                Ok(())
            }
            Directive::SecDefaultAction(actions) => {
                self.ensure_no_open_chain()?;
                let phase = phase_of(actions)?.unwrap_or(Phase::RequestBody);
                for action in actions {
                    self.config.actions.build(&action.name)?;
                }
                self.defaults[phase.index()] = Some(actions.clone());
                Ok(())
            }
            Directive::SecRuleUpdateTargetById { id, targets } => {
                self.updates.push((*id, targets.clone()));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn ensure_no_open_chain(&self) -> Result<()> {
        match self.pending {
            Some(_) => Err(Error::IncompleteChain),
            None => Ok(()),
        }
    }

    fn add_rule(&mut self, source: RuleSource<'_>) -> Result<()> {
        let location = source.location;
        let phase = phase_of(source.actions)
            .map_err(|e| e.at(location))?
            .unwrap_or(Phase::RequestBody);
        let defaults = self.defaults[phase.index()]
            .clone()
            .unwrap_or_else(|| self.config.default_actions.clone());

        let rule = self.build(source, &defaults, None).map_err(|e| e.at(location))?;
        let id = rule.metadata.id;
        if id == 0 {
            return Err(Error::MissingRuleId.at(location));
        }
        if self.ids.contains_key(&id) {
            return Err(Error::DuplicateRuleId { id }.at(location));
        }

        let index = self.rules.len();
        if rule.metadata.chain {
            self.pending = Some(index);
            self.starter = Some(Arc::clone(&rule.metadata));
        }
        self.ids.insert(id, index);
        self.rules.push(rule);
        self.listed.push(index);
        Ok(())
    }

    fn add_child(&mut self, parent: usize, source: RuleSource<'_>) -> Result<()> {
        let location = source.location;
        let starter = match &self.starter {
            Some(starter) => Arc::clone(starter),
            None => return Err(Error::IncompleteChain.at(location)),
        };
        let rule = self
            .build(source, &[], Some(&starter))
            .map_err(|e| e.at(location))?;

        let index = self.rules.len();
        let chained = rule.metadata.chain;
        self.rules.push(rule);
        self.rules[parent].chain = Some(index);
        if chained {
            self.pending = Some(index);
        } else {
            self.pending = None;
            self.starter = None;
        }
        Ok(())
    }

    fn build(
        &self,
        source: RuleSource<'_>,
        defaults: &[RawAction],
        starter: Option<&RuleMetadata>,
    ) -> Result<Rule> {
        let mut meta = RuleMetadata {
            file: source.location.file.clone(),
            line: source.location.line,
            raw: source.raw.to_string(),
            ..Default::default()
        };

        let own = self.instantiate(source.actions)?;
        let own_disruptive = own
            .iter()
            .any(|(a, _)| a.kind() == ActionKind::Disruptive && a.name() != "block");

        let mut actions: Vec<(Box<dyn RuleAction>, &str)> = Vec::new();
        for (action, arg) in self.instantiate(defaults)? {
            match action.name() {
                "id" | "chain" => continue,
                _ if own_disruptive && action.kind() == ActionKind::Disruptive => continue,
                _ => actions.push((action, arg)),
            }
        }
        actions.extend(own);

        let mut runtime = Vec::new();
        for (mut action, arg) in actions {
            if action.name() == "ctl" {
                self.check_body_processor(arg)?;
            }
            action.init(&mut meta, arg)?;
            if action.kind().is_runtime() {
                runtime.push(action);
            }
        }

        if let Some(starter) = starter {
            if runtime.iter().any(|a| a.kind() == ActionKind::Disruptive) {
                return Err(Error::config(
                    "disruptive actions are only allowed on the chain starter",
                ));
            }
            meta.parent_id = Some(starter.effective_id());
            meta.id = 0;
            meta.phase = starter.phase;
        }

        let runtime = keep_one_disruptive(runtime);
        meta.disruptive = runtime
            .iter()
            .find(|a| a.kind() == ActionKind::Disruptive)
            .map(|a| a.name());

        let transformations =
            TransformationPipeline::from_names(&self.config.transformations, &meta.transformations)?;

        let operator = match source.operator {
            Some(spec) => Some(self.operator(spec, source.location)?),
            None => None,
        };

        Ok(Rule {
            metadata: Arc::new(meta),
            targets: source.targets,
            transformations,
            operator,
            actions: runtime,
            chain: None,
            marker: None,
        })
    }

    /// `ctl:requestBodyProcessor` and `ctl:responseBodyProcessor` must
    /// name a registered processor.
    fn check_body_processor(&self, ctl: &str) -> Result<()> {
        let Some((option, name)) = ctl.split_once('=') else {
            return Ok(());
        };
        let option = option.trim();
        let selects_processor = option.eq_ignore_ascii_case("requestBodyProcessor")
            || option.eq_ignore_ascii_case("responseBodyProcessor");
        if selects_processor && self.config.body_processors.get(name.trim()).is_none() {
            return Err(Error::UnknownBodyProcessor {
                name: name.trim().to_string(),
            });
        }
        Ok(())
    }

    fn instantiate<'r>(&self, raw: &'r [RawAction]) -> Result<Vec<(Box<dyn RuleAction>, &'r str)>> {
        raw.iter()
            .map(|a| Ok((self.config.actions.build(&a.name)?, a.arg())))
            .collect()
    }

    fn operator(&self, spec: &OperatorSpec, location: &SourceLocation) -> Result<RuleOperator> {
        let opts = OperatorOptions {
            argument: spec.argument.clone(),
            root: location
                .file
                .as_ref()
                .and_then(|f| f.parent())
                .map(|p| p.to_path_buf()),
            datasets: Arc::clone(&self.datasets),
            geo: self.config.geo.clone(),
            nameserver: self.config.nameserver,
        };
        Ok(RuleOperator {
            operator: self.config.operators.build(&spec.name, &opts)?,
            negated: spec.negated,
            name: spec.name.clone(),
            argument: spec.argument.clone(),
        })
    }

    fn finish(mut self) -> Result<Ruleset> {
        self.ensure_no_open_chain()?;

        for (id, targets) in std::mem::take(&mut self.updates) {
            let Some(&index) = self.ids.get(&id) else {
                warn!(id, "SecRuleUpdateTargetById: no such rule");
                continue;
            };
            let rule = &mut self.rules[index];
            for part in split_targets(&targets) {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                match part.strip_prefix('!') {
                    Some(removal) => remove_target(&mut rule.targets, &parse_variable(removal)?),
                    None => rule.targets.push(parse_variable(part)?),
                }
            }
        }

        let mut ruleset = Ruleset {
            rules: Vec::new(),
            phases: Default::default(),
            labels: Default::default(),
            count: 0,
        };

        for &index in &self.listed {
            let rule = &self.rules[index];
            if rule.is_marker() {
                for phase in Phase::ALL {
                    push_entry(&mut ruleset, phase, index, rule);
                }
                continue;
            }
            if self.is_removed(&rule.metadata) {
                debug!(id = rule.metadata.id, "rule removed by configuration");
                continue;
            }
            push_entry(&mut ruleset, rule.metadata.phase, index, rule);
            ruleset.count += 1;
        }

        ruleset.rules = self.rules;
        Ok(ruleset)
    }

    fn is_removed(&self, meta: &RuleMetadata) -> bool {
        let id = meta.effective_id();
        self.config.rule_remove_by_id.iter().any(|r| r.contains(&id))
            || self
                .config
                .rule_remove_by_tag
                .iter()
                .any(|re| meta.tags.iter().any(|t| re.is_match(t)))
            || (meta.msg.is_some()
                && self
                    .config
                    .rule_remove_by_msg
                    .iter()
                    .any(|re| re.is_match(meta.msg_text())))
    }
}

struct RuleSource<'r> {
    targets: Vec<VariableSpec>,
    operator: Option<&'r OperatorSpec>,
    actions: &'r [RawAction],
    location: &'r SourceLocation,
    raw: &'r str,
}

fn push_entry(ruleset: &mut Ruleset, phase: Phase, index: usize, rule: &Rule) {
    let list = &mut ruleset.phases[phase.index()];
    let position = list.len();
    list.push(index);

    let labels = &mut ruleset.labels[phase.index()];
    let mut label = |name: String| labels.entry(name).or_default().push(position);
    match &rule.marker {
        Some(name) => label(name.clone()),
        None => {
            label(rule.metadata.id.to_string());
            for tag in &rule.metadata.tags {
                label(tag.clone());
            }
        }
    }
}

fn phase_of(actions: &[RawAction]) -> Result<Option<Phase>> {
    match actions.iter().rev().find(|a| a.key() == "phase") {
        Some(action) => Phase::parse(action.arg())
            .map(Some)
            .ok_or_else(|| Error::InvalidActionArgument {
                action: "phase".to_string(),
                message: format!("invalid phase: {}", action.arg()),
            }),
        None => Ok(None),
    }
}

/// Keep the last disruptive action. `block` only survives when it is the
/// only one, in which case it behaves like `pass`.
fn keep_one_disruptive(actions: Vec<Box<dyn RuleAction>>) -> Vec<Box<dyn RuleAction>> {
    let keep = actions
        .iter()
        .rposition(|a| a.kind() == ActionKind::Disruptive && a.name() != "block")
        .or_else(|| actions.iter().rposition(|a| a.kind() == ActionKind::Disruptive));

    let mut out: Vec<Box<dyn RuleAction>> = actions
        .into_iter()
        .enumerate()
        .filter(|(i, a)| a.kind() != ActionKind::Disruptive || Some(*i) == keep)
        .map(|(_, a)| a)
        .collect();
    out.sort_by_key(|a| a.kind());
    out
}
