//! The `ctl` action: per-transaction configuration changes.

use super::{ActionKind, RuleAction, RuleMetadata};
use crate::engine::config::{AuditEngine, RuleEngineMode};
use crate::engine::{RuleMatcher, TargetRemoval, Transaction};
use crate::error::{Error, Result};
use crate::parser::{parse_id_range, parse_variable};
use crate::variables::VariableSpec;
use regex::{Regex, RegexBuilder};
use std::ops::RangeInclusive;
use tracing::debug;

/// One `ctl:option=value` command.
#[derive(Debug, Clone)]
pub enum CtlCommand {
    /// `ruleEngine`
    RuleEngine(RuleEngineMode),
    /// `requestBodyAccess`
    RequestBodyAccess(bool),
    /// `responseBodyAccess`
    ResponseBodyAccess(bool),
    /// `requestBodyProcessor`, lowercased
    RequestBodyProcessor(String),
    /// `responseBodyProcessor`, lowercased
    ResponseBodyProcessor(String),
    /// `requestBodyLimit`
    RequestBodyLimit(u64),
    /// `forceRequestBodyVariable`
    ForceRequestBodyVariable(bool),
    /// `ruleRemoveById`
    RuleRemoveById(RangeInclusive<u64>),
    /// `ruleRemoveByTag`
    RuleRemoveByTag(Regex),
    /// `ruleRemoveByMsg`
    RuleRemoveByMsg(Regex),
    /// `ruleRemoveTargetById`, `ruleRemoveTargetByTag`, `ruleRemoveTargetByMsg`
    RuleRemoveTarget(RuleMatcher, VariableSpec),
    /// `auditEngine`
    AuditEngine(AuditEngine),
    /// `auditLogParts`: `+E`, `-E` or a full part list
    AuditLogParts(String),
    /// `debugLogLevel`
    DebugLogLevel(u8),
}

impl CtlCommand {
    /// Parse `option=value`.
    pub fn parse(input: &str) -> Result<Self> {
        let (option, value) = input
            .split_once('=')
            .ok_or_else(|| invalid(format!("expected option=value, got {:?}", input)))?;
        let value = value.trim();
        let command = match option.trim().to_ascii_lowercase().as_str() {
            "ruleengine" => Self::RuleEngine(
                RuleEngineMode::parse(value).ok_or_else(|| invalid(format!("bad ruleEngine {:?}", value)))?,
            ),
            "requestbodyaccess" => Self::RequestBodyAccess(on_off(value)?),
            "responsebodyaccess" => Self::ResponseBodyAccess(on_off(value)?),
            "forcerequestbodyvariable" => Self::ForceRequestBodyVariable(on_off(value)?),
            "requestbodyprocessor" => Self::RequestBodyProcessor(value.to_ascii_lowercase()),
            "responsebodyprocessor" => Self::ResponseBodyProcessor(value.to_ascii_lowercase()),
            "requestbodylimit" => Self::RequestBodyLimit(
                value
                    .parse()
                    .map_err(|_| invalid(format!("bad requestBodyLimit {:?}", value)))?,
            ),
            "ruleremovebyid" => Self::RuleRemoveById(id_range(value)?),
            "ruleremovebytag" => Self::RuleRemoveByTag(regex(value)?),
            "ruleremovebymsg" => Self::RuleRemoveByMsg(regex(value)?),
            "ruleremovetargetbyid" => {
                let (rule, target) = split_target(value)?;
                Self::RuleRemoveTarget(RuleMatcher::Id(id_range(rule)?), target)
            }
            "ruleremovetargetbytag" => {
                let (rule, target) = split_target(value)?;
                Self::RuleRemoveTarget(RuleMatcher::Tag(regex(rule)?), target)
            }
            "ruleremovetargetbymsg" => {
                let (rule, target) = split_target(value)?;
                Self::RuleRemoveTarget(RuleMatcher::Msg(regex(rule)?), target)
            }
            "auditengine" => Self::AuditEngine(
                AuditEngine::parse(value).ok_or_else(|| invalid(format!("bad auditEngine {:?}", value)))?,
            ),
            "auditlogparts" => {
                if value.is_empty() {
                    return Err(invalid("empty auditLogParts"));
                }
                Self::AuditLogParts(value.to_string())
            }
            "debugloglevel" => match value.parse::<u8>() {
                Ok(level) if level <= 9 => Self::DebugLogLevel(level),
                _ => return Err(invalid(format!("bad debugLogLevel {:?}", value))),
            },
            other => return Err(invalid(format!("unknown option {:?}", other))),
        };
        Ok(command)
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidActionArgument {
        action: "ctl".to_string(),
        message: message.into(),
    }
}

fn on_off(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        _ => Err(invalid(format!("expected On or Off, got {:?}", value))),
    }
}

fn id_range(value: &str) -> Result<RangeInclusive<u64>> {
    parse_id_range(value).ok_or_else(|| invalid(format!("bad rule id {:?}", value)))
}

fn regex(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .build()
        .map_err(|source| Error::RegexCompile {
            pattern: pattern.to_string(),
            source,
        })
}

/// `rule;TARGET`
fn split_target(value: &str) -> Result<(&str, VariableSpec)> {
    let (rule, target) = value
        .split_once(';')
        .ok_or_else(|| invalid(format!("expected RULE;TARGET, got {:?}", value)))?;
    Ok((rule.trim(), parse_variable(target.trim())?))
}

/// `ctl:option=value`
#[derive(Debug, Default)]
pub struct CtlAction {
    command: Option<CtlCommand>,
}

impl CtlAction {
    /// The parsed command.
    pub fn command(&self) -> Option<&CtlCommand> {
        self.command.as_ref()
    }
}

impl RuleAction for CtlAction {
    fn name(&self) -> &'static str {
        "ctl"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::NonDisruptive
    }

    fn init(&mut self, _: &mut RuleMetadata, arg: &str) -> Result<()> {
        self.command = Some(CtlCommand::parse(arg)?);
        Ok(())
    }

    fn evaluate(&self, rule: &RuleMetadata, tx: &mut Transaction) {
        let Some(command) = &self.command else {
            return;
        };
        debug!(rule_id = rule.effective_id(), tx_id = %tx.id(), ctl = ?command, "ctl");
        match command {
            CtlCommand::RuleEngine(mode) => tx.settings_mut().rule_engine = *mode,
            CtlCommand::RequestBodyAccess(on) => tx.settings_mut().request_body_access = *on,
            CtlCommand::ResponseBodyAccess(on) => tx.settings_mut().response_body_access = *on,
            CtlCommand::RequestBodyProcessor(name) => {
                tx.settings_mut().request_body_processor = Some(name.clone())
            }
            CtlCommand::ResponseBodyProcessor(name) => {
                tx.settings_mut().response_body_processor = Some(name.clone())
            }
            CtlCommand::RequestBodyLimit(limit) => tx.settings_mut().request_body_limit = *limit,
            CtlCommand::ForceRequestBodyVariable(on) => {
                tx.settings_mut().force_request_body_variable = *on
            }
            CtlCommand::RuleRemoveById(ids) => tx.removals_mut().ids.push(ids.clone()),
            CtlCommand::RuleRemoveByTag(re) => tx.removals_mut().tags.push(re.clone()),
            CtlCommand::RuleRemoveByMsg(re) => tx.removals_mut().msgs.push(re.clone()),
            CtlCommand::RuleRemoveTarget(matcher, target) => {
                tx.removals_mut().targets.push(TargetRemoval {
                    rule: matcher.clone(),
                    target: target.clone(),
                })
            }
            CtlCommand::AuditEngine(engine) => tx.settings_mut().audit_engine = *engine,
            CtlCommand::AuditLogParts(change) => tx.settings_mut().audit_log_parts.apply_change(change),
            CtlCommand::DebugLogLevel(level) => tx.settings_mut().debug_log_level = *level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::{Selection, VariableName};

    #[test]
    fn test_parse_switches() {
        assert!(matches!(
            CtlCommand::parse("ruleEngine=DetectionOnly").unwrap(),
            CtlCommand::RuleEngine(RuleEngineMode::DetectionOnly)
        ));
        assert!(matches!(
            CtlCommand::parse("requestBodyAccess=Off").unwrap(),
            CtlCommand::RequestBodyAccess(false)
        ));
        assert!(matches!(
            CtlCommand::parse("requestBodyProcessor=JSON").unwrap(),
            CtlCommand::RequestBodyProcessor(ref p) if p == "json"
        ));
        assert!(CtlCommand::parse("ruleEngine=sometimes").is_err());
        assert!(CtlCommand::parse("noSuchOption=1").is_err());
        assert!(CtlCommand::parse("ruleEngine").is_err());
    }

    #[test]
    fn test_parse_removals() {
        match CtlCommand::parse("ruleRemoveById=942100-942199").unwrap() {
            CtlCommand::RuleRemoveById(r) => assert_eq!(r, 942100..=942199),
            other => panic!("unexpected {:?}", other),
        }
        match CtlCommand::parse("ruleRemoveTargetById=981260;ARGS:user").unwrap() {
            CtlCommand::RuleRemoveTarget(RuleMatcher::Id(r), target) => {
                assert_eq!(r, 981260..=981260);
                assert_eq!(target.name, VariableName::Args);
                assert!(matches!(target.selection, Some(Selection::Key(ref k)) if k == "user"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            CtlCommand::parse("ruleRemoveTargetByTag=attack-sqli;REQUEST_COOKIES").unwrap(),
            CtlCommand::RuleRemoveTarget(RuleMatcher::Tag(_), _)
        ));
        assert!(CtlCommand::parse("ruleRemoveTargetById=12").is_err());
        assert!(CtlCommand::parse("ruleRemoveByMsg=(").is_err());
    }

    #[test]
    fn test_parse_levels() {
        assert!(matches!(
            CtlCommand::parse("debugLogLevel=9").unwrap(),
            CtlCommand::DebugLogLevel(9)
        ));
        assert!(CtlCommand::parse("debugLogLevel=10").is_err());
        assert!(matches!(
            CtlCommand::parse("auditLogParts=+E").unwrap(),
            CtlCommand::AuditLogParts(_)
        ));
    }
}
