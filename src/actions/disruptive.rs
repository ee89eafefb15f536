//! Disruptive actions (deny, drop, redirect, proxy, allow, pass, block).

use super::{ActionKind, RuleAction, RuleMetadata};
use crate::engine::{AllowScope, Disruption, Interruption, Transaction};
use crate::error::{Error, Result};
use crate::macros::Macro;

/// Status used by deny and drop when the rule sets none.
pub const DEFAULT_DENY_STATUS: u16 = 403;

/// Status used by redirect when the rule sets none.
pub const DEFAULT_REDIRECT_STATUS: u16 = 302;

fn interruption(rule: &RuleMetadata, action: Disruption, status: u16, data: String) -> Interruption {
    Interruption {
        status,
        action,
        rule_id: rule.effective_id(),
        data,
    }
}

/// `deny`
#[derive(Debug, Default)]
pub struct DenyAction;

impl RuleAction for DenyAction {
    fn name(&self) -> &'static str {
        "deny"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Disruptive
    }

    fn init(&mut self, _: &mut RuleMetadata, _: &str) -> Result<()> {
        Ok(())
    }

    fn evaluate(&self, rule: &RuleMetadata, tx: &mut Transaction) {
        let status = rule.status.unwrap_or(DEFAULT_DENY_STATUS);
        tx.interrupt(interruption(rule, Disruption::Deny, status, String::new()));
    }
}

/// `drop`: the adapter closes the connection.
#[derive(Debug, Default)]
pub struct DropAction;

impl RuleAction for DropAction {
    fn name(&self) -> &'static str {
        "drop"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Disruptive
    }

    fn init(&mut self, _: &mut RuleMetadata, _: &str) -> Result<()> {
        Ok(())
    }

    fn evaluate(&self, rule: &RuleMetadata, tx: &mut Transaction) {
        let status = rule.status.unwrap_or(DEFAULT_DENY_STATUS);
        tx.interrupt(interruption(rule, Disruption::Drop, status, String::new()));
    }
}

/// `redirect:URL`. The URL may contain macros.
#[derive(Debug, Default)]
pub struct RedirectAction {
    target: Macro,
}

impl RuleAction for RedirectAction {
    fn name(&self) -> &'static str {
        "redirect"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Disruptive
    }

    fn init(&mut self, _: &mut RuleMetadata, arg: &str) -> Result<()> {
        if arg.trim().is_empty() {
            return Err(Error::InvalidActionArgument {
                action: "redirect".to_string(),
                message: "missing URL".to_string(),
            });
        }
        self.target = Macro::compile(arg.trim());
        Ok(())
    }

    fn evaluate(&self, rule: &RuleMetadata, tx: &mut Transaction) {
        let status = match rule.status {
            Some(s @ (301 | 302 | 303 | 307 | 308)) => s,
            _ => DEFAULT_REDIRECT_STATUS,
        };
        let url = self.target.expand(tx.variables());
        tx.interrupt(interruption(rule, Disruption::Redirect, status, url));
    }
}

/// `proxy:URL`. The adapter forwards the request to `data`.
#[derive(Debug, Default)]
pub struct ProxyAction {
    target: Macro,
}

impl RuleAction for ProxyAction {
    fn name(&self) -> &'static str {
        "proxy"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Disruptive
    }

    fn init(&mut self, _: &mut RuleMetadata, arg: &str) -> Result<()> {
        if arg.trim().is_empty() {
            return Err(Error::InvalidActionArgument {
                action: "proxy".to_string(),
                message: "missing backend URL".to_string(),
            });
        }
        self.target = Macro::compile(arg.trim());
        Ok(())
    }

    fn evaluate(&self, rule: &RuleMetadata, tx: &mut Transaction) {
        let url = self.target.expand(tx.variables());
        tx.interrupt(interruption(rule, Disruption::Proxy, rule.status.unwrap_or(0), url));
    }
}

/// `allow`, `allow:phase` or `allow:request`.
///
/// Stops rule evaluation without producing an interruption.
#[derive(Debug, Default)]
pub struct AllowAction {
    scope: AllowScope,
}

impl RuleAction for AllowAction {
    fn name(&self) -> &'static str {
        "allow"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Disruptive
    }

    fn init(&mut self, _: &mut RuleMetadata, arg: &str) -> Result<()> {
        self.scope = match arg.trim().to_ascii_lowercase().as_str() {
            "" => AllowScope::Transaction,
            "phase" => AllowScope::Phase,
            "request" => AllowScope::Request,
            other => {
                return Err(Error::InvalidActionArgument {
                    action: "allow".to_string(),
                    message: format!("unknown scope {:?}", other),
                })
            }
        };
        Ok(())
    }

    fn evaluate(&self, rule: &RuleMetadata, tx: &mut Transaction) {
        tx.allow(self.scope, rule.effective_id());
    }
}

/// `pass`
#[derive(Debug, Default)]
pub struct PassAction;

impl RuleAction for PassAction {
    fn name(&self) -> &'static str {
        "pass"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Disruptive
    }

    fn init(&mut self, _: &mut RuleMetadata, _: &str) -> Result<()> {
        Ok(())
    }

    fn evaluate(&self, _: &RuleMetadata, _: &mut Transaction) {}
}

/// `block`: replaced by the disruptive action of SecDefaultAction when the
/// rule is compiled.
#[derive(Debug, Default)]
pub struct BlockAction;

impl RuleAction for BlockAction {
    fn name(&self) -> &'static str {
        "block"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Disruptive
    }

    fn init(&mut self, meta: &mut RuleMetadata, _: &str) -> Result<()> {
        meta.block = true;
        Ok(())
    }

    fn evaluate(&self, _: &RuleMetadata, _: &mut Transaction) {}
}
