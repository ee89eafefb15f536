//! Flow control actions (skip, skipAfter).

use super::{ActionKind, RuleAction, RuleMetadata};
use crate::engine::Transaction;
use crate::error::{Error, Result};

/// Cursor change requested by a matched rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Skip the next N rules of the phase.
    Skip(usize),
    /// Continue after the first later rule or marker with this id, tag or name.
    SkipAfter(String),
}

/// `skip:N`
#[derive(Debug, Default)]
pub struct SkipAction {
    count: usize,
}

impl RuleAction for SkipAction {
    fn name(&self) -> &'static str {
        "skip"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Flow
    }

    fn init(&mut self, _: &mut RuleMetadata, arg: &str) -> Result<()> {
        match arg.trim().parse::<usize>() {
            Ok(n) if n > 0 => {
                self.count = n;
                Ok(())
            }
            _ => Err(Error::InvalidActionArgument {
                action: "skip".to_string(),
                message: format!("expected a positive count, got {:?}", arg),
            }),
        }
    }

    fn evaluate(&self, _: &RuleMetadata, tx: &mut Transaction) {
        tx.set_flow(Flow::Skip(self.count));
    }
}

/// `skipAfter:MARKER`
#[derive(Debug, Default)]
pub struct SkipAfterAction {
    label: String,
}

impl SkipAfterAction {
    /// Label this action jumps past.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl RuleAction for SkipAfterAction {
    fn name(&self) -> &'static str {
        "skipAfter"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Flow
    }

    fn init(&mut self, _: &mut RuleMetadata, arg: &str) -> Result<()> {
        let label = arg.trim().trim_matches('\'');
        if label.is_empty() {
            return Err(Error::InvalidActionArgument {
                action: "skipAfter".to_string(),
                message: "missing marker".to_string(),
            });
        }
        self.label = label.to_string();
        Ok(())
    }

    fn evaluate(&self, _: &RuleMetadata, tx: &mut Transaction) {
        tx.set_flow(Flow::SkipAfter(self.label.clone()));
    }
}
