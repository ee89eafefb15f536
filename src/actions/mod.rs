//! Rule actions and the registry that builds them by name.
//!
//! Every action goes through two steps: `init` runs once when the rule is
//! compiled and may record metadata on the rule; `evaluate` runs on the
//! transaction each time the rule matches. Metadata and data actions only
//! have an `init` step.

mod ctl;
mod data;
mod disruptive;
mod flow;
mod metadata;
mod nondisruptive;

pub use ctl::{CtlAction, CtlCommand};
pub use data::{CaptureAction, ChainAction, MultiMatchAction, StatusAction, TransformationAction};
pub use disruptive::{
    AllowAction, BlockAction, DenyAction, DropAction, PassAction, ProxyAction, RedirectAction,
    DEFAULT_DENY_STATUS, DEFAULT_REDIRECT_STATUS,
};
pub use flow::{Flow, SkipAction, SkipAfterAction};
pub use metadata::{
    AccuracyAction, IdAction, LogDataAction, MaturityAction, MsgAction, PhaseAction, RevAction,
    RuleMetadata, Severity, SeverityAction, TagAction, VerAction,
};
pub use nondisruptive::{
    ContentInjectionAction, ExecAction, ExpireVarAction, InitColAction, LogFlagAction,
    PauseAction, SanitiseAction, SetEnvAction, SetVarAction,
};

use crate::engine::Transaction;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// When an action takes effect. Runtime actions of a rule run in the
/// order `NonDisruptive`, `Flow`, `Disruptive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActionKind {
    /// Compile time only: id, msg, severity, tags.
    Metadata,
    /// Compile time only: shapes matching (t, capture, chain, status).
    Data,
    /// Runs on every match: setvar, ctl, initcol.
    NonDisruptive,
    /// Moves the evaluation cursor: skip, skipAfter.
    Flow,
    /// Decides the transaction: deny, drop, redirect, allow.
    Disruptive,
}

impl ActionKind {
    /// Whether `evaluate` has an effect.
    pub fn is_runtime(&self) -> bool {
        matches!(self, Self::NonDisruptive | Self::Flow | Self::Disruptive)
    }
}

/// Trait for all actions.
pub trait RuleAction: Send + Sync {
    /// Action name as written in rules.
    fn name(&self) -> &'static str;

    /// Action kind.
    fn kind(&self) -> ActionKind;

    /// Parse the argument and record compile-time effects on the rule.
    fn init(&mut self, rule: &mut RuleMetadata, argument: &str) -> Result<()>;

    /// Apply the action to a transaction. Failures are logged, not returned.
    fn evaluate(&self, rule: &RuleMetadata, tx: &mut Transaction);
}

/// Creates a fresh, uninitialised action.
pub type ActionFactory = Arc<dyn Fn() -> Box<dyn RuleAction> + Send + Sync>;

/// Name to factory map. Names are case-insensitive.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    factories: HashMap<String, ActionFactory>,
}

impl ActionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in action.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtins();
        registry
    }

    /// Register an action factory, replacing any action of the same name.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn RuleAction> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_ascii_lowercase(), Arc::new(factory));
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_ascii_lowercase())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Create an uninitialised action.
    pub fn build(&self, name: &str) -> Result<Box<dyn RuleAction>> {
        self.factories
            .get(&name.to_ascii_lowercase())
            .map(|factory| factory())
            .ok_or_else(|| Error::UnknownAction {
                name: name.to_string(),
            })
    }

    /// Register every built-in action.
    pub fn register_builtins(&mut self) {
        fn boxed<A: RuleAction + Default + 'static>() -> Box<dyn RuleAction> {
            Box::<A>::default()
        }

        // Metadata
        self.register("id", boxed::<IdAction>);
        self.register("phase", boxed::<PhaseAction>);
        self.register("msg", boxed::<MsgAction>);
        self.register("logdata", boxed::<LogDataAction>);
        self.register("severity", boxed::<SeverityAction>);
        self.register("tag", boxed::<TagAction>);
        self.register("maturity", boxed::<MaturityAction>);
        self.register("accuracy", boxed::<AccuracyAction>);
        self.register("rev", boxed::<RevAction>);
        self.register("ver", boxed::<VerAction>);

        // Data
        self.register("t", boxed::<TransformationAction>);
        self.register("capture", boxed::<CaptureAction>);
        self.register("multimatch", boxed::<MultiMatchAction>);
        self.register("chain", boxed::<ChainAction>);
        self.register("status", boxed::<StatusAction>);

        // Non-disruptive
        self.register("setvar", boxed::<SetVarAction>);
        self.register("setenv", boxed::<SetEnvAction>);
        self.register("ctl", boxed::<CtlAction>);
        self.register("expirevar", boxed::<ExpireVarAction>);
        self.register("exec", boxed::<ExecAction>);
        self.register("pause", boxed::<PauseAction>);
        self.register("initcol", || Box::new(InitColAction::initcol()));
        self.register("setuid", || Box::new(InitColAction::setuid()));
        self.register("setsid", || Box::new(InitColAction::setsid()));
        self.register("setrsc", || Box::new(InitColAction::setrsc()));
        self.register("append", || Box::new(ContentInjectionAction::append()));
        self.register("prepend", || Box::new(ContentInjectionAction::prepend()));
        for name in ["log", "nolog", "auditlog", "noauditlog"] {
            self.register(name, move || Box::new(LogFlagAction::new(name)));
        }
        for name in [
            "sanitisearg",
            "sanitiserequestheader",
            "sanitiseresponseheader",
            "sanitisematched",
            "sanitisematchedbytes",
        ] {
            self.register(name, move || Box::new(SanitiseAction::new(name)));
        }
        // American spelling aliases.
        self.register("sanitizearg", || Box::new(SanitiseAction::new("sanitisearg")));
        self.register("sanitizematched", || Box::new(SanitiseAction::new("sanitisematched")));

        // Flow
        self.register("skip", boxed::<SkipAction>);
        self.register("skipafter", boxed::<SkipAfterAction>);

        // Disruptive
        self.register("deny", boxed::<DenyAction>);
        self.register("drop", boxed::<DropAction>);
        self.register("redirect", boxed::<RedirectAction>);
        self.register("proxy", boxed::<ProxyAction>);
        self.register("allow", boxed::<AllowAction>);
        self.register("pass", boxed::<PassAction>);
        self.register("block", boxed::<BlockAction>);
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}
