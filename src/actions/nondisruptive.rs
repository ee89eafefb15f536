//! Non-disruptive actions: collection writes, persistence, logging flags,
//! content injection, external programs and audit log sanitisation.

use super::{ActionKind, RuleAction, RuleMetadata};
use crate::auditlog::Sanitisation;
use crate::engine::Transaction;
use crate::error::{Error, Result};
use crate::macros::Macro;
use crate::operators::{run_program, INSPECT_TIMEOUT};
use crate::variables::VariableName;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::warn;

fn invalid(action: &str, message: impl Into<String>) -> Error {
    Error::InvalidActionArgument {
        action: action.to_string(),
        message: message.into(),
    }
}

/// Split `COLLECTION.key` and check the collection is writable.
fn collection_target(action: &str, target: &str) -> Result<(VariableName, Macro)> {
    let (col, key) = target
        .split_once('.')
        .ok_or_else(|| invalid(action, format!("expected COLLECTION.key, got {:?}", target)))?;
    let variable = VariableName::from_name(col.trim())
        .ok_or_else(|| invalid(action, format!("unknown collection {:?}", col)))?;
    if !variable.is_writable() {
        return Err(invalid(action, format!("collection {} is read-only", variable)));
    }
    let key = key.trim();
    if key.is_empty() {
        return Err(invalid(action, "missing key"));
    }
    Ok((variable, Macro::compile(key)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SetVarOp {
    #[default]
    Set,
    Add,
    Sub,
    Delete,
}

/// `setvar:tx.score=+%{tx.critical_anomaly_score}`
///
/// Forms: `col.key=value`, `col.key=+n`, `col.key=-n`, `col.key+=n`,
/// `col.key-=n`, `!col.key` (delete) and `col.key` (set to `1`). Both the
/// key and the value may contain macros.
#[derive(Debug, Default)]
pub struct SetVarAction {
    collection: Option<VariableName>,
    key: Macro,
    value: Macro,
    op: SetVarOp,
}

impl RuleAction for SetVarAction {
    fn name(&self) -> &'static str {
        "setvar"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::NonDisruptive
    }

    fn init(&mut self, _: &mut RuleMetadata, arg: &str) -> Result<()> {
        let arg = arg.trim();
        if arg.is_empty() {
            return Err(invalid("setvar", "missing target"));
        }

        if let Some(target) = arg.strip_prefix('!') {
            let (collection, key) = collection_target("setvar", target)?;
            self.collection = Some(collection);
            self.key = key;
            self.op = SetVarOp::Delete;
            return Ok(());
        }

        let (target, value) = match arg.split_once('=') {
            Some((t, v)) => (t, v),
            None => (arg, "1"),
        };

        let (target, mut op) = if let Some(t) = target.strip_suffix('+') {
            (t, SetVarOp::Add)
        } else if let Some(t) = target.strip_suffix('-') {
            (t, SetVarOp::Sub)
        } else {
            (target, SetVarOp::Set)
        };

        let value = if op == SetVarOp::Set {
            if let Some(v) = value.strip_prefix('+') {
                op = SetVarOp::Add;
                v
            } else if let Some(v) = value.strip_prefix('-').filter(|v| !v.is_empty()) {
                op = SetVarOp::Sub;
                v
            } else {
                value
            }
        } else {
            value
        };

        let (collection, key) = collection_target("setvar", target)?;
        self.collection = Some(collection);
        self.key = key;
        self.value = Macro::compile(value);
        self.op = op;
        Ok(())
    }

    fn evaluate(&self, rule: &RuleMetadata, tx: &mut Transaction) {
        let Some(collection) = self.collection else {
            return;
        };
        let key = self.key.expand(tx.variables());
        if key.is_empty() {
            warn!(rule_id = rule.effective_id(), "setvar: key expanded to nothing");
            return;
        }
        let value = self.value.expand(tx.variables());
        if matches!(self.op, SetVarOp::Delete | SetVarOp::Set) {
            tx.record_overwrite(collection, &key);
        }
        match self.op {
            SetVarOp::Delete => tx.variables_mut().map_mut(collection).remove(&key),
            SetVarOp::Set => tx.variables_mut().map_mut(collection).set_one(key, value),
            SetVarOp::Add | SetVarOp::Sub => {
                let delta: i64 = match value.trim().parse() {
                    Ok(n) => n,
                    Err(_) => {
                        warn!(
                            rule_id = rule.effective_id(),
                            value = %value,
                            "setvar: value is not a number"
                        );
                        return;
                    }
                };
                let delta = if self.op == SetVarOp::Add {
                    delta
                } else {
                    delta.saturating_neg()
                };
                tx.record_delta(collection, &key, delta);
                let map = tx.variables_mut().map_mut(collection);
                let next = map.get_int(&key).saturating_add(delta);
                map.set_one(key, next.to_string());
            }
        }
    }
}

/// `setenv:name=value`
#[derive(Debug, Default)]
pub struct SetEnvAction {
    key: Macro,
    value: Macro,
}

impl RuleAction for SetEnvAction {
    fn name(&self) -> &'static str {
        "setenv"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::NonDisruptive
    }

    fn init(&mut self, _: &mut RuleMetadata, arg: &str) -> Result<()> {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| invalid("setenv", format!("expected name=value, got {:?}", arg)))?;
        if key.trim().is_empty() {
            return Err(invalid("setenv", "missing name"));
        }
        self.key = Macro::compile(key.trim());
        self.value = Macro::compile(value);
        Ok(())
    }

    fn evaluate(&self, _: &RuleMetadata, tx: &mut Transaction) {
        let key = self.key.expand(tx.variables());
        let value = self.value.expand(tx.variables());
        tx.variables_mut().map_mut(VariableName::Env).set_one(key, value);
    }
}

/// `initcol:ip=%{REMOTE_ADDR}` and its shortcuts `setuid`, `setsid` and
/// `setrsc`.
#[derive(Debug)]
pub struct InitColAction {
    name: &'static str,
    fixed: Option<VariableName>,
    collection: Option<VariableName>,
    key: Macro,
}

impl InitColAction {
    /// `initcol:COLLECTION=key`
    pub fn initcol() -> Self {
        Self::new("initcol", None)
    }

    /// `setuid:key`, opens USER.
    pub fn setuid() -> Self {
        Self::new("setuid", Some(VariableName::User))
    }

    /// `setsid:key`, opens SESSION.
    pub fn setsid() -> Self {
        Self::new("setsid", Some(VariableName::Session))
    }

    /// `setrsc:key`, opens RESOURCE.
    pub fn setrsc() -> Self {
        Self::new("setrsc", Some(VariableName::Resource))
    }

    fn new(name: &'static str, fixed: Option<VariableName>) -> Self {
        Self {
            name,
            fixed,
            collection: fixed,
            key: Macro::default(),
        }
    }
}

impl RuleAction for InitColAction {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> ActionKind {
        ActionKind::NonDisruptive
    }

    fn init(&mut self, _: &mut RuleMetadata, arg: &str) -> Result<()> {
        let key = match self.fixed {
            Some(_) => arg,
            None => {
                let (col, key) = arg
                    .split_once('=')
                    .ok_or_else(|| invalid(self.name, format!("expected COLLECTION=key, got {:?}", arg)))?;
                let variable = VariableName::from_name(col.trim())
                    .filter(VariableName::is_persistent)
                    .ok_or_else(|| invalid(self.name, format!("{:?} is not a persistent collection", col)))?;
                self.collection = Some(variable);
                key
            }
        };
        if key.trim().is_empty() {
            return Err(invalid(self.name, "missing collection key"));
        }
        self.key = Macro::compile(key.trim());
        Ok(())
    }

    fn evaluate(&self, _: &RuleMetadata, tx: &mut Transaction) {
        let Some(collection) = self.collection else {
            return;
        };
        let key = self.key.expand(tx.variables());
        tx.init_collection(collection, key);
    }
}

/// `expirevar:ip.blocked=60`
#[derive(Debug, Default)]
pub struct ExpireVarAction {
    collection: Option<VariableName>,
    key: Macro,
    seconds: Macro,
}

impl RuleAction for ExpireVarAction {
    fn name(&self) -> &'static str {
        "expirevar"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::NonDisruptive
    }

    fn init(&mut self, _: &mut RuleMetadata, arg: &str) -> Result<()> {
        let (target, seconds) = arg
            .split_once('=')
            .ok_or_else(|| invalid("expirevar", format!("expected COLLECTION.key=seconds, got {:?}", arg)))?;
        let (collection, key) = collection_target("expirevar", target)?;
        self.collection = Some(collection);
        self.key = key;
        self.seconds = Macro::compile(seconds.trim());
        Ok(())
    }

    fn evaluate(&self, rule: &RuleMetadata, tx: &mut Transaction) {
        let Some(collection) = self.collection else {
            return;
        };
        let key = self.key.expand(tx.variables());
        let seconds = self.seconds.expand(tx.variables());
        match seconds.trim().parse::<u64>() {
            Ok(secs) => tx.expire_var(collection, key, Duration::from_secs(secs)),
            Err(_) => warn!(rule_id = rule.effective_id(), value = %seconds, "expirevar: bad duration"),
        }
    }
}

/// `log`, `nolog`, `auditlog` and `noauditlog`.
#[derive(Debug)]
pub struct LogFlagAction {
    name: &'static str,
}

impl LogFlagAction {
    /// Action for one of the four flag names.
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl RuleAction for LogFlagAction {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Metadata
    }

    fn init(&mut self, meta: &mut RuleMetadata, _: &str) -> Result<()> {
        match self.name {
            "log" => {
                meta.log = true;
                meta.audit_log = true;
            }
            "nolog" => {
                meta.log = false;
                meta.audit_log = false;
            }
            "auditlog" => meta.audit_log = true,
            _ => meta.audit_log = false,
        }
        Ok(())
    }

    fn evaluate(&self, _: &RuleMetadata, _: &mut Transaction) {}
}

/// `append:text` and `prepend:text` for response body injection.
#[derive(Debug)]
pub struct ContentInjectionAction {
    prepend: bool,
    content: Macro,
}

impl ContentInjectionAction {
    /// `append`
    pub fn append() -> Self {
        Self {
            prepend: false,
            content: Macro::default(),
        }
    }

    /// `prepend`
    pub fn prepend() -> Self {
        Self {
            prepend: true,
            content: Macro::default(),
        }
    }
}

impl RuleAction for ContentInjectionAction {
    fn name(&self) -> &'static str {
        if self.prepend {
            "prepend"
        } else {
            "append"
        }
    }

    fn kind(&self) -> ActionKind {
        ActionKind::NonDisruptive
    }

    fn init(&mut self, _: &mut RuleMetadata, arg: &str) -> Result<()> {
        self.content = Macro::compile(arg);
        Ok(())
    }

    fn evaluate(&self, _: &RuleMetadata, tx: &mut Transaction) {
        let content = self.content.expand(tx.variables());
        tx.inject_content(self.prepend, content);
    }
}

/// `exec:/path/to/program`
#[derive(Debug, Default)]
pub struct ExecAction {
    program: PathBuf,
}

impl RuleAction for ExecAction {
    fn name(&self) -> &'static str {
        "exec"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::NonDisruptive
    }

    fn init(&mut self, meta: &mut RuleMetadata, arg: &str) -> Result<()> {
        let program = arg.trim();
        if program.is_empty() {
            return Err(invalid("exec", "missing program path"));
        }
        let path = PathBuf::from(program);
        self.program = match meta.file.as_ref().and_then(|f| f.parent()) {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path,
        };
        Ok(())
    }

    fn evaluate(&self, rule: &RuleMetadata, tx: &mut Transaction) {
        if !run_program(&self.program, &[], INSPECT_TIMEOUT, tx.cancel_token()) {
            warn!(
                rule_id = rule.effective_id(),
                program = %self.program.display(),
                "exec: program failed"
            );
        }
    }
}

/// `pause:ms`. Stops early when the transaction is cancelled.
#[derive(Debug, Default)]
pub struct PauseAction {
    duration: Duration,
}

impl RuleAction for PauseAction {
    fn name(&self) -> &'static str {
        "pause"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::NonDisruptive
    }

    fn init(&mut self, _: &mut RuleMetadata, arg: &str) -> Result<()> {
        let ms: u64 = arg
            .trim()
            .parse()
            .map_err(|_| invalid("pause", format!("expected milliseconds, got {:?}", arg)))?;
        self.duration = Duration::from_millis(ms);
        Ok(())
    }

    fn evaluate(&self, _: &RuleMetadata, tx: &mut Transaction) {
        const STEP: Duration = Duration::from_millis(10);
        let started = Instant::now();
        while started.elapsed() < self.duration && !tx.cancel_token().is_cancelled() {
            std::thread::sleep(STEP.min(self.duration.saturating_sub(started.elapsed())));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SanitiseTarget {
    Arg,
    RequestHeader,
    ResponseHeader,
    Matched,
    MatchedBytes,
}

/// `sanitiseArg`, `sanitiseRequestHeader`, `sanitiseResponseHeader`,
/// `sanitiseMatched` and `sanitiseMatchedBytes[:prefix/suffix]`.
///
/// Values are masked in the audit log only; rules still see them.
#[derive(Debug)]
pub struct SanitiseAction {
    name: &'static str,
    target: SanitiseTarget,
    key: String,
    keep: (usize, usize),
}

impl SanitiseAction {
    /// Build the action registered under `name`.
    pub fn new(name: &'static str) -> Self {
        let target = match name {
            "sanitisearg" => SanitiseTarget::Arg,
            "sanitiserequestheader" => SanitiseTarget::RequestHeader,
            "sanitiseresponseheader" => SanitiseTarget::ResponseHeader,
            "sanitisematchedbytes" => SanitiseTarget::MatchedBytes,
            _ => SanitiseTarget::Matched,
        };
        Self {
            name,
            target,
            key: String::new(),
            keep: (0, 0),
        }
    }
}

impl RuleAction for SanitiseAction {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> ActionKind {
        ActionKind::NonDisruptive
    }

    fn init(&mut self, _: &mut RuleMetadata, arg: &str) -> Result<()> {
        let arg = arg.trim();
        match self.target {
            SanitiseTarget::Arg | SanitiseTarget::RequestHeader | SanitiseTarget::ResponseHeader => {
                if arg.is_empty() {
                    return Err(invalid(self.name, "missing name"));
                }
                self.key = arg.to_string();
            }
            SanitiseTarget::MatchedBytes if !arg.is_empty() => {
                let (prefix, suffix) = arg.split_once('/').unwrap_or((arg, "0"));
                let parse = |s: &str| {
                    s.trim()
                        .parse::<usize>()
                        .map_err(|_| invalid(self.name, format!("expected prefix/suffix, got {:?}", arg)))
                };
                self.keep = (parse(prefix)?, parse(suffix)?);
            }
            _ => {}
        }
        Ok(())
    }

    fn evaluate(&self, _: &RuleMetadata, tx: &mut Transaction) {
        let fixed = match self.target {
            SanitiseTarget::Arg => Some(VariableName::Args),
            SanitiseTarget::RequestHeader => Some(VariableName::RequestHeaders),
            SanitiseTarget::ResponseHeader => Some(VariableName::ResponseHeaders),
            SanitiseTarget::Matched | SanitiseTarget::MatchedBytes => None,
        };
        if let Some(variable) = fixed {
            tx.sanitise(Sanitisation::new(variable, self.key.clone()));
            return;
        }

        let matched: Vec<Sanitisation> = tx
            .variables()
            .map(VariableName::MatchedVars)
            .keys()
            .filter_map(|full| {
                let (name, key) = full.split_once(':')?;
                let variable = VariableName::from_name(name)?;
                let mut s = Sanitisation::new(variable, key.to_string());
                s.keep_prefix = self.keep.0;
                s.keep_suffix = self.keep.1;
                Some(s)
            })
            .collect();
        for s in matched {
            tx.sanitise(s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setvar(arg: &str) -> SetVarAction {
        let mut action = SetVarAction::default();
        action.init(&mut RuleMetadata::default(), arg).unwrap();
        action
    }

    #[test]
    fn test_setvar_forms() {
        let a = setvar("tx.score=+5");
        assert_eq!(a.op, SetVarOp::Add);
        assert_eq!(a.value.raw(), "5");
        assert_eq!(a.collection, Some(VariableName::Tx));

        let a = setvar("tx.score-=%{tx.penalty}");
        assert_eq!(a.op, SetVarOp::Sub);
        assert!(a.value.is_dynamic());

        let a = setvar("!ip.blocked");
        assert_eq!(a.op, SetVarOp::Delete);
        assert_eq!(a.collection, Some(VariableName::Ip));

        let a = setvar("tx.flag");
        assert_eq!(a.op, SetVarOp::Set);
        assert_eq!(a.value.raw(), "1");

        let a = setvar("tx.msg=-");
        assert_eq!(a.op, SetVarOp::Set);
        assert_eq!(a.value.raw(), "-");
    }

    #[test]
    fn test_setvar_rejects_read_only() {
        let mut meta = RuleMetadata::default();
        assert!(SetVarAction::default().init(&mut meta, "args.x=1").is_err());
        assert!(SetVarAction::default().init(&mut meta, "nodot=1").is_err());
        assert!(SetVarAction::default().init(&mut meta, "").is_err());
    }

    #[test]
    fn test_initcol_init() {
        let mut meta = RuleMetadata::default();
        let mut a = InitColAction::initcol();
        a.init(&mut meta, "ip=%{REMOTE_ADDR}_%{REQUEST_HEADERS.user-agent}").unwrap();
        assert_eq!(a.collection, Some(VariableName::Ip));
        assert!(InitColAction::initcol().init(&mut meta, "tx=1").is_err());

        let mut a = InitColAction::setsid();
        a.init(&mut meta, "%{REQUEST_COOKIES.sessionid}").unwrap();
        assert_eq!(a.collection, Some(VariableName::Session));
    }

    #[test]
    fn test_log_flags() {
        let mut meta = RuleMetadata::default();
        LogFlagAction::new("nolog").init(&mut meta, "").unwrap();
        assert!(!meta.log && !meta.audit_log);
        LogFlagAction::new("auditlog").init(&mut meta, "").unwrap();
        assert!(!meta.log && meta.audit_log);
    }

    #[test]
    fn test_sanitise_bytes_argument() {
        let mut meta = RuleMetadata::default();
        let mut a = SanitiseAction::new("sanitisematchedbytes");
        a.init(&mut meta, "1/4").unwrap();
        assert_eq!(a.keep, (1, 4));
        assert!(SanitiseAction::new("sanitisearg").init(&mut meta, "").is_err());
    }

    #[test]
    fn test_pause_and_exec_init() {
        let mut meta = RuleMetadata::default();
        assert!(PauseAction::default().init(&mut meta, "abc").is_err());
        meta.file = Some(PathBuf::from("/etc/rules/main.conf"));
        let mut exec = ExecAction::default();
        exec.init(&mut meta, "scripts/notify.sh").unwrap();
        assert_eq!(exec.program, PathBuf::from("/etc/rules/scripts/notify.sh"));
    }
}
