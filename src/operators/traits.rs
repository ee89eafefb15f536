//! Operator trait, evaluation context and build options.

use crate::engine::{CancellationToken, Phase};
use crate::variables::TransactionVariables;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Highest capture slot (`TX.0` .. `TX.9`).
pub const MAX_CAPTURES: usize = 10;

/// Mutable view of the transaction handed to an operator.
pub struct OperatorContext<'a> {
    /// Transaction variables; operators may write captures and documented
    /// side-effect variables.
    pub variables: &'a mut TransactionVariables,
    /// Phase being evaluated.
    pub phase: Phase,
    /// Whether the rule has the `capture` action.
    pub capture: bool,
    /// Cancellation handle of the transaction.
    pub cancel: &'a CancellationToken,
}

impl<'a> OperatorContext<'a> {
    /// Create a context.
    pub fn new(
        variables: &'a mut TransactionVariables,
        phase: Phase,
        capture: bool,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            variables,
            phase,
            capture,
            cancel,
        }
    }

    /// Store `value` in `TX.<index>` when capturing. Slots past 9 are dropped.
    pub fn capture_field(&mut self, index: usize, value: &str) {
        if self.capture && index < MAX_CAPTURES {
            self.variables.tx_mut().set_one(index.to_string(), value);
        }
    }
}

/// Trait for all operators.
pub trait Operator: Send + Sync {
    /// Test `value`. Runtime failures are logged by the operator and
    /// reported as no match.
    fn evaluate(&self, ctx: &mut OperatorContext<'_>, value: &str) -> bool;

    /// Get the operator name.
    fn name(&self) -> &'static str;
}

/// Resolves an address to GEO collection fields (`COUNTRY_CODE`, `CITY`, ...).
pub trait GeoResolver: Send + Sync {
    /// Look up `addr`; `None` when unknown.
    fn lookup(&self, addr: IpAddr) -> Option<HashMap<String, String>>;
}

/// Everything an operator factory may need at rule build time.
#[derive(Clone, Default)]
pub struct OperatorOptions {
    /// Operator argument, macros not yet expanded.
    pub argument: String,
    /// Directory of the file the rule came from, for relative data files.
    pub root: Option<PathBuf>,
    /// Named datasets (`SecDataset`).
    pub datasets: Arc<HashMap<String, Vec<String>>>,
    /// Geo database for `@geoLookup`.
    pub geo: Option<Arc<dyn GeoResolver>>,
    /// DNS server for `@rbl`.
    pub nameserver: Option<SocketAddr>,
}

impl OperatorOptions {
    /// Options with just an argument.
    pub fn new(argument: impl Into<String>) -> Self {
        Self {
            argument: argument.into(),
            ..Self::default()
        }
    }

    /// Resolve a data file path against the rule's directory.
    pub fn resolve_path(&self, file: &str) -> PathBuf {
        let path = Path::new(file);
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl std::fmt::Debug for OperatorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorOptions")
            .field("argument", &self.argument)
            .field("root", &self.root)
            .field("datasets", &self.datasets.keys().collect::<Vec<_>>())
            .field("geo", &self.geo.is_some())
            .field("nameserver", &self.nameserver)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_field_limits() {
        let mut vars = TransactionVariables::new();
        let cancel = CancellationToken::new();
        let mut ctx = OperatorContext::new(&mut vars, Phase::RequestHeaders, true, &cancel);
        ctx.capture_field(0, "whole");
        ctx.capture_field(10, "dropped");
        assert_eq!(vars.tx().first("0"), Some("whole"));
        assert!(!vars.tx().contains_key("10"));
    }

    #[test]
    fn test_resolve_path() {
        let mut opts = OperatorOptions::new("x");
        assert_eq!(opts.resolve_path("a.data"), PathBuf::from("a.data"));
        opts.root = Some(PathBuf::from("/etc/rules"));
        assert_eq!(opts.resolve_path("a.data"), PathBuf::from("/etc/rules/a.data"));
        assert_eq!(opts.resolve_path("/abs.data"), PathBuf::from("/abs.data"));
    }
}
