//! Operator implementations and the registry that builds them by name.
//!
//! Every operator, built-in or plug-in, is created through
//! [`OperatorRegistry`]. Names are case-insensitive.

mod cache;
mod comparison;
mod detection;
mod dns;
mod inspect;
mod network;
mod pattern;
mod traits;
mod validation;

pub use comparison::{Comparison, NumericOperator, StringMatch, StringOperator};
pub use detection::{DetectSqliOperator, DetectXssOperator};
pub use inspect::{InspectFileOperator, INSPECT_TIMEOUT};
pub(crate) use inspect::run_program;
pub use network::{GeoLookupOperator, IpMatchOperator, RblOperator};
pub use pattern::{PmOperator, RestPathOperator, RxOperator};
pub use traits::{GeoResolver, Operator, OperatorContext, OperatorOptions, MAX_CAPTURES};
pub use validation::{
    ValidateByteRangeOperator, ValidateNidOperator, ValidateSchemaOperator,
    ValidateUrlEncodingOperator, ValidateUtf8EncodingOperator, VerifyCcOperator,
    JSON_REQUEST_BODY, JSON_RESPONSE_BODY,
};

#[cfg(test)]
pub(crate) use traits::testing;

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Builds an operator instance from its options.
pub type OperatorFactory = Arc<dyn Fn(&OperatorOptions) -> Result<Arc<dyn Operator>> + Send + Sync>;

/// Operators that take no argument.
const NO_ARGUMENT: &[&str] = &[
    "detectsqli",
    "detectxss",
    "validateurlencoding",
    "validateutf8encoding",
    "nomatch",
    "unconditionalmatch",
    "geolookup",
];

/// Name to factory map.
#[derive(Clone, Default)]
pub struct OperatorRegistry {
    factories: HashMap<String, OperatorFactory>,
}

impl OperatorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding every built-in operator.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtins();
        registry
    }

    /// Register (or replace) an operator under `name`.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&OperatorOptions) -> Result<Arc<dyn Operator>> + Send + Sync + 'static,
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

    /// Build operator `name` with `opts`.
    ///
    /// An operator that normally takes an argument but was given none
    /// matches unconditionally.
    pub fn build(&self, name: &str, opts: &OperatorOptions) -> Result<Arc<dyn Operator>> {
        let lower = name.to_ascii_lowercase();
        let factory = self
            .factories
            .get(&lower)
            .ok_or_else(|| Error::UnknownOperator {
                name: name.to_string(),
            })?;
        if opts.argument.trim().is_empty() && !NO_ARGUMENT.contains(&lower.as_str()) {
            return Ok(Arc::new(UnconditionalMatchOperator));
        }
        factory(opts)
    }

    /// Register every built-in operator.
    pub fn register_builtins(&mut self) {
        self.register("rx", |o| Ok(Arc::new(RxOperator::new(&o.argument)?)));
        self.register("pm", |o| Ok(Arc::new(PmOperator::new(&o.argument)?)));
        self.register("pmf", |o| Ok(Arc::new(PmOperator::from_file(o)?)));
        self.register("pmfromfile", |o| Ok(Arc::new(PmOperator::from_file(o)?)));
        self.register("pmfromdataset", |o| Ok(Arc::new(PmOperator::from_dataset(o)?)));
        self.register("restpath", |o| Ok(Arc::new(RestPathOperator::new(&o.argument)?)));

        let strings = [
            ("beginswith", StringMatch::BeginsWith),
            ("endswith", StringMatch::EndsWith),
            ("contains", StringMatch::Contains),
            ("containsword", StringMatch::ContainsWord),
            ("streq", StringMatch::Equals),
            ("strmatch", StringMatch::StrMatch),
            ("within", StringMatch::Within),
        ];
        for (name, kind) in strings {
            self.register(name, move |o| Ok(Arc::new(StringOperator::new(kind, &o.argument))));
        }

        let numbers = [
            ("eq", Comparison::Eq),
            ("ne", Comparison::Ne),
            ("gt", Comparison::Gt),
            ("ge", Comparison::Ge),
            ("lt", Comparison::Lt),
            ("le", Comparison::Le),
        ];
        for (name, comparison) in numbers {
            self.register(name, move |o| {
                Ok(Arc::new(NumericOperator::new(comparison, &o.argument)))
            });
        }

        self.register("ipmatch", |o| Ok(Arc::new(IpMatchOperator::new(&o.argument)?)));
        self.register("ipmatchf", |o| Ok(Arc::new(IpMatchOperator::from_file(o)?)));
        self.register("ipmatchfromfile", |o| Ok(Arc::new(IpMatchOperator::from_file(o)?)));
        self.register("ipmatchfromdataset", |o| {
            Ok(Arc::new(IpMatchOperator::from_dataset(o)?))
        });
        self.register("rbl", |o| Ok(Arc::new(RblOperator::new(o)?)));
        self.register("geolookup", |o| Ok(Arc::new(GeoLookupOperator::new(o))));

        self.register("detectsqli", |_| Ok(Arc::new(DetectSqliOperator)));
        self.register("detectxss", |_| Ok(Arc::new(DetectXssOperator)));

        self.register("validatebyterange", |o| {
            Ok(Arc::new(ValidateByteRangeOperator::new(&o.argument)?))
        });
        self.register("validateurlencoding", |_| Ok(Arc::new(ValidateUrlEncodingOperator)));
        self.register("validateutf8encoding", |_| Ok(Arc::new(ValidateUtf8EncodingOperator)));
        self.register("validatenid", |o| Ok(Arc::new(ValidateNidOperator::new(&o.argument)?)));
        self.register("validateschema", |o| Ok(Arc::new(ValidateSchemaOperator::new(o)?)));
        self.register("verifycc", |o| Ok(Arc::new(VerifyCcOperator::new(&o.argument)?)));

        self.register("inspectfile", |o| Ok(Arc::new(InspectFileOperator::new(o)?)));

        self.register("nomatch", |_| Ok(Arc::new(NoMatchOperator)));
        self.register("unconditionalmatch", |_| Ok(Arc::new(UnconditionalMatchOperator)));
    }
}

impl std::fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorRegistry")
            .field("operators", &self.factories.len())
            .finish()
    }
}

/// Operator that never matches.
pub struct NoMatchOperator;

impl Operator for NoMatchOperator {
    fn evaluate(&self, _ctx: &mut OperatorContext<'_>, _value: &str) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "noMatch"
    }
}

/// Operator that always matches.
pub struct UnconditionalMatchOperator;

impl Operator for UnconditionalMatchOperator {
    fn evaluate(&self, _ctx: &mut OperatorContext<'_>, _value: &str) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "unconditionalMatch"
    }
}
