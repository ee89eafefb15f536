//! Transformation pipeline.

use super::{Transformation, TransformationRegistry};
use crate::error::Result;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::debug;

/// A pipeline of transformations applied as a left fold.
#[derive(Clone, Default)]
pub struct TransformationPipeline {
    steps: Vec<Arc<dyn Transformation>>,
}

impl TransformationPipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pipeline from `t:` names. `none` drops everything before it.
    pub fn from_names<S: AsRef<str>>(registry: &TransformationRegistry, names: &[S]) -> Result<Self> {
        let mut steps = Vec::new();
        for name in names {
            let name = name.as_ref();
            if name.eq_ignore_ascii_case("none") {
                steps.clear();
                continue;
            }
            steps.push(registry.get(name)?);
        }
        Ok(Self { steps })
    }

    /// Add a transformation to the pipeline.
    pub fn add(&mut self, transformation: Arc<dyn Transformation>) {
        self.steps.push(transformation);
    }

    /// Apply all steps in order. A step that fails keeps the previous value.
    pub fn apply<'a>(&self, input: &'a str) -> Cow<'a, str> {
        let mut current: Cow<'a, str> = Cow::Borrowed(input);
        for step in &self.steps {
            if let Some(next) = run_step(step.as_ref(), &current) {
                current = Cow::Owned(next);
            }
        }
        current
    }

    /// Values for `multiMatch`: the input followed by every intermediate
    /// result that differs from the one before it.
    pub fn apply_all(&self, input: &str) -> Vec<String> {
        let mut values = vec![input.to_string()];
        for step in &self.steps {
            let last = values.last().map(String::as_str).unwrap_or_default();
            if let Some(next) = run_step(step.as_ref(), last) {
                if next != last {
                    values.push(next);
                }
            }
        }
        values
    }

    /// Check if the pipeline is empty.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Get the number of transformations.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Step names in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|t| t.name()).collect()
    }
}

/// Run one step; `None` means the value is unchanged.
fn run_step(step: &dyn Transformation, value: &str) -> Option<String> {
    match step.transform(value) {
        Ok(Cow::Owned(s)) => Some(s),
        Ok(Cow::Borrowed(_)) => None,
        Err(e) => {
            debug!(error = %e, "transformation failed, keeping value");
            None
        }
    }
}

impl std::fmt::Debug for TransformationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformationPipeline")
            .field("steps", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(names: &[&str]) -> TransformationPipeline {
        TransformationPipeline::from_names(&TransformationRegistry::with_builtins(), names).unwrap()
    }

    #[test]
    fn test_empty_pipeline() {
        assert_eq!(TransformationPipeline::new().apply("hello"), "hello");
    }

    #[test]
    fn test_left_fold() {
        assert_eq!(pipeline(&["urlDecode", "lowercase"]).apply("HELLO%20WORLD"), "hello world");
    }

    #[test]
    fn test_none_resets() {
        let p = pipeline(&["lowercase", "none", "uppercase"]);
        assert_eq!(p.len(), 1);
        assert_eq!(p.apply("hello"), "HELLO");
    }

    #[test]
    fn test_soft_error_keeps_value() {
        let p = pipeline(&["hexDecode", "uppercase"]);
        assert_eq!(p.apply("zz"), "ZZ");
    }

    #[test]
    fn test_apply_all_for_multi_match() {
        let p = pipeline(&["urlDecode", "lowercase", "trim"]);
        assert_eq!(p.apply_all("A%20B"), vec!["A%20B", "A B", "a b"]);
    }

    #[test]
    fn test_unknown_name_fails() {
        let registry = TransformationRegistry::with_builtins();
        assert!(TransformationPipeline::from_names(&registry, &["nope"]).is_err());
    }
}
