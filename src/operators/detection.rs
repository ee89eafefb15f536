//! Detection operators (`@detectSQLi`, `@detectXSS`).
//!
//! Thin wrappers over [`crate::detection`]. With `capture`, the fingerprint
//! is stored in `TX.0`.

use super::traits::{Operator, OperatorContext};
use crate::detection;

/// SQL injection detection operator (`@detectSQLi`).
pub struct DetectSqliOperator;

impl Operator for DetectSqliOperator {
    fn evaluate(&self, ctx: &mut OperatorContext<'_>, value: &str) -> bool {
        match detection::detect_sqli(value) {
            Some(fingerprint) => {
                ctx.capture_field(0, &fingerprint);
                true
            }
            None => false,
        }
    }

    fn name(&self) -> &'static str {
        "detectSQLi"
    }
}

/// XSS detection operator (`@detectXSS`).
pub struct DetectXssOperator;

impl Operator for DetectXssOperator {
    fn evaluate(&self, ctx: &mut OperatorContext<'_>, value: &str) -> bool {
        match detection::detect_xss(value) {
            Some(found) => {
                ctx.capture_field(0, &found);
                true
            }
            None => false,
        }
    }

    fn name(&self) -> &'static str {
        "detectXSS"
    }
}
