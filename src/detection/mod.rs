//! Injection detectors behind `@detectSQLi` and `@detectXSS`.
//!
//! Both detectors are tokenizer based: the input is scanned the way a SQL
//! parser or an HTML parser would see it, and the resulting shape is
//! checked for constructs that only make sense as an injection.

pub mod sqli;
pub mod xss;

pub use sqli::detect_sqli;
pub use xss::detect_xss;

/// Returns true if `input` looks like SQL injection.
pub fn is_sqli(input: &str) -> bool {
    detect_sqli(input).is_some()
}

/// Returns true if `input` looks like cross-site scripting.
pub fn is_xss(input: &str) -> bool {
    detect_xss(input).is_some()
}
