//! # zentinel-waf
//!
//! A SecLang web application firewall engine in pure Rust.
//!
//! Rules written in the ModSecurity directive language are compiled once
//! into a [`Waf`]; every HTTP exchange is then fed through a
//! [`Transaction`] phase by phase. The engine never touches the network
//! itself: an HTTP adapter hands it the request and response and acts on
//! the [`Interruption`] it returns.
//!
//! ## Features
//!
//! - SecRule, SecAction, SecMarker and the configuration directives
//! - Operators, transformations and actions of the ModSecurity catalog
//! - Body processors for urlencoded, multipart, JSON, JSON streams, XML,
//!   CSV and raw bodies
//! - Persistent collections with a pluggable back-end
//! - Audit logging in native, JSON, legacy JSON and OCSF formats
//!
//! ## Quick Start
//!
//! ```no_run
//! use zentinel_waf::{Waf, WafConfig};
//!
//! let waf = Waf::new(WafConfig::new().with_directives(
//!     r#"SecRule ARGS:id "@rx ^[0-9]+$" "id:100,phase:1,pass,nolog"
//!        SecRule ARGS:id "!@rx ^[0-9]+$" "id:101,phase:1,deny,status:400""#,
//! ))?;
//!
//! let mut tx = waf.new_transaction();
//! tx.process_connection("203.0.113.7", 51200, "10.0.0.1", 443);
//! tx.process_uri("/users?id=1%27", "GET", "HTTP/1.1");
//! tx.add_request_header("Host", "example.com");
//! if let Some(interruption) = tx.process_request_headers() {
//!     println!("blocked: {}", interruption.status);
//! }
//! tx.process_logging();
//! tx.close()?;
//! # Ok::<(), zentinel_waf::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod actions;
pub mod auditlog;
pub mod bodyprocessors;
pub mod detection;
pub mod engine;
pub mod error;
pub mod macros;
pub mod operators;
pub mod parser;
pub mod persistence;
pub mod transformations;
pub mod variables;

pub use engine::{Interruption, MatchedRule, Phase, Transaction, Waf, WafConfig};
pub use error::{Error, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
