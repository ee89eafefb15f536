//! The WAF engine: compiled rules, shared services and transactions.

pub mod body_buffer;
mod cancel;
pub mod config;
mod evaluator;
pub mod interruption;
pub mod matched;
pub mod phase;
pub mod rule;
pub mod ruleset;
pub mod transaction;

pub use cancel::CancellationToken;
pub use config::{AuditEngine, BodyLimitAction, RuleEngineMode, UploadKeepFiles, WafConfig};
pub use interruption::{AllowScope, Disruption, Interruption};
pub use matched::{MatchedData, MatchedRule};
pub use phase::Phase;
pub use rule::{RuleFilter, RuleMatcher, TargetRemoval};
pub use ruleset::Ruleset;
pub use transaction::{BodyWriter, ContentInjection, Transaction, TransactionSettings};

use crate::auditlog::{AuditPipeline, WriterConfig};
use crate::error::{Error, Result};
use crate::parser::Parser;
use crate::persistence::{MemoryEngine, PersistenceEngine};
use config::RuleSource;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use tracing::info;

/// Length of generated transaction ids.
const TRANSACTION_ID_LEN: usize = 20;

/// State shared by every transaction of a [`Waf`].
pub(crate) struct WafInner {
    pub(crate) config: WafConfig,
    pub(crate) ruleset: Ruleset,
    pub(crate) persistence: Arc<dyn PersistenceEngine>,
    pub(crate) audit: Option<AuditPipeline>,
}

/// A configured WAF. Cheap to clone; clones share rules and services.
#[derive(Clone)]
pub struct Waf {
    inner: Arc<WafInner>,
}

impl Waf {
    /// Parse the configured rule sources, apply their settings and
    /// compile the ruleset.
    pub fn new(mut config: WafConfig) -> Result<Self> {
        let mut parser = Parser::new();
        for source in std::mem::take(&mut config.sources) {
            match source {
                RuleSource::Text(text) => parser.parse(&text)?,
                RuleSource::File(path) => parser.parse_glob(&path.to_string_lossy())?,
            }
        }
        let directives = parser.into_directives();
        for directive in &directives {
            config.apply(directive);
        }
        let ruleset = Ruleset::compile(&directives, &config)?;

        let persistence = match &config.persistence {
            Some(engine) => Arc::clone(engine),
            None => Arc::new(MemoryEngine::new(config.collection_timeout)) as Arc<dyn PersistenceEngine>,
        };

        let audit_configured = config.audit_engine != AuditEngine::Off
            || config.audit_log_target.is_some()
            || config.audit_log_storage_dir.is_some();
        let audit = if audit_configured {
            let writer = WriterConfig {
                target: config.audit_log_target.clone(),
                storage_dir: config.audit_log_storage_dir.clone(),
                ..Default::default()
            };
            let pipeline = AuditPipeline::new(
                &config.audit_log,
                &config.audit_log_format,
                &config.audit_log_type,
                writer,
            )
            .map_err(|e| Error::config(e.to_string()))?;
            Some(pipeline)
        } else {
            None
        };

        info!(
            rules = ruleset.len(),
            engine = config.rule_engine.as_str(),
            audit = audit.is_some(),
            "waf ready"
        );
        Ok(Self {
            inner: Arc::new(WafInner {
                config,
                ruleset,
                persistence,
                audit,
            }),
        })
    }

    /// Start a transaction with a random id.
    pub fn new_transaction(&self) -> Transaction {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TRANSACTION_ID_LEN)
            .map(char::from)
            .collect();
        self.new_transaction_with_id(id)
    }

    /// Start a transaction with the adapter's id.
    pub fn new_transaction_with_id(&self, id: impl Into<String>) -> Transaction {
        Transaction::new(Arc::clone(&self.inner), id.into())
    }

    /// Effective configuration.
    pub fn config(&self) -> &WafConfig {
        &self.inner.config
    }

    /// Compiled rules.
    pub fn ruleset(&self) -> &Ruleset {
        &self.inner.ruleset
    }

    /// Number of top-level rules.
    pub fn rule_count(&self) -> usize {
        self.inner.ruleset.len()
    }

    /// Stop the persistence engine and close the audit writer.
    pub fn close(&self) {
        self.inner.persistence.close();
        if let Some(audit) = &self.inner.audit {
            audit.close();
        }
    }
}

impl std::fmt::Debug for Waf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waf")
            .field("rules", &self.inner.ruleset.len())
            .field("rule_engine", &self.inner.config.rule_engine)
            .field("audit", &self.inner.audit)
            .finish()
    }
}
