//! A single HTTP exchange passing through the WAF.
//!
//! The adapter feeds the request and response into a [`Transaction`] in
//! order and asks after each phase whether the exchange was interrupted.
//! Rule evaluation itself lives in `evaluator.rs`.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{debug, warn};

use super::body_buffer::BodyBuffer;
use super::cancel::CancellationToken;
use super::config::{AuditEngine, BodyLimitAction, RuleEngineMode, UploadKeepFiles};
use super::interruption::{AllowScope, Disruption, Interruption};
use super::matched::MatchedRule;
use super::phase::Phase;
use super::rule::{RuleFilter, RuleRemovals};
use super::WafInner;
use crate::actions::Flow;
use crate::auditlog::{
    AuditFile, AuditLog, AuditLogParts, AuditMessage, AuditProducer, AuditRequest, AuditResponse,
    AuditTransaction, Headers, Sanitisation, TIMESTAMP_FORMAT,
};
use crate::bodyprocessors::{parse_query, processor_for_content_type, BodyProcessorOptions};
use crate::error::{Error, Result};
use crate::persistence::{open_collection, store_collection, CollectionWrite};
use crate::variables::{lossless_string, wire_bytes, Map, TransactionVariables, VariableKind, VariableName};

/// Settings a transaction starts with and `ctl` may change.
#[derive(Debug, Clone)]
pub struct TransactionSettings {
    /// `ctl:ruleEngine`.
    pub rule_engine: RuleEngineMode,
    /// `ctl:requestBodyAccess`.
    pub request_body_access: bool,
    /// `ctl:responseBodyAccess`.
    pub response_body_access: bool,
    /// `ctl:requestBodyProcessor`; `None` picks one from `Content-Type`.
    pub request_body_processor: Option<String>,
    /// `ctl:responseBodyProcessor`; `None` leaves the response unparsed.
    pub response_body_processor: Option<String>,
    /// `ctl:requestBodyLimit`.
    pub request_body_limit: u64,
    /// `ctl:forceRequestBodyVariable`.
    pub force_request_body_variable: bool,
    /// `ctl:auditEngine`.
    pub audit_engine: AuditEngine,
    /// `ctl:auditLogParts`.
    pub audit_log_parts: AuditLogParts,
    /// `ctl:debugLogLevel`.
    pub debug_log_level: u8,
}

/// Content queued by `prepend` and `append`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentInjection {
    /// Sent before the response body.
    pub prepend: String,
    /// Sent after the response body.
    pub append: String,
}

impl ContentInjection {
    /// Whether nothing was queued.
    pub fn is_empty(&self) -> bool {
        self.prepend.is_empty() && self.append.is_empty()
    }
}

#[derive(Debug)]
struct OpenCollection {
    variable: VariableName,
    key: String,
    loaded: Vec<(String, String)>,
    deltas: Vec<(String, i64)>,
    overwritten: Vec<String>,
}

#[derive(Debug)]
struct Expiration {
    variable: VariableName,
    field: String,
    ttl: Duration,
}

/// One request/response exchange.
///
/// A transaction is driven from a single thread. Phases run at most once
/// and in order; calling an entry point for a phase that already ran does
/// nothing. Once interrupted, every entry point except
/// [`Transaction::process_logging`] returns the recorded interruption.
pub struct Transaction {
    pub(crate) waf: Arc<WafInner>,
    id: String,
    pub(crate) vars: TransactionVariables,
    settings: TransactionSettings,
    pub(crate) removals: RuleRemovals,
    pub(crate) filter: Option<Arc<dyn RuleFilter>>,
    pub(crate) cancel: CancellationToken,
    last_phase: Option<Phase>,
    pub(crate) current_phase: Phase,
    pub(crate) interruption: Option<Interruption>,
    pub(crate) allow: Option<(AllowScope, Phase)>,
    pub(crate) flow: Option<Flow>,
    pub(crate) matched: Vec<MatchedRule>,
    request_body: Option<BodyBuffer>,
    response_body: Option<BodyBuffer>,
    collections: Vec<OpenCollection>,
    expirations: Vec<Expiration>,
    sanitisations: Vec<Sanitisation>,
    injection: ContentInjection,
    client_port: u16,
    server_port: u16,
    response_status: u16,
    started: DateTime<Local>,
    persisted: bool,
    closed: bool,
}

impl Transaction {
    pub(crate) fn new(waf: Arc<WafInner>, id: String) -> Self {
        let config = &waf.config;
        let settings = TransactionSettings {
            rule_engine: config.rule_engine,
            request_body_access: config.request_body_access,
            response_body_access: config.response_body_access,
            request_body_processor: None,
            response_body_processor: None,
            request_body_limit: config.request_body_limit,
            force_request_body_variable: false,
            audit_engine: config.audit_engine,
            audit_log_parts: config.audit_log_parts,
            debug_log_level: config.debug_log_level,
        };

        let mut vars = TransactionVariables::new();
        vars.set(VariableName::UniqueId, id.as_str());
        for (key, value) in std::env::vars() {
            vars.map_mut(VariableName::Env).add(key, value);
        }

        debug!(tx_id = %id, "transaction started");
        Self {
            waf,
            id,
            vars,
            settings,
            removals: RuleRemovals::default(),
            filter: None,
            cancel: CancellationToken::new(),
            last_phase: None,
            current_phase: Phase::RequestHeaders,
            interruption: None,
            allow: None,
            flow: None,
            matched: Vec::new(),
            request_body: None,
            response_body: None,
            collections: Vec::new(),
            expirations: Vec::new(),
            sanitisations: Vec::new(),
            injection: ContentInjection::default(),
            client_port: 0,
            server_port: 0,
            response_status: 0,
            started: Local::now(),
            persisted: false,
            closed: false,
        }
    }

    // --- request ---

    /// Record the connection endpoints.
    pub fn process_connection(&mut self, client_ip: &str, client_port: u16, server_ip: &str, server_port: u16) {
        self.client_port = client_port;
        self.server_port = server_port;
        self.vars.set(VariableName::RemoteAddr, client_ip);
        self.vars.set(VariableName::RemoteHost, client_ip);
        self.vars.set(VariableName::RemotePort, client_port.to_string());
        self.vars.set(VariableName::ServerAddr, server_ip);
        self.vars.set(VariableName::ServerPort, server_port.to_string());
    }

    /// Record the request line and parse the query string into `ARGS_GET`.
    pub fn process_uri(&mut self, uri: &str, method: &str, version: &str) {
        self.vars.set(VariableName::RequestMethod, method);
        self.vars.set(VariableName::RequestProtocol, version);
        self.vars.set(VariableName::RequestUriRaw, uri);
        self.vars
            .set(VariableName::RequestLine, format!("{} {} {}", method, uri, version));

        // Absolute form: drop scheme and authority.
        let relative = match uri.find("://") {
            Some(scheme_end) => {
                let rest = &uri[scheme_end + 3..];
                rest.find(['/', '?']).map_or("/", |i| &rest[i..])
            }
            None => uri,
        };
        let relative = relative.split('#').next().unwrap_or_default();
        self.vars.set(VariableName::RequestUri, relative);

        let (path, query) = match relative.split_once('?') {
            Some((path, query)) => (path, query),
            None => (relative, ""),
        };
        self.vars.set(VariableName::RequestFilename, path);
        self.vars
            .set(VariableName::RequestBasename, path.rsplit('/').next().unwrap_or_default());
        self.vars.set(VariableName::QueryString, query);

        let (pairs, invalid) = parse_query(query);
        let args = self.vars.map_mut(VariableName::ArgsGet);
        for (key, value) in pairs {
            args.add(key, value);
        }
        if invalid {
            self.vars.set(VariableName::UrlencodedError, "1");
        }
    }

    /// Add a request header. `Cookie`, `Host` and `Authorization` also
    /// fill `REQUEST_COOKIES`, `SERVER_NAME` and `AUTH_TYPE`.
    pub fn add_request_header(&mut self, name: &str, value: &str) {
        self.vars.map_mut(VariableName::RequestHeaders).add(name, value);
        match name.to_ascii_lowercase().as_str() {
            "cookie" => {
                let cookies = self.vars.map_mut(VariableName::RequestCookies);
                for token in value.split(';').map(str::trim).filter(|t| !t.is_empty()) {
                    match token.split_once('=') {
                        Some((k, v)) => cookies.add(k.trim(), v.trim()),
                        None => cookies.add(token, ""),
                    }
                }
            }
            "host" => {
                let host = if value.starts_with('[') {
                    value.split_inclusive(']').next().unwrap_or(value)
                } else {
                    value.split(':').next().unwrap_or(value)
                };
                self.vars.set(VariableName::ServerName, host);
            }
            "authorization" => {
                let scheme = value.split_whitespace().next().unwrap_or_default();
                self.vars.set(VariableName::AuthType, scheme);
            }
            _ => {}
        }
    }

    /// Run phase 1.
    pub fn process_request_headers(&mut self) -> Option<Interruption> {
        self.run_phase(Phase::RequestHeaders)
    }

    /// Writer buffering the request body.
    pub fn request_body_writer(&mut self) -> BodyWriter<'_> {
        BodyWriter {
            tx: self,
            response: false,
        }
    }

    /// Buffer part of the request body.
    ///
    /// Past the body limit the transaction is interrupted with 413 under
    /// `Reject`, and the excess is dropped under `ProcessPartial`.
    pub fn write_request_body(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.settings.request_body_access || self.interruption.is_some() || data.is_empty() {
            return Ok(());
        }
        let config = &self.waf.config;
        let limit_action = config.request_body_limit_action;
        let buffer = self
            .request_body
            .get_or_insert_with(|| BodyBuffer::new(config.request_body_in_memory_limit, config.temp_dir.clone()));

        let limit = self.settings.request_body_limit;
        let room = limit.saturating_sub(buffer.size());
        if data.len() as u64 <= room {
            return buffer.write_all(data);
        }

        self.vars.set(VariableName::InboundDataError, "1");
        match limit_action {
            BodyLimitAction::Reject => {
                debug!(tx_id = %self.id, limit, "request body limit exceeded");
                if self.settings.rule_engine != RuleEngineMode::Off {
                    self.interrupt(Interruption::engine(413, Disruption::Deny));
                }
                Ok(())
            }
            BodyLimitAction::ProcessPartial => buffer.write_all(&data[..room as usize]),
        }
    }

    /// Parse the buffered request body and run phase 2.
    pub fn process_request_body(&mut self) -> Option<Interruption> {
        if !self.enter(Phase::RequestBody) {
            return self.interruption.clone();
        }
        if self.settings.rule_engine == RuleEngineMode::Off {
            return None;
        }
        let evaluated = self.settings.request_body_access && self.parse_request_body();
        if !evaluated {
            self.evaluate_phase(Phase::RequestBody);
        }
        self.interruption.clone()
    }

    /// Fill the body variables. Returns `true` when phase 2 already ran
    /// record by record.
    fn parse_request_body(&mut self) -> bool {
        let Some(mut buffer) = self.request_body.take() else {
            return false;
        };
        let content_type = self
            .vars
            .map(VariableName::RequestHeaders)
            .first("content-type")
            .unwrap_or_default()
            .to_string();
        let name = self
            .settings
            .request_body_processor
            .clone()
            .or_else(|| processor_for_content_type(&content_type).map(str::to_string));

        let raw = match buffer.read_prefix(self.settings.request_body_limit) {
            Ok(bytes) => lossless_string(bytes),
            Err(e) => {
                self.body_error(false, &format!("reading body failed: {}", e));
                self.request_body = Some(buffer);
                return false;
            }
        };
        self.vars.set(VariableName::RequestBodyLength, buffer.size().to_string());
        let keep_raw = self.settings.force_request_body_variable
            || name.as_deref().map_or(true, |n| n.eq_ignore_ascii_case("urlencoded"));
        if keep_raw {
            self.vars.set(VariableName::RequestBody, raw.as_str());
        }
        let full = format!("{}{}", self.request_head(), raw);
        self.vars
            .set(VariableName::FullRequestLength, wire_bytes(&full).len().to_string());
        self.vars.set(VariableName::FullRequest, full);

        let mut evaluated = false;
        if let Some(name) = name {
            self.vars.set(VariableName::RequestBodyProcessor, name.to_ascii_uppercase());
            match self.waf.config.body_processors.get(&name) {
                None => self.body_error(false, &format!("unknown body processor {}", name)),
                Some(processor) => {
                    let by_record = self.waf.config.request_body_records && processor.supports_records();
                    let result = match buffer.reader() {
                        Err(e) => Err(crate::bodyprocessors::BodyProcessorError::new(
                            processor.name(),
                            format!("reading body failed: {}", e),
                        )),
                        Ok(mut reader) if by_record => {
                            self.body_ok(false);
                            let mut records = 0usize;
                            let result = processor.process_records(&mut reader, &mut |index, record| {
                                records += 1;
                                self.evaluate_record(index, record)
                            });
                            evaluated = records > 0;
                            result
                        }
                        Ok(mut reader) => {
                            let opts = BodyProcessorOptions {
                                mime: content_type.clone(),
                                upload_dir: self.waf.config.upload_dir().to_path_buf(),
                                disk_access: self.waf.config.upload_dir.is_some()
                                    || self.waf.config.upload_keep_files != UploadKeepFiles::Off,
                            };
                            processor.process_request(&mut reader, &mut self.vars, &opts)
                        }
                    };
                    match result {
                        Ok(()) => self.body_ok(false),
                        Err(e) => {
                            self.body_error(false, &e.to_string());
                            // Records already ran without the error; let
                            // body error rules see it.
                            if evaluated && self.interruption.is_none() {
                                self.evaluate_phase(Phase::RequestBody);
                            }
                        }
                    }
                }
            }
        }
        self.request_body = Some(buffer);
        evaluated
    }

    /// Add one streamed record to `ARGS_POST`/`JSON` and run phase 2.
    /// Earlier records stay visible.
    fn evaluate_record(&mut self, index: usize, record: Vec<(String, String)>) -> bool {
        for (key, value) in record {
            self.vars.map_mut(VariableName::Json).add(key.clone(), value.clone());
            self.vars.map_mut(VariableName::ArgsPost).add(key, value);
        }
        if self.settings.debug_log_level >= 9 {
            tracing::trace!(tx_id = %self.id, record = index, "evaluating body record");
        }
        self.evaluate_phase(Phase::RequestBody);
        self.interruption.is_none()
    }

    fn request_head(&self) -> String {
        let mut head = self.vars.get(VariableName::RequestLine).unwrap_or_default().to_string();
        head.push_str("\r\n");
        for (name, value) in self.vars.map(VariableName::RequestHeaders).iter() {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");
        head
    }

    fn body_ok(&mut self, response: bool) {
        let (error, processor_error) = if response {
            (VariableName::ResbodyError, VariableName::ResbodyProcessorError)
        } else {
            (VariableName::ReqbodyError, VariableName::ReqbodyProcessorError)
        };
        self.vars.set(error, "0");
        self.vars.set(processor_error, "0");
    }

    fn body_error(&mut self, response: bool, message: &str) {
        debug!(tx_id = %self.id, response, error = message, "body processing failed");
        let names = if response {
            [
                VariableName::ResbodyError,
                VariableName::ResbodyErrorMsg,
                VariableName::ResbodyProcessorError,
                VariableName::ResbodyProcessorErrorMsg,
            ]
        } else {
            [
                VariableName::ReqbodyError,
                VariableName::ReqbodyErrorMsg,
                VariableName::ReqbodyProcessorError,
                VariableName::ReqbodyProcessorErrorMsg,
            ]
        };
        self.vars.set(names[0], "1");
        self.vars.set(names[1], message);
        self.vars.set(names[2], "1");
        self.vars.set(names[3], message);
    }

    // --- response ---

    /// Add a response header. `Content-Type` and `Content-Length` also
    /// fill their dedicated variables.
    pub fn add_response_header(&mut self, name: &str, value: &str) {
        self.vars.map_mut(VariableName::ResponseHeaders).add(name, value);
        if name.eq_ignore_ascii_case("content-type") {
            self.vars.set(VariableName::ResponseContentType, value);
        } else if name.eq_ignore_ascii_case("content-length") {
            self.vars.set(VariableName::ResponseContentLength, value.trim());
        }
    }

    /// Record the status line and run phase 3.
    pub fn process_response_headers(&mut self, status: u16, protocol: &str) -> Option<Interruption> {
        self.response_status = status;
        self.vars.set(VariableName::ResponseStatus, status.to_string());
        self.vars.set(VariableName::ResponseProtocol, protocol);
        self.vars.set(VariableName::StatusLine, format!("{} {}", protocol, status));
        self.run_phase(Phase::ResponseHeaders)
    }

    /// Writer buffering the response body.
    pub fn response_body_writer(&mut self) -> BodyWriter<'_> {
        BodyWriter {
            tx: self,
            response: true,
        }
    }

    /// Whether the response body is buffered for inspection.
    pub fn is_response_body_inspected(&self) -> bool {
        self.settings.response_body_access
            && self
                .vars
                .get(VariableName::ResponseContentType)
                .is_some_and(|t| self.waf.config.is_response_mime_allowed(t))
    }

    /// Buffer part of the response body. Data past the limit is dropped
    /// and flagged in `OUTBOUND_DATA_ERROR`.
    pub fn write_response_body(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.is_response_body_inspected() || self.interruption.is_some() || data.is_empty() {
            return Ok(());
        }
        let config = &self.waf.config;
        let buffer = self
            .response_body
            .get_or_insert_with(|| BodyBuffer::new(config.request_body_in_memory_limit, config.temp_dir.clone()));
        let room = config.response_body_limit.saturating_sub(buffer.size());
        if data.len() as u64 <= room {
            return buffer.write_all(data);
        }
        self.vars.set(VariableName::OutboundDataError, "1");
        buffer.write_all(&data[..room as usize])
    }

    /// Parse the buffered response body and run phase 4.
    pub fn process_response_body(&mut self) -> Option<Interruption> {
        if !self.enter(Phase::ResponseBody) {
            return self.interruption.clone();
        }
        if self.settings.rule_engine == RuleEngineMode::Off {
            return None;
        }
        if self.is_response_body_inspected() {
            self.parse_response_body();
        }
        self.evaluate_phase(Phase::ResponseBody);
        self.interruption.clone()
    }

    fn parse_response_body(&mut self) {
        let Some(mut buffer) = self.response_body.take() else {
            return;
        };
        match buffer.read_prefix(self.waf.config.response_body_limit) {
            Ok(bytes) => {
                if self.vars.get(VariableName::ResponseContentLength).is_none() {
                    self.vars.set(VariableName::ResponseContentLength, bytes.len().to_string());
                }
                self.vars.set(VariableName::ResponseBody, lossless_string(bytes));
            }
            Err(e) => self.body_error(true, &format!("reading body failed: {}", e)),
        }

        if let Some(name) = self.settings.response_body_processor.clone() {
            self.vars.set(VariableName::ResbodyProcessor, name.to_ascii_uppercase());
            let result = match self.waf.config.body_processors.get(&name) {
                None => Err(format!("unknown body processor {}", name)),
                Some(processor) => {
                    let opts = BodyProcessorOptions {
                        mime: self
                            .vars
                            .get(VariableName::ResponseContentType)
                            .unwrap_or_default()
                            .to_string(),
                        ..Default::default()
                    };
                    buffer
                        .reader()
                        .map_err(|e| format!("reading body failed: {}", e))
                        .and_then(|mut reader| {
                            processor
                                .process_response(&mut reader, &mut self.vars, &opts)
                                .map_err(|e| e.to_string())
                        })
                }
            };
            match result {
                Ok(()) => self.body_ok(true),
                Err(message) => self.body_error(true, &message),
            }
        }
        self.response_body = Some(buffer);
    }

    // --- logging and teardown ---

    /// Run phase 5, write persistent collections back and emit the audit
    /// record. Runs even after an interruption.
    pub fn process_logging(&mut self) {
        if !self.enter(Phase::Logging) {
            return;
        }
        if self.settings.rule_engine != RuleEngineMode::Off {
            self.evaluate_phase(Phase::Logging);
        }
        self.persist();
        self.emit_audit();
    }

    fn emit_audit(&mut self) {
        let waf = Arc::clone(&self.waf);
        let Some(pipeline) = waf.audit.as_ref() else {
            return;
        };
        let relevant = match self.settings.audit_engine {
            AuditEngine::Off => false,
            AuditEngine::On => true,
            AuditEngine::RelevantOnly => {
                self.matched.iter().any(MatchedRule::is_audited)
                    || waf
                        .config
                        .audit_log_relevant_status
                        .as_ref()
                        .is_some_and(|re| self.response_status != 0 && re.is_match(&self.response_status.to_string()))
            }
        };
        if !relevant || self.settings.audit_log_parts.is_empty() {
            return;
        }
        let log = self.audit_log();
        pipeline.emit(&log);
    }

    /// Build the audit record for the selected parts, sanitised.
    pub fn audit_log(&mut self) -> AuditLog {
        let parts = self.settings.audit_log_parts;
        let vars = &self.vars;
        let text = |name| vars.get(name).unwrap_or_default().to_string();

        let request = (parts.contains('B') || parts.contains('C') || parts.contains('I') || parts.contains('J'))
            .then(|| AuditRequest {
                method: text(VariableName::RequestMethod),
                protocol: text(VariableName::RequestProtocol),
                uri: text(VariableName::RequestUriRaw),
                headers: if parts.contains('B') {
                    headers(vars.map(VariableName::RequestHeaders))
                } else {
                    Headers::new()
                },
                body: String::new(),
                files: if parts.contains('J') {
                    vars.map(VariableName::FilesSizes)
                        .iter()
                        .map(|(name, size)| AuditFile {
                            name: name.to_string(),
                            size: size.parse().unwrap_or_default(),
                        })
                        .collect()
                } else {
                    Vec::new()
                },
            });
        let response = (parts.contains('E') || parts.contains('F')).then(|| AuditResponse {
            protocol: text(VariableName::ResponseProtocol),
            status: self.response_status,
            headers: if parts.contains('F') {
                headers(vars.map(VariableName::ResponseHeaders))
            } else {
                Headers::new()
            },
            body: if parts.contains('E') {
                text(VariableName::ResponseBody)
            } else {
                String::new()
            },
        });
        let producer = parts.contains('H').then(|| AuditProducer {
            connector: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            server: text(VariableName::ServerName),
            rule_engine: self.settings.rule_engine.as_str().to_string(),
            stopwatch: vars.elapsed().as_micros().to_string(),
            rulesets: self.waf.config.component_signatures.clone(),
        });

        let mut log = AuditLog {
            parts,
            transaction: AuditTransaction {
                timestamp: self.started.format(TIMESTAMP_FORMAT).to_string(),
                unix_timestamp: self.started.timestamp_nanos_opt().unwrap_or_default(),
                id: self.id.clone(),
                client_ip: text(VariableName::RemoteAddr),
                client_port: self.client_port,
                host_ip: text(VariableName::ServerAddr),
                host_port: self.server_port,
                server_id: text(VariableName::ServerName),
                request,
                response,
                producer,
                highest_severity: text(VariableName::HighestSeverity),
                is_interrupted: self.interruption.is_some(),
                interruption: self.interruption.clone(),
            },
            messages: self
                .matched
                .iter()
                .filter(|m| m.is_audited())
                .map(AuditMessage::from)
                .collect(),
        };

        if parts.contains('C') || parts.contains('I') {
            let body = self
                .request_body
                .as_mut()
                .map(|b| b.read_prefix(self.settings.request_body_limit));
            if let (Some(request), Some(Ok(bytes))) = (log.transaction.request.as_mut(), body) {
                request.body = String::from_utf8_lossy(&bytes).into_owned();
            }
        }

        for s in &self.sanitisations {
            let values = sanitised_values(&self.vars, s);
            log.sanitise(s, &values);
        }
        log
    }

    /// Write persistent collections back if phase 5 did not, remove
    /// uploaded files that are not kept, release the body buffers and
    /// report audited matches to the error callback. Safe to call more
    /// than once.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.persist();

        if let Some(callback) = &self.waf.config.error_callback {
            for m in self.matched.iter().filter(|m| m.is_audited()) {
                callback(m);
            }
        }

        let mut failure: Option<io::Error> = None;
        for mut buffer in [self.request_body.take(), self.response_body.take()].into_iter().flatten() {
            if let Err(e) = buffer.close() {
                failure.get_or_insert(e);
            }
        }

        let keep = match self.waf.config.upload_keep_files {
            UploadKeepFiles::On => true,
            UploadKeepFiles::Off => false,
            UploadKeepFiles::RelevantOnly => self.matched.iter().any(MatchedRule::is_audited),
        };
        if !keep {
            let uploads: Vec<PathBuf> = self
                .vars
                .map(VariableName::FilesTmpnames)
                .iter()
                .map(|(_, path)| PathBuf::from(path))
                .collect();
            for path in uploads {
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        debug!(tx_id = %self.id, path = %path.display(), error = %e, "upload not removed");
                        failure.get_or_insert(e);
                    }
                }
            }
        }

        debug!(tx_id = %self.id, matched = self.matched.len(), "transaction closed");
        match failure {
            Some(e) => Err(Error::Io(e)),
            None => Ok(()),
        }
    }

    fn persist(&mut self) {
        if self.persisted {
            return;
        }
        self.persisted = true;
        let engine = Arc::clone(&self.waf.persistence);
        for c in &self.collections {
            let fields: Vec<(String, String)> = self
                .vars
                .map(c.variable)
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            let write = CollectionWrite {
                fields: &fields,
                loaded: &c.loaded,
                deltas: &c.deltas,
            };
            store_collection(engine.as_ref(), c.variable.name(), &c.key, &write);
        }
        for e in &self.expirations {
            match self.collections.iter().find(|c| c.variable == e.variable) {
                Some(c) => engine.set_ttl(c.variable.name(), &c.key, &e.field, e.ttl),
                None => debug!(tx_id = %self.id, collection = e.variable.name(), "expirevar on a collection that was never opened"),
            }
        }
    }

    // --- phases ---

    /// Claim `phase`: false when it already ran, or the transaction was
    /// interrupted and `phase` is not logging.
    fn enter(&mut self, phase: Phase) -> bool {
        if self.interruption.is_some() && phase != Phase::Logging {
            return false;
        }
        if self.last_phase.is_some_and(|last| last >= phase) {
            return false;
        }
        self.last_phase = Some(phase);
        self.current_phase = phase;
        true
    }

    fn run_phase(&mut self, phase: Phase) -> Option<Interruption> {
        if self.enter(phase) && self.settings.rule_engine != RuleEngineMode::Off {
            self.evaluate_phase(phase);
        }
        self.interruption.clone()
    }

    // --- accessors ---

    /// Transaction id (`UNIQUE_ID`).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The interruption, if a rule or the engine decided one.
    pub fn interruption(&self) -> Option<&Interruption> {
        self.interruption.as_ref()
    }

    /// Whether the transaction was interrupted.
    pub fn is_interrupted(&self) -> bool {
        self.interruption.is_some()
    }

    /// Rules that matched so far, in match order.
    pub fn matched_rules(&self) -> &[MatchedRule] {
        &self.matched
    }

    /// The variables of this transaction.
    pub fn variables(&self) -> &TransactionVariables {
        &self.vars
    }

    /// Mutable access to the variables.
    pub fn variables_mut(&mut self) -> &mut TransactionVariables {
        &mut self.vars
    }

    /// Current settings.
    pub fn settings(&self) -> &TransactionSettings {
        &self.settings
    }

    /// Settings for `ctl`.
    pub fn settings_mut(&mut self) -> &mut TransactionSettings {
        &mut self.settings
    }

    /// Runtime rule removals for `ctl`.
    pub fn removals_mut(&mut self) -> &mut RuleRemovals {
        &mut self.removals
    }

    /// Skip the rules `filter` selects for the rest of the transaction.
    pub fn set_rule_filter(&mut self, filter: Arc<dyn RuleFilter>) {
        self.filter = Some(filter);
    }

    /// Content queued by `prepend` and `append`.
    pub fn content_injection(&self) -> &ContentInjection {
        &self.injection
    }

    /// Cancellation handle; clone it to cancel from another thread.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Phase currently (or last) evaluated.
    pub fn phase(&self) -> Phase {
        self.current_phase
    }

    // --- hooks for actions ---

    /// Record an interruption. Only the first one counts, and nothing is
    /// recorded unless the rule engine is `On`.
    pub fn interrupt(&mut self, interruption: Interruption) {
        if self.settings.rule_engine != RuleEngineMode::On {
            debug!(tx_id = %self.id, rule_id = interruption.rule_id, "interruption suppressed, engine not On");
            return;
        }
        if self.interruption.is_none() {
            debug!(tx_id = %self.id, interruption = %interruption.format_log(), "transaction interrupted");
            self.interruption = Some(interruption);
        }
    }

    /// Stop evaluating rules for `scope` from the current phase on.
    pub fn allow(&mut self, scope: AllowScope, rule_id: u64) {
        if self.settings.rule_engine != RuleEngineMode::On {
            return;
        }
        debug!(tx_id = %self.id, rule_id, ?scope, phase = %self.current_phase, "allow");
        self.allow = Some((scope, self.current_phase));
    }

    /// Move the rule cursor after the current rule.
    pub fn set_flow(&mut self, flow: Flow) {
        self.flow = Some(flow);
    }

    /// Load a persistent collection under `key` (`initcol`).
    pub fn init_collection(&mut self, variable: VariableName, key: String) {
        if !variable.is_persistent() {
            warn!(tx_id = %self.id, collection = variable.name(), "initcol on a non-persistent collection");
            return;
        }
        if self.collections.iter().any(|c| c.variable == variable) {
            debug!(tx_id = %self.id, collection = variable.name(), "collection already open");
            return;
        }
        let fields = open_collection(
            self.waf.persistence.as_ref(),
            variable.name(),
            &key,
            self.waf.config.collection_timeout,
        );
        let mut fields: Vec<(String, String)> = fields.into_iter().collect();
        fields.sort();

        let map = self.vars.map_mut(variable);
        map.clear();
        for (field, value) in &fields {
            map.add(field.clone(), value.clone());
        }
        debug!(tx_id = %self.id, collection = variable.name(), key = %key, fields = fields.len(), "collection opened");
        self.collections.push(OpenCollection {
            variable,
            key,
            loaded: fields,
            deltas: Vec::new(),
            overwritten: Vec::new(),
        });
    }

    /// Note a `+=`/`-=` on a persistent collection. Write-back adds the net
    /// change to the stored value unless the field was also set outright.
    pub fn record_delta(&mut self, variable: VariableName, field: &str, delta: i64) {
        let Some(c) = self.collections.iter_mut().find(|c| c.variable == variable) else {
            return;
        };
        if c.overwritten.iter().any(|f| f.eq_ignore_ascii_case(field)) {
            return;
        }
        match c.deltas.iter_mut().find(|(f, _)| f.eq_ignore_ascii_case(field)) {
            Some((_, total)) => *total = total.saturating_add(delta),
            None => c.deltas.push((field.to_string(), delta)),
        }
    }

    /// Note a plain set or delete on a persistent collection; the field is
    /// written back as the transaction left it.
    pub fn record_overwrite(&mut self, variable: VariableName, field: &str) {
        let Some(c) = self.collections.iter_mut().find(|c| c.variable == variable) else {
            return;
        };
        c.deltas.retain(|(f, _)| !f.eq_ignore_ascii_case(field));
        if !c.overwritten.iter().any(|f| f.eq_ignore_ascii_case(field)) {
            c.overwritten.push(field.to_string());
        }
    }

    /// Expire `field` of a persistent collection `ttl` after write-back.
    pub fn expire_var(&mut self, variable: VariableName, field: String, ttl: Duration) {
        if !variable.is_persistent() {
            debug!(tx_id = %self.id, collection = variable.name(), "expirevar ignored on a transient collection");
            return;
        }
        self.expirations.push(Expiration { variable, field, ttl });
    }

    /// Queue response content (`prepend`/`append`).
    pub fn inject_content(&mut self, prepend: bool, content: String) {
        if prepend {
            self.injection.prepend.push_str(&content);
        } else {
            self.injection.append.push_str(&content);
        }
    }

    /// Mask a value in the audit record.
    pub fn sanitise(&mut self, sanitisation: Sanitisation) {
        if !self.sanitisations.contains(&sanitisation) {
            self.sanitisations.push(sanitisation);
        }
    }
}

fn headers(map: &Map) -> Headers {
    let mut out = Headers::new();
    for (name, value) in map.iter() {
        out.entry(name.to_string()).or_default().push(value.to_string());
    }
    out
}

fn sanitised_values(vars: &TransactionVariables, s: &Sanitisation) -> Vec<String> {
    match s.variable.kind() {
        VariableKind::Map => vars.map(s.variable).get(&s.key).to_vec(),
        VariableKind::Concat(parts) => parts
            .iter()
            .flat_map(|p| vars.map(*p).get(&s.key).iter().cloned())
            .collect(),
        _ => vars.value(s.variable).into_iter().collect(),
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(tx_id = %self.id, error = %e, "transaction close failed");
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("phase", &self.current_phase)
            .field("interruption", &self.interruption)
            .field("matched", &self.matched.len())
            .finish_non_exhaustive()
    }
}

/// [`io::Write`] adapter over a transaction body.
pub struct BodyWriter<'a> {
    tx: &'a mut Transaction,
    response: bool,
}

impl Write for BodyWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.response {
            self.tx.write_response_body(buf)?;
        } else {
            self.tx.write_request_body(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
