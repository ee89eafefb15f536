//! Audit log formatters.

use super::record::{AuditLog, Headers};
use super::AuditLogError;
use rand::Rng;
use serde_json::{json, Value};
use std::fmt::Write as _;

/// Serializes an [`AuditLog`].
pub trait Formatter: Send + Sync {
    /// Formatter name as used by `SecAuditLogFormat`.
    fn name(&self) -> &'static str;

    /// MIME type of the output.
    fn mime(&self) -> &'static str {
        "application/json"
    }

    /// Serialize one record.
    fn format(&self, log: &AuditLog) -> Result<Vec<u8>, AuditLogError>;
}

/// `{transaction: {...}, messages: [...]}`, one line per record.
#[derive(Debug, Default)]
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn name(&self) -> &'static str {
        "json"
    }

    fn format(&self, log: &AuditLog) -> Result<Vec<u8>, AuditLogError> {
        Ok(serde_json::to_vec(log)?)
    }
}

fn request_line(log: &AuditLog) -> String {
    log.transaction
        .request
        .as_ref()
        .map(|r| format!("{} {} {}", r.method, r.uri, r.protocol))
        .unwrap_or_default()
}

fn flat_headers(headers: &Headers) -> serde_json::Map<String, Value> {
    headers
        .iter()
        .map(|(name, values)| (name.clone(), Value::String(values.join(", "))))
        .collect()
}

/// ModSecurity 2 JSON layout: `transaction`, `request`, `response` and
/// `audit_data` sections.
#[derive(Debug, Default)]
pub struct JsonLegacyFormatter;

impl Formatter for JsonLegacyFormatter {
    fn name(&self) -> &'static str {
        "jsonlegacy"
    }

    fn format(&self, log: &AuditLog) -> Result<Vec<u8>, AuditLogError> {
        let tx = &log.transaction;
        let mut doc = serde_json::Map::new();
        doc.insert(
            "transaction".to_string(),
            json!({
                "time": tx.timestamp,
                "transaction_id": tx.id,
                "remote_address": tx.client_ip,
                "remote_port": tx.client_port,
                "local_address": tx.host_ip,
                "local_port": tx.host_port,
            }),
        );

        if let Some(request) = &tx.request {
            let mut section = serde_json::Map::new();
            section.insert("request_line".to_string(), json!(request_line(log)));
            section.insert("headers".to_string(), Value::Object(flat_headers(&request.headers)));
            if !request.body.is_empty() {
                section.insert("body".to_string(), json!([request.body]));
            }
            doc.insert("request".to_string(), Value::Object(section));
        }

        if let Some(response) = &tx.response {
            let mut section = serde_json::Map::new();
            section.insert("protocol".to_string(), json!(response.protocol));
            section.insert("status".to_string(), json!(response.status));
            section.insert("headers".to_string(), Value::Object(flat_headers(&response.headers)));
            if !response.body.is_empty() {
                section.insert("body".to_string(), json!(response.body));
            }
            doc.insert("response".to_string(), Value::Object(section));
        }

        let mut audit = serde_json::Map::new();
        audit.insert(
            "messages".to_string(),
            json!(log.messages.iter().map(|m| m.log_line.as_str()).collect::<Vec<_>>()),
        );
        audit.insert("error_messages".to_string(), json!([]));
        if let Some(producer) = &tx.producer {
            let mut products = vec![format!("{} {}", producer.connector, producer.version)];
            products.extend(producer.rulesets.iter().cloned());
            audit.insert("producer".to_string(), json!(products));
            audit.insert("server".to_string(), json!(producer.server));
            audit.insert("engine_mode".to_string(), json!(producer.rule_engine));
            audit.insert("stopwatch".to_string(), json!({ "p1": producer.stopwatch }));
        }
        if let Some(interruption) = &tx.interruption {
            audit.insert(
                "action".to_string(),
                json!({
                    "intercepted": true,
                    "message": interruption.format_log(),
                }),
            );
        }
        doc.insert("audit_data".to_string(), Value::Object(audit));

        Ok(serde_json::to_vec(&Value::Object(doc))?)
    }
}

/// ModSecurity native format: `--boundary-X--` sections, one per part.
#[derive(Debug, Default)]
pub struct NativeFormatter;

impl NativeFormatter {
    fn boundary() -> String {
        let mut rng = rand::thread_rng();
        (0..8).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect()
    }

    fn headers(out: &mut String, headers: &Headers) {
        for (name, values) in headers {
            for value in values {
                let _ = writeln!(out, "{}: {}", name, value);
            }
        }
    }
}

impl Formatter for NativeFormatter {
    fn name(&self) -> &'static str {
        "native"
    }

    fn mime(&self) -> &'static str {
        "text/plain"
    }

    fn format(&self, log: &AuditLog) -> Result<Vec<u8>, AuditLogError> {
        let boundary = Self::boundary();
        let tx = &log.transaction;
        let mut out = String::new();

        for part in log.parts.letters() {
            let mut section = String::new();
            match part {
                'A' => {
                    let _ = writeln!(
                        section,
                        "[{}] {} {} {} {} {}",
                        tx.timestamp, tx.id, tx.client_ip, tx.client_port, tx.host_ip, tx.host_port
                    );
                }
                'B' => {
                    if let Some(request) = &tx.request {
                        let _ = writeln!(section, "{}", request_line(log));
                        Self::headers(&mut section, &request.headers);
                    }
                }
                'C' | 'I' => {
                    if let Some(request) = tx.request.as_ref().filter(|r| !r.body.is_empty()) {
                        let _ = writeln!(section, "{}", request.body);
                    }
                }
                'J' => {
                    for file in tx.request.iter().flat_map(|r| &r.files) {
                        let _ = writeln!(section, "{} {}", file.name, file.size);
                    }
                }
                'E' => {
                    if let Some(response) = tx.response.as_ref().filter(|r| !r.body.is_empty()) {
                        let _ = writeln!(section, "{}", response.body);
                    }
                }
                'F' => {
                    if let Some(response) = &tx.response {
                        let _ = writeln!(section, "{} {}", response.protocol, response.status);
                        Self::headers(&mut section, &response.headers);
                    }
                }
                'H' => {
                    for message in &log.messages {
                        let _ = writeln!(section, "Message: {}", message.log_line);
                    }
                    if let Some(interruption) = &tx.interruption {
                        let _ = writeln!(section, "Action: Intercepted {}", interruption.format_log());
                    }
                    if let Some(producer) = &tx.producer {
                        let _ = writeln!(section, "Stopwatch: {}", producer.stopwatch);
                        let _ = writeln!(section, "Producer: {} {}", producer.connector, producer.version);
                        for ruleset in &producer.rulesets {
                            let _ = writeln!(section, "Producer: {}", ruleset);
                        }
                        let _ = writeln!(section, "Server: {}", producer.server);
                        let _ = writeln!(section, "Engine-Mode: \"{}\"", producer.rule_engine);
                    }
                }
                'K' => {
                    for message in &log.messages {
                        let _ = writeln!(section, "{}", message.data.raw);
                    }
                }
                'Z' => {}
                _ => continue,
            }
            let _ = writeln!(out, "--{}-{}--", boundary, part);
            out.push_str(&section);
            if part != 'Z' {
                out.push('\n');
            }
        }
        Ok(out.into_bytes())
    }
}

/// OCSF 1.x HTTP Activity (class 4002).
#[derive(Debug, Default)]
pub struct OcsfFormatter;

impl OcsfFormatter {
    fn headers(headers: &Headers) -> Vec<Value> {
        headers
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |v| json!({"name": name, "value": v})))
            .collect()
    }

    /// OCSF severity id for a ModSecurity severity (0 emergency .. 7 debug).
    fn severity_id(highest: &str) -> u8 {
        match highest.parse::<u8>() {
            Ok(0..=1) => 6,
            Ok(2) => 5,
            Ok(3) => 4,
            Ok(4) => 3,
            Ok(5..=7) => 1,
            _ => 0,
        }
    }
}

impl Formatter for OcsfFormatter {
    fn name(&self) -> &'static str {
        "ocsf"
    }

    fn format(&self, log: &AuditLog) -> Result<Vec<u8>, AuditLogError> {
        let tx = &log.transaction;
        let (outcome, action) = if tx.is_interrupted { (2, "Denied") } else { (1, "Allowed") };
        let rules: Vec<Value> = log
            .messages
            .iter()
            .map(|m| {
                json!({
                    "id": m.data.id,
                    "msg": m.data.msg,
                    "data": m.data.data,
                    "severity": m.data.severity,
                    "tags": m.data.tags,
                })
            })
            .collect();
        let mut doc = json!({
            "class_uid": 4002,
            "class_name": "HTTP Activity",
            "category_uid": 4,
            "category_name": "Network Activity",
            "activity_id": 0,
            "type_uid": 400200,
            "time": tx.unix_timestamp / 1_000_000,
            "severity_id": Self::severity_id(&tx.highest_severity),
            "action_id": outcome,
            "action": action,
            "disposition_id": outcome,
            "status_id": 1,
            "metadata": {
                "uid": tx.id,
                "version": "1.1.0",
                "product": {
                    "name": env!("CARGO_PKG_NAME"),
                    "vendor_name": "Zentinel",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            },
            "src_endpoint": {"ip": tx.client_ip, "port": tx.client_port},
            "dst_endpoint": {"ip": tx.host_ip, "port": tx.host_port, "hostname": tx.server_id},
            "unmapped": {"rules": rules},
        });

        if let Some(request) = &tx.request {
            let (path, query) = request.uri.split_once('?').unwrap_or((&request.uri, ""));
            doc["http_request"] = json!({
                "http_method": request.method,
                "version": request.protocol,
                "url": {"path": path, "query_string": query, "hostname": tx.server_id},
                "http_headers": Self::headers(&request.headers),
            });
        }
        if let Some(response) = &tx.response {
            doc["http_response"] = json!({
                "code": response.status,
                "http_headers": Self::headers(&response.headers),
            });
        }
        if let Some(interruption) = &tx.interruption {
            doc["message"] = json!(interruption.format_log());
        }
        Ok(serde_json::to_vec(&doc)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auditlog::record::{AuditMessage, AuditMessageData, AuditRequest, AuditTransaction};
    use crate::auditlog::AuditLogParts;
    use crate::engine::{Disruption, Interruption};

    fn sample(parts: &str) -> AuditLog {
        let mut request = AuditRequest {
            method: "GET".to_string(),
            protocol: "HTTP/1.1".to_string(),
            uri: "/hello?id=0".to_string(),
            ..Default::default()
        };
        request.headers.insert("Host".to_string(), vec!["example.com".to_string()]);
        AuditLog {
            parts: AuditLogParts::parse(parts),
            transaction: AuditTransaction {
                timestamp: "02/Jan/2006:15:04:20 -0700".to_string(),
                unix_timestamp: 1_136_239_460_000_000_000,
                id: "tx1".to_string(),
                client_ip: "10.0.0.1".to_string(),
                client_port: 5555,
                host_ip: "10.0.0.2".to_string(),
                host_port: 80,
                request: Some(request),
                highest_severity: "2".to_string(),
                is_interrupted: true,
                interruption: Some(Interruption {
                    status: 403,
                    action: Disruption::Deny,
                    rule_id: 1,
                    data: String::new(),
                }),
                ..Default::default()
            },
            messages: vec![AuditMessage {
                actionset: "deny".to_string(),
                message: "bad id".to_string(),
                data: AuditMessageData {
                    id: 1,
                    msg: "bad id".to_string(),
                    raw: "SecRule ARGS:id \"@eq 0\" \"id:1,deny\"".to_string(),
                    ..Default::default()
                },
                log_line: "ModSecurity: Access denied.".to_string(),
            }],
        }
    }

    #[test]
    fn test_json_schema() {
        let bytes = JsonFormatter.format(&sample("ABZ")).unwrap();
        let doc: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc["transaction"]["id"], "tx1");
        assert_eq!(doc["transaction"]["timestamp"], "02/Jan/2006:15:04:20 -0700");
        assert_eq!(doc["transaction"]["request"]["uri"], "/hello?id=0");
        assert_eq!(doc["transaction"]["interruption"]["action"], "deny");
        assert_eq!(doc["messages"][0]["data"]["id"], 1);
        assert_eq!(doc["messages"][0]["actionset"], "deny");
        assert!(doc["messages"][0].get("log_line").is_none());
    }

    #[test]
    fn test_json_legacy() {
        let bytes = JsonLegacyFormatter.format(&sample("ABZ")).unwrap();
        let doc: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc["transaction"]["transaction_id"], "tx1");
        assert_eq!(doc["request"]["request_line"], "GET /hello?id=0 HTTP/1.1");
        assert_eq!(doc["request"]["headers"]["Host"], "example.com");
        assert_eq!(doc["audit_data"]["action"]["intercepted"], true);
    }

    #[test]
    fn test_native_sections() {
        let text = String::from_utf8(NativeFormatter.format(&sample("ABHKZ")).unwrap()).unwrap();
        let first = text.lines().next().unwrap();
        assert!(first.starts_with("--") && first.ends_with("-A--"));
        let boundary = &first[2..10];
        for part in ['B', 'H', 'K', 'Z'] {
            assert!(text.contains(&format!("--{}-{}--", boundary, part)), "missing {}", part);
        }
        assert!(!text.contains(&format!("--{}-C--", boundary)));
        assert!(text.contains("GET /hello?id=0 HTTP/1.1\nHost: example.com\n"));
        assert!(text.contains("Message: ModSecurity: Access denied."));
        assert!(text.contains("SecRule ARGS:id"));
    }

    #[test]
    fn test_ocsf() {
        let bytes = OcsfFormatter.format(&sample("ABZ")).unwrap();
        let doc: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc["class_uid"], 4002);
        assert_eq!(doc["action_id"], 2);
        assert_eq!(doc["severity_id"], 5);
        assert_eq!(doc["time"], 1_136_239_460_000i64);
        assert_eq!(doc["http_request"]["url"]["path"], "/hello");
        assert_eq!(doc["unmapped"]["rules"][0]["id"], 1);
    }
}
