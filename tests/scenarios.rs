//! End-to-end scenarios driven through the public API.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use zentinel_waf::engine::body_buffer::BodyBuffer;
use zentinel_waf::engine::Disruption;
use zentinel_waf::operators::{OperatorContext, OperatorOptions, OperatorRegistry};
use zentinel_waf::variables::{TransactionVariables, VariableName};
use zentinel_waf::{Transaction, Waf, WafConfig};

fn waf(rules: &str) -> Waf {
    Waf::new(WafConfig::new().with_directives(rules)).unwrap()
}

fn request(waf: &Waf, method: &str, uri: &str, headers: &[(&str, &str)]) -> Transaction {
    let mut tx = waf.new_transaction();
    tx.process_connection("192.0.2.10", 40000, "10.0.0.1", 80);
    tx.process_uri(uri, method, "HTTP/1.1");
    for (name, value) in headers {
        tx.add_request_header(name, value);
    }
    tx
}

fn matched_ids(tx: &Transaction) -> Vec<u64> {
    tx.matched_rules().iter().map(|m| m.rule.effective_id()).collect()
}

#[test]
fn deny_on_query_arg() {
    let waf = waf(r#"SecRule ARGS:id "@eq 0" "id:1,phase:1,deny,status:403""#);
    let mut tx = request(&waf, "GET", "/hello?id=0", &[("Host", "example.com")]);

    let interruption = tx.process_request_headers().unwrap();
    assert_eq!(interruption.status, 403);
    assert_eq!(interruption.action, Disruption::Deny);
    assert_eq!(interruption.rule_id, 1);
    assert_eq!(matched_ids(&tx), vec![1]);

    let json = serde_json::to_value(&interruption).unwrap();
    assert_eq!(json["action"], "deny");

    let mut clean = request(&waf, "GET", "/hello?id=7", &[]);
    assert!(clean.process_request_headers().is_none());
    assert!(clean.matched_rules().is_empty());
}

#[test]
fn ndjson_stream_record_match() {
    let waf = waf(
        r#"
        SecRequestBodyAccess On
        SecRule ARGS_POST:/json\.\d+\.name/ "juan" "id:3,phase:2,deny"
        "#,
    );
    let mut tx = request(&waf, "POST", "/ingest", &[("Content-Type", "application/x-ndjson")]);
    assert!(tx.process_request_headers().is_none());
    tx.request_body_writer()
        .write_all(b"{\"name\":\"jose\"}\n{\"name\":\"juan\"}\n")
        .unwrap();

    let interruption = tx.process_request_body().unwrap();
    assert_eq!(interruption.rule_id, 3);

    let m = &tx.matched_rules()[0];
    assert_eq!(m.matched[0].full_name(), "ARGS_POST:json.1.name");
    assert_eq!(m.matched[0].value, "juan");
    assert_eq!(tx.variables().get(VariableName::RequestBodyProcessor), Some("JSONSTREAM"));

    let post = tx.variables().map(VariableName::ArgsPost);
    assert_eq!(post.first("json.0.name"), Some("jose"));
    assert_eq!(post.first("json.1.name"), Some("juan"));
}

fn stream_request(waf: &Waf, body: &[u8]) -> Transaction {
    let mut tx = request(waf, "POST", "/ingest", &[("Content-Type", "application/x-ndjson")]);
    tx.process_request_headers();
    tx.request_body_writer().write_all(body).unwrap();
    tx
}

#[test]
fn stream_body_evaluated_once() {
    let waf = waf(
        r#"
        SecRequestBodyAccess On
        SecAction "id:1,phase:2,pass,nolog,setvar:tx.n=+1"
        "#,
    );
    let mut tx = stream_request(&waf, b"{\"a\":1}\n{\"a\":2}\n{\"a\":3}\n");
    assert!(tx.process_request_body().is_none());

    assert_eq!(tx.variables().tx().first("n"), Some("1"));
    assert_eq!(tx.matched_rules().len(), 1);
    let post = tx.variables().map(VariableName::ArgsPost);
    for (key, value) in [("json.0.a", "1"), ("json.1.a", "2"), ("json.2.a", "3")] {
        assert_eq!(post.first(key), Some(value), "{}", key);
    }
    assert_eq!(tx.variables().map(VariableName::Json).first("json.2.a"), Some("3"));
}

const BODY_ERROR_RULES: &str = r#"
    SecRequestBodyAccess On
    SecRule REQBODY_ERROR "!@eq 0" "id:5,phase:2,deny,status:400"
"#;

#[test]
fn stream_body_error_blocks() {
    let waf = waf(BODY_ERROR_RULES);
    let mut tx = stream_request(&waf, b"{\"a\":1}\n{oops\n");
    let interruption = tx.process_request_body().unwrap();
    assert_eq!((interruption.rule_id, interruption.status), (5, 400));
    assert_eq!(tx.variables().get(VariableName::ReqbodyError), Some("1"));
    assert_eq!(tx.variables().map(VariableName::ArgsPost).first("json.0.a"), Some("1"));
}

#[test]
fn record_mode_body_error_blocks() {
    let waf = Waf::new(
        WafConfig::new()
            .with_request_body_records(true)
            .with_directives(BODY_ERROR_RULES),
    )
    .unwrap();
    let mut tx = stream_request(&waf, b"{\"a\":1}\n{oops\n");
    let interruption = tx.process_request_body().unwrap();
    assert_eq!(interruption.rule_id, 5);
    assert_eq!(tx.variables().get(VariableName::ReqbodyError), Some("1"));
}

#[test]
fn record_mode_keeps_earlier_records() {
    let waf = Waf::new(WafConfig::new().with_request_body_records(true).with_directives(
        r#"
        SecRequestBodyAccess On
        SecAction "id:1,phase:2,pass,nolog,setvar:tx.n=+1"
        SecRule ARGS_POST:json.0.name "@streq jose" "id:2,phase:2,pass,nolog,setvar:tx.seen_first=+1"
        SecRule ARGS_POST:/json\.\d+\.name/ "juan" "id:3,phase:2,deny"
        "#,
    ))
    .unwrap();
    let mut tx = stream_request(
        &waf,
        b"{\"name\":\"jose\"}\n{\"name\":\"juan\"}\n{\"name\":\"ana\"}\n",
    );
    let interruption = tx.process_request_body().unwrap();
    assert_eq!(interruption.rule_id, 3);

    let tx_vars = tx.variables().tx();
    assert_eq!(tx_vars.first("n"), Some("2"));
    assert_eq!(tx_vars.first("seen_first"), Some("2"));
    let post = tx.variables().map(VariableName::ArgsPost);
    assert_eq!(post.first("json.0.name"), Some("jose"));
    assert_eq!(post.first("json.1.name"), Some("juan"));
    assert_eq!(post.first("json.2.name"), None);
}

#[test]
fn non_utf8_argument_keeps_its_bytes() {
    let waf = waf(
        r#"
        SecRule ARGS:a "@eq 1" "id:1,phase:1,pass,log,t:none,t:length"
        SecRule ARGS:a "@validateUtf8Encoding" "id:2,phase:1,pass,log"
        SecRule ARGS:a "@validateByteRange 32-126" "id:3,phase:1,pass,log"
        "#,
    );
    let mut tx = request(&waf, "GET", "/?a=%ff", &[]);
    tx.process_request_headers();
    assert_eq!(matched_ids(&tx), vec![1, 2, 3]);

    let mut clean = request(&waf, "GET", "/?a=caf%C3%A9", &[]);
    clean.process_request_headers();
    assert!(matched_ids(&clean).contains(&3));
    assert!(!matched_ids(&clean).contains(&1));
    assert!(!matched_ids(&clean).contains(&2));
}

#[test]
fn nested_macro_is_literal() {
    let waf = waf(r#"SecAction "id:1,phase:1,pass,nolog,setvar:tx.y=1,setvar:tx.out=a%{TX.%{TX.y}}b""#);
    let mut tx = request(&waf, "GET", "/", &[]);
    tx.process_request_headers();
    assert_eq!(tx.variables().tx().first("out"), Some("a%{TX.%{TX.y}}b"));
}

#[test]
fn multipart_extraction() {
    const BOUNDARY: &str = "---------------------------9051914041544843365972754266";
    let body = [
        format!("--{}", BOUNDARY),
        "Content-Disposition: form-data; name=\"text\"".to_string(),
        String::new(),
        "text default".to_string(),
        format!("--{}", BOUNDARY),
        "Content-Disposition: form-data; name=\"file1\"; filename=\"a.txt\"".to_string(),
        "Content-Type: text/plain".to_string(),
        String::new(),
        "Content of a.txt.".to_string(),
        format!("--{}", BOUNDARY),
        "Content-Disposition: form-data; name=\"file2\"; filename=\"a.html\"".to_string(),
        "Content-Type: text/html".to_string(),
        String::new(),
        "<!DOCTYPE html><title>Content of a.html.</title>".to_string(),
        format!("--{}--", BOUNDARY),
        String::new(),
    ]
    .join("\r\n");

    let waf = waf("SecRequestBodyAccess On");
    let content_type = format!("multipart/form-data; boundary={}", BOUNDARY);
    let mut tx = request(&waf, "POST", "/upload", &[("Content-Type", &content_type)]);
    tx.process_request_headers();
    tx.request_body_writer().write_all(body.as_bytes()).unwrap();
    assert!(tx.process_request_body().is_none());

    let vars = tx.variables();
    assert_eq!(vars.get(VariableName::ReqbodyError), Some("0"));
    assert_eq!(vars.map(VariableName::ArgsPost).first("text"), Some("text default"));
    let files: Vec<&str> = vars.map(VariableName::Files).iter().map(|(_, v)| v).collect();
    assert!(files.contains(&"a.txt"));
    assert!(files.contains(&"a.html"));
    assert_eq!(vars.map(VariableName::FilesSizes).first("a.txt"), Some("17"));
    assert!(vars
        .map(VariableName::MultipartPartHeaders)
        .get("file2")
        .iter()
        .any(|h| h.contains("Content-Disposition: form-data; name=\"file2\"; filename=\"a.html\"")));
}

#[test]
fn uploads_removed_on_close() {
    const BOUNDARY: &str = "xyz";
    let body = "--xyz\r\nContent-Disposition: form-data; name=\"f\"; filename=\"x.bin\"\r\n\r\nDATA\r\n--xyz--\r\n";
    let dir = tempfile::tempdir().unwrap();
    let config = WafConfig::new()
        .with_request_body_access(true)
        .with_uploads(dir.path(), zentinel_waf::engine::UploadKeepFiles::Off);
    let waf = Waf::new(config).unwrap();

    let content_type = format!("multipart/form-data; boundary={}", BOUNDARY);
    let mut tx = request(&waf, "POST", "/upload", &[("Content-Type", &content_type)]);
    tx.process_request_headers();
    tx.request_body_writer().write_all(body.as_bytes()).unwrap();
    tx.process_request_body();
    let path = tx
        .variables()
        .map(VariableName::FilesTmpnames)
        .first("f")
        .unwrap()
        .to_string();
    assert!(std::path::Path::new(&path).exists());

    tx.close().unwrap();
    assert!(!std::path::Path::new(&path).exists());
}

#[test]
fn body_spill_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let count = || std::fs::read_dir(dir.path()).unwrap().count();

    let mut buffer = BodyBuffer::new(8, dir.path());
    buffer.write_all(b"abcdefghij").unwrap();
    buffer.write_all(b"klmno").unwrap();
    assert_eq!(buffer.size(), 15);

    let mut out = Vec::new();
    std::io::Read::read_to_end(&mut buffer.reader().unwrap(), &mut out).unwrap();
    assert_eq!(out, b"abcdefghijklmno");
    assert_eq!(count(), 1);

    buffer.close().unwrap();
    assert_eq!(count(), 0);
}

#[test]
fn chain_requires_both_matches() {
    let waf = waf(
        r#"
        SecRule REQUEST_METHOD "@streq POST" "id:10,phase:1,chain,deny"
            SecRule REQUEST_HEADERS:Host "@streq evil.example" ""
        "#,
    );

    let mut good = request(&waf, "POST", "/", &[("Host", "good.example")]);
    assert!(good.process_request_headers().is_none());
    assert!(good.matched_rules().is_empty());

    let mut evil = request(&waf, "POST", "/", &[("Host", "evil.example")]);
    let interruption = evil.process_request_headers().unwrap();
    assert_eq!(interruption.rule_id, 10);
    assert_eq!(matched_ids(&evil), vec![10]);
}

#[test]
fn ip_match_cidr_and_singleton() {
    let registry = OperatorRegistry::with_builtins();
    let op = registry
        .build("ipMatch", &OperatorOptions::new("127.0.0.1, 192.168.0.0/24"))
        .unwrap();
    let cancel = zentinel_waf::engine::CancellationToken::new();
    let mut vars = TransactionVariables::new();
    let mut eval = |addr: &str| {
        let mut ctx = OperatorContext::new(&mut vars, zentinel_waf::Phase::RequestHeaders, false, &cancel);
        op.evaluate(&mut ctx, addr)
    };

    for addr in ["127.0.0.1", "192.168.0.1", "192.168.0.253"] {
        assert!(eval(addr), "{} should match", addr);
    }
    for addr in ["127.0.0.2", "192.168.1.1"] {
        assert!(!eval(addr), "{} should not match", addr);
    }
}

#[test]
fn persistent_collection_survives_transactions() {
    let waf = waf(
        r#"SecAction "id:1,phase:1,pass,nolog,initcol:ip=%{REMOTE_ADDR},setvar:ip.hits=+1""#,
    );

    let mut first = request(&waf, "GET", "/", &[]);
    first.process_request_headers();
    assert_eq!(first.variables().map(VariableName::Ip).first("hits"), Some("1"));
    assert_eq!(first.variables().map(VariableName::Ip).first("IS_NEW"), Some("1"));
    first.process_logging();
    first.close().unwrap();

    let mut second = request(&waf, "GET", "/", &[]);
    second.process_request_headers();
    assert_eq!(second.variables().map(VariableName::Ip).first("hits"), Some("2"));
    assert_eq!(second.variables().map(VariableName::Ip).first("IS_NEW"), Some("0"));
    waf.close();
}

#[test]
fn interleaved_transactions_keep_every_increment() {
    let waf = waf(r#"SecAction "id:1,phase:1,pass,nolog,initcol:ip=%{REMOTE_ADDR},setvar:ip.n=+1""#);

    let mut a = request(&waf, "GET", "/", &[]);
    let mut b = request(&waf, "GET", "/", &[]);
    a.process_request_headers();
    b.process_request_headers();
    assert_eq!(a.variables().map(VariableName::Ip).first("n"), Some("1"));
    assert_eq!(b.variables().map(VariableName::Ip).first("n"), Some("1"));
    a.process_logging();
    b.process_logging();
    a.close().unwrap();
    b.close().unwrap();

    let mut c = request(&waf, "GET", "/", &[]);
    c.process_request_headers();
    assert_eq!(c.variables().map(VariableName::Ip).first("n"), Some("3"));
    waf.close();
}

#[test]
fn collections_written_back_in_logging_phase() {
    let waf = waf(r#"SecAction "id:1,phase:1,pass,nolog,initcol:ip=%{REMOTE_ADDR},setvar:ip.hits=+1""#);

    let mut first = request(&waf, "GET", "/", &[]);
    first.process_request_headers();
    first.process_logging();

    let mut second = request(&waf, "GET", "/", &[]);
    second.process_request_headers();
    assert_eq!(second.variables().map(VariableName::Ip).first("hits"), Some("2"));

    // close after logging does not write again
    first.close().unwrap();
    let mut third = request(&waf, "GET", "/", &[]);
    third.process_request_headers();
    assert_eq!(third.variables().map(VariableName::Ip).first("hits"), Some("2"));
    waf.close();
}

#[test]
fn ctl_removes_later_rule() {
    let waf = waf(
        r#"
        SecRule REQUEST_URI "@beginsWith /health" "id:1,phase:1,pass,nolog,ctl:ruleRemoveById=20"
        SecRule REQUEST_METHOD "@streq GET" "id:20,phase:2,deny,status:403"
        "#,
    );

    let mut health = request(&waf, "GET", "/health", &[]);
    health.process_request_headers();
    assert!(health.process_request_body().is_none());

    let mut other = request(&waf, "GET", "/other", &[]);
    other.process_request_headers();
    assert_eq!(other.process_request_body().map(|i| i.rule_id), Some(20));
}

#[test]
fn audit_log_written_for_relevant_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("audit.log");
    let rules = format!(
        r#"
        SecAuditEngine RelevantOnly
        SecAuditLog {}
        SecAuditLogFormat JSON
        SecAuditLogParts ABFHZ
        SecAction "id:2,phase:1,pass,nolog,noauditlog,sanitiseArg:pwd"
        SecRule ARGS:user "@streq admin" "id:5,phase:1,deny,status:403,msg:'admin login'"
        "#,
        log_path.display()
    );
    let waf = waf(&rules);

    let mut quiet = request(&waf, "GET", "/login?user=bob", &[("Host", "example.com")]);
    quiet.process_request_headers();
    quiet.process_logging();
    quiet.close().unwrap();

    let mut tx = request(
        &waf,
        "GET",
        "/login?user=admin&pwd=hunter2",
        &[("Host", "example.com")],
    );
    assert!(tx.process_request_headers().is_some());
    tx.process_logging();
    let id = tx.id().to_string();
    tx.close().unwrap();
    waf.close();

    let text = std::fs::read_to_string(&log_path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 1);

    let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(record["transaction"]["id"], id.as_str());
    assert_eq!(record["transaction"]["is_interrupted"], true);
    assert_eq!(record["transaction"]["request"]["uri"], "/login?user=admin&pwd=*******");
    assert_eq!(record["messages"][0]["data"]["id"], 5);
    assert_eq!(record["messages"][0]["message"], "admin login");
}

#[test]
fn error_callback_sees_audited_matches() {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let config = WafConfig::new()
        .with_directives(
            r#"
            SecAction "id:1,phase:1,pass,log,auditlog"
            SecAction "id:2,phase:1,pass,nolog,noauditlog"
            "#,
        )
        .with_error_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    let waf = Waf::new(config).unwrap();
    let mut tx = request(&waf, "GET", "/", &[]);
    tx.process_request_headers();
    tx.close().unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn redirect_and_logging_after_interruption() {
    let waf = waf(
        r#"
        SecRule REQUEST_URI "@contains /old" "id:7,phase:1,redirect:https://example.com/new"
        SecAction "id:8,phase:5,pass,nolog,setvar:tx.logged=1"
        SecAction "id:9,phase:5,pass,nolog,setvar:tx.logged=+1"
        "#,
    );
    let mut tx = request(&waf, "GET", "/old/page", &[]);
    let interruption = tx.process_request_headers().unwrap();
    assert_eq!(interruption.action, Disruption::Redirect);
    assert_eq!(interruption.data, "https://example.com/new");

    tx.process_logging();
    assert_eq!(tx.variables().tx().first("logged"), Some("2"));
}
