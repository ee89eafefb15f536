//! Behavioral properties that hold across inputs.

use std::io::{Read, Write};

use zentinel_waf::bodyprocessors::{BodyProcessor, BodyProcessorOptions, JsonProcessor, UrlEncodedProcessor};
use zentinel_waf::engine::body_buffer::BodyBuffer;
use zentinel_waf::engine::CancellationToken;
use zentinel_waf::macros::Macro;
use zentinel_waf::operators::{OperatorContext, OperatorOptions, OperatorRegistry};
use zentinel_waf::transformations::{TransformationPipeline, TransformationRegistry};
use zentinel_waf::variables::{TransactionVariables, VariableName};
use zentinel_waf::{Phase, Waf, WafConfig};

#[test]
fn phases_run_in_order_and_once() {
    let mut rules = String::new();
    for phase in 1..=5 {
        rules.push_str(&format!(
            "SecAction \"id:{p},phase:{p},pass,nolog,setvar:tx.seq=+1,setvar:tx.phase{p}=%{{TX.seq}}\"\n",
            p = phase
        ));
    }
    let waf = Waf::new(WafConfig::new().with_directives(rules)).unwrap();
    let mut tx = waf.new_transaction();
    tx.process_uri("/", "GET", "HTTP/1.1");

    tx.process_request_headers();
    tx.process_request_headers();
    tx.process_request_body();
    tx.process_request_headers();
    tx.add_response_header("Content-Type", "text/plain");
    tx.process_response_headers(200, "HTTP/1.1");
    tx.process_response_body();
    tx.process_response_body();
    tx.process_logging();

    let tx_vars = tx.variables().tx();
    assert_eq!(tx_vars.first("seq"), Some("5"));
    for phase in 1..=5 {
        let key = format!("phase{}", phase);
        assert_eq!(tx_vars.first(&key), Some(phase.to_string().as_str()), "{}", key);
    }
}

#[test]
fn matched_rules_contain_every_firing_rule() {
    let waf = Waf::new(WafConfig::new().with_directives(
        r#"
        SecRule ARGS "@contains x" "id:11,phase:1,pass,log"
        SecRule ARGS "@contains y" "id:12,phase:1,pass,log"
        SecRule ARGS "@contains z" "id:13,phase:1,pass,log"
        "#,
    ))
    .unwrap();

    for (query, expected) in [
        ("a=x", vec![11]),
        ("a=xy", vec![11, 12]),
        ("a=z&b=y", vec![12, 13]),
        ("a=q", vec![]),
    ] {
        let mut tx = waf.new_transaction();
        tx.process_uri(&format!("/?{}", query), "GET", "HTTP/1.1");
        tx.process_request_headers();
        let ids: Vec<u64> = tx.matched_rules().iter().map(|m| m.rule.effective_id()).collect();
        assert_eq!(ids, expected, "{}", query);
    }
}

#[test]
fn body_buffer_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let payload: Vec<u8> = (0..=255u8).cycle().take(3000).collect();

    for limit in [0, 1, 64, 2999, 3000, 10_000] {
        for chunk in [1, 7, 512, 3000] {
            let mut buffer = BodyBuffer::new(limit, dir.path());
            for piece in payload.chunks(chunk) {
                buffer.write_all(piece).unwrap();
            }
            assert_eq!(buffer.size(), payload.len() as u64);
            assert_eq!(buffer.spill_path().is_some(), limit < payload.len() as u64);

            let mut out = Vec::new();
            buffer.reader().unwrap().read_to_end(&mut out).unwrap();
            assert_eq!(out, payload, "limit {} chunk {}", limit, chunk);

            let mut again = Vec::new();
            buffer.reader().unwrap().read_to_end(&mut again).unwrap();
            assert_eq!(again, payload);
            buffer.close().unwrap();
        }
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

fn parse_with(processor: &dyn BodyProcessor, body: &str) -> TransactionVariables {
    let mut vars = TransactionVariables::new();
    processor
        .process_request(&mut body.as_bytes(), &mut vars, &BodyProcessorOptions::default())
        .unwrap();
    vars
}

#[test]
fn urlencoded_golden() {
    let vars = parse_with(&UrlEncodedProcessor, "a=1&b=two%20words&a=3&empty=&flag");
    let args = vars.map(VariableName::ArgsPost);
    assert_eq!(args.get("a"), ["1", "3"]);
    assert_eq!(args.get("b"), ["two words"]);
    assert_eq!(args.get("empty"), [""]);
    assert_eq!(args.get("flag"), [""]);
    assert_eq!(args.len(), 5);
}

#[test]
fn json_golden() {
    let vars = parse_with(
        &JsonProcessor,
        r#"{"user":{"name":"alice","admin":true},"tags":["a","b"],"n":1.5,"none":null}"#,
    );
    let args = vars.map(VariableName::ArgsPost);
    for (key, value) in [
        ("json.user.name", "alice"),
        ("json.user.admin", "true"),
        ("json.tags", "2"),
        ("json.tags.0", "a"),
        ("json.tags.1", "b"),
        ("json.n", "1.5"),
        ("json.none", ""),
    ] {
        assert_eq!(args.first(key), Some(value), "{}", key);
    }
    assert_eq!(args.first("json.user"), None);
}

#[test]
fn macro_expansion() {
    let mut vars = TransactionVariables::new();
    let m = Macro::compile("a%{TX.x}b");
    assert_eq!(m.expand(&vars), "ab");

    for value in ["", "1", "hello world", "%{TX.x}"] {
        vars.tx_mut().set_one("x", value);
        assert_eq!(m.expand(&vars), format!("a{}b", value));
    }

    vars.set(VariableName::RequestMethod, "PUT");
    assert_eq!(Macro::compile("%{request_method}!").expand(&vars), "PUT!");
    assert_eq!(Macro::compile("plain").expand(&vars), "plain");
    assert_eq!(Macro::compile("%{NOPE}").expand(&vars), "%{NOPE}");
}

#[test]
fn ip_match_is_order_independent() {
    let registry = OperatorRegistry::with_builtins();
    let entries = ["10.0.0.0/8", "127.0.0.1", "192.168.0.0/24", "::1", "2001:db8::/32"];
    let forward = registry
        .build("ipMatch", &OperatorOptions::new(entries.join(",")))
        .unwrap();
    let mut reversed_entries = entries;
    reversed_entries.reverse();
    let reversed = registry
        .build("ipMatch", &OperatorOptions::new(reversed_entries.join(", ")))
        .unwrap();

    let cancel = CancellationToken::new();
    let mut vars = TransactionVariables::new();
    for addr in [
        "10.1.2.3",
        "11.0.0.1",
        "127.0.0.1",
        "127.0.0.2",
        "192.168.0.9",
        "192.168.1.9",
        "::1",
        "2001:db8::5",
        "2001:db9::5",
        "not an ip",
    ] {
        let mut ctx = OperatorContext::new(&mut vars, Phase::RequestHeaders, false, &cancel);
        let a = forward.evaluate(&mut ctx, addr);
        let b = reversed.evaluate(&mut ctx, addr);
        assert_eq!(a, b, "{}", addr);
    }
}

#[test]
fn transformations_are_deterministic() {
    let registry = TransformationRegistry::with_builtins();
    let inputs = [
        "",
        "Hello%20World",
        "&lt;script&gt;alert(1)&lt;/script&gt;",
        "/a/./b/../c//d",
        "SELECT/*x*/1 -- y",
        "  spaced\tout\n",
        "ZGF0YQ==",
    ];
    for name in registry.names() {
        let pipeline = TransformationPipeline::from_names(&registry, &[name]).unwrap();
        for input in inputs {
            let first = pipeline.apply(input).to_string();
            let second = pipeline.apply(input).to_string();
            assert_eq!(first, second, "{} on {:?}", name, input);
        }
    }
}

#[test]
fn verdicts_are_deterministic() {
    let waf = Waf::new(WafConfig::new().with_directives(
        r#"
        SecRequestBodyAccess On
        SecRule ARGS "@detectSQLi" "id:1,phase:2,deny,status:403,t:urlDecodeUni"
        SecRule REQUEST_HEADERS:User-Agent "@pm nikto sqlmap" "id:2,phase:1,deny,status:403,t:lowercase"
        "#,
    ))
    .unwrap();

    let run = |uri: &str, agent: &str, body: &str| {
        let mut tx = waf.new_transaction();
        tx.process_uri(uri, "POST", "HTTP/1.1");
        tx.add_request_header("User-Agent", agent);
        tx.add_request_header("Content-Type", "application/x-www-form-urlencoded");
        let mut verdict = tx.process_request_headers();
        if verdict.is_none() {
            tx.request_body_writer().write_all(body.as_bytes()).unwrap();
            verdict = tx.process_request_body();
        }
        let ids: Vec<u64> = tx.matched_rules().iter().map(|m| m.rule.effective_id()).collect();
        (verdict.map(|i| (i.status, i.rule_id)), ids)
    };

    for (uri, agent, body) in [
        ("/", "curl/8.0", "q=hello"),
        ("/", "SQLMap/1.7", "q=hello"),
        ("/search", "curl/8.0", "q=1' OR '1'='1"),
        ("/search?id=1%20union%20select%20password%20from%20users", "curl/8.0", ""),
    ] {
        assert_eq!(run(uri, agent, body), run(uri, agent, body), "{} {}", uri, agent);
    }
}
