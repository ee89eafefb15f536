//! zentinel-waf CLI tool.

use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;
use zentinel_waf::engine::{Phase, RuleEngineMode};
use zentinel_waf::{Interruption, Result, Transaction, Waf, WafConfig};

#[derive(Parser)]
#[command(name = "zentinel-waf")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check if rules parse and compile
    Check {
        /// Rules file or glob
        #[arg(short, long)]
        rules: PathBuf,
    },

    /// Run a request through the rules
    Test {
        /// Rules file or glob
        #[arg(short, long)]
        rules: PathBuf,

        /// Request URI
        #[arg(short, long)]
        uri: String,

        /// Request method
        #[arg(short, long, default_value = "GET")]
        method: String,

        /// Request headers (format: "Name: Value")
        #[arg(short = 'H', long)]
        header: Vec<String>,

        /// Request body
        #[arg(short, long)]
        body: Option<String>,

        /// Record matches without interrupting
        #[arg(long)]
        detection_only: bool,
    },

    /// Print compiled rules by phase
    Dump {
        /// Rules file or glob
        #[arg(short, long)]
        rules: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Check { rules } => check_rules(&rules),
        Commands::Test {
            rules,
            uri,
            method,
            header,
            body,
            detection_only,
        } => test_request(&rules, &uri, &method, &header, body.as_deref(), detection_only),
        Commands::Dump { rules } => dump_rules(&rules),
    }
}

fn load(path: &Path, config: WafConfig) -> Result<Waf> {
    info!("Loading rules from {:?}", path);
    let waf = Waf::new(config.with_directives_from_file(path))?;
    info!(rules = waf.rule_count(), "rules loaded");
    Ok(waf)
}

fn check_rules(path: &Path) -> Result<()> {
    let waf = load(path, WafConfig::new())?;
    println!("Successfully compiled {} rules", waf.rule_count());
    waf.close();
    Ok(())
}

fn report(phase: Phase, interruption: &Interruption) {
    println!("BLOCKED ({})", phase);
    println!("  {}", interruption.format_log());
}

fn test_request(
    rules: &Path,
    uri: &str,
    method: &str,
    headers: &[String],
    body: Option<&str>,
    detection_only: bool,
) -> Result<()> {
    let mut config = WafConfig::new().with_request_body_access(body.is_some());
    if detection_only {
        config = config.with_rule_engine(RuleEngineMode::DetectionOnly);
    }
    let waf = load(rules, config)?;
    let mut tx = waf.new_transaction();

    tx.process_connection("127.0.0.1", 0, "127.0.0.1", 80);
    tx.process_uri(uri, method, "HTTP/1.1");
    for header in headers {
        if let Some((name, value)) = header.split_once(':') {
            tx.add_request_header(name.trim(), value.trim());
        }
    }

    let mut verdict = tx.process_request_headers().map(|i| (Phase::RequestHeaders, i));
    if verdict.is_none() {
        if let Some(data) = body {
            tx.request_body_writer().write_all(data.as_bytes())?;
        }
        verdict = tx.process_request_body().map(|i| (Phase::RequestBody, i));
    }
    tx.process_logging();

    match verdict {
        Some((phase, interruption)) => report(phase, &interruption),
        None => println!("ALLOWED"),
    }
    print_matches(&tx);
    tx.close()?;
    waf.close();
    Ok(())
}

fn print_matches(tx: &Transaction) {
    for m in tx.matched_rules() {
        println!("  [{}] rule {} {}", m.phase, m.rule.effective_id(), m.message);
    }
}

fn dump_rules(path: &Path) -> Result<()> {
    let waf = load(path, WafConfig::new())?;
    println!("Total rules: {}", waf.rule_count());
    println!("\nRules by phase:");

    for phase in Phase::ALL {
        let rules: Vec<_> = waf
            .ruleset()
            .phase(phase)
            .iter()
            .map(|&i| waf.ruleset().rule(i))
            .collect();
        if rules.is_empty() {
            continue;
        }
        println!("\n  Phase {} ({}):", phase.number(), phase.name());
        for rule in rules {
            match &rule.marker {
                Some(marker) => println!("    - Marker {}", marker),
                None => println!("    - Rule {} {:?}", rule.id(), rule.operator),
            }
        }
    }
    waf.close();
    Ok(())
}
