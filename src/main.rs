use std::env;

use casegate_contracts::{
    contracts_manifest, RecordFixtures, ReviewRequest, RECORD_FIXTURES_SCHEMA,
    REVIEW_REQUEST_SCHEMA,
};
use casegate_engine::{verify_audit_chain, verify_audit_chain_with_mirror, MemoryStore, WriteGate};

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    let rest: Vec<String> = args.collect();
    match cmd.as_str() {
        "check" => check(&rest).await,
        "validate-config" => validate_config(&rest),
        "verify-audit" => verify_audit(&rest),
        "contracts" => contracts(),
        _ => {
            eprintln!("Usage: casegate <check|validate-config|verify-audit|contracts>");
            eprintln!("  check            --records <path> --request <path> [--config <path>]");
            eprintln!("  validate-config  [--config <path>]");
            eprintln!("  verify-audit     --log <path> [--mirror <path>]");
            eprintln!("  contracts");
            std::process::exit(2);
        }
    }
}

async fn check(args: &[String]) {
    let mut config_path = String::from("./config/example-config.yaml");
    let mut records_path: Option<String> = None;
    let mut request_path: Option<String> = None;
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(v) = it.next() {
                    config_path = v.clone();
                }
            }
            "--records" => records_path = it.next().cloned(),
            "--request" => request_path = it.next().cloned(),
            other => {
                eprintln!("unknown argument: {other}");
                std::process::exit(2);
            }
        }
    }
    let Some(records_path) = records_path else {
        eprintln!("check requires --records <path>");
        std::process::exit(2);
    };
    let Some(request_path) = request_path else {
        eprintln!("check requires --request <path>");
        std::process::exit(2);
    };

    let cfg = match casegate_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let fixtures = load_validated(&records_path, RECORD_FIXTURES_SCHEMA, "records");
    let fixtures: RecordFixtures = match serde_json::from_value(fixtures) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("records file {records_path}: {e}");
            std::process::exit(1);
        }
    };
    let request = load_validated(&request_path, REVIEW_REQUEST_SCHEMA, "request");
    let request: ReviewRequest = match serde_json::from_value(request) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("request file {request_path}: {e}");
            std::process::exit(1);
        }
    };

    let store = MemoryStore::from_fixtures(fixtures);
    let gate = match WriteGate::new(&cfg, store).await {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to start write gate: {e}");
            std::process::exit(1);
        }
    };
    let decision = match gate.review(&request).await {
        Ok(v) => v,
        Err(e) => {
            eprintln!("review failed: {e}");
            std::process::exit(1);
        }
    };
    match serde_json::to_string_pretty(&decision) {
        Ok(text) => println!("{text}"),
        Err(e) => {
            eprintln!("failed to render decision: {e}");
            std::process::exit(1);
        }
    }
    if !decision.allowed() {
        std::process::exit(1);
    }
}

fn validate_config(args: &[String]) {
    let mut config_path = String::from("./config/example-config.yaml");
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        if arg == "--config" {
            if let Some(v) = it.next() {
                config_path = v.clone();
            }
        }
    }
    match casegate_config::load_and_validate(&config_path) {
        Ok(_) => println!("config ok: {config_path}"),
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    }
}

fn verify_audit(args: &[String]) {
    let mut log_path: Option<String> = None;
    let mut mirror_path: Option<String> = None;
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--log" => log_path = it.next().cloned(),
            "--mirror" => mirror_path = it.next().cloned(),
            other => {
                eprintln!("unknown argument: {other}");
                std::process::exit(2);
            }
        }
    }
    let Some(log_path) = log_path else {
        eprintln!("verify-audit requires --log <path>");
        std::process::exit(2);
    };
    let outcome = match &mirror_path {
        Some(mirror) => verify_audit_chain_with_mirror(&log_path, mirror),
        None => verify_audit_chain(&log_path),
    };
    match outcome {
        Ok(summary) => println!("{summary}"),
        Err(e) => {
            eprintln!("audit verification failed: {e}");
            std::process::exit(1);
        }
    }
}

fn contracts() {
    let manifest = contracts_manifest();
    let schemas: Vec<serde_json::Value> = manifest
        .schemas
        .iter()
        .map(|schema| {
            serde_json::json!({
                "path": schema.path,
                "sha256": schema.sha256,
            })
        })
        .collect();
    let body = serde_json::json!({
        "contract_version": manifest.contract_version,
        "contracts_set_sha256": manifest.contracts_set_sha256,
        "schemas": schemas,
    });
    println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
}

fn load_validated(path: &str, schema: &str, what: &str) -> serde_json::Value {
    let raw = match std::fs::read_to_string(path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to read {what} file {path}: {e}");
            std::process::exit(1);
        }
    };
    let value: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("{what} file {path} is not valid json: {e}");
            std::process::exit(1);
        }
    };
    let schema_value: serde_json::Value = match serde_json::from_str(schema) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("embedded {what} schema is corrupt: {e}");
            std::process::exit(1);
        }
    };
    let validator = match jsonschema::validator_for(&schema_value) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("embedded {what} schema is invalid: {e}");
            std::process::exit(1);
        }
    };
    if let Err(first) = validator.validate(&value) {
        eprintln!("{what} file {path} failed schema validation: {first}");
        std::process::exit(1);
    }
    value
}
