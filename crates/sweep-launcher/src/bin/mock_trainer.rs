//! Mock Trainer
//!
//! Stands in for the real training program in tests: accepts any trainer
//! flags, reports what it was started with and exits the way it is told to.
//!
//! Recognised flags (last occurrence wins, everything else is ignored):
//! `--env`, `--seed`, `--exp_name`, `--sleep-ms`, `--fail-code`,
//! `--fail-seed`, `--fail-env`, `--stderr`.
//!
//! # Usage
//!
//! ```bash
//! # Succeed after 200ms
//! mock-trainer --env boxing --seed 0 --sleep-ms 200
//!
//! # Exit with code 3 when started for seed 1
//! mock-trainer --env boxing --seed 1 --fail-code 3 --fail-seed 1
//! ```

use std::collections::HashMap;
use std::time::Duration;

/// `--flag value` pairs; a flag followed by another flag maps to ""
fn parse_flags(args: &[String]) -> HashMap<&str, &str> {
    let mut flags = HashMap::new();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        let Some(name) = arg.strip_prefix("--") else {
            continue;
        };
        let value = match iter.peek() {
            Some(next) if !next.starts_with("--") => iter.next().map_or("", String::as_str),
            _ => "",
        };
        flags.insert(name, value);
    }
    flags
}

fn stamp() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let flags = parse_flags(&args);

    let env = flags.get("env").copied().unwrap_or("unknown");
    let seed = flags.get("seed").copied().unwrap_or("0");
    let gpu = std::env::var("CUDA_VISIBLE_DEVICES").unwrap_or_else(|_| "unset".to_string());

    println!(
        "[mock-trainer] start {} env={} seed={} gpu={} pid={}",
        stamp(),
        env,
        seed,
        gpu,
        std::process::id()
    );
    println!("[mock-trainer] args: {}", args.join(" "));
    if let Some(exp_name) = flags.get("exp_name") {
        println!("[mock-trainer] exp_name={}", exp_name);
    }
    if flags.contains_key("stderr") {
        eprintln!("[mock-trainer] stderr line for seed {}", seed);
    }

    let sleep_ms = flags
        .get("sleep-ms")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    if sleep_ms > 0 {
        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
    }

    let seed_matches = flags.get("fail-seed").map_or(true, |s| *s == seed);
    let env_matches = flags.get("fail-env").map_or(true, |e| *e == env);
    let code = match flags.get("fail-code").and_then(|v| v.parse::<i32>().ok()) {
        Some(code) if seed_matches && env_matches => code,
        _ => 0,
    };

    println!("[mock-trainer] end {} code={}", stamp(), code);
    std::process::exit(code);
}
