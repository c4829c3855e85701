//! Minimal CLI solver
//!
//! Reads a recurrence (JSON, §-schema) from a file or stdin, runs the full
//! solve + refine pipeline, and writes the annotated report JSON.
//!
//! Usage:
//!   solve --input rec.json [--output report.json]
//!         [--near-boundary 0.1] [--taylor-order 3] [--epsilon-min 0.01]
//!
//! Exit codes: 0 solved; 2 the input was rejected (malformed recurrence,
//! non-reducing cycle, …).

#![forbid(unsafe_code)]

use std::io::Read;
use std::path::Path;

use thetabound::api::{self, wire};
use thetabound::{CancelToken, NoopProgress, SolverOptions};

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn parse_f64(args: &[String], key: &str) -> anyhow::Result<Option<f64>> {
    match parse_flag(args, key) {
        None => Ok(None),
        Some(s) => s
            .parse::<f64>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{key} expects a number, got `{s}`: {e}")),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "solve=info".into()))
        .with_target(false)
        .compact()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut options = SolverOptions::default();
    if let Some(v) = parse_f64(&args, "--near-boundary")? {
        options.near_boundary = v;
    }
    if let Some(v) = parse_f64(&args, "--epsilon-min")? {
        options.epsilon_min = v;
    }
    if let Some(v) = parse_flag(&args, "--taylor-order") {
        options.taylor_order = v
            .parse::<usize>()
            .map_err(|e| anyhow::anyhow!("--taylor-order expects an integer: {e}"))?;
    }

    // Input: file path or stdin.
    let rec = match parse_flag(&args, "--input") {
        Some(path) => wire::read_recurrence(Path::new(&path))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| anyhow::anyhow!("read stdin: {e}"))?;
            wire::parse_recurrence(&buf)?
        }
    };

    let output = match api::solve_recurrence_with(&rec, options, &CancelToken::new(), &NoopProgress)
    {
        Ok(out) => out,
        Err(e) => {
            eprintln!("error[{}]: {e}", e.code());
            std::process::exit(2);
        }
    };

    tracing::info!(
        theorem = %output.theorem,
        solution = %output.solution,
        confidence = output.confidence,
        "solved"
    );

    let rendered = wire::render_report(&wire::report(&rec, output))?;
    match parse_flag(&args, "--output") {
        Some(path) => std::fs::write(&path, rendered)
            .map_err(|e| anyhow::anyhow!("write {path}: {e}"))?,
        None => println!("{rendered}"),
    }
    Ok(())
}
