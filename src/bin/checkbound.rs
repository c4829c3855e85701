//! Minimal CLI bound checker
//!
//! Reads a recurrence (JSON) and a proposed bound (the CAS grammar, e.g.
//! `"n * log(n)"`), runs the induction verifier, and prints the verdict.
//!
//! Usage:
//!   checkbound --input rec.json --bound "n * log(n)" [--kind O|Omega|Theta]
//!
//! Exit codes: 0 accepted; 1 rejected; 2 bad input.

#![forbid(unsafe_code)]

use std::path::Path;

use thetabound::api::{self, wire};
use thetabound::bridge::parse_cas_expr;
use thetabound::refine::BoundKind;

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "checkbound=info".into()))
        .with_target(false)
        .compact()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let input = match parse_flag(&args, "--input") {
        Some(p) => p,
        None => {
            eprintln!("usage: checkbound --input rec.json --bound \"n * log(n)\" [--kind Theta]");
            std::process::exit(2);
        }
    };
    let bound_text = match parse_flag(&args, "--bound") {
        Some(b) => b,
        None => {
            eprintln!("missing --bound");
            std::process::exit(2);
        }
    };
    let kind = match parse_flag(&args, "--kind").as_deref() {
        None | Some("Theta") | Some("theta") => BoundKind::Theta,
        Some("O") | Some("o") => BoundKind::O,
        Some("Omega") | Some("omega") => BoundKind::Omega,
        Some(other) => {
            eprintln!("unknown bound kind `{other}` (expected O, Omega, or Theta)");
            std::process::exit(2);
        }
    };

    let rec = wire::read_recurrence(Path::new(&input))?;
    let proposed = match parse_cas_expr(&bound_text) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("unparseable bound: {e}");
            std::process::exit(2);
        }
    };

    let verdict = api::verify_bound(&rec, &proposed, kind);
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    if verdict.accepted {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
