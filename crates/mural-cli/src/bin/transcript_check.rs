use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mural_contracts::transcript::{evaluate, parse_transcript, CheckSet};

#[derive(Debug, Parser)]
#[command(
    name = "transcript-check",
    version,
    about = "Evaluate a recorded tool-use transcript against declarative checks"
)]
struct Cli {
    /// JSONL transcript file
    transcript: PathBuf,
    /// Checks as a JSON object, e.g. '{"has_bash_command": "git worktree list"}'
    checks: String,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("transcript-check error: {err:#}");
            std::process::exit(2);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    let checks: CheckSet =
        serde_json::from_str(&cli.checks).context("checks argument is not valid JSON")?;
    let transcript = parse_transcript(&cli.transcript)?;
    let report = evaluate(&checks, &transcript)?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.passed { 0 } else { 1 })
}
