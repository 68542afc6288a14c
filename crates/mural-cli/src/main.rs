use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use mural_contracts::events::EventWriter;
use mural_contracts::outcome::{BatchOutcome, ErrorKind};
use mural_contracts::request::{
    AspectRatio, BatchRequest, DEFAULT_MAX_RETRIES, DEFAULT_MODEL, DEFAULT_TIMEOUT_SECONDS,
};
use mural_engine::generate_batch;

#[derive(Debug, Parser)]
#[command(
    name = "mural",
    version,
    about = "Batch image generation via the Gemini API",
    after_help = "\
Examples:
  mural out.png \"A minimal 3D cube\"
  mural out.png \"gear icon\" --style styles/glass.md
  mural out.png \"cube\" \"sphere\" \"pyramid\"
  mural out.png \"Make sky blue\" --edit photo.jpg
  mural out.png \"Same style, sphere\" --ref cube.png --aspect 16:9

Exit Codes:
  0 - All images generated successfully
  1 - Some or all images failed
  2 - Invalid arguments or configuration"
)]
struct Cli {
    /// Output image path (batches get _001, _002, ... before the extension)
    output: PathBuf,
    /// Generation prompt(s)
    #[arg(required = true)]
    prompts: Vec<String>,
    /// Style template (.md file) prepended to every prompt
    #[arg(long)]
    style: Option<PathBuf>,
    /// Existing image to edit
    #[arg(long)]
    edit: Option<PathBuf>,
    /// Reference image(s)
    #[arg(long = "ref")]
    references: Vec<PathBuf>,
    /// Aspect ratio
    #[arg(long, default_value = "1:1")]
    aspect: AspectRatio,
    /// Model ID
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,
    /// Max retry attempts per image
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,
    /// Per-request timeout in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECONDS)]
    timeout: u64,
    /// Append batch events to this JSONL file
    #[arg(long)]
    events: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("mural error: {err:#}");
            std::process::exit(2);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    let mut request = BatchRequest::new(cli.prompts, cli.output);
    request.style = cli.style;
    request.edit = cli.edit;
    request.references = cli.references;
    request.aspect_ratio = cli.aspect;
    request.model = cli.model;
    request.max_retries = cli.max_retries;
    request.timeout_seconds = cli.timeout;

    let events = cli
        .events
        .map(|path| EventWriter::new(path, uuid::Uuid::new_v4().to_string()));

    let outcome = generate_batch(&request, events.as_ref());

    if outcome.error_code == ErrorKind::ApiKeyMissing {
        eprintln!(
            "ERROR: {}",
            outcome.error.as_deref().unwrap_or("credential missing")
        );
        return Ok(2);
    }

    print_outcome(&outcome);
    Ok(if outcome.success { 0 } else { 1 })
}

fn print_outcome(outcome: &BatchOutcome) {
    for item in &outcome.results {
        if item.success {
            if let Some(output) = &item.output {
                println!("Generated: {}", output.display());
            }
        } else {
            println!(
                "ERROR: {}",
                item.error.as_deref().unwrap_or("Unknown error")
            );
        }
    }

    if let Some(error) = &outcome.error {
        println!("ERROR: {error}");
    }

    println!("\nCompleted: {}/{} images", outcome.succeeded, outcome.total);
    if outcome.retries_used > 0 {
        println!("Retries used: {}", outcome.retries_used);
    }

    if outcome.failed > 0 && !outcome.results.is_empty() {
        println!("\nFailed images:");
        for item in outcome.results.iter().filter(|item| !item.success) {
            println!(
                "  - {}: {}",
                item.prompt,
                item.error.as_deref().unwrap_or("Unknown error")
            );
        }
    }
}
