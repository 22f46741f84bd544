use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "salvo",
    version,
    about = "Benchmark a proxy server across versions"
)]
struct Cli {
    /// Job control document (JSON or YAML)
    #[arg(long)]
    job: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(&cli.job) {
        error!("{err:#}");
        std::process::exit(1);
    }
}

fn run(job: &Path) -> Result<()> {
    let control = salvo_core::load_control_doc(job)
        .with_context(|| format!("unable to load job control from {}", job.display()))?;

    let summary = salvo_core::execute(&control)?;
    for outcome in &summary.outcomes {
        match &outcome.error {
            None => println!("{}: ok", outcome.point),
            Some(error) => println!("{}: failed ({error})", outcome.point),
        }
    }
    if !summary.all_succeeded() {
        anyhow::bail!("one or more benchmark points failed");
    }
    Ok(())
}
