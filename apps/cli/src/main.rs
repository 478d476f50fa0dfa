//! knowcrawl CLI: LLM-driven knowledge-graph extraction.
//!
//! Retrieves reference text for each entity in a list, runs an ordered
//! chain of prompts over it, and writes one schema-validated JSON record
//! per entity.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
