//! Helpdesk CLI: answers IT and HR questions through a checkpointed
//! retrieve-generate-evaluate pipeline.
//!
//! Every stage boundary is persisted, so an interrupted run resumes from
//! its last checkpoint when invoked again with the same checkpoint id.

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
