mod bridge;
mod cli;
mod config;
mod dispatcher;
mod engine;
mod error;
mod events;
mod metrics;
mod model;
mod orchestrator;
mod projection;
mod storage;
mod text_summary;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let cfg = cli::build_config(&args)?;
    config::init_logging(&cfg);

    // The stdin reader may still sit on a blocking read, so leave explicitly
    // instead of waiting for the runtime to shut down.
    match cli::run(args, cfg).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}
