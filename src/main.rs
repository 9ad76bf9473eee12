mod canonical;
mod cli;
mod engine;
mod error;
mod metrics;
mod model;
mod orchestrator;
mod storage;
mod text_summary;

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("simtune=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::Cli::parse();
    let is_silent = args.silent;
    if !is_silent {
        init_tracing();
    }

    // Return instead of exiting so the runtime drops and any worker still
    // attached to an abandoned stage is killed.
    match cli::run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if is_silent {
                println!("{e:#}");
            } else {
                eprintln!("Error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}
