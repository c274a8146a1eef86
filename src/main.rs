//! linkfront/src/main.rs
//! Command-line entry point: configuration loading, logging, signals.

use anyhow::Context;
use clap::Parser;
use linkfront::{config, logging};
use std::path::PathBuf;
use std::sync::Arc;

/// SOCKS5 front-end proxy over a balanced pool of upstream links.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "basic.json")]
    input: PathBuf,

    /// Append log output to this file instead of stderr
    #[arg(short, long)]
    log: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.log.as_deref()).context("cannot open the log output")?;

    let server = Arc::new(config::load(&args.input).with_context(|| {
        format!(
            "error while trying to load the configuration file '{}'",
            args.input.display()
        )
    })?);

    let mut serving = tokio::spawn(Arc::clone(&server).serve());
    tokio::select! {
        result = &mut serving => result??,
        _ = tokio::signal::ctrl_c() => {
            server.stop();
            serving.await??;
        }
    }
    Ok(())
}
