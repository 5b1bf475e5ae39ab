//! insanity - distributed test runner
//!
//! Loads a run plan, drives every scheduled test through its lifecycle in
//! isolated worker processes and reports the results.

use clap::Parser;
use commands::Commands;
use insanity::common::logging;
use insanity::{cli, commands};

#[derive(Parser)]
#[command(name = "insanity", about = "Distributed test runner")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let guard = if cli.command.wants_log_file() {
        logging::init_cli_with_file().map(|(path, guard)| {
            eprintln!("Logging to {}", path.display());
            guard
        })
    } else {
        logging::init_cli();
        None
    };

    let code = match cli::dispatch(cli.command).await {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            eprintln!("Error: {e}");
            2
        }
    };

    // flush the file log before exiting
    drop(guard);
    std::process::exit(code);
}
