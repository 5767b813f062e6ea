//! Command-line utility for managing a running postern instance
//!
//! - Smtpd users and recipient hosts
//! - Queue listing, discard, bounce and immediate processing
//! - Outgoing routes
//! - System status and health checks

use std::process::ExitCode;

use clap::Parser;
use postern::cli::{self, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version land here too
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let mut stdout = std::io::stdout().lock();
    match cli::execute(cli, &mut stdout).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
