//! Tally command-line entry point.

use clap::Parser;

#[tokio::main]
async fn main() {
    tally_cli::init_tracing();

    let cli = tally_cli::Cli::parse();
    if let Err(e) = tally_cli::run(cli).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
