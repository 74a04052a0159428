pub mod cli;
pub mod config;
pub mod pipeline;

use clap::Parser;
use tracing_subscriber::EnvFilter;

pub fn run() {
    // Load .env file if present (before reading any settings)
    let _ = dotenvy::dotenv();

    let default_filter = if cli::is_verbose() {
        "docsift_lib=debug,docsift=debug"
    } else {
        config::default_log_filter()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let args = cli::Cli::parse();
    if let Err(e) = cli::run(args) {
        tracing::error!(error = %e, "Command failed");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
