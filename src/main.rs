//! gridsweep - queue-backed distributed parameter sweep workers.
//!
//! Stateless worker processes that pull chunks of a parameter batch from
//! a shared queue, process them, and publish results.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gridsweep::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    // Initialize logging based on verbosity
    let default_filter = if cli::is_verbose() {
        "gridsweep=debug"
    } else {
        "gridsweep=info"
    };

    // Logs go to stderr; stdout is reserved for the final summary line.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Run CLI
    cli::run().await
}
