// gmc-bridge/src/main.rs

mod cli;
mod logic;

use clap::Parser;
use cli::{Cli, Commands, ServeArgs};
use logic::client::health;
use logic::config::{BridgeConfig, ConfigOverrides};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments (environment variables fill the gaps)
    let args = Cli::parse();

    match args.command {
        Some(Commands::HealthCheck) => {
            // Quiet on purpose: the exit code is the whole answer
            let healthy = health::run(args.port).await;
            std::process::exit(if healthy { 0 } else { 1 });
        }
        Some(Commands::Serve) | None => run_serve(args.host, args.port, args.serve).await,
    }
}

async fn run_serve(host: String, port: u16, serve: ServeArgs) -> anyhow::Result<()> {
    init_logging();

    // Load from file first, then override with CLI / environment values
    let base_config = match &serve.config {
        Some(path) => BridgeConfig::from_file(path)?,
        None => BridgeConfig::default(),
    };
    let config = base_config.with_overrides(ConfigOverrides {
        broker: serve.broker,
        topic: serve.topic,
        username: serve.username,
        password: serve.password,
        offline_threshold: serve.offline_threshold,
        check_frequency: serve.check_frequency,
    });

    logic::serve::run(host, port, config).await
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
