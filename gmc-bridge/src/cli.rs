use clap::{Parser, Subcommand};

/// HTTP to MQTT bridge for GQ GMC geiger counters
#[derive(Parser)]
#[command(name = "gmc-bridge", version)]
pub struct Cli {
    /// Address to bind
    #[arg(short = 'H', long, env = "BRIDGE_IP", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind (serve) or probe (health-check)
    #[arg(short, long, env = "BRIDGE_PORT", default_value_t = 80)]
    pub port: u16,

    #[command(flatten)]
    pub serve: ServeArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server and forward reports to MQTT (default)
    Serve,

    /// Probe a locally running bridge; exit code 0 if it answers
    HealthCheck,
}

#[derive(clap::Args)]
pub struct ServeArgs {
    /// Path to a TOML configuration file (supports `~`)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Broker URI, tcp://host:port or ssl://host:port
    #[arg(long, env = "MQTT_BROKER")]
    pub broker: Option<String>,

    /// Base topic for all device topics
    #[arg(long, env = "MQTT_TOPIC")]
    pub topic: Option<String>,

    #[arg(long, env = "MQTT_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Minutes without a report before a device is marked offline
    #[arg(long, env = "OFFLINE_THRESHOLD_MINUTES")]
    pub offline_threshold: Option<String>,

    /// Minutes between offline sweeps
    #[arg(long, env = "CHECK_FREQUENCY_MINUTES")]
    pub check_frequency: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_flags() {
        let cli = Cli::try_parse_from([
            "gmc-bridge",
            "--port",
            "8080",
            "--broker",
            "ssl://broker:8883",
            "--offline-threshold",
            "10",
            "serve",
        ])
        .unwrap();
        assert_eq!(cli.port, 8080);
        assert!(matches!(cli.command, Some(Commands::Serve)));
        assert_eq!(cli.serve.broker.as_deref(), Some("ssl://broker:8883"));
        assert_eq!(cli.serve.offline_threshold.as_deref(), Some("10"));
    }

    #[test]
    fn test_health_check_subcommand() {
        let cli = Cli::try_parse_from(["gmc-bridge", "health-check"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::HealthCheck)));
    }

    #[test]
    fn test_serve_is_default() {
        let cli = Cli::try_parse_from(["gmc-bridge", "--topic", "home/geiger"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.serve.topic.as_deref(), Some("home/geiger"));
    }
}
