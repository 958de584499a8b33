use clap::Parser;
use soccerbot_runtime::behavior::BehaviorId;
use soccerbot_runtime::config::RobotConfig;
use std::path::PathBuf;
use std::process;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Soccer robot runtime: behavior loop, wheel control and helper lifecycle
#[derive(Parser, Debug)]
#[command(name = "soccerbot")]
#[command(version)]
struct Args {
    /// Robot configuration (TOML)
    #[arg(long, value_name = "FILE", default_value = "soccerbot.toml")]
    config: PathBuf,

    /// Serial port of the wheel bus, overrides motor.port
    #[arg(long)]
    port: Option<String>,

    /// State to start in, overrides behavior.initial_state
    #[arg(long, value_name = "STATE")]
    initial_state: Option<String>,

    /// Motor watchdog timeout in milliseconds, overrides motor.watchdog_ms
    #[arg(long)]
    watchdog_ms: Option<u64>,

    /// Enable verbose logging (DEBUG level)
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    setup_tracing(&args);

    info!("Soccerbot runtime v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = match load(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("FATAL: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = soccerbot_runtime::runtime::run(config).await {
        error!("FATAL: {e}");
        process::exit(e.exit_code());
    }
}

fn load(args: &Args) -> Result<RobotConfig, Box<dyn std::error::Error>> {
    info!("Loading config from {}", args.config.display());
    let mut config = RobotConfig::load(&args.config)?;

    if let Some(port) = &args.port {
        config.motor.port = port.clone();
    }
    if let Some(state) = &args.initial_state {
        config.behavior.initial_state = state.parse::<BehaviorId>()?;
    }
    if let Some(ms) = args.watchdog_ms {
        config.motor.watchdog_ms = ms;
    }
    Ok(config)
}

fn setup_tracing(args: &Args) {
    let default = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if args.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
