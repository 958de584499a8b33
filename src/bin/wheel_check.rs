// Wheel check: READ-ONLY bus diagnostic
//
// Pings the four wheel servos named in the config and prints their present
// speed. Nothing is written to the bus.
//
// Usage: cargo run --bin wheel_check -- --config soccerbot.toml [--port /dev/ttyUSB0]

use clap::Parser;
use soccerbot_runtime::config::RobotConfig;
use soccerbot_runtime::motor::kinematics::Wheel;
use soccerbot_runtime::motor::{FeetechWheels, WheelDriver};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "wheel_check")]
#[command(about = "Read-only check of the four wheel servos")]
struct Args {
    /// Robot configuration (TOML)
    #[arg(long, value_name = "FILE", default_value = "soccerbot.toml")]
    config: PathBuf,

    /// Serial port, overrides motor.port
    #[arg(long)]
    port: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .init();

    let args = Args::parse();
    let config = RobotConfig::load(&args.config)?;
    let map = config.motor.wheel_map()?;
    let port = args.port.unwrap_or_else(|| config.motor.port.clone());

    println!("Wheel check (read-only) on {} @ {} baud", port, config.motor.baudrate);
    println!();

    let mut wheels = match FeetechWheels::open(&port, config.motor.baudrate, map, config.motor.max_raw) {
        Ok(wheels) => wheels,
        Err(e) => {
            println!("  ✗ Failed to open serial port: {}", e);
            println!("  - Check the port path and the USB cable");
            return Err(e.into());
        }
    };

    let mut missing = 0;
    for wheel in Wheel::ALL {
        print!("  {:<12} (ID {:>3}): ", wheel.name(), map.id(wheel));

        match wheels.ping(wheel) {
            Ok(true) => println!("✓ responding"),
            Ok(false) => {
                println!("✗ no response");
                missing += 1;
                continue;
            }
            Err(e) => {
                println!("✗ error: {}", e);
                missing += 1;
                continue;
            }
        }

        match wheels.read_speed(wheel) {
            Ok(speed) => println!("      present speed: {:+.3}", speed),
            Err(e) => println!("      present speed: error: {}", e),
        }
    }

    println!();
    if missing == 0 {
        println!("All four wheels answered.");
    } else {
        println!("⚠ {} wheel(s) did not answer; the runtime will refuse to start.", missing);
    }
    Ok(())
}
