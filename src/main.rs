use clap::Parser;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use dxl_diagnostic::config::{self, DiagnosticConfig};
use dxl_diagnostic::diagnostic;
use dxl_diagnostic::motor::SerialBus;
use dxl_diagnostic::report::DiagnosticReport;

/// One-shot diagnostic for a single Dynamixel servo (Protocol 2.0)
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Serial device the servo bus is attached to
    #[arg(short, long, default_value = config::DEVICE_NAME)]
    port: String,

    /// Bus baudrate
    #[arg(short, long, default_value_t = config::BAUDRATE)]
    baudrate: u32,

    /// Motor ID under test
    #[arg(short, long, default_value_t = config::MOTOR_ID)]
    id: u8,

    /// Goal position in raw ticks
    #[arg(short, long, default_value_t = config::GOAL_POSITION)]
    goal: i32,

    /// Wait before reading the position back, in milliseconds
    #[arg(long, default_value_t = config::SETTLE_DELAY.as_millis() as u64)]
    settle_ms: u64,

    /// Print the report as JSON on stdout
    #[arg(long)]
    json: bool,
}

impl From<Args> for DiagnosticConfig {
    fn from(args: Args) -> Self {
        Self {
            device: args.port,
            baudrate: args.baudrate,
            id: args.id,
            goal: args.goal,
            settle: Duration::from_millis(args.settle_ms),
        }
    }
}

fn main() {
    // Setup logging (set RUST_LOG=debug to see packets)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let json = args.json;
    let config = DiagnosticConfig::from(args);

    match diagnostic::run(&config, SerialBus::open) {
        Ok(report) => {
            if json && !print_json(&report) {
                std::process::exit(1);
            }
        }
        Err(abort) => {
            eprintln!("Diagnostic aborted: {}", abort.error);
            // Partial report: steps up to and including the failed one
            if json {
                print_json(&abort.report);
            }
            std::process::exit(1);
        }
    }
}

fn print_json(report: &DiagnosticReport) -> bool {
    match serde_json::to_string_pretty(report) {
        Ok(out) => {
            println!("{}", out);
            true
        }
        Err(e) => {
            eprintln!("Failed to encode report: {}", e);
            false
        }
    }
}
