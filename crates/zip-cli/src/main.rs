//! `zipbridge` – ZIP robot bridge command line
//!
//! 1. Loads `~/.zip/config.toml` (first run writes one with defaults).
//! 2. Connects to the robot over the configured serial port, or with
//!    `--sim` boots the in-process simulated board (safe-mode check and motor
//!    self-test) and talks to that instead.
//! 3. Drops the operator into an interactive REPL over start / update /
//!    stop / status / diagnostics.
//! 4. Turns **Ctrl-C** into an emergency stop before exiting.

mod bringup;
mod config;
mod repl;
mod telemetry;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use tracing::{error, warn};
use zip_bridge::{EventLog, RobotBridge};
use zip_firmware::{SimulatedRobot, SystemMillis};
use zip_types::ZipError;

#[derive(Debug, Default, PartialEq)]
struct Args {
    sim: bool,
    port: Option<String>,
    real_time_self_test: bool,
    help: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--sim" => parsed.sim = true,
            "--slow-self-test" => parsed.real_time_self_test = true,
            "--port" => {
                parsed.port = Some(args.next().ok_or("--port needs a device path")?);
            }
            "-h" | "--help" => parsed.help = true,
            other => return Err(format!("unknown argument '{other}'")),
        }
    }
    Ok(parsed)
}

fn main() {
    let _telemetry = telemetry::init_tracing("zipbridge");

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}: {e}", "error".red());
            print_usage();
            std::process::exit(2);
        }
    };
    if args.help {
        print_usage();
        return;
    }

    print_banner();
    let mut cfg = load_or_create_config();
    if let Some(port) = args.port {
        cfg.bridge.port = port;
    }
    let sim = args.sim || cfg.sim;

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            std::process::exit(1);
        }
    };
    let _enter = runtime.enter();

    let connected = if sim {
        runtime.block_on(connect_sim(cfg.bridge.clone(), args.real_time_self_test))
    } else {
        print!("  Connecting to {} … ", cfg.bridge.port.bold());
        runtime.block_on(RobotBridge::connect(cfg.bridge.clone()))
    };
    let bridge = match connected {
        Ok(bridge) => Arc::new(bridge),
        Err(e) => {
            println!("{}", "FAILED".red());
            println!("  {e}");
            println!("  Try {} to run against the simulated robot.", "--sim".bold());
            std::process::exit(1);
        }
    };
    println!("{}", "ready".green());

    let shutdown = Arc::new(AtomicBool::new(false));
    let on_ctrlc = {
        let bridge = Arc::clone(&bridge);
        let shutdown = Arc::clone(&shutdown);
        move || {
            println!();
            println!("{}", "⚠  Ctrl-C received – emergency stop".yellow().bold());
            match bridge.emergency_stop("operator ctrl-c") {
                Ok(()) => println!("{}", "  ✓ Stop frame sent.".green()),
                Err(e) => println!("{} {e}", "  ✗ Stop frame not sent:".red()),
            }
            shutdown.store(true, Ordering::SeqCst);
            println!("{}", "  Press Enter to exit.".dimmed());
        }
    };
    if let Err(e) = ctrlc::set_handler(on_ctrlc) {
        warn!(error = %e, "Ctrl-C handler not installed; emergency stop on Ctrl-C unavailable");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());
    repl::run(Arc::clone(&bridge), runtime.handle().clone(), shutdown);

    runtime.block_on(bridge.shutdown());
}

async fn connect_sim(
    bridge_cfg: zip_bridge::BridgeConfig,
    real_time_self_test: bool,
) -> Result<RobotBridge, ZipError> {
    println!("  Booting simulated board …");
    let report = bringup::run(&config::safe_mode_path(), real_time_self_test)
        .map_err(|e| ZipError::Io(e.to_string()))?;
    println!(
        "  Self-test {}, safe mode {} ({} failure(s) recorded)",
        if report.self_test_passed { "passed".green() } else { "FAILED".red() },
        if report.safe_mode { "ON".red() } else { "off".green() },
        report.failures
    );

    let log = match &bridge_cfg.log_path {
        Some(path) => EventLog::open(path).await?,
        None => EventLog::disabled(),
    };
    let bridge = RobotBridge::new(bridge_cfg, log);
    let (robot, _handle) = SimulatedRobot::new(Arc::new(SystemMillis::new()));
    print!("  Attaching simulated robot … ");
    bridge.attach(robot).await?;
    Ok(bridge)
}

fn load_or_create_config() -> config::Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

fn print_banner() {
    println!();
    println!("  {} {}", "zipbridge".bold().cyan(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Setpoint streaming bridge for the ZIP robot");
    println!();
}

fn print_usage() {
    println!("Usage: zipbridge [--sim] [--port <device>] [--slow-self-test]");
    println!();
    println!("  --sim              run against the in-process simulated robot");
    println!("  --port <device>    serial device, overrides config and ZIP_SERIAL_PORT");
    println!("  --slow-self-test   run the simulated self-test in real time");
}
