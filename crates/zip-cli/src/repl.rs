//! REPL – operator shell over the bridge's upstream contract.
//!
//! Supported slash-commands:
//!   /start <v> <w> [rate_hz] [ttl_ms] – begin streaming
//!   /update <v> <w> [ttl_ms]          – replace the streamed setpoint
//!   /stop [soft]                      – end the stream (hard stop by default)
//!   /estop                            – emergency stop
//!   /status | /diag | /stats          – health, firmware diagnostics, stream counters
//!   /schema                           – JSON Schema of the status shape
//!   /help | /quit | /exit

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use serde::Serialize;
use tokio::runtime::Handle;
use zip_bridge::RobotBridge;
use zip_types::status_schema;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start {
        v: i32,
        w: i32,
        rate_hz: Option<f64>,
        ttl_ms: Option<u32>,
    },
    Update {
        v: i32,
        w: i32,
        ttl_ms: Option<u32>,
    },
    Stop {
        hard: bool,
    },
    EmergencyStop,
    Status,
    Diagnostics,
    Stats,
    Schema,
    Help,
    Quit,
}

/// Parse one input line.  `Err` carries the message to show the operator.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("empty command".to_string());
    };
    let args: Vec<&str> = words.collect();

    let cmd = match (head, args.as_slice()) {
        ("/start", [v, w, rest @ ..]) if rest.len() <= 2 => Command::Start {
            v: number(v, "v")?,
            w: number(w, "w")?,
            rate_hz: rest.first().map(|r| number(r, "rate_hz")).transpose()?,
            ttl_ms: rest.get(1).map(|t| number(t, "ttl_ms")).transpose()?,
        },
        ("/update", [v, w, rest @ ..]) if rest.len() <= 1 => Command::Update {
            v: number(v, "v")?,
            w: number(w, "w")?,
            ttl_ms: rest.first().map(|t| number(t, "ttl_ms")).transpose()?,
        },
        ("/stop", []) => Command::Stop { hard: true },
        ("/stop", ["soft"]) => Command::Stop { hard: false },
        ("/estop", []) => Command::EmergencyStop,
        ("/status", []) => Command::Status,
        ("/diag", []) => Command::Diagnostics,
        ("/stats", []) => Command::Stats,
        ("/schema", []) => Command::Schema,
        ("/help", []) => Command::Help,
        ("/quit" | "/exit", []) => Command::Quit,
        ("/start" | "/update" | "/stop", _) => {
            return Err(format!("bad arguments for {head}, see /help"));
        }
        _ => return Err(format!("unknown command '{head}'")),
    };
    Ok(cmd)
}

fn number<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T, String> {
    raw.parse()
        .map_err(|_| format!("{name}: '{raw}' is not a number"))
}

/// Run the shell until `/quit`, EOF or `shutdown` is raised.
pub fn run(bridge: Arc<RobotBridge>, runtime: Handle, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "zip>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_command(line) {
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                break;
            }
            Ok(cmd) => execute(&bridge, &runtime, cmd),
            Err(msg) => println!(
                "{} {}. Type {} for available commands.",
                "Error:".red(),
                msg.yellow(),
                "/help".bold()
            ),
        }
    }
}

fn execute(bridge: &RobotBridge, runtime: &Handle, cmd: Command) {
    match cmd {
        Command::Start { v, w, rate_hz, ttl_ms } => match bridge.start(v, w, rate_hz, ttl_ms) {
            Ok(applied) => println!(
                "  {} streaming at {} Hz, ttl {} ms",
                "✓".green(),
                applied.rate_hz.to_string().bold(),
                applied.ttl_ms.to_string().bold()
            ),
            Err(e) => println!("  {} {}", "✗".red(), e),
        },
        Command::Update { v, w, ttl_ms } => {
            if let Err(e) = bridge.update(v, w, ttl_ms) {
                println!("  {} {}", "✗".red(), e);
            }
        }
        Command::Stop { hard } => {
            if bridge.stop(hard) {
                println!("  {} stream stopped", "✓".green());
            } else {
                println!("  {}", "not streaming".dimmed());
            }
        }
        Command::EmergencyStop => match bridge.emergency_stop("operator") {
            Ok(()) => println!("  {} stop frame sent", "■".red().bold()),
            Err(e) => println!("  {} stop frame not sent: {}", "✗".red(), e),
        },
        Command::Status => print_json(&bridge.get_status()),
        Command::Diagnostics => {
            let report = runtime.block_on(bridge.get_diagnostics());
            if !report.success {
                println!(
                    "  {} {}",
                    "diagnostics unavailable:".yellow(),
                    report.error.as_deref().unwrap_or("unknown")
                );
            }
            print_json(&report);
        }
        Command::Stats => print_json(&bridge.streamer_stats()),
        Command::Schema => print_json(&status_schema()),
        Command::Help => print_help(),
        Command::Quit => {}
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => println!("  {} {}", "✗".red(), e),
    }
}

fn print_help() {
    println!();
    println!("{}", "Bridge Commands".bold().underline());
    println!("  {}  – begin streaming", "/start <v> <w> [rate_hz] [ttl_ms]".bold().cyan());
    println!("  {}           – replace the setpoint", "/update <v> <w> [ttl_ms]".bold().cyan());
    println!("  {}                       – end the stream", "/stop [soft]".bold().cyan());
    println!("  {}                             – emergency stop", "/estop".bold().cyan());
    println!("  {}               – link health, firmware, counters", "/status /diag /stats".bold().cyan());
    println!("  {}                            – status JSON Schema", "/schema".bold().cyan());
    println!("  {}                       – exit", "/quit  /exit".bold().cyan());
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_with_optional_arguments() {
        assert_eq!(
            parse_command("/start 100 0").unwrap(),
            Command::Start { v: 100, w: 0, rate_hz: None, ttl_ms: None }
        );
        assert_eq!(
            parse_command("/start -50 20 25 180").unwrap(),
            Command::Start { v: -50, w: 20, rate_hz: Some(25.0), ttl_ms: Some(180) }
        );
    }

    #[test]
    fn update_and_stop_forms() {
        assert_eq!(
            parse_command("/update 1 2 250").unwrap(),
            Command::Update { v: 1, w: 2, ttl_ms: Some(250) }
        );
        assert_eq!(parse_command("/stop").unwrap(), Command::Stop { hard: true });
        assert_eq!(parse_command("  /stop   soft ").unwrap(), Command::Stop { hard: false });
        assert_eq!(parse_command("/exit").unwrap(), Command::Quit);
    }

    #[test]
    fn bad_input_is_reported_not_panicked() {
        assert!(parse_command("/start fast 0").unwrap_err().contains("v"));
        assert!(parse_command("/start 1").is_err());
        assert!(parse_command("/update 1 2 3 4").is_err());
        assert!(parse_command("/stop hard").is_err());
        assert!(parse_command("/dance").unwrap_err().contains("unknown"));
        assert!(parse_command("").is_err());
    }
}
