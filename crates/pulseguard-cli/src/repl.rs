//! REPL – the interactive bench shell.
//!
//! Commands:
//!   arm | start <id> | stop | pause | resume
//!   estop | clear | clear-estop
//!   status | protocols | deadman on|off | signal <name> on|off
//!   help | quit

use std::collections::BTreeMap;
use std::time::Instant;

use colored::Colorize;
use pulseguard_kernel::SignalLine;
use pulseguard_runtime::{Controller, ControllerStatus};
use pulseguard_types::{OperatorCommand, SafetyState};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::runtime::Runtime;

use crate::bench::{self, DEADMAN};

/// One parsed shell line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Operator(OperatorCommand),
    Status,
    Protocols,
    Signal { name: String, on: bool },
    Help,
    Quit,
}

pub fn parse(line: &str) -> Result<ShellCommand, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let op = |c: OperatorCommand| -> Result<ShellCommand, String> { Ok(ShellCommand::Operator(c)) };
    match words.as_slice() {
        ["arm"] => op(OperatorCommand::Arm),
        ["start", id] => op(OperatorCommand::Start {
            protocol_id: (*id).to_string(),
        }),
        ["start"] => Err("usage: start <protocol-id>".into()),
        ["stop"] => op(OperatorCommand::Stop),
        ["pause"] => op(OperatorCommand::Pause),
        ["resume"] => op(OperatorCommand::Resume),
        ["estop"] => op(OperatorCommand::EmergencyStop),
        ["clear"] => op(OperatorCommand::ClearFault),
        ["clear-estop"] => op(OperatorCommand::ClearEmergency),
        ["status"] => Ok(ShellCommand::Status),
        ["protocols"] => Ok(ShellCommand::Protocols),
        ["deadman", level] => Ok(ShellCommand::Signal {
            name: DEADMAN.to_string(),
            on: parse_level(level)?,
        }),
        ["signal", name, level] => Ok(ShellCommand::Signal {
            name: (*name).to_string(),
            on: parse_level(level)?,
        }),
        ["help"] => Ok(ShellCommand::Help),
        ["quit"] | ["exit"] => Ok(ShellCommand::Quit),
        _ => Err(format!("unknown command '{}'", line.trim())),
    }
}

fn parse_level(word: &str) -> Result<bool, String> {
    match word {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(format!("expected on|off, got '{other}'")),
    }
}

/// Run the shell until `quit` or end of input.
pub fn run(runtime: &Runtime, controller: &Controller, lines: &BTreeMap<String, SignalLine>) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}: {e}", "Could not open the terminal".red());
            return;
        }
    };

    loop {
        let prompt = format!("{} ", prompt_for(controller.safety().current_state()));
        let line = match editor.readline(&prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                // Ctrl-C at the prompt is an emergency stop, same as the signal handler.
                emergency_stop(controller);
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {e}", "Read error".red());
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line.as_str());

        match parse(&line) {
            Ok(ShellCommand::Quit) => {
                println!("{}", "Goodbye.".green());
                break;
            }
            Ok(ShellCommand::Help) => print_help(),
            Ok(ShellCommand::Status) => print_status(&controller.status()),
            Ok(ShellCommand::Protocols) => {
                for id in controller.protocol_ids() {
                    println!("  • {}", id.bold());
                }
            }
            Ok(ShellCommand::Signal { name, on }) => match lines.get(&name) {
                Some(line) => {
                    bench::drive(line, on);
                    println!("  {} {}", name.bold(), if on { "on".green() } else { "off".red() });
                }
                None => println!("{} '{}'", "No signal line named".red(), name.yellow()),
            },
            Ok(ShellCommand::Operator(command)) => {
                match runtime.block_on(controller.handle(command)) {
                    Ok(ack) => {
                        let detail = ack.detail.map(|d| format!(" ({d})")).unwrap_or_default();
                        println!(
                            "  {} {} → {}{}",
                            "✓".green().bold(),
                            ack.command,
                            paint(ack.state),
                            detail.dimmed()
                        );
                    }
                    Err(e) => println!("  {} {}", "✗".red().bold(), e.to_string().red()),
                }
            }
            Err(msg) => println!(
                "{} {}. Type {} for available commands.",
                "Unknown command:".red(),
                msg.yellow(),
                "help".bold()
            ),
        }
    }
}

pub fn emergency_stop(controller: &Controller) {
    match controller.safety().try_emergency_stop() {
        Ok(()) => println!("{}", "⚠  EMERGENCY STOP requested".yellow().bold()),
        Err(e) => println!("{}: {e}", "Emergency stop could not be queued".red().bold()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

pub fn paint(state: SafetyState) -> colored::ColoredString {
    let text = state.as_str();
    match state {
        SafetyState::Safe => text.green(),
        SafetyState::Armed => text.yellow(),
        SafetyState::Treating => text.magenta().bold(),
        SafetyState::Unsafe => text.red().bold(),
        SafetyState::EmergencyStop => text.on_red().white().bold(),
    }
}

fn prompt_for(state: SafetyState) -> String {
    format!("pulseguard[{}]>", state.as_str().to_lowercase())
}

fn print_help() {
    println!();
    println!("{}", "PulseGuard Commands".bold().underline());
    println!("  {}            – arm (interlocks must be satisfied)", "arm".bold().cyan());
    println!("  {}     – run a protocol", "start <id>".bold().cyan());
    println!("  {}  – stop, pause or resume the run", "stop | pause | resume".bold().cyan());
    println!("  {}          – emergency stop (also Ctrl-C)", "estop".bold().cyan());
    println!("  {}  – clear a fault or an emergency stop", "clear | clear-estop".bold().cyan());
    println!("  {}  – state, interlocks, run and watchdog", "status | protocols".bold().cyan());
    println!("  {}  – drive a bench signal line", "deadman on|off, signal <name> on|off".bold().cyan());
    println!("  {}           – exit", "quit".bold().cyan());
    println!();
}

fn print_status(status: &ControllerStatus) {
    println!("  State      : {}", paint(status.state));
    let verdict = if status.verdict.overall_satisfied {
        "satisfied".green()
    } else {
        "NOT satisfied".red()
    };
    println!("  Interlocks : {} (sample #{})", verdict, status.verdict.sequence);
    for (name, ok) in &status.verdict.per_interlock {
        let mark = if *ok { "✓".green() } else { "✗".red() };
        println!("    {mark} {name}");
    }
    match status.cursor {
        Some(cursor) => {
            let dwell = cursor
                .remaining_dwell_ms
                .map(|ms| format!(", {ms} ms dwell left"))
                .unwrap_or_default();
            println!(
                "  Run        : line {} loop {} {:?}{}",
                cursor.current_line_index, cursor.loop_iteration, cursor.status, dwell
            );
        }
        None => println!("  Run        : {}", "none".dimmed()),
    }
    let heartbeat = status
        .watchdog
        .last_heartbeat_sent
        .map(|t| format!("{} ms ago", Instant::now().duration_since(t).as_millis()))
        .unwrap_or_else(|| "never".to_string());
    let missed = if status.watchdog.missed {
        " MISSED".red().bold().to_string()
    } else {
        String::new()
    };
    println!("  Watchdog   : last heartbeat {heartbeat}{missed}");
}
