//! `pulseguard` – bench shell for the PulseGuard safety core.
//!
//! 1. Loads `~/.pulseguard/config.toml` (defaults when absent) and fills in
//!    bench interlocks and demo protocols the file does not define.
//! 2. Starts the controller against simulated hardware.
//! 3. Drops the operator into an interactive shell.
//! 4. Turns **Ctrl-C** into an emergency stop.

mod bench;
mod repl;

use std::time::Duration;

use colored::Colorize;
use pulseguard_hal::sim::SimRig;
use pulseguard_middleware::{Topic, next_event};
use pulseguard_runtime::{Controller, ControllerConfig, config_path, init_tracing};
use pulseguard_types::EventPayload;
use tracing::warn;

fn main() {
    let _telemetry = init_tracing("pulseguard");
    print_banner();

    // ── Configuration ─────────────────────────────────────────────────────
    let path = config_path();
    let config = match ControllerConfig::load_or_default(&path) {
        Ok(config) => {
            println!("  Config: {}", path.display().to_string().bold());
            config
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            ControllerConfig::default()
        }
    };
    let config = bench::with_bench_defaults(config);
    let lines = bench::signal_lines(&config);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{}: {e}", "Could not start the async runtime".red());
            std::process::exit(1);
        }
    };

    // ── Controller on simulated hardware ──────────────────────────────────
    let rig = SimRig::new(
        config.call_timeout(),
        Duration::from_millis(config.watchdog.timeout_ms),
    );
    let controller = match runtime.block_on(Controller::start(
        config,
        rig.hardware.clone(),
        bench::as_sources(&lines),
    )) {
        Ok(controller) => controller,
        Err(e) => {
            eprintln!("{}: {e}", "Controller failed to start".red().bold());
            std::process::exit(1);
        }
    };

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let safety = controller.safety().clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        match safety.try_emergency_stop() {
            Ok(()) => println!("{}", "⚠  Ctrl-C – EMERGENCY STOP requested".yellow().bold()),
            Err(e) => println!("{}: {e}", "Emergency stop could not be queued".red().bold()),
        }
    }) {
        warn!(error = %e, "could not install Ctrl-C handler; use 'estop' instead");
    }

    runtime.spawn(print_events(
        controller.subscribe(Topic::StateChanges),
        controller.subscribe(Topic::Faults),
    ));

    println!();
    println!(
        "  Hold the deadman with {} before arming. Type {} for all commands.\n",
        "deadman on".bold().cyan(),
        "help".bold().cyan()
    );

    repl::run(&runtime, &controller, &lines);

    runtime.block_on(controller.shutdown());
}

/// Echo state changes and fault events above the prompt.
async fn print_events(
    mut states: pulseguard_middleware::TopicReceiver,
    mut faults: pulseguard_middleware::TopicReceiver,
) {
    loop {
        let event = tokio::select! {
            e = next_event(&mut faults) => e,
            e = next_event(&mut states) => e,
        };
        let Some(event) = event else { break };
        match event.payload {
            EventPayload::StateChanged(change) => println!(
                "\n  {} {} → {} ({})",
                "state".dimmed(),
                repl::paint(change.previous),
                repl::paint(change.new),
                change.cause
            ),
            EventPayload::Fault(fault) => println!(
                "\n  {} {} [{}]",
                "FAULT".red().bold(),
                fault.cause,
                fault.failed_interlock.as_deref().unwrap_or("-")
            ),
            _ => {}
        }
    }
}

fn print_banner() {
    println!();
    println!("{}", "  ┌─┐┬ ┬┬  ┌─┐┌─┐┌─┐┬ ┬┌─┐┬─┐┌┬┐".bold().cyan());
    println!("{}", "  ├─┘│ ││  └─┐├┤ │ ┬│ │├─┤├┬┘ ││".bold().cyan());
    println!("{}", "  ┴  └─┘┴─┘└─┘└─┘└─┘└─┘┴ ┴┴└──┴┘".bold().cyan());
    println!();
    println!(
        "  {} {}",
        "PulseGuard".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Safety control core – simulated bench");
    println!();
}
