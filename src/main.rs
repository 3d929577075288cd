use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use chambercycle::artifacts::ArtifactCollector;
use chambercycle::chamber::ChamberController;
use chambercycle::config::{ConfigError, HarnessConfig, LoggingConfig, CONFIG_ENV};
use chambercycle::cycle::{CycleSettings, RunError, RunReport};
use chambercycle::power::{CommandRelay, PowerCyclePlan, PowerSequencer};

#[derive(Parser)]
#[command(
    name = "chambercycle",
    about = "Thermal-cycling and power-cycling endurance harness",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (falls back to /etc/chambercycle/chambercycle.toml)
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full setpoint plan
    Run {
        /// Use the simulated chamber instead of the configured controller
        #[arg(long)]
        simulate: bool,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Preview setpoints, run indexes and estimated time per plateau
    Plan,

    /// Manual chamber operations
    Chamber {
        /// Use the simulated chamber instead of the configured controller
        #[arg(long)]
        simulate: bool,

        #[command(subcommand)]
        action: ChamberAction,
    },

    /// Perform a single DUT power cycle with the configured delays
    PowerCycle,

    /// Validate and print the effective configuration
    CheckConfig,
}

#[derive(Subcommand)]
enum ChamberAction {
    /// Read the current air temperature
    Sample,

    /// Move the setpoint and start conditioning
    Set {
        /// Target temperature in degrees Celsius
        #[arg(long, allow_negative_numbers = true)]
        value: f64,
    },

    /// Stop conditioning
    Stop,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(2);
        }
    };
    init_tracing(&config.logging, cli.log_json);

    match dispatch(cli.command, config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let code = e.downcast_ref::<RunError>().map(RunError::exit_code).unwrap_or(2);
            tracing::error!(error = %format!("{e:#}"), exit_code = code, "chambercycle failed");
            eprintln!("error: {e:#}");
            ExitCode::from(code)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<HarnessConfig> {
    match path {
        Some(path) => HarnessConfig::load(path),
        None => Ok(HarnessConfig::load_or_default()),
    }
}

fn init_tracing(logging: &LoggingConfig, force_json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if force_json || logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_interrupt(token: &CancellationToken) {
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling session");
            trigger.cancel();
        }
    });
}

async fn dispatch(command: Commands, config: HarnessConfig) -> Result<u8> {
    match command {
        Commands::Run { simulate, json } => {
            let cancel = CancellationToken::new();
            cancel_on_interrupt(&cancel);

            let report = chambercycle::run_session(&config, simulate, &cancel).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            Ok(report.exit_code())
        }
        Commands::Plan => {
            let plan = chambercycle::build_plan(&config)?;
            let collector = ArtifactCollector::from_config(&config.results);
            let first_index = collector.next_run_index().map_err(RunError::from)?;
            let settings = CycleSettings::from_config(&config);
            let per_plateau = settings.estimated_plateau(config.workload.launch_stagger());

            println!("\nchambercycle setpoint plan");
            println!("{:<5} | {:<10} | {:<8} | Worst case", "#", "Setpoint", "Run");
            println!("{:-<5}-|-{:-<10}-|-{:-<8}-|-{:-<12}", "", "", "", "");
            for (i, setpoint) in plan.iter().enumerate() {
                println!(
                    "{:<5} | {:<10.1} | run{:03}   | {}",
                    i + 1,
                    setpoint,
                    first_index + i as u32,
                    format_duration(per_plateau)
                );
            }
            if let Some(setpoint) = settings.precondition_setpoint {
                println!("\nPreconditioning at {:.1} before the first setpoint.", setpoint);
            }
            println!(
                "Rest setpoint: {:.1}. Worst-case total: {}.\n",
                settings.rest_setpoint,
                format_duration(per_plateau * plan.len() as u32)
            );
            Ok(0)
        }
        Commands::Chamber { simulate, action } => {
            let mut chamber = chambercycle::chamber::connect(&config.chamber, simulate)
                .await
                .map_err(RunError::from)?;
            match action {
                ChamberAction::Sample => {
                    let reading = chamber.sample().await.map_err(RunError::from)?;
                    println!("air: {:.2} °C", reading.air);
                }
                ChamberAction::Set { value } => {
                    chamber.set_target(value).await.map_err(RunError::from)?;
                    chamber.start_conditioning().await.map_err(RunError::from)?;
                    println!("setpoint {:.1} °C, conditioning on", value);
                }
                ChamberAction::Stop => {
                    chamber.stop_conditioning().await.map_err(RunError::from)?;
                    println!("conditioning off");
                }
            }
            Ok(0)
        }
        Commands::PowerCycle => {
            if config.power.off_commands.is_empty() || config.power.on_commands.is_empty() {
                return Err(RunError::from(ConfigError::Invalid {
                    field: "power.off_commands",
                    reason: "power-cycle needs both off_commands and on_commands".to_string(),
                })
                .into());
            }

            let cancel = CancellationToken::new();
            cancel_on_interrupt(&cancel);

            let mut sequencer = PowerSequencer::new(Box::new(CommandRelay::from_config(&config.power)));
            let report = sequencer
                .cycle(&PowerCyclePlan::from_config(&config.power), &cancel)
                .await
                .map_err(RunError::from)?;
            println!(
                "power cycle complete: off for {:.1}s, {:.1}s total",
                report.off_duration_sec, report.total_sec
            );
            Ok(0)
        }
        Commands::CheckConfig => {
            chambercycle::build_plan(&config)?;
            let rendered = toml::to_string_pretty(&config).context("failed to render configuration")?;
            println!("{}", rendered);
            Ok(0)
        }
    }
}

fn print_report(report: &RunReport) {
    println!("\n=== chambercycle session {} ===", report.session_id);
    println!(
        "{:<8} | {:<10} | {:<12} | {:<7} | Verdict",
        "Run", "Setpoint", "Stabilized", "Bursts"
    );
    println!("{:-<8}-|-{:-<10}-|-{:-<12}-|-{:-<7}-|-{:-<7}", "", "", "", "", "");
    for outcome in &report.outcomes {
        let stabilized = if outcome.stabilization.is_stable() {
            format!("{} polls", outcome.stabilization.polls())
        } else {
            "TIMED OUT".to_string()
        };
        println!(
            "run{:03}   | {:<10.1} | {:<12} | {:<7} | {}",
            outcome.run_index,
            outcome.setpoint,
            stabilized,
            outcome.bursts.len(),
            if outcome.passed() { "PASS" } else { "FAIL" }
        );
    }
    println!(
        "\nOverall: {}",
        if report.passed() { "PASS" } else { "FAIL" }
    );
    println!();
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
