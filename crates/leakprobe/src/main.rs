//! leakprobe CLI
//!
//! Reproduces the throttling-analyzer timer leak through a simulated storage
//! client, then proves the fix by comparing unreleased and released analyzers.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::debug;

use leakprobe_core::client::{CloseBehavior, SimulatedAbfsClient};
use leakprobe_core::config::{Config, LogFormat};
use leakprobe_core::error::{Error, format_error_with_remediation};
use leakprobe_core::harness::ComparativeLeakHarness;
use leakprobe_core::logging::{LogConfig, init_logging};
use leakprobe_core::monitor::LifecycleMonitor;
use leakprobe_core::registry::{NamedTaskRegistry, TaskRegistry};
use leakprobe_core::report::{self, MemoryAnalysis, RunSummary, SystemInfo, TaskAnalysis};
use leakprobe_core::resource::{AnalyzerFactory, ThrottlingConfig};

const EXIT_LEAK: u8 = 1;
const EXIT_CONFIG: u8 = 2;

/// leakprobe - reproduce and verify periodic-task lifecycle leaks
#[derive(Parser)]
#[command(name = "leakprobe", version, about, long_about = None)]
struct Cli {
    /// Path to a leakprobe.toml config file
    #[arg(long, global = true, env = "LEAKPROBE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format for stderr (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Output format for stdout
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Plain)]
    format: OutputFormat,

    /// Exit with status 1 when a leak is detected or the fix is ineffective
    #[arg(long, global = true)]
    fail_on_leak: bool,

    /// Client property override, e.g. -D fs.azure.analysis.period=100
    #[arg(short = 'D', long = "property", global = true, value_name = "KEY=VALUE", value_parser = parse_property)]
    properties: Vec<(String, String)>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Plain,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cycle monitor, the final analysis and the comparison (default)
    Run {
        #[command(flatten)]
        cycles: CycleArgs,
        #[command(flatten)]
        compare: CompareArgs,
    },

    /// Run only the open/probe/close cycle monitor
    Cycles {
        #[command(flatten)]
        cycles: CycleArgs,
    },

    /// Run only the broken-vs-fixed comparison
    Compare {
        #[command(flatten)]
        compare: CompareArgs,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args)]
struct CycleArgs {
    /// Number of cycles
    #[arg(long)]
    cycles: Option<u32>,

    /// Storage URI to exercise (repeatable)
    #[arg(long = "uri")]
    uris: Vec<String>,

    /// What closing a client does with its analyzers
    #[arg(long)]
    close_behavior: Option<CloseBehavior>,

    /// Pause at the end of each cycle before the collection pass
    #[arg(long)]
    settle_ms: Option<u64>,
}

#[derive(Args)]
struct CompareArgs {
    /// Resources constructed and never released
    #[arg(long)]
    broken: Option<u32>,

    /// Resources constructed and released
    #[arg(long)]
    fixed: Option<u32>,

    /// Pause before each comparison snapshot
    #[arg(long)]
    compare_settle_ms: Option<u64>,

    /// Pause between constructing a resource and recording activity
    #[arg(long)]
    creation_delay_ms: Option<u64>,

    /// Wait for each unreleased resource's first tick
    #[arg(long)]
    await_first_tick: bool,
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

impl CycleArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(cycles) = self.cycles {
            config.monitor.cycles = cycles;
        }
        if !self.uris.is_empty() {
            config.monitor.uris.clone_from(&self.uris);
        }
        if let Some(close) = self.close_behavior {
            config.monitor.close_behavior = close;
        }
        if let Some(settle) = self.settle_ms {
            config.monitor.settle_ms = settle;
        }
    }
}

impl CompareArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(broken) = self.broken {
            config.compare.broken = broken;
        }
        if let Some(fixed) = self.fixed {
            config.compare.fixed = fixed;
        }
        if let Some(settle) = self.compare_settle_ms {
            config.compare.settle_ms = settle;
        }
        if let Some(delay) = self.creation_delay_ms {
            config.compare.creation_delay_ms = delay;
        }
        if self.await_first_tick {
            config.compare.await_first_tick = true;
        }
    }
}

/// Which phases a command runs.
#[derive(Clone, Copy)]
struct Phases {
    cycles: bool,
    compare: bool,
}

fn effective_config(cli: &Cli) -> Result<(Config, Phases), Error> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::default(),
    };

    if let Some(level) = &cli.log_level {
        config.general.log_level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.general.log_format = format;
    }
    for (key, value) in &cli.properties {
        config.properties.set(key.clone(), value.clone());
    }

    let phases = match &cli.command {
        None => Phases {
            cycles: true,
            compare: true,
        },
        Some(Commands::Run { cycles, compare }) => {
            cycles.apply(&mut config);
            compare.apply(&mut config);
            Phases {
                cycles: true,
                compare: true,
            }
        }
        Some(Commands::Cycles { cycles }) => {
            cycles.apply(&mut config);
            Phases {
                cycles: true,
                compare: false,
            }
        }
        Some(Commands::Compare { compare }) => {
            compare.apply(&mut config);
            Phases {
                cycles: false,
                compare: true,
            }
        }
        Some(Commands::Config) => Phases {
            cycles: false,
            compare: false,
        },
    };

    // Surface bad property values before any task is started.
    ThrottlingConfig::from_properties(&config.properties)?;
    Ok((config, phases))
}

async fn execute(config: &Config, phases: Phases, format: OutputFormat) -> anyhow::Result<RunSummary> {
    let plain = format == OutputFormat::Plain;
    let registry = NamedTaskRegistry::global();
    let pattern = &config.pattern;
    let properties = &config.properties;
    let system = SystemInfo::current();

    if plain {
        print!("{}", report::render_system_info(&system));
    }

    let mut run = None;

    if phases.cycles {
        let client = SimulatedAbfsClient::new(Arc::clone(&registry), config.monitor.close_behavior);
        let monitor = LifecycleMonitor::new(
            client,
            Arc::clone(&registry),
            pattern.clone(),
            properties.clone(),
            &config.monitor,
        );
        if plain {
            print!("{}", report::render_run_header(&config.monitor.uris, properties));
            println!("{}", report::table_header());
        }
        let monitor_run = monitor
            .run_cycles_with(config.monitor.cycles, &config.monitor.uris, |baseline, record| {
                if plain {
                    println!("{}", report::table_row(record, baseline));
                }
            })
            .await;
        run = Some(monitor_run);
    }

    // The comparison leaves its unreleased batch behind on purpose, so the
    // task analysis never looks past it.
    let (tasks, memory) = final_analysis(&*registry, pattern).await;

    let mut verdict = None;
    if phases.compare {
        let throttling = ThrottlingConfig::from_properties(properties)
            .context("invalid throttling properties")?;
        let harness = ComparativeLeakHarness::new(
            AnalyzerFactory::new(Arc::clone(&registry), throttling),
            Arc::clone(&registry),
            pattern.clone(),
            config.compare.clone(),
        );
        verdict = Some(
            harness
                .compare(config.compare.broken, config.compare.fixed)
                .await,
        );
    }

    let mut summary = RunSummary::new(system, tasks, memory, properties);
    if let Some(run) = run {
        summary = summary.with_cycles(run);
    }
    if let Some(verdict) = verdict {
        summary = summary.with_verdict(verdict);
    }
    Ok(summary)
}

async fn final_analysis(
    registry: &NamedTaskRegistry,
    pattern: &leakprobe_core::registry::TaskPattern,
) -> (TaskAnalysis, MemoryAnalysis) {
    registry.collect().await;
    let tasks = registry.live_tasks();
    let snapshot = registry.snapshot(pattern);
    (
        TaskAnalysis::new(&tasks, &snapshot, pattern),
        MemoryAnalysis::from(&snapshot),
    )
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let (config, phases) = match effective_config(&cli) {
        Ok(resolved) => resolved,
        Err(err) => {
            eprint!("{}", format_error_with_remediation(&err));
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if matches!(cli.command, Some(Commands::Config)) {
        return match config.to_toml_string() {
            Ok(toml) => {
                print!("{toml}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprint!("{}", format_error_with_remediation(&err));
                ExitCode::FAILURE
            }
        };
    }

    if let Err(err) = init_logging(&LogConfig::from(&config.general)) {
        eprintln!("Error: {err}");
        return ExitCode::from(EXIT_CONFIG);
    }
    debug!(config = ?cli.config, "Configuration resolved");

    let summary = match execute(&config, phases, cli.format).await {
        Ok(summary) => summary,
        Err(err) => {
            eprintln!("Error: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match cli.format {
        OutputFormat::Plain => print!("{}", summary.render_plain()),
        OutputFormat::Json => match summary.to_json() {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprint!("{}", format_error_with_remediation(&err));
                return ExitCode::FAILURE;
            }
        },
    }

    if cli.fail_on_leak && summary.leak_detected() {
        return ExitCode::from(EXIT_LEAK);
    }
    ExitCode::SUCCESS
}
