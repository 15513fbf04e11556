use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use rime::core::{ModulePriority, RpcTable};
use rime::scheduling::HealthReport;
use rime::{loader, modules, Kernel, KernelConfig};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rime")]
#[command(about = "RIME - real-time module kernel for refrigeration controllers")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Debug-level kernel logging (overridden by RUST_LOG)
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and print the resolved tables
    Check {
        /// Configuration file (.toml, .yaml, .yml or .json)
        config: PathBuf,
    },

    /// Run the kernel with the modules listed under system.modules
    Run {
        /// Configuration file (.toml, .yaml, .yml or .json)
        config: PathBuf,

        /// Stop after this many seconds (default: run until Ctrl+C)
        #[arg(short = 'd', long = "duration-secs", value_name = "SECS")]
        duration_secs: Option<u64>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run_command(cli.command) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "rime=debug" } else { "rime=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

fn run_command(command: Commands) -> Result<()> {
    match command {
        Commands::Check { config } => check(&config),
        Commands::Run {
            config,
            duration_secs,
        } => run(&config, duration_secs.map(Duration::from_secs)),
    }
}

fn load(path: &Path) -> Result<(Value, KernelConfig)> {
    let tree = loader::load_tree(path)
        .with_context(|| format!("loading {}", path.display()))?;
    let config = KernelConfig::from_tree(&tree).context("invalid system section")?;
    Ok((tree, config))
}

fn check(path: &Path) -> Result<()> {
    let (tree, config) = load(path)?;

    println!("{} {}", "Configuration".green().bold(), path.display());
    let t = &config.timing;
    println!(
        "  period {}ms, module budget {}ms, event budget {}ms",
        t.period_ms, t.module_budget_ms, t.event_budget_ms
    );
    println!(
        "  event queue {}, state {} entries / {} byte keys",
        config.event_bus.queue_capacity, config.state.max_entries, config.state.max_key_len
    );

    println!("\n  {:<12} {:>12} {:>16}", "priority".bold(), "deadline".bold(), "heartbeat".bold());
    for priority in ModulePriority::ALL {
        println!(
            "  {:<12} {:>12?} {:>16?}",
            priority.as_str(),
            config.scheduler.deadline_for(priority),
            config.heartbeat.timeout_for(priority)
        );
    }
    println!(
        "\n  heartbeat check every {:?}, auto restart {}, max {} attempts",
        config.heartbeat.check_interval(),
        if config.heartbeat.auto_restart { "on" } else { "off" },
        config.heartbeat.max_restart_attempts
    );

    let factory = modules::factory();
    let listed = tree
        .get("system")
        .and_then(|s| s.get("modules"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    println!("\n  {} listed modules", listed.len());
    for entry in &listed {
        let id = entry.get("id").and_then(Value::as_str).unwrap_or("<missing id>");
        let known = if factory.contains(id) {
            "ok".green()
        } else {
            "unknown".yellow()
        };
        println!("    {:<16} {}", id, known);
    }
    println!("{}", "Configuration is valid".green());
    Ok(())
}

fn run(path: &Path, duration: Option<Duration>) -> Result<()> {
    let (tree, config) = load(path)?;
    let mut kernel = Kernel::new(config).context("creating kernel")?;

    let registered = kernel
        .register_listed(&modules::factory(), &tree)
        .context("registering modules")?;
    if registered == 0 {
        tracing::warn!("no modules registered; add entries under system.modules");
    }

    kernel.start(&tree).context("starting kernel")?;

    let mut rpc = RpcTable::new();
    kernel.scheduler_mut().register_all_rpc(&mut rpc);
    tracing::info!("rpc methods: {:?}", rpc.methods());

    let stop = kernel.stop_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("{}", "\nCtrl+C received! Stopping RIME kernel...".red());
        stop.stop();
    }) {
        eprintln!("Warning: Failed to set signal handler: {}", e);
    }

    tracing::info!("kernel {} running", kernel.instance_id());
    match duration {
        Some(d) => kernel.run_for(d)?,
        None => kernel.run_until_stopped()?,
    }

    let report = kernel.scheduler().health_report();
    let failures = kernel.shutdown();
    print_summary(&kernel, &report);

    if failures > 0 {
        anyhow::bail!("{} modules failed to stop cleanly", failures);
    }
    Ok(())
}

fn score(s: u8) -> ColoredString {
    let text = format!("{:>3}", s);
    match s {
        80..=100 => text.green(),
        50..=79 => text.yellow(),
        _ => text.red(),
    }
}

fn print_summary(kernel: &Kernel, report: &HealthReport) {
    let stats = kernel.stats();
    println!("\n{}", "RIME run summary".bold());
    println!(
        "  {} cycles, {} overruns, cycle avg {:?} / max {:?}",
        stats.cycles, stats.overruns, stats.avg_cycle_time, stats.max_cycle_time
    );

    let bus = kernel.events().stats();
    println!(
        "  events: {} published, {} processed, {} dropped, {} handler failures",
        bus.published, bus.processed, bus.dropped, bus.handler_failures
    );
    let state = kernel.state().statistics();
    println!(
        "  state: {} / {} entries, {} sets, {} gets",
        state.entry_count, state.capacity, state.total_sets, state.total_gets
    );

    println!(
        "\n  {:<20} {:<11} {:<12} {:>8} {:>6} {:>7} {:>6}",
        "module".bold(),
        "priority".bold(),
        "state".bold(),
        "updates".bold(),
        "errors".bold(),
        "misses".bold(),
        "health".bold()
    );
    for m in &report.modules {
        let name = if m.enabled {
            m.name.normal()
        } else {
            m.name.dimmed()
        };
        println!(
            "  {:<20} {:<11} {:<12} {:>8} {:>6} {:>7} {:>6}",
            name,
            m.priority.as_str(),
            m.state.to_string(),
            m.update_count,
            m.error_count,
            m.deadline_misses,
            score(m.health_score)
        );
    }
    println!(
        "\n  system health {} ({} healthy, {} degraded, {} error, {} disabled)",
        score(report.system_score),
        report.healthy,
        report.degraded,
        report.error,
        report.disabled
    );
}
