//! GRIDSLAM: runs the grid SLAM particle filter on a synthetic scenario.
//!
//! A robot drives a square loop inside a simulated room. Every step it reports noisy odometry and a laser scan,
//! which are fed to the filter. At the end the best particle's pose is compared against ground truth.
//!
//! Parameters come from an optional scenario file (TOML/JSON/YAML) and can be overridden on the command line.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use gridslam::sim::{ScenarioConfig, ScenarioRunner};
use gridslam::trace::{CsvTraceWriter, LogObserver};
use gridslam::{PruningPolicy, ResamplingStrategy};

#[derive(Parser)]
#[command(author, version, about = "Run the grid SLAM particle filter on a synthetic scenario.")]
struct Cli {
    /// Scenario file (TOML/JSON/YAML). Missing fields take their defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the effective scenario configuration to this file and exit
    #[arg(long)]
    write_config: Option<PathBuf>,

    /// Number of scans to process (0 drives one loop)
    #[arg(short, long)]
    steps: Option<usize>,

    /// Number of particles
    #[arg(short = 'n', long)]
    particles: Option<usize>,

    /// Seed for both the filter and the simulation
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, value_enum)]
    resampling: Option<ResamplingStrategy>,

    #[arg(long, value_enum)]
    pruning: Option<PruningPolicy>,

    /// Process particles sequentially
    #[arg(long)]
    sequential: bool,

    /// Write one CSV row per filter step to this file
    #[arg(long)]
    trace: Option<PathBuf>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Route `log` records to stderr, or to `log_file` when given, stamped with local time and the emitting module.
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    use std::io::Write;

    let level: log::LevelFilter = log_level
        .parse()
        .with_context(|| format!("unknown log level '{log_level}'"))?;
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).format(|buf, record| {
        writeln!(
            buf,
            "{} {:<5} {}: {}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    });
    if let Some(path) = log_file {
        let file = std::fs::File::create(path)
            .with_context(|| format!("cannot create log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(())
}

fn scenario(cli: &Cli) -> Result<ScenarioConfig> {
    let mut config = match &cli.config {
        Some(path) => ScenarioConfig::from_file(path)
            .with_context(|| format!("cannot read scenario {}", path.display()))?,
        None => ScenarioConfig::default(),
    };
    if let Some(steps) = cli.steps {
        config.steps = steps;
    }
    if let Some(n) = cli.particles {
        config.filter.num_particles = n;
    }
    if let Some(seed) = cli.seed {
        config.filter.seed = seed;
        config.simulation.seed = seed;
    }
    if let Some(strategy) = cli.resampling {
        config.filter.resampling_strategy = strategy;
    }
    if let Some(pruning) = cli.pruning {
        config.filter.pruning = pruning;
    }
    if cli.sequential {
        config.filter.parallel = false;
    }
    Ok(config)
}

fn run(cli: &Cli) -> Result<()> {
    let config = scenario(cli)?;
    if let Some(path) = &cli.write_config {
        config
            .to_file(path)
            .with_context(|| format!("cannot write scenario {}", path.display()))?;
        info!("wrote scenario configuration to {}", path.display());
        return Ok(());
    }

    let mut runner = ScenarioRunner::new(&config)?;
    runner.filter.add_observer(LogObserver);
    let trace_path = cli.trace.clone();
    if let Some(path) = &trace_path {
        let writer = CsvTraceWriter::create(path)
            .with_context(|| format!("cannot create trace {}", path.display()))?;
        runner.filter.add_observer(writer);
    }
    info!(
        "running {} steps with {} particles",
        runner.steps(),
        config.filter.num_particles
    );

    let report = runner.run()?;
    info!(
        "best particle error: final {:.3} m, mean {:.3} m, max {:.3} m (odometry only: {:.3} m)",
        report.final_error, report.mean_error, report.max_error, report.odometry_error
    );
    info!(
        "{} resamples over {} steps, {} ancestry nodes for {} particles",
        report.resamples, report.steps, report.tree_nodes, report.particles
    );
    if let Some(best) = runner.filter.best_trajectory() {
        info!("best trajectory has {} poses", best.len());
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    if let Some(path) = trace_path {
        info!("step trace written to {}", path.display());
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logger(&cli.log_level, cli.log_file.as_ref()) {
        eprintln!("cannot initialize logging: {e:#}");
        std::process::exit(1);
    }
    if let Err(e) = run(&cli) {
        error!("{e:#}");
        std::process::exit(1);
    }
}
