//! batsim Command-Line Interface
//!
//! This CLI provides tools for:
//! - Running one selfish-mesh simulation and printing its result record
//! - Sweeping a configuration over consecutive seeds
//! - Inspecting a configuration and its radio link budget

use anyhow::{bail, Context, Result};
use batsim_core::channel::{bit_error_probability, packet_error_probability};
use batsim_core::{run_simulation, ErrorModel, RunConfig, RunResult, TrafficPattern};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "batsim")]
#[command(author, version, about = "Selfish-node mesh simulator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Configuration shared by every subcommand: a JSON file, then flag overrides
#[derive(Args, Debug, Clone)]
struct ConfigArgs {
    /// JSON run configuration (missing fields take their defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Number of nodes
    #[arg(short, long)]
    nodes: Option<usize>,

    /// Side of the square area (m)
    #[arg(long)]
    dim: Option<f64>,

    /// Maximum link distance (m)
    #[arg(long)]
    dist_lim: Option<f64>,

    /// Probability of a flow per ordered node pair
    #[arg(long)]
    app_rate: Option<f64>,

    /// Fraction of nodes that start selfish
    #[arg(long)]
    selfish_rate: Option<f64>,

    /// Virtual time after which no new traffic is generated (s)
    #[arg(short = 't', long)]
    stop_time: Option<f64>,

    /// Reputation update period (s)
    #[arg(long)]
    update_interval: Option<f64>,

    /// Drop score past which a selfish node turns cooperative
    #[arg(long)]
    drop_limit: Option<u32>,

    /// Snapshot period (s)
    #[arg(long)]
    snapshot_interval: Option<f64>,

    /// Use the per-link success probabilities instead of the Friis model
    #[arg(long)]
    link_probability: bool,
}

impl ConfigArgs {
    fn load(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => read_config(path)?,
            None => RunConfig::default(),
        };

        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(nodes) = self.nodes {
            config.node_num = nodes;
        }
        if self.dim.is_some() || self.dist_lim.is_some() {
            let dim = self.dim.unwrap_or(config.dim);
            let dist_lim = self.dist_lim.unwrap_or(config.dist_lim);
            config = config.with_area(dim, dist_lim);
        }
        if let Some(app_rate) = self.app_rate {
            config.app_rate = app_rate;
        }
        if let Some(selfish_rate) = self.selfish_rate {
            config.selfish_rate = selfish_rate;
        }
        if let Some(stop_time) = self.stop_time {
            config.stop_time = stop_time;
        }
        if let Some(interval) = self.update_interval {
            config.update_interval = interval;
        }
        if let Some(limit) = self.drop_limit {
            config.drop_limit = limit;
        }
        if let Some(interval) = self.snapshot_interval {
            config.snapshot_interval = Some(interval);
        }
        if self.link_probability {
            config.channel.error_model = ErrorModel::LinkProbability;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one simulation and print the result record as JSON
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        /// Output file for the result (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Pretty-print the JSON
        #[arg(long)]
        pretty: bool,
    },

    /// Run the same configuration over consecutive seeds
    Sweep {
        #[command(flatten)]
        config: ConfigArgs,

        /// Number of seeds
        #[arg(short, long, default_value = "10")]
        runs: u64,

        /// Output file for the per-seed records (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show a configuration and the link budget of its radio
    Info {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

/// One seed of a sweep
#[derive(Serialize)]
struct SweepEntry {
    seed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<RunResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn read_config(path: &Path) -> Result<RunConfig> {
    let file = File::open(path).with_context(|| format!("Failed to open config {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse config {}", path.display()))
}

fn open_output(output: &Option<PathBuf>) -> Result<Box<dyn Write>> {
    Ok(match output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
            Box::new(BufWriter::new(file))
        }
        None => Box::new(std::io::stdout().lock()),
    })
}

fn cmd_run(config: RunConfig, output: Option<PathBuf>, pretty: bool) -> Result<()> {
    let seed = config.seed;
    let start = Instant::now();
    let result = run_simulation(config).with_context(|| format!("Simulation with seed {} failed", seed))?;
    info!(
        seed,
        elapsed_ms = start.elapsed().as_millis() as u64,
        selfish_rx = result.selfish.rx_bytes,
        cooperative_rx = result.cooperative.rx_bytes,
        "run complete"
    );

    let mut out = open_output(&output)?;
    if pretty {
        serde_json::to_writer_pretty(&mut out, &result)?;
    } else {
        serde_json::to_writer(&mut out, &result)?;
    }
    writeln!(out)?;
    out.flush()?;

    if let Some(path) = output {
        eprintln!("Result written to {}", path.display());
    }
    Ok(())
}

fn cmd_sweep(config: RunConfig, runs: u64, output: Option<PathBuf>) -> Result<()> {
    if runs == 0 {
        bail!("Sweep needs at least one run");
    }

    let first_seed = config.seed;
    let mut out = open_output(&output)?;
    let mut failures = 0u64;
    let start = Instant::now();

    for seed in first_seed..first_seed.saturating_add(runs) {
        let entry = match run_simulation(config.clone().with_seed(seed)) {
            Ok(result) => SweepEntry { seed, result: Some(result), error: None },
            Err(e) => {
                warn!(seed, error = %e, "run failed");
                failures += 1;
                SweepEntry { seed, result: None, error: Some(e.to_string()) }
            }
        };
        // One JSON record per line
        serde_json::to_writer(&mut out, &entry)?;
        writeln!(out)?;
    }
    out.flush()?;

    eprintln!(
        "Sweep: {} runs, {} failed, {:.2} s",
        runs,
        failures,
        start.elapsed().as_secs_f64()
    );
    if failures == runs {
        bail!("All {} runs failed", runs);
    }
    Ok(())
}

fn cmd_info(config: RunConfig) -> Result<()> {
    println!("=== batsim Configuration ===");
    println!();
    println!("Topology:");
    println!("  Nodes:             {}", config.node_num);
    println!("  Area:              {} x {} m", config.dim, config.dim);
    println!("  Link distance:     <= {} m", config.dist_lim);
    println!("  Max neighbors:     {}", config.max_neighbors);
    println!("  Selfish at start:  {:.0}%", config.selfish_rate * 100.0);
    println!("  Flow rate:         {:.3} per node pair", config.app_rate);
    println!();
    println!("Timing:");
    println!("  Stop time:         {} s", config.stop_time);
    println!("  Reputation tick:   {} s (drop limit {})", config.update_interval, config.drop_limit);
    match config.snapshot_interval {
        Some(interval) => println!("  Snapshots:         every {} s", interval),
        None => println!("  Snapshots:         off"),
    }
    println!();
    println!("Traffic:");
    match config.traffic {
        TrafficPattern::Uniform { max_interarrival, min_size, max_size } => {
            println!("  Uniform:           {}-{} B, inter-arrival < {} s", min_size, max_size, max_interarrival);
        }
        TrafficPattern::Periodic { interval, size } => {
            println!("  Periodic:          {} B every {} s", size, interval);
        }
    }
    println!();
    println!("Channel:");
    println!("  Error model:       {:?}", config.channel.error_model);
    println!("  Mode:              {:?}", config.channel.mode);
    println!("  Processing time:   {:.3} ms", config.channel.processing_time * 1000.0);
    match config.channel.queue_limit {
        Some(limit) => println!("  Queue limit:       {} ({:?})", limit, config.channel.overflow),
        None => println!("  Queue limit:       none"),
    }

    let size_bits = match config.traffic {
        TrafficPattern::Uniform { max_size, .. } => max_size as u64 * 8,
        TrafficPattern::Periodic { size, .. } => size as u64 * 8,
    };
    let radio = &config.channel.radio;
    println!();
    println!("Link Budget ({} bit packet):", size_bits);
    println!("  {:>8}  {:>10}  {:>12}  {:>12}", "dist (m)", "rtt (ms)", "bit error", "pkt success");
    for fraction in [0.1, 0.25, 0.5, 0.75, 1.0] {
        let distance = config.dist_lim * fraction;
        println!(
            "  {:>8.1}  {:>10.4}  {:>12.3e}  {:>12.6}",
            distance,
            config.channel.rtt(distance) * 1000.0,
            bit_error_probability(radio, distance),
            1.0 - packet_error_probability(radio, distance, size_bits),
        );
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run { config, output, pretty } => cmd_run(config.load()?, output, pretty),

        Commands::Sweep { config, runs, output } => cmd_sweep(config.load()?, runs, output),

        Commands::Info { config } => cmd_info(config.load()?),
    }
}
