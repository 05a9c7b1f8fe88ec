//! Shardrun Replayer CLI
//!
//! Drives a recorded trace or a synthetic workload through the cross-shard
//! emitter against the in-process simulated ledger.

use clap::{Args, Parser, Subcommand};
use futures::stream::{self, BoxStream, StreamExt};
use shardrun_emitter::Emitter;
use shardrun_partitioning::PlacementPolicy;
use shardrun_replayer::{ReplayerConfig, SelectionMode, SyntheticWorkload, TraceReader};
use shardrun_simulation::SimulatedLedger;
use shardrun_types::Operation;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shardrun-replayer")]
#[command(about = "Replay workloads through the cross-shard emitter")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by every source. Each overrides the config file.
#[derive(Args)]
struct CommonArgs {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Number of partitions
    #[arg(long, global = true)]
    partitions: Option<u64>,

    /// Initial outstanding window per partition
    #[arg(long, global = true)]
    window: Option<usize>,

    /// Destination policy (occupants, global-excluding-source)
    #[arg(long, global = true)]
    policy: Option<String>,

    /// Log execution failures and keep going instead of stopping
    #[arg(long, global = true)]
    continue_on_exception: bool,

    /// Simulated block interval (e.g., "50ms", "1s")
    #[arg(long, global = true)]
    block_interval: Option<humantime::Duration>,

    /// Simulated block capacity
    #[arg(long, global = true)]
    block_capacity: Option<usize>,

    /// How often to log progress
    #[arg(long, global = true, default_value = "5s")]
    stats_interval: humantime::Duration,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a recorded event trace
    Trace {
        /// Trace file, one event per line
        path: PathBuf,

        /// Lines to skip at the start of the trace
        #[arg(long, default_value = "0")]
        skip_lines: usize,
    },

    /// Generate a seeded synthetic workload
    Synthetic {
        /// Operations to generate
        #[arg(long)]
        operations: Option<u64>,

        /// Cross-partition ratio (0.0 to 1.0)
        #[arg(long)]
        cross_shard_ratio: Option<f64>,

        /// Share of operations creating new objects (0.0 to 1.0)
        #[arg(long)]
        create_ratio: Option<f64>,

        /// Objects homed on each partition
        #[arg(long)]
        objects_per_partition: Option<usize>,

        /// Object selection mode (random, zipf, zipf:<exponent>)
        #[arg(long)]
        selection: Option<String>,

        /// RNG seed
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn apply_overrides(
    config: &mut ReplayerConfig,
    args: &CommonArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(partitions) = args.partitions {
        config.emitter.num_partitions = partitions;
    }
    if let Some(window) = args.window {
        config.emitter.window = window;
        config.emitter.max_window = config.emitter.max_window.max(window);
    }
    if let Some(policy) = &args.policy {
        config.emitter.policy = policy.parse::<PlacementPolicy>()?;
    }
    if args.continue_on_exception {
        config.emitter.fail_on_exception = false;
    }
    if let Some(interval) = &args.block_interval {
        config.ledger.block_interval = **interval;
    }
    if let Some(capacity) = args.block_capacity {
        config.ledger.block_capacity = capacity;
    }
    Ok(())
}

fn operations(
    command: Commands,
    config: &mut ReplayerConfig,
) -> Result<BoxStream<'static, Operation>, Box<dyn std::error::Error>> {
    match command {
        Commands::Trace { path, skip_lines } => {
            let file = File::open(&path)?;
            let operations = TraceReader::new(BufReader::new(file))
                .with_skip_lines(skip_lines)
                .collect::<Result<Vec<_>, _>>()?;
            info!(path = %path.display(), operations = operations.len(), "Trace loaded");
            Ok(stream::iter(operations).boxed())
        }

        Commands::Synthetic {
            operations,
            cross_shard_ratio,
            create_ratio,
            objects_per_partition,
            selection,
            seed,
        } => {
            let workload = &mut config.workload;
            if let Some(operations) = operations {
                workload.operations = operations;
            }
            if let Some(ratio) = cross_shard_ratio {
                workload.cross_shard_ratio = ratio;
            }
            if let Some(ratio) = create_ratio {
                workload.create_ratio = ratio;
            }
            if let Some(objects) = objects_per_partition {
                workload.objects_per_partition = objects;
            }
            if let Some(selection) = selection {
                workload.selection = selection.parse::<SelectionMode>()?;
            }
            if let Some(seed) = seed {
                workload.seed = seed;
            }
            let workload = SyntheticWorkload::new(
                config.workload.clone(),
                config.emitter.num_partitions,
            )?;
            info!(
                operations = config.workload.operations,
                cross_shard_ratio = config.workload.cross_shard_ratio,
                create_ratio = config.workload.create_ratio,
                selection = %config.workload.selection,
                seed = config.workload.seed,
                "Synthetic workload"
            );
            Ok(stream::iter(workload).boxed())
        }
    }
}

async fn report_progress(emitter: Arc<Emitter>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let stats = emitter.stats();
                info!(
                    sent = stats.sent,
                    executed = stats.total_executed(),
                    moved = stats.moved,
                    failed = stats.failed,
                    abandoned = stats.abandoned,
                    "Progress"
                );
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = match &cli.common.config {
        Some(path) => ReplayerConfig::load(path)?,
        None => ReplayerConfig::default(),
    };
    apply_overrides(&mut config, &cli.common)?;
    let operations = operations(cli.command, &mut config)?;
    config.validate()?;

    let num_partitions = config.emitter.num_partitions;
    let ledger = Arc::new(SimulatedLedger::new(config.ledger.simulation(num_partitions)));
    let emitter = Arc::new(
        Emitter::new(config.emitter.clone(), ledger.clone())?
            .with_migration_config(config.migration.clone()),
    );

    let background = CancellationToken::new();
    let _guard = background.clone().drop_guard();
    ledger.spawn_producers(background.clone());
    tokio::spawn(report_progress(
        emitter.clone(),
        *cli.common.stats_interval,
        background.clone(),
    ));

    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, draining outstanding operations");
                stop.cancel();
            }
        });
    }

    let report = emitter.run(operations, stop).await?;
    background.cancel();

    report.print();
    println!("Partition loads:");
    for (index, load) in emitter.partitioning().loads().iter().enumerate() {
        println!("  partition {}: {} objects", index + 1, load);
    }

    Ok(())
}
