//! forkpool - demo and diagnostic CLI for the process pool.

mod cli;

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use forkpool::logging::{self, LogConfig};
use forkpool::{ApplyOptions, Heap, Pool, PoolConfig, PoolError, PoolStats, TaskRegistry};
use owo_colors::{OwoColorize, Stream::Stderr, Stream::Stdout};
use serde::Serialize;
use serde_json::{Value, json};

use cli::{Cli, Commands, HeapArgs, MapArgs, RunArgs};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::Map(args) => cmd_map(args),
        Commands::Heap(args) => cmd_heap(args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let mut config = LogConfig::from_verbosity(cli.verbose, cli.quiet);
    // Explicit flags beat FORKPOOL_LOG / RUST_LOG.
    if cli.verbose > 0 || cli.quiet {
        let level = config.level.to_string().to_lowercase();
        config = config.with_filter(level);
    }
    let mut config = config.with_env_overrides().with_ansi(!cli.no_color);
    if let Some(format) = cli.log_format {
        config = config.with_format(format.into());
    }
    logging::init(config);
}

/// Tasks the demo commands run.
fn demo_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register("sleep", |ctx, args| {
        let ms: u64 = args.arg(0)?;
        std::thread::sleep(Duration::from_millis(ms));
        Ok(json!({ "worker": ctx.worker_index, "pid": ctx.pid }))
    });
    registry.register("square", |_, args| {
        let n: i64 = args.arg(0)?;
        n.checked_mul(n)
            .with_context(|| format!("{} squared overflows i64", n))
    });
    registry
}

fn pool_config(processes: usize) -> Result<PoolConfig> {
    if processes == 0 {
        bail!("--processes must be at least 1");
    }
    Ok(PoolConfig::default()
        .with_env_overrides()
        .with_processes(processes))
}

#[derive(Serialize)]
struct RunSummary {
    tasks: usize,
    succeeded: usize,
    failed: usize,
    distinct_workers: usize,
    elapsed_ms: u64,
    stats: PoolStats,
}

fn cmd_run(args: &RunArgs) -> Result<()> {
    let mut config = pool_config(args.processes)?;
    if let Some(secs) = args.timeout {
        let timeout = Duration::try_from_secs_f64(secs)
            .with_context(|| format!("Invalid --timeout {}", secs))?;
        config = config.with_timeout(timeout);
    }
    if let Some(n) = args.max_tasks_per_child {
        config = config.with_max_tasks_per_child(n);
    }

    let started = Instant::now();
    let pool = Pool::new(config, demo_registry()).context("Failed to start pool")?;
    let handles = (0..args.tasks)
        .map(|_| pool.apply_async("sleep", vec![json!(args.sleep_ms)], ApplyOptions::new()))
        .collect::<forkpool::Result<Vec<_>>>()
        .context("Failed to submit tasks")?;

    let mut succeeded = 0;
    let mut failed = 0;
    let mut pids = BTreeSet::new();
    for handle in &handles {
        match handle.get(None) {
            Ok(value) => {
                succeeded += 1;
                if let Some(pid) = value.get("pid").and_then(Value::as_i64) {
                    pids.insert(pid);
                }
            }
            Err(PoolError::Task(e)) => {
                failed += 1;
                tracing::debug!(job_id = handle.job_id(), error = %e, "Task failed");
            }
            Err(e) => return Err(e).context("Waiting for task result"),
        }
    }
    let stats = pool.stats();
    pool.close();
    pool.join().context("Failed to shut down pool")?;

    let summary = RunSummary {
        tasks: args.tasks,
        succeeded,
        failed,
        distinct_workers: pids.len(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        stats,
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_run_summary(&summary);
    }
    Ok(())
}

fn print_run_summary(summary: &RunSummary) {
    println!(
        "{} {} tasks in {} ms",
        "Ran".if_supports_color(Stdout, |t| t.bold()),
        summary.tasks,
        summary.elapsed_ms
    );
    println!(
        "  succeeded: {}",
        summary
            .succeeded
            .if_supports_color(Stdout, |t| t.green())
    );
    if summary.failed > 0 {
        println!(
            "  failed:    {}",
            summary.failed.if_supports_color(Stdout, |t| t.red())
        );
    } else {
        println!("  failed:    0");
    }
    println!("  workers:   {}", summary.distinct_workers);
    println!(
        "  restarts:  {}  completed: {}",
        summary.stats.restarts, summary.stats.tasks_completed
    );
}

fn cmd_map(args: &MapArgs) -> Result<()> {
    let pool = Pool::new(pool_config(args.processes)?, demo_registry())
        .context("Failed to start pool")?;
    let items: Vec<Value> = args.numbers.iter().map(|n| json!(n)).collect();

    let results = if args.unordered {
        pool.imap_unordered("square", items, args.chunksize)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(PoolError::from)?
    } else {
        pool.map("square", items, args.chunksize)?
    };
    pool.close();
    pool.join().context("Failed to shut down pool")?;

    if args.json {
        println!("{}", serde_json::to_string(&results)?);
    } else {
        for value in &results {
            println!("{}", value);
        }
    }
    Ok(())
}

fn cmd_heap(args: &HeapArgs) -> Result<()> {
    let heap = Heap::new();
    let mut blocks = (0..args.allocations)
        .map(|_| heap.allocate(args.size))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Allocating {} blocks of {} bytes", args.allocations, args.size))?;

    if args.fragment {
        let mut kept = Vec::with_capacity(blocks.len().div_ceil(2));
        for (i, block) in blocks.into_iter().enumerate() {
            if i % 2 == 0 {
                kept.push(block);
            } else {
                heap.free(block)?;
            }
        }
        blocks = kept;
    }

    let header = format!(
        "{:>5}  {:>10}  {:>10}  {:>10}  {:>6}",
        "arena", "size", "allocated", "free", "holes"
    );
    println!("{}", header.if_supports_color(Stdout, |t| t.bold()));
    for arena in heap.stats() {
        println!(
            "{:>5}  {:>10}  {:>10}  {:>10}  {:>6}",
            arena.index, arena.size, arena.allocated, arena.free, arena.free_blocks
        );
    }

    for block in blocks {
        heap.free(block)?;
    }
    Ok(())
}
