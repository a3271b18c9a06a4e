//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use forkpool::logging::LogFormat;

/// Run demo workloads on a forked process pool.
#[derive(Parser, Debug)]
#[command(name = "forkpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Log output format.
    #[arg(long, value_enum, env = "FORKPOOL_LOG_FORMAT", global = true)]
    pub log_format: Option<LogFormatArg>,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit sleeping tasks and report how the pool handled them.
    Run(RunArgs),

    /// Square numbers on the pool.
    Map(MapArgs),

    /// Exercise the shared-memory allocator.
    Heap(HeapArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of worker processes.
    #[arg(short, long, default_value_t = 4)]
    pub processes: usize,

    /// Number of tasks to submit.
    #[arg(short, long, default_value_t = 16)]
    pub tasks: usize,

    /// How long each task sleeps, in milliseconds.
    #[arg(long, default_value_t = 50)]
    pub sleep_ms: u64,

    /// Hard time limit per task, in seconds.
    #[arg(long)]
    pub timeout: Option<f64>,

    /// Recycle a worker after this many tasks.
    #[arg(long)]
    pub max_tasks_per_child: Option<usize>,

    /// Print the summary as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the map command.
#[derive(Parser, Debug)]
pub struct MapArgs {
    /// Number of worker processes.
    #[arg(short, long, default_value_t = 4)]
    pub processes: usize,

    /// Items per task (defaults to len / (4 * processes)).
    #[arg(short, long)]
    pub chunksize: Option<usize>,

    /// Yield results as they complete instead of in input order.
    #[arg(long)]
    pub unordered: bool,

    /// Print results as a JSON array.
    #[arg(long)]
    pub json: bool,

    /// Numbers to square.
    #[arg(required = true, allow_negative_numbers = true)]
    pub numbers: Vec<i64>,
}

/// Arguments for the heap command.
#[derive(Parser, Debug)]
pub struct HeapArgs {
    /// Number of blocks to allocate.
    #[arg(short = 'n', long, default_value_t = 64)]
    pub allocations: usize,

    /// Size of each block in bytes.
    #[arg(short, long, default_value_t = 256)]
    pub size: usize,

    /// Free every other block before printing, to show fragmentation.
    #[arg(long)]
    pub fragment: bool,
}

/// Log format argument.
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum LogFormatArg {
    /// Human-readable multi-line output.
    Pretty,
    /// Single-line output.
    Compact,
    /// JSON lines.
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Compact => LogFormat::Compact,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}
