// -----------------------------------------------------------------------------
// io-replay - capture and multi-threaded replay of I/O workload traces
// -----------------------------------------------------------------------------

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::runtime::Builder as RtBuilder;
use tracing::{info, warn};

use io_replay::assign::{AssignmentPolicy, OverflowPolicy};
use io_replay::cancel::{CancelReason, CancelToken};
use io_replay::capture::CapturingExecutor;
use io_replay::config::ReplayConfig;
use io_replay::convert::{convert_capture_to_replay, ConvertOptions};
use io_replay::executor::{FsExecutor, NoopExecutor, OpExecutor};
use io_replay::record::{CaptureRecord, ReplayRecord, TraceKind};
use io_replay::rlimit::raise_limits;
use io_replay::scheduler::{ReplayScheduler, RunOutcome, RunSummary};
use io_replay::trace_reader::{probe_header, TraceFileReader, TraceItem};
use io_replay::tsv_export::TsvExporter;

// -----------------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------------
#[derive(Parser)]
#[command(name = "io-replay", version, about = "Capture and replay I/O workload traces")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a trace with a pool of worker threads
    ///
    /// Examples:
    ///   io-replay replay --trace run.replay --target-root /mnt/test
    ///   io-replay replay --trace run.replay.zst --dry-run --workers 16
    ///   io-replay replay --trace run.replay --config replay.yaml
    Replay(ReplayArgs),

    /// Convert a capture trace into a replay trace
    Convert {
        /// Capture trace to read (.zst supported)
        #[arg(long)]
        capture: PathBuf,

        /// Replay trace to write (.zst compresses)
        #[arg(long)]
        output: PathBuf,

        /// Keep operations that failed during capture
        #[arg(long)]
        keep_failed: bool,

        /// YAML configuration; only its `limits` section is used
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Parse a trace without executing it and report malformed lines
    Validate {
        #[arg(long)]
        trace: PathBuf,

        /// YAML configuration; only its `limits` section is used
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct ReplayArgs {
    /// Replay trace to execute (.zst supported)
    #[arg(long)]
    trace: PathBuf,

    /// YAML run configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory the trace paths are replayed under
    #[arg(long, conflicts_with = "dry_run")]
    target_root: Option<PathBuf>,

    /// Parse and schedule everything, execute nothing
    #[arg(long)]
    dry_run: bool,

    /// Fail operations whose parent directory is missing instead of creating it
    #[arg(long)]
    no_create_parents: bool,

    /// Number of worker threads
    #[arg(long)]
    workers: Option<usize>,

    /// Bounded queue capacity per worker
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Worker assignment: round_robin, target_hash or affinity
    #[arg(long)]
    assign: Option<AssignmentPolicy>,

    /// Full-queue behavior: block or reject
    #[arg(long)]
    overflow: Option<OverflowPolicy>,

    /// Give up on a task after waiting this long for queue space (e.g. 250ms)
    #[arg(long, value_parser = parse_duration)]
    enqueue_timeout: Option<Duration>,

    /// Timing multiplier (2.0 = twice as fast as captured)
    #[arg(long)]
    speed: Option<f64>,

    /// Ignore scheduled delays and replay as fast as possible
    #[arg(long)]
    no_timing: bool,

    /// Cancel the run after this many failed tasks
    #[arg(long)]
    max_errors: Option<u64>,

    /// Cancel the run after this many consecutive failed tasks
    #[arg(long)]
    max_consecutive_errors: Option<u64>,

    /// Record what is replayed into this capture file
    #[arg(long)]
    capture_out: Option<PathBuf>,

    /// Write TSV results to <base>-results.tsv
    #[arg(long)]
    results_tsv: Option<PathBuf>,
}

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

// -----------------------------------------------------------------------------
// main
// -----------------------------------------------------------------------------
fn main() -> Result<()> {
    let cli = Cli::parse();

    // -v (1): info, -vv (2): debug, -vvv (3+): trace
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::new(format!("io_replay={}", level));
    fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Replay(args) => replay_cmd(args)?,
        Commands::Convert {
            capture,
            output,
            keep_failed,
            config,
        } => convert_cmd(&capture, &output, keep_failed, config.as_deref())?,
        Commands::Validate { trace, config } => validate_cmd(&trace, config.as_deref())?,
    }

    Ok(())
}

// -----------------------------------------------------------------------------
// replay
// -----------------------------------------------------------------------------
fn build_config(args: &ReplayArgs) -> Result<ReplayConfig> {
    let mut cfg = match &args.config {
        Some(path) => {
            println!("Loading configuration from: {}", path.display());
            ReplayConfig::load(path)?
        }
        None => ReplayConfig::default(),
    };

    if let Some(root) = &args.target_root {
        cfg.target_root = Some(root.clone());
        cfg.dry_run = false;
    }
    if args.dry_run {
        cfg.dry_run = true;
    }
    if args.no_create_parents {
        cfg.create_parents = false;
    }
    if let Some(n) = args.workers {
        cfg.workers = n;
    }
    if let Some(n) = args.queue_capacity {
        cfg.queue_capacity = n;
    }
    if let Some(p) = args.assign {
        cfg.assignment = p;
    }
    if let Some(p) = args.overflow {
        cfg.overflow = p;
    }
    if args.enqueue_timeout.is_some() {
        cfg.enqueue_timeout = args.enqueue_timeout;
    }
    if let Some(s) = args.speed {
        cfg.speed = s;
    }
    if args.no_timing {
        cfg.honor_timing = false;
    }
    if args.max_errors.is_some() {
        cfg.error_budget.max_total_errors = args.max_errors;
    }
    if args.max_consecutive_errors.is_some() {
        cfg.error_budget.max_consecutive_errors = args.max_consecutive_errors;
    }
    if args.capture_out.is_some() {
        cfg.capture_out = args.capture_out.clone();
    }
    if args.results_tsv.is_some() {
        cfg.results_tsv = args.results_tsv.clone();
    }

    cfg.validate().context("Invalid replay configuration")?;
    Ok(cfg)
}

fn build_executor(cfg: &ReplayConfig) -> Result<Arc<dyn OpExecutor>> {
    let base: Arc<dyn OpExecutor> = match (&cfg.target_root, cfg.dry_run) {
        (_, true) => Arc::new(NoopExecutor),
        (Some(root), false) => {
            Arc::new(FsExecutor::new(root).with_create_parents(cfg.create_parents))
        }
        (None, false) => bail!("no target root given (use --target-root or --dry-run)"),
    };

    match &cfg.capture_out {
        Some(path) => Ok(Arc::new(CapturingExecutor::create(base, path, cfg.limits)?)),
        None => Ok(base),
    }
}

fn replay_cmd(args: ReplayArgs) -> Result<()> {
    let cfg = build_config(&args)?;

    let applied = raise_limits(&cfg.rlimits);
    info!("Resource limits: {:?}", applied);

    let reader = TraceFileReader::<ReplayRecord>::open(&args.trace, cfg.limits)
        .with_context(|| format!("Failed to open replay trace {}", args.trace.display()))?;
    println!(
        "Replaying {} ({} format v{}) with {} workers",
        args.trace.display(),
        reader.header().kind,
        reader.header().version,
        cfg.workers
    );

    let executor = build_executor(&cfg)?;
    let cancel = CancelToken::new();
    let scheduler = ReplayScheduler::new(cfg.scheduler_config());

    let rt = RtBuilder::new_multi_thread().enable_all().build()?;
    let summary = rt.block_on(async {
        let signal_cancel = cancel.clone();
        let signal = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Received Ctrl-C, draining replay");
                signal_cancel.cancel(CancelReason::Interrupted);
            }
        });

        let run_cancel = cancel.clone();
        let result = tokio::task::spawn_blocking(move || {
            scheduler.run(reader, executor, &run_cancel)
        })
        .await
        .context("Replay task failed");

        signal.abort();
        result
    })??;

    summary.print();

    if let Some(base) = &cfg.results_tsv {
        let path = TsvExporter::new(base).export_results(&summary)?;
        println!("\nTSV results exported to: {}", path.display());
    }

    report_outcome(&summary)
}

fn report_outcome(summary: &RunSummary) -> Result<()> {
    if let Some(e) = &summary.trace_error {
        bail!("replay stopped early: {}", e);
    }
    if let Some(e) = &summary.executor_error {
        bail!("executor shutdown failed: {}", e);
    }
    if let RunOutcome::Cancelled(reason) = &summary.outcome {
        bail!("replay cancelled: {}", reason);
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// convert
// -----------------------------------------------------------------------------
fn convert_cmd(capture: &Path, output: &Path, keep_failed: bool, config: Option<&Path>) -> Result<()> {
    let opts = ConvertOptions {
        keep_failed,
        limits: ReplayConfig::load_trace_limits(config)?,
    };
    let s = convert_capture_to_replay(capture, output, &opts)?;

    println!("\nConversion Summary:");
    println!("  Capture records: {}", s.records_read);
    println!("  Replay records written: {}", s.records_written);
    println!("  Failed operations dropped: {}", s.dropped_failed);
    println!("  Malformed lines: {}", s.parse_errors);
    println!("  Timeline span: {:.3}s", s.span.as_secs_f64());
    for f in &s.line_failures {
        println!("    line {}: {}", f.line, f.error);
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// validate
// -----------------------------------------------------------------------------
fn validate_cmd(trace: &Path, config: Option<&Path>) -> Result<()> {
    let limits = ReplayConfig::load_trace_limits(config)?;
    let header = probe_header(trace, limits)
        .with_context(|| format!("Invalid trace {}", trace.display()))?;
    println!("{}: {} format v{}", trace.display(), header.kind, header.version);

    let (records, malformed) = match header.kind {
        TraceKind::Replay => count_items(TraceFileReader::<ReplayRecord>::open(trace, limits)?)?,
        TraceKind::Capture => count_items(TraceFileReader::<CaptureRecord>::open(trace, limits)?)?,
    };

    println!("  Records: {}", records);
    println!("  Malformed lines: {}", malformed);
    if malformed > 0 {
        bail!("{} malformed lines in {}", malformed, trace.display());
    }
    Ok(())
}

fn count_items<R, I>(items: I) -> Result<(u64, u64)>
where
    I: IntoIterator<Item = TraceItem<R>>,
{
    let mut records = 0u64;
    let mut malformed = 0u64;
    for item in items {
        match item {
            TraceItem::Record { .. } => records += 1,
            TraceItem::Malformed { line, error } => {
                malformed += 1;
                println!("    line {}: {}", line, error);
            }
            TraceItem::Failed(e) => return Err(e).context("Trace read failed"),
        }
    }
    Ok((records, malformed))
}
