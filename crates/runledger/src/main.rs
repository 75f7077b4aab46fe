//! runledger - replay recorded lifecycle events into a SQLite report and
//! summarize the result.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{debug, warn};

use runledger_core::bridge::WaitOutcome;
use runledger_core::config::Config;
use runledger_core::error::format_error_with_remediation;
use runledger_core::logging::{CONSOLE_TARGET, init_logging};
use runledger_core::pipeline::PipelineConfig;
use runledger_core::sqlite_sink::{ReportSummary, SqliteSink};
use runledger_core::{Envelope, EventPipeline};

#[derive(Debug, Parser)]
#[command(name = "runledger", version, about = "Record test-execution events into a report")]
struct Cli {
    /// Configuration file (defaults to ./runledger.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Report database, overriding `storage.db_path`
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Log level, overriding `general.log_level`
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Feed a JSON-lines file of recorded envelopes through the pipeline
    Replay(ReplayArgs),
    /// Print per-run totals of a report database
    Summary(SummaryArgs),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Debug, Args)]
struct ReplayArgs {
    /// JSON-lines file, one envelope per line
    events: PathBuf,

    /// Buffer messages, checkpoints and statistics between flushes
    #[arg(long)]
    batch: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
    format: OutputFormat,
}

#[derive(Debug, Args)]
struct SummaryArgs {
    #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
    format: OutputFormat,
}

/// Outcome counts of a replay.
#[derive(Debug, Default, Serialize)]
struct ReplayReport {
    events: u64,
    completed: u64,
    queued: u64,
    timed_out: u64,
    failed: u64,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<runledger_core::Error>() {
                Some(core) => eprintln!("{}", format_error_with_remediation(core)),
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(db) = &cli.db {
        config.storage.db_path.clone_from(db);
    }
    if let Some(level) = &cli.log_level {
        config.general.log_level.clone_from(level);
    }
    config.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    init_logging(&config.log_config()).context("failed to initialize logging")?;

    match cli.command {
        Commands::Replay(args) => replay(&args, &config),
        Commands::Summary(args) => summary(&args, &config),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn replay(args: &ReplayArgs, config: &Config) -> Result<()> {
    let file = File::open(&args.events)
        .with_context(|| format!("cannot open event file {}", args.events.display()))?;

    let mut pipeline_config = PipelineConfig::from_config(config);
    pipeline_config.processor.batch_mode |= args.batch;

    let sink = SqliteSink::open(&config.storage.db_path, config.storage.batch_capacity)
        .map_err(runledger_core::Error::from)?;
    let pipeline = EventPipeline::start(sink, pipeline_config)?;

    let mut report = ReplayReport::default();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let envelope: Envelope = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid envelope", args.events.display(), index + 1))?;
        report.events += 1;

        match pipeline.dispatch_envelope(envelope) {
            Ok(WaitOutcome::Completed) => report.completed += 1,
            Ok(WaitOutcome::Queued) => report.queued += 1,
            Ok(WaitOutcome::TimedOut { .. }) => report.timed_out += 1,
            Err(err) => {
                report.failed += 1;
                warn!(target: CONSOLE_TARGET, line = index + 1, error = %err, "Event failed");
            }
        }
    }
    pipeline.shutdown()?;
    debug!(events = report.events, "Replay finished");

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Plain => println!(
            "Replayed {} events into {} ({} completed, {} queued, {} timed out, {} failed)",
            report.events,
            config.storage.db_path.display(),
            report.completed,
            report.queued,
            report.timed_out,
            report.failed
        ),
    }
    Ok(())
}

fn open_existing(db_path: &Path, batch_capacity: usize) -> Result<SqliteSink> {
    if !db_path.exists() {
        anyhow::bail!(
            "report database {} does not exist; run `runledger replay` first",
            db_path.display()
        );
    }
    Ok(SqliteSink::open(db_path, batch_capacity).map_err(runledger_core::Error::from)?)
}

fn summary(args: &SummaryArgs, config: &Config) -> Result<()> {
    let sink = open_existing(&config.storage.db_path, config.storage.batch_capacity)?;
    let summary = sink.summary().map_err(runledger_core::Error::from)?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Plain => print_plain(&summary),
    }
    Ok(())
}

fn print_plain(summary: &ReportSummary) {
    if summary.runs.is_empty() {
        println!("No runs recorded");
        return;
    }
    for run in &summary.runs {
        let status = if run.ended_at.is_some() { "ended" } else { "open" };
        println!(
            "run {} '{}' [{}]: {} suites, {} testcases ({} passed, {} failed, {} skipped, {} running)",
            run.run_id,
            run.run_name,
            status,
            run.suites,
            run.testcases,
            run.passed,
            run.failed,
            run.skipped,
            run.running
        );
    }
    println!(
        "{} messages, {} checkpoints, {} statistics",
        summary.messages, summary.checkpoints, summary.statistics
    );
}
