//! Ledgersync CLI: sync, status and source listing commands.
//!
//! Commands:
//! - `sync`: pull new records from every configured source into the ledgers
//! - `status`: print each export's last-synced date
//! - `sources`: list supported source kinds and their required options
//!
//! Exit status: 0 on success, 1 if any source failed, 2 on a fatal error
//! (bad configuration, corrupt cursor file).

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ledgersync_core::data::{create_sources, required_options};
use ledgersync_core::{
    CursorStore, RunSummary, SourceKind, SourceOutcome, SourceState, SyncConfig,
    SyncOrchestrator, SyncProgress,
};

#[derive(Parser)]
#[command(
    name = "ledgersync",
    about = "Ledgersync: incremental sync of financial records into CSV ledgers"
)]
struct Cli {
    /// Path to the TOML config file. Defaults to ~/.ledgersync.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync all (or the named) configured sources.
    Sync {
        /// Only sync these sources (repeatable).
        #[arg(long = "source", value_name = "NAME")]
        sources: Vec<String>,

        /// Processing date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        today: Option<String>,
    },
    /// Print the last-synced date of every export.
    Status,
    /// List supported source kinds and their required options.
    Sources,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let result = match cli.command {
        Commands::Sync { sources, today } => run_sync(cli.config, &sources, today.as_deref()),
        Commands::Status => run_status(cli.config).map(|()| ExitCode::SUCCESS),
        Commands::Sources => {
            print_sources();
            Ok(ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ledgersync=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(path: Option<PathBuf>) -> Result<SyncConfig> {
    let path = match path {
        Some(p) => p,
        None => SyncConfig::default_path()?,
    };
    SyncConfig::from_file(&path).with_context(|| format!("loading {}", path.display()))
}

fn run_sync(config_path: Option<PathBuf>, only: &[String], today: Option<&str>) -> Result<ExitCode> {
    let today = match today {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("invalid --today '{s}'"))?,
        None => chrono::Local::now().date_naive(),
    };

    let config = load_config(config_path)?;
    tracing::debug!(
        sources = config.sources.len(),
        cursor_file = %config.cursor_file.display(),
        "loaded config"
    );
    let selected = config.select(only)?;
    // Every source is constructed (and its options validated) before any
    // network or file activity.
    let mut sources = create_sources(selected)?;
    let mut orchestrator = SyncOrchestrator::open(&config.cursor_file)?;

    let summary = orchestrator
        .run(&mut sources, today, &StdoutProgress)
        .with_context(|| format!("saving cursors to {}", config.cursor_file.display()))?;
    tracing::info!(
        %today,
        committed = summary.count(SourceState::Committed),
        skipped = summary.count(SourceState::Skipped),
        failed = summary.count(SourceState::Failed),
        rows = summary.rows_appended(),
        "sync finished"
    );

    Ok(if summary.has_failures() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

fn run_status(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let cursors = CursorStore::load(&config.cursor_file)?;

    println!("Cursor file: {}", config.cursor_file.display());
    if cursors.is_empty() {
        println!("No exports synced yet.");
        return Ok(());
    }
    let width = cursors.iter().map(|(id, _)| id.as_str().len()).max().unwrap_or(0);
    println!("{:<width$}  LAST SYNCED", "EXPORT");
    for (id, date) in cursors.iter() {
        println!("{:<width$}  {date}", id.as_str());
    }
    Ok(())
}

fn print_sources() {
    println!("{:<14}  REQUIRED OPTIONS", "KIND");
    for kind in SourceKind::ALL {
        println!("{:<14}  {}", kind.as_str(), required_options(kind).join(", "));
    }
}

/// Prints progress and the run summary table to stdout.
struct StdoutProgress;

impl SyncProgress for StdoutProgress {
    fn on_source_start(&self, name: &str, index: usize, total: usize) {
        println!("[{}/{}] Syncing {name}...", index + 1, total);
    }

    fn on_source_complete(&self, outcome: &SourceOutcome, _index: usize, _total: usize) {
        match outcome.state {
            SourceState::Committed => println!(
                "  OK: {} ({} rows)",
                outcome.name,
                outcome.rows_appended()
            ),
            SourceState::Skipped => println!("  SKIP: {} (already current)", outcome.name),
            _ => match &outcome.error {
                Some(e) => println!("  FAIL: {}: {e}", outcome.name),
                None => {
                    for export in outcome.exports.iter().filter(|e| !e.is_ok()) {
                        if let Some(e) = &export.error {
                            println!("  FAIL: {}/{}: {e}", outcome.name, export.export_id);
                        }
                    }
                }
            },
        }
    }

    fn on_run_complete(&self, summary: &RunSummary) {
        print_summary(summary);
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("Sync summary for {}", summary.today);
    println!("{:<20} {:<10} {:<14} {:>6}  LAST SYNCED", "SOURCE", "STATE", "EXPORT", "ROWS");
    for source in &summary.sources {
        if source.exports.is_empty() {
            println!("{:<20} {:<10} {:<14} {:>6}  -", source.name, source.state, "-", 0);
            continue;
        }
        for export in &source.exports {
            let cursor = export
                .cursor
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<20} {:<10} {:<14} {:>6}  {cursor}",
                source.name,
                source.state,
                export.export_id.as_str(),
                export.rows_appended
            );
        }
    }
    println!(
        "\n{} committed, {} skipped, {} failed, {} rows appended",
        summary.count(SourceState::Committed),
        summary.count(SourceState::Skipped),
        summary.count(SourceState::Failed),
        summary.rows_appended()
    );
}
