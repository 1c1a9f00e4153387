//! Stable embedded command surface for the usage ledger.
//!
//! Host processes should embed ledger behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteUsageStore`].
//!
//! Every subcommand prints exactly one versioned JSON payload on stdout;
//! diagnostics go to stderr via `tracing`.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use ulid::Ulid;
use usage_ledger_core::{
    parse_rfc3339_utc, run_pipeline, EngineConfig, Observation, TombstonePolicy,
};
use usage_ledger_store_sqlite::SqliteUsageStore;

#[derive(Debug, Parser)]
#[command(name = "ul")]
#[command(about = "Usage Ledger CLI")]
pub struct Cli {
    #[arg(long, default_value = "./usage_ledger.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Ingest(IngestArgs),
    Run(RunArgs),
    Report {
        #[command(subcommand)]
        command: Box<ReportCommand>,
    },
    Rejections {
        #[command(subcommand)]
        command: Box<RejectionsCommand>,
    },
    Runs {
        #[command(subcommand)]
        command: Box<RunsCommand>,
    },
    Config {
        #[command(subcommand)]
        command: Box<ConfigCommand>,
    },
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    #[arg(long)]
    site: String,
    /// Path to a JSON array of observations.
    #[arg(long)]
    input: PathBuf,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long)]
    site: String,
    #[arg(long)]
    start: Option<String>,
    #[arg(long)]
    end: Option<String>,
    #[arg(long, default_value_t = 1_440)]
    bucket_minutes: i64,
    /// Source priority, highest first (repeatable). Defaults to the standard
    /// order when omitted.
    #[arg(long = "priority")]
    priority: Vec<String>,
    #[arg(long, value_enum, default_value = "authoritative")]
    tombstone_policy: TombstonePolicyArg,
    /// Full engine configuration as a JSON file; overrides every other flag
    /// except --site.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum ReportCommand {
    Show(ReportShowArgs),
}

#[derive(Debug, Args)]
pub struct ReportShowArgs {
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    metric: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum RejectionsCommand {
    List(RejectionsListArgs),
}

#[derive(Debug, Args)]
pub struct RejectionsListArgs {
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Subcommand)]
pub enum RunsCommand {
    List,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show(ConfigShowArgs),
}

#[derive(Debug, Args)]
pub struct ConfigShowArgs {
    #[arg(long, default_value = "site-a")]
    site: String,
    #[arg(long, default_value = "2024-01-01T00:00:00Z")]
    start: String,
    #[arg(long, default_value = "2024-02-01T00:00:00Z")]
    end: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TombstonePolicyArg {
    Authoritative,
    PerSource,
}

impl TombstonePolicyArg {
    fn to_policy(self) -> TombstonePolicy {
        match self {
            Self::Authoritative => TombstonePolicy::Authoritative,
            Self::PerSource => TombstonePolicy::PerSource,
        }
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_command_with_db(&cli.db, cli.command)
}

/// Executes a parsed command using the provided sqlite DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_command_with_db(db_path: &Path, command: Command) -> Result<()> {
    let mut store = SqliteUsageStore::open(db_path)?;
    store.migrate()?;
    run_command(command, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when ingest, pipeline execution, persistence, or
/// retrieval fails.
pub fn run_command(command: Command, store: &mut SqliteUsageStore) -> Result<()> {
    match command {
        Command::Ingest(args) => run_ingest(&args, store),
        Command::Run(args) => run_run(&args, store),
        Command::Report { command } => match *command {
            ReportCommand::Show(args) => run_report_show(&args, store),
        },
        Command::Rejections { command } => match *command {
            RejectionsCommand::List(args) => run_rejections_list(&args, store),
        },
        Command::Runs { command } => match *command {
            RunsCommand::List => run_runs_list(store),
        },
        Command::Config { command } => match *command {
            ConfigCommand::Show(args) => run_config_show(&args),
        },
    }
}

fn run_ingest(args: &IngestArgs, store: &mut SqliteUsageStore) -> Result<()> {
    let body = std::fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let observations: Vec<Observation> = serde_json::from_str(&body)
        .with_context(|| format!("invalid observation JSON in {}", args.input.display()))?;

    let ids = store.append_observations(&args.site, &observations)?;

    let payload = json!({
        "contract_version": "ingest_receipt.v1",
        "site": args.site,
        "appended": ids.len(),
        "observation_ids": ids.iter().map(Ulid::to_string).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn run_run(args: &RunArgs, store: &mut SqliteUsageStore) -> Result<()> {
    let config = build_config(args)?;
    let observations = store.load_observations(&args.site)?;
    tracing::debug!(
        site = %args.site,
        observations = observations.len(),
        "loaded observations for run"
    );

    let run_id = Ulid::new();
    let report = run_pipeline(run_id, &observations, &config)?;
    store.save_report(&report)?;

    let payload = json!({
        "contract_version": "usage_report.v1",
        "run_id": run_id.to_string(),
        "site": report.site,
        "window_start": args_window(&config.window_start)?,
        "window_end": args_window(&config.window_end)?,
        "bucket_minutes": report.bucket_minutes,
        "row_count": report.rows.len(),
        "rejection_count": report.rejections.len(),
        "audits": serde_json::to_value(&report.audits)?,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn args_window(value: &time::OffsetDateTime) -> Result<String> {
    usage_ledger_core::format_rfc3339(*value).map_err(|err| anyhow!(err.to_string()))
}

fn build_config(args: &RunArgs) -> Result<EngineConfig> {
    if let Some(path) = &args.config {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let value: Value = serde_json::from_str(&body)
            .with_context(|| format!("invalid configuration JSON in {}", path.display()))?;
        let mut config =
            EngineConfig::from_json(&value).map_err(|err| anyhow!(err.to_string()))?;
        config.site = args.site.clone();
        return Ok(config);
    }

    let start = args
        .start
        .as_deref()
        .ok_or_else(|| anyhow!("--start is required unless --config is given"))?;
    let end = args
        .end
        .as_deref()
        .ok_or_else(|| anyhow!("--end is required unless --config is given"))?;

    let mut config = EngineConfig::standard(
        &args.site,
        parse_rfc3339_utc(start).map_err(|err| anyhow!("invalid --start value: {err}"))?,
        parse_rfc3339_utc(end).map_err(|err| anyhow!("invalid --end value: {err}"))?,
    );
    config.bucket_minutes = args.bucket_minutes;
    config.tombstone_policy = args.tombstone_policy.to_policy();
    if !args.priority.is_empty() {
        config.priority_order = args.priority.clone();
    }
    config.validate().map_err(|err| anyhow!(err.to_string()))?;
    Ok(config)
}

fn run_report_show(args: &ReportShowArgs, store: &SqliteUsageStore) -> Result<()> {
    let run_id = parse_run_id(&args.run_id)?;
    let Some(report) = store.load_report(run_id)? else {
        return Err(anyhow!("run {} not found", args.run_id));
    };

    let rows: Vec<Value> = report
        .rows
        .iter()
        .filter(|row| match args.metric.as_deref() {
            Some(metric) => row.metric == metric,
            None => true,
        })
        .map(serde_json::to_value)
        .collect::<Result<_, _>>()?;

    let payload = json!({
        "contract_version": "usage_rows.v1",
        "run_id": run_id.to_string(),
        "site": report.site,
        "rows": rows,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn run_rejections_list(args: &RejectionsListArgs, store: &SqliteUsageStore) -> Result<()> {
    let run_id = parse_run_id(&args.run_id)?;
    if store.load_report(run_id)?.is_none() {
        return Err(anyhow!("run {} not found", args.run_id));
    }
    let rejections = store.load_rejections(run_id)?;

    let payload = json!({
        "contract_version": "rejection_ledger.v1",
        "run_id": run_id.to_string(),
        "rejections": serde_json::to_value(&rejections)?,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn run_runs_list(store: &SqliteUsageStore) -> Result<()> {
    let runs = store.list_runs()?;
    let payload = json!({
        "contract_version": "run_list.v1",
        "runs": serde_json::to_value(&runs)?,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn run_config_show(args: &ConfigShowArgs) -> Result<()> {
    let config = EngineConfig::standard(
        &args.site,
        parse_rfc3339_utc(&args.start).map_err(|err| anyhow!("invalid --start value: {err}"))?,
        parse_rfc3339_utc(&args.end).map_err(|err| anyhow!("invalid --end value: {err}"))?,
    );

    let payload = json!({
        "contract_version": "engine_config.v1",
        "config": serde_json::to_value(&config)?,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn parse_run_id(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid run id: {raw}"))
}
